// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Typed publish/subscribe fan-out of [CoreMessage]s

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::message::CoreMessage;

/// Fans outbound messages out to all subscribers, preserving submission
/// order per subscriber. Closed subscribers are pruned on the next emit.
#[derive(Default)]
pub struct Emitter {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CoreMessage>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoreMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("emitter subscribers poisoned")
            .push(tx);
        rx
    }

    /// Deliver a message to every live subscriber
    pub fn emit(&self, message: CoreMessage) {
        self.subscribers
            .lock()
            .expect("emitter subscribers poisoned")
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Drop all subscribers, ending their receive streams
    pub fn close(&self) {
        self.subscribers
            .lock()
            .expect("emitter subscribers poisoned")
            .clear();
    }
}
