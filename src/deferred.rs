// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Single-shot completion cells for UI round-trips
//!
//! A [Deferred] is resolved or rejected exactly once; later settlements are
//! no-ops. Waiting is multi-consumer, several calls may block on the same
//! popup readiness cell.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::Notify;

use crate::{error::CoreError, message::EventTag};

enum State<T> {
    Pending,
    Resolved(T),
    Rejected(CoreError),
}

/// Cancelable one-shot completion cell
pub struct Deferred<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            notify: Notify::new(),
        }
    }

    /// Complete the cell with a value. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        let mut state = self.state.lock().expect("deferred state poisoned");
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Resolved(value);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Complete the cell with an error. Returns false if already settled.
    pub fn reject(&self, error: CoreError) -> bool {
        let mut state = self.state.lock().expect("deferred state poisoned");
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Rejected(error);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            *self.state.lock().expect("deferred state poisoned"),
            State::Pending
        )
    }

    fn settled(&self) -> Option<Result<T, CoreError>> {
        match &*self.state.lock().expect("deferred state poisoned") {
            State::Pending => None,
            State::Resolved(v) => Some(Ok(v.clone())),
            State::Rejected(e) => Some(Err(e.clone())),
        }
    }

    /// Wait until the cell settles. Safe to call from several tasks and
    /// after settlement.
    pub async fn wait(&self) -> Result<T, CoreError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent settle is not missed
            notified.as_mut().enable();
            if let Some(result) = self.settled() {
                return result;
            }
            notified.await;
        }
    }
}

/// Payload a UI round-trip resolves with
#[derive(Clone, Debug, PartialEq)]
pub struct UiResponse {
    /// Tag of the inbound message (or a synthetic disconnect event)
    pub event: EventTag,
    /// Raw payload of the inbound message
    pub payload: Value,
}

/// A pending round-trip awaiting a user response of a specific kind,
/// optionally bound to a device.
///
/// Registered promises live in the core registry until resolved, rejected,
/// or synthetically settled when their bound device disconnects. Lookup is
/// by tag alone, FIFO.
pub struct UiPromise {
    tag: EventTag,
    device_path: Option<String>,
    deferred: Deferred<UiResponse>,
}

impl UiPromise {
    pub fn new(tag: EventTag, device_path: Option<String>) -> Self {
        Self {
            tag,
            device_path,
            deferred: Deferred::new(),
        }
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }

    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    pub fn resolve(&self, response: UiResponse) -> bool {
        self.deferred.resolve(response)
    }

    pub fn reject(&self, error: CoreError) -> bool {
        self.deferred.reject(error)
    }

    pub async fn wait(&self) -> Result<UiResponse, CoreError> {
        self.deferred.wait().await
    }
}
