// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Restartable user-interaction timeout

use std::{sync::Mutex, time::Duration};

use tokio::task::JoinHandle;

/// Single restartable timer firing "user idle".
///
/// Every UI-bound wait restarts the timer; expiry is treated exactly like
/// the user closing the popup. A zero duration disables the timer entirely.
pub struct InteractionTimeout {
    duration: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InteractionTimeout {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            task: Mutex::new(None),
        }
    }

    /// (Re)arm the timer. `on_expire` runs once if the timer is not
    /// restarted or stopped before the duration elapses.
    pub fn start<F>(&self, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.duration.is_zero() {
            return;
        }

        let duration = self.duration;
        let mut task = self.task.lock().expect("timeout task poisoned");
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_expire();
        }));
    }

    /// Disarm the timer
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().expect("timeout task poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for InteractionTimeout {
    fn drop(&mut self) {
        self.stop();
    }
}
