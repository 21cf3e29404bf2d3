//! Cooperative cancellation token.
//!
//! A `CancelToken` is a cloneable handle shared between the owner of an
//! operation (a table, a caller holding a command future) and the code that
//! performs it. Cancellation is cooperative: every suspension point in the
//! executor selects on the token, and a token fired after completion is a
//! no-op.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. The first reason wins; later calls are ignored.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.inner.reason.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason.into());
            drop(guard);
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.lock().unwrap().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap().clone()
    }

    /// Resolves with the cancellation reason once the token fires.
    pub async fn cancelled(&self) -> String {
        loop {
            // Register interest before checking the flag so a concurrent
            // cancel() cannot slip between the check and the await.
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}
