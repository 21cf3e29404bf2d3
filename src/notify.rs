//! Notification Bus.
//!
//! One process-wide long-poll loop against the change-feed endpoint. Each
//! successful poll advances the event cursor, resolves the one-shot readiness
//! signal on the first success, and fans the coalesced version-update events
//! out to every live subscriber. Transport failures back off and retry
//! forever; a malformed payload is a protocol mismatch and terminates the
//! loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::protocol::ChangeEvents;
use crate::transport::Transport;

/// Cursor value meaning "no events seen yet".
const NO_EVENTS_YET: i64 = -1;

/// Delay before re-polling after a transport failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One live subscription: events are buffered in the channel until the
/// subscriber consumes them.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<Arc<ChangeEvents>>,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Arc<ChangeEvents>>>>,
    next_subscriber_id: AtomicU64,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    last_error: Mutex<Option<String>>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

/// Shared handle to the process-wide notification bus.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Start the poll loop. The loop runs for the lifetime of the process;
    /// subscribers come and go as tables are added and removed.
    pub fn start(transport: Arc<dyn Transport>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let bus = Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                ready_tx,
                ready_rx,
                last_error: Mutex::new(None),
                last_sync_at: Mutex::new(None),
                last_event_at: Mutex::new(None),
            }),
        };

        let inner = bus.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = Self::run(inner, transport).await {
                // Only a malformed payload lands here; transport failures are
                // retried inside the loop.
                error!("notification loop terminated: {}", err);
            }
        });

        bus
    }

    async fn run(
        inner: Arc<BusInner>,
        transport: Arc<dyn Transport>,
    ) -> crate::error::SyncResult<()> {
        let mut last_event_id = NO_EVENTS_YET;
        info!("notification loop started");

        loop {
            match transport.poll_changes(last_event_id).await {
                Ok(feed) => {
                    let first = last_event_id == NO_EVENTS_YET;
                    last_event_id = feed.last_event_id;
                    *inner.last_error.lock().unwrap() = None;
                    *inner.last_sync_at.lock().unwrap() = Some(Utc::now());
                    if !feed.events.is_empty() {
                        *inner.last_event_at.lock().unwrap() = Some(Utc::now());
                    }

                    if first {
                        debug!(cursor = last_event_id, "first successful sync");
                        let _ = inner.ready_tx.send(true);
                    }

                    let payload = Arc::new(feed.events);
                    let mut subscribers = inner.subscribers.lock().unwrap();
                    subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
                }
                Err(err @ crate::error::SyncError::Transport(_)) => {
                    warn!("change-feed poll failed: {}", err);
                    *inner.last_error.lock().unwrap() = Some(err.to_string());
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Register a subscriber. Events received from now on are delivered in
    /// order through the returned channel.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().insert(id, tx);
        debug!(subscriber = id, "subscriber added");
        Subscription {
            id: SubscriptionId(id),
            events: rx,
        }
    }

    /// Remove a subscriber. Returns false if the handle is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.lock().unwrap().remove(&id.0).is_some();
        if removed {
            debug!(subscriber = id.0, "subscriber removed");
        }
        removed
    }

    /// Resolves once the first poll has succeeded. Usable by any number of
    /// waiters, before or after the fact.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready_rx.clone();
        // wait_for only fails if the sender is dropped, which cannot happen
        // while the bus itself is alive.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_rx.borrow()
    }

    /// Last transport failure of the poll loop, cleared on success.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Completion time of the most recent successful poll.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sync_at.lock().unwrap()
    }

    /// Time of the most recent poll that carried events.
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_event_at.lock().unwrap()
    }
}
