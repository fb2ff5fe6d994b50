//! # Broadcast Hub
//!
//! Fans [`SimEvent`]s out to any number of live subscribers.
//!
//! Built on a `tokio::sync::broadcast` ring: publishing never waits, every
//! subscriber reads at its own pace, and a subscriber that falls more than
//! `capacity` events behind loses the oldest ones (counted in
//! [`Subscription::dropped_count`]). A subscriber that never reads therefore
//! costs no more than the shared ring and never slows anyone else.

use futures::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, trace, warn};

use crate::domain::SimEvent;

/// Cheap to clone; all clones share one set of subscribers.
#[derive(Clone, Debug)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    /// `None` once the hub is closed
    sender: Mutex<Option<broadcast::Sender<SimEvent>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                sender: Mutex::new(Some(sender)),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new subscriber. It sees every event published from now on.
    /// After [`close`](Self::close) the returned subscription is already ended.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.inner.sender.lock().as_ref().map(|tx| tx.subscribe());
        debug!(subscriber_id = id, open = rx.is_some(), "subscriber registered");
        Subscription { id, rx, dropped: 0 }
    }

    /// Explicit disconnect; equivalent to dropping the subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Deliver `event` to every current subscriber without waiting.
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: SimEvent) -> usize {
        let guard = self.inner.sender.lock();
        let Some(tx) = guard.as_ref() else {
            trace!("publish after close ignored");
            return 0;
        };
        // Err only means nobody is listening
        tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .sender
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.receiver_count())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// End every subscription. Subscribers receive what is already queued and
    /// then `None`; later publishes are ignored.
    pub fn close(&self) {
        if self.inner.sender.lock().take().is_some() {
            debug!("broadcast hub closed");
        }
    }
}

/// One subscriber's handle. Dropping it unsubscribes and frees its queue.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: Option<broadcast::Receiver<SimEvent>>,
    dropped: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Events this subscriber lost because it fell behind.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Next event, waiting if none is queued. `None` once the hub is closed.
    pub async fn recv(&mut self) -> Option<SimEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    warn!(subscriber_id = self.id, skipped, "slow subscriber, oldest events dropped");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SimEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    warn!(subscriber_id = self.id, skipped, "slow subscriber, oldest events dropped");
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    pub fn into_stream(self) -> impl Stream<Item = SimEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(subscriber_id = self.id, dropped = self.dropped, "subscriber released");
    }
}
