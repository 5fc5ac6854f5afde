//! Broadcast hub: fans ledger events out to every subscribed connection
//!
//! Backed by a bounded `tokio::sync::broadcast` channel. Publishing never
//! waits on subscribers. Each subscriber sees events in publish order; one
//! that falls more than `capacity` events behind is told it lagged and must
//! resynchronize from a snapshot instead of silently missing events.

use crate::record::LedgerEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Cloneable publisher side of the hub
#[derive(Clone, Debug)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Arc<LedgerEvent>>,
}

/// What a subscriber receives next
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<LedgerEvent>),
    /// Subscriber fell behind and `n` events were skipped
    Lagged(u64),
    /// Hub dropped
    Closed,
}

/// One subscriber's ordered event stream
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Arc<LedgerEvent>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `event` to every current subscriber
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: LedgerEvent) -> usize {
        if self.tx.receiver_count() == 0 {
            return 0;
        }
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Subscription {
    /// Wait for the next delivery
    pub async fn next(&mut self) -> Delivery {
        match self.rx.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Delivery::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }

    /// Non-blocking variant of [`Subscription::next`]; `None` when empty
    pub fn try_next(&mut self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Some(Delivery::Closed),
            Err(broadcast::error::TryRecvError::Empty) => None,
        }
    }
}
