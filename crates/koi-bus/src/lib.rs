#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-bus** - the FUN event bus.
//!
//! Every artifact write emits a `New`, `Update`, or `Forget` notification
//! carrying the affected RID. Consumers subscribe with an RID-glob pattern
//! and receive at-least-once delivery: each delivered event holds a
//! backpressure permit until the subscriber acks it, bounding how far a
//! slow consumer can fall behind before `recv` stops handing it more work.
//! The bus itself is the sole assigner of the monotonic sequence number;
//! nothing else mutates it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use koi_identity::{Cid, Rid};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};

/// The kind of change a [`FunEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunKind {
    /// An RID was written for the first time.
    New,
    /// An existing RID's current CID changed.
    Update,
    /// An RID's content was retracted (dedup merge, takedown, ...).
    Forget,
}

/// One notification on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunEvent {
    /// Monotonically increasing, assigned by the bus at publish time.
    pub seq: u64,
    /// What kind of change occurred.
    pub kind: FunKind,
    /// The affected resource.
    pub rid: Rid,
    /// The RID's new current CID; `None` for `Forget`.
    pub cid: Option<Cid>,
    /// When the bus assigned this event its sequence number.
    pub occurred_at: DateTime<Utc>,
}

/// Errors raised by the bus or a subscription.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No subscribers are currently attached; the event was not delivered
    /// to anyone (it is still a valid, sequenced event - late subscribers
    /// simply will not see it).
    #[error("no active subscribers")]
    NoSubscribers,
    /// The subscriber fell behind the bus's ring buffer and missed
    /// `skipped` events.
    #[error("subscriber lagged, {0} events skipped")]
    Lagged(u64),
    /// The bus was dropped while a subscription was still live.
    #[error("bus closed")]
    Closed,
    /// `ack` was called with a `seq` this subscription never received or
    /// already acked.
    #[error("unknown or already-acked sequence number: {0}")]
    UnknownSeq(u64),
}

/// The FUN event bus.
#[derive(Debug, Clone)]
pub struct FunBus {
    tx: broadcast::Sender<FunEvent>,
    next_seq: Arc<Mutex<u64>>,
}

impl FunBus {
    /// Create a bus with the given ring-buffer capacity (events older than
    /// the last `capacity` are dropped for subscribers that lag behind).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            next_seq: Arc::new(Mutex::new(0)),
        }
    }

    /// Publish a notification, assigning it the next sequence number.
    /// Publishing with no subscribers attached still succeeds (the event
    /// simply reaches nobody); this is not treated as an error since the
    /// writer side should never block on reader presence.
    pub async fn publish(&self, kind: FunKind, rid: Rid, cid: Option<Cid>) -> FunEvent {
        let mut seq = self.next_seq.lock().await;
        *seq += 1;
        let event = FunEvent {
            seq: *seq,
            kind,
            rid,
            cid,
            occurred_at: Utc::now(),
        };
        drop(seq);
        let _ = self.tx.send(event.clone());
        event
    }

    /// Subscribe to events whose RID matches `pattern` (see
    /// [`Rid::matches_glob`]). At most `max_unacked` delivered-but-unacked
    /// events may be outstanding at once; once that limit is hit, `recv`
    /// waits for an `ack` before handing out the next matching event.
    pub fn subscribe(&self, pattern: impl Into<String>, max_unacked: usize) -> Subscription {
        Subscription {
            pattern: pattern.into(),
            rx: self.tx.subscribe(),
            semaphore: Arc::new(Semaphore::new(max_unacked)),
            unacked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of subscriptions currently attached, live or lapsed.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live subscription to the bus, filtered by an RID-glob pattern.
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<FunEvent>,
    semaphore: Arc<Semaphore>,
    unacked: Arc<Mutex<HashMap<u64, OwnedSemaphorePermit>>>,
}

impl Subscription {
    /// Wait for and return the next event matching this subscription's
    /// pattern. Blocks if `max_unacked` events are already outstanding.
    pub async fn recv(&mut self) -> Result<FunEvent, BusError> {
        loop {
            let event = match self.rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => return Err(BusError::Lagged(n)),
                Err(RecvError::Closed) => return Err(BusError::Closed),
            };
            if !event.rid.matches_glob(&self.pattern) {
                continue;
            }
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BusError::Closed)?;
            self.unacked.lock().await.insert(event.seq, permit);
            return Ok(event);
        }
    }

    /// Acknowledge delivery of `seq`, releasing its backpressure permit.
    pub async fn ack(&self, seq: u64) -> Result<(), BusError> {
        self.unacked
            .lock()
            .await
            .remove(&seq)
            .map(|_| ())
            .ok_or(BusError::UnknownSeq(seq))
    }

    /// How many delivered events this subscription has not yet acked.
    pub async fn unacked_count(&self) -> usize {
        self.unacked.lock().await.len()
    }

    /// The glob pattern this subscription was created with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(ns: &str, kind: &str, id: &str) -> Rid {
        Rid::mint(ns, kind, id).unwrap()
    }

    #[tokio::test]
    async fn delivers_matching_events_only() {
        let bus = FunBus::new(16);
        let mut sub = bus.subscribe("orn:regen.raw:*", 8);

        bus.publish(FunKind::New, rid("regen", "raw", "a"), None).await;
        bus.publish(FunKind::New, rid("regen", "governance", "b"), None).await;
        bus.publish(FunKind::New, rid("regen", "raw", "c"), None).await;

        let first = sub.recv().await.unwrap();
        assert_eq!(first.rid.id(), "a");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.rid.id(), "c");
    }

    #[tokio::test]
    async fn seq_numbers_are_monotonic() {
        let bus = FunBus::new(16);
        let e1 = bus.publish(FunKind::New, rid("regen", "raw", "a"), None).await;
        let e2 = bus.publish(FunKind::New, rid("regen", "raw", "b"), None).await;
        assert_eq!(e2.seq, e1.seq + 1);
    }

    #[tokio::test]
    async fn ack_releases_backpressure_permit() {
        let bus = FunBus::new(16);
        let mut sub = bus.subscribe("orn:regen.raw:*", 1);

        bus.publish(FunKind::New, rid("regen", "raw", "a"), None).await;
        bus.publish(FunKind::New, rid("regen", "raw", "b"), None).await;

        let first = sub.recv().await.unwrap();
        assert_eq!(sub.unacked_count().await, 1);

        let recv_second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sub.recv(),
        )
        .await;
        assert!(recv_second.is_err(), "recv should block at max_unacked");

        sub.ack(first.seq).await.unwrap();
        assert_eq!(sub.unacked_count().await, 0);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.rid.id(), "b");
    }

    #[tokio::test]
    async fn acking_unknown_seq_errors() {
        let bus = FunBus::new(16);
        let sub = bus.subscribe("orn:regen.raw:*", 4);
        assert!(matches!(sub.ack(999).await, Err(BusError::UnknownSeq(999))));
    }

    #[tokio::test]
    async fn forget_events_carry_no_cid() {
        let bus = FunBus::new(16);
        let mut sub = bus.subscribe("orn:regen.raw:*", 4);
        bus.publish(FunKind::Forget, rid("regen", "raw", "a"), None).await;
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, FunKind::Forget);
        assert!(event.cid.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_lagged_error() {
        let bus = FunBus::new(2);
        let mut sub = bus.subscribe("orn:regen.raw:*", 16);
        for i in 0..5 {
            bus.publish(FunKind::New, rid("regen", "raw", &i.to_string()), None).await;
        }
        match sub.recv().await {
            Err(BusError::Lagged(_)) => {}
            other => panic!("expected Lagged, got {other:?}"),
        }
    }
}
