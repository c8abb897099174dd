//! Viewer set — anonymous subscribers to the live frame feed.
//!
//! Each viewer connection owns a bounded queue. The connection's writer task
//! drains it into the socket (with a per-send deadline); `broadcast` only ever
//! enqueues. A viewer that stops reading therefore fills its own queue and
//! loses frames, but never delays the producer or any other viewer.
//!
//! Outcome per viewer on `broadcast`:
//!   queued        → delivered (to the queue; the socket write is the writer's job)
//!   queue full    → frame dropped for this viewer only
//!   queue closed  → writer is gone, viewer removed from the set

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use wire_protocol::ViewerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// What one `broadcast` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Viewers registered when the broadcast started.
    pub attempted: usize,
    pub delivered: usize,
    /// Skipped because that viewer's queue was full.
    pub dropped:   usize,
    /// Found closed and removed.
    pub removed:   usize,
}

pub struct ViewerSet {
    viewers:     DashMap<ViewerId, mpsc::Sender<Message>>,
    queue_depth: usize,
    next_id:     AtomicU64,
}

impl ViewerSet {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            viewers:     DashMap::new(),
            queue_depth: queue_depth.max(1),
            next_id:     AtomicU64::new(1),
        }
    }

    /// Register a viewer. The caller drains the returned queue into the
    /// viewer's socket and calls `remove` when the socket closes.
    pub fn add(&self) -> (ViewerId, mpsc::Receiver<Message>) {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.viewers.insert(id, tx);
        (id, rx)
    }

    /// Idempotent; returns whether the viewer was present.
    pub fn remove(&self, id: ViewerId) -> bool {
        self.viewers.remove(&id).is_some()
    }

    /// Offer `message` to every registered viewer.
    ///
    /// Senders are copied out first, so no map lock is held while enqueueing.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        let targets: Vec<(ViewerId, mpsc::Sender<Message>)> = self
            .viewers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut report = BroadcastReport { attempted: targets.len(), ..Default::default() };

        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(viewer = %id, "Viewer queue full, frame dropped");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    if self.remove(id) {
                        debug!(viewer = %id, "Viewer gone, removed during broadcast");
                    }
                    report.removed += 1;
                }
            }
        }

        report
    }

    /// Wrap `data` as a viewer `camera_frame` (serialized once) and broadcast it.
    pub fn broadcast_frame(&self, data: String) -> Result<BroadcastReport, serde_json::Error> {
        let text = wire_protocol::encode(&ViewerMessage::CameraFrame { data })?;
        Ok(self.broadcast(Message::text(text)))
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_string(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_viewer_gets_one_copy() {
        let set = ViewerSet::new(8);
        let mut queues: Vec<_> = (0..3).map(|_| set.add().1).collect();

        let report = set.broadcast_frame("AAAA".into()).unwrap();
        assert_eq!(report, BroadcastReport { attempted: 3, delivered: 3, dropped: 0, removed: 0 });

        for rx in &mut queues {
            let v: serde_json::Value = serde_json::from_str(&text_of(rx.recv().await.unwrap())).unwrap();
            assert_eq!(v, serde_json::json!({"type": "camera_frame", "data": "AAAA"}));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn closed_viewer_is_removed_and_others_still_receive() {
        let set = ViewerSet::new(8);
        let (_a, mut rx_a) = set.add();
        let (b, rx_b) = set.add();
        let (_c, mut rx_c) = set.add();
        drop(rx_b);

        let report = set.broadcast_frame("frame".into()).unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(set.len(), 2);
        assert!(!set.remove(b));

        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
    }

    #[tokio::test]
    async fn slow_viewer_drops_without_blocking_others() {
        let set = ViewerSet::new(1);
        let (_slow, _rx_slow) = set.add();
        let (_fast, mut rx_fast) = set.add();

        set.broadcast(Message::text("1"));
        assert_eq!(text_of(rx_fast.recv().await.unwrap()), "1");

        let report = set.broadcast(Message::text("2"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(text_of(rx_fast.recv().await.unwrap()), "2");
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn per_viewer_order_matches_send_order() {
        let set = ViewerSet::new(16);
        let (_id, mut rx) = set.add();
        for n in 0..10 {
            set.broadcast(Message::text(n.to_string()));
        }
        for n in 0..10 {
            assert_eq!(text_of(rx.recv().await.unwrap()), n.to_string());
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let set = ViewerSet::new(4);
        let (id, _rx) = set.add();
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }

    #[test]
    fn broadcast_to_nobody_is_a_no_op() {
        let set = ViewerSet::new(4);
        assert_eq!(set.broadcast(Message::text("x")), BroadcastReport::default());
    }
}
