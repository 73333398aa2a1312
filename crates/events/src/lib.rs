//! Session/event bus (`spec.md` §4.11).
//!
//! Two delivery classes, per `spec.md` §5: lossy discovery/peer events ride
//! a `tokio::sync::broadcast` channel (oldest dropped under lag, matching
//! broadcast's own semantics); reliable chunk-completion/checkpoint events
//! fan out over bounded `mpsc` channels with a backpressured `send().await`
//! so they are never silently dropped. Sequence numbers are monotonically
//! increasing per session so a subscriber can detect a gap in the lossy
//! class even though it can't detect *what* was dropped.

use chiral_proto::{Event, EventKind, SequencedEvent};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

const DEFAULT_LOSSY_CAPACITY: usize = 256;
const DEFAULT_RELIABLE_CAPACITY: usize = 1024;

pub struct EventBus {
    seq: Mutex<HashMap<String, u64>>,
    lossy: broadcast::Sender<SequencedEvent<Event>>,
    reliable_subscribers: Mutex<Vec<mpsc::Sender<SequencedEvent<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (lossy, _) = broadcast::channel(DEFAULT_LOSSY_CAPACITY);
        Self {
            seq: Mutex::new(HashMap::new()),
            lossy,
            reliable_subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe_lossy(&self) -> broadcast::Receiver<SequencedEvent<Event>> {
        self.lossy.subscribe()
    }

    pub fn subscribe_reliable(&self) -> mpsc::Receiver<SequencedEvent<Event>> {
        let (tx, rx) = mpsc::channel(DEFAULT_RELIABLE_CAPACITY);
        self.reliable_subscribers.lock().unwrap().push(tx);
        rx
    }

    fn next_seq(&self, session: &str) -> u64 {
        let mut seqs = self.seq.lock().unwrap();
        let entry = seqs.entry(session.to_string()).or_insert(0);
        let seq = *entry;
        *entry += 1;
        seq
    }

    /// Publishes `event` to `session`, stamping it with the next sequence
    /// number for that session and routing to the delivery class
    /// [`Event::delivery_class`] selects.
    pub async fn publish(&self, session: &str, event: Event) {
        let seq = self.next_seq(session);
        let wrapped = SequencedEvent::new(session, seq, event.clone());
        trace!(subsystem = event.subsystem(), session, seq, "event published");
        match event.delivery_class() {
            EventKind::Reliable => {
                let subs = self.reliable_subscribers.lock().unwrap().clone();
                for sub in subs {
                    // Backpressure here blocks the producer, never drops a
                    // reliable event (`spec.md` §5).
                    let _ = sub.send(wrapped.clone()).await;
                }
            }
            EventKind::Lossy => {
                // broadcast::Sender::send only fails if there are no
                // receivers at all, which is a legitimate no-op here.
                let _ = self.lossy.send(wrapped);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chiral_proto::Cid;

    #[tokio::test]
    async fn sequence_numbers_are_monotonic_per_session() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_lossy();
        bus.publish(
            "s1",
            Event::DhtPeerDiscovered {
                peer: "a".into(),
            },
        )
        .await;
        bus.publish(
            "s1",
            Event::DhtPeerDiscovered {
                peer: "b".into(),
            },
        )
        .await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn reliable_events_are_delivered_to_every_subscriber() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe_reliable();
        let mut rx2 = bus.subscribe_reliable();
        bus.publish(
            "transfer-1",
            Event::TransferProgress {
                root_cid: Cid::of(b"x"),
                bytes_transferred: 10,
                file_size: 100,
            },
        )
        .await;
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn sessions_have_independent_sequence_counters() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_lossy();
        bus.publish("a", Event::DhtPeerConnected { peer: "x".into() }).await;
        bus.publish("b", Event::DhtPeerConnected { peer: "y".into() }).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 0);
    }
}
