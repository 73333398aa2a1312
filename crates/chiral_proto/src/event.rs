//! Event payload schemas for the session/event bus (`spec.md` §4.11).

use crate::{Cid, ErrorKind, PeerId, PricePerMib};
use serde::{Deserialize, Serialize};

/// Wraps any event payload with the per-session monotonically increasing
/// sequence number required by `spec.md` §4.11/§5 so subscribers can detect
/// gaps under the lossy channel's backpressure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent<T> {
    pub session: String,
    pub seq: u64,
    pub payload: T,
}

impl<T> SequencedEvent<T> {
    pub fn new(session: impl Into<String>, seq: u64, payload: T) -> Self {
        Self {
            session: session.into(),
            seq,
            payload,
        }
    }
}

/// The named event catalogue of `spec.md` §4.11.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    PublishedFile {
        root_cid: Cid,
        size: u64,
    },
    FoundFile {
        root_cid: Cid,
        seeders: Vec<PeerId>,
    },
    FileContent {
        root_cid: Cid,
        bytes_written: u64,
    },
    DhtPeerDiscovered {
        peer: PeerId,
    },
    DhtPeerConnected {
        peer: PeerId,
    },
    DhtPeerDisconnected {
        peer: PeerId,
    },
    ReachabilityChanged {
        new_state: String,
        confidence: String,
        summary: String,
    },
    RelayStateChanged {
        relay: PeerId,
        healthy: bool,
        summary: String,
    },
    DcutrResult {
        peer: PeerId,
        upgraded: bool,
    },
    TransferProgress {
        root_cid: Cid,
        bytes_transferred: u64,
        file_size: u64,
    },
    CheckpointWaiting {
        session_id: String,
        next_checkpoint: u64,
        price_per_mib: PricePerMib,
    },
    CheckpointPaid {
        session_id: String,
        total_paid: f64,
        next_checkpoint: u64,
    },
    /// Emitted when a local-recoverable error (`spec.md` §7) persists past
    /// its configured cap and must finally surface to the host.
    Fault {
        subsystem: &'static str,
        kind: ErrorKind,
        summary: String,
        retry_hint: Option<String>,
    },
}

impl Event {
    pub fn subsystem(&self) -> &'static str {
        match self {
            Event::PublishedFile { .. } | Event::FoundFile { .. } | Event::FileContent { .. } => {
                "manifest"
            }
            Event::DhtPeerDiscovered { .. }
            | Event::DhtPeerConnected { .. }
            | Event::DhtPeerDisconnected { .. } => "dht",
            Event::ReachabilityChanged { .. } => "reachability",
            Event::RelayStateChanged { .. } => "relay",
            Event::DcutrResult { .. } => "holepunch",
            Event::TransferProgress { .. } => "scheduler",
            Event::CheckpointWaiting { .. } | Event::CheckpointPaid { .. } => "checkpoint",
            Event::Fault { subsystem, .. } => subsystem,
        }
    }
}

/// Classifies events into the two delivery classes of `spec.md` §5:
/// `Reliable` events are never dropped under backpressure, `Lossy` events
/// may be coalesced in favor of the newest discovery/peer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Reliable,
    Lossy,
}

impl Event {
    pub fn delivery_class(&self) -> EventKind {
        match self {
            Event::FileContent { .. }
            | Event::TransferProgress { .. }
            | Event::CheckpointWaiting { .. }
            | Event::CheckpointPaid { .. }
            | Event::Fault { .. } => EventKind::Reliable,
            _ => EventKind::Lossy,
        }
    }
}
