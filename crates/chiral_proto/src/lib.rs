//! Shared value types passed across the Chiral Network core crate seams.
//!
//! Kept dependency-light on purpose: this crate sits underneath every other
//! crate in the workspace, so it pulls in only `serde`, `blake3` (for the
//! content-identifier hash) and `thiserror` (for the shared error taxonomy).
//! Anything that needs `libp2p` types (multiaddrs, the wire peer id) lives in
//! `dht_engine` and converts to/from the normalized forms here at the edge.

use std::fmt;
use std::str::FromStr;

pub mod event;

pub use event::{Event, EventKind, SequencedEvent};

/// A content identifier: the 32-byte BLAKE3 hash of a chunk's bytes.
///
/// Collision-resistant and stable for identical input bytes (`spec.md` §3).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Cid(pub [u8; 32]);

impl Cid {
    pub fn of(bytes: &[u8]) -> Self {
        Cid(*blake3::hash(bytes).as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CidParseError> {
        let raw = hex::decode(s).map_err(|_| CidParseError)?;
        let arr: [u8; 32] = raw.as_slice().try_into().map_err(|_| CidParseError)?;
        Ok(Cid(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Directory fan-out prefix used by the chunk store (`spec.md` §6):
    /// the first two hex bytes of the CID.
    pub fn fanout_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed content identifier")]
pub struct CidParseError;

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::from_hex(s)
    }
}

/// Canonical peer identity.
///
/// The upstream libp2p stack and the front-end collaborator both sometimes
/// carry a peer id embedded in a multiaddr (`.../p2p/<id>`); `spec.md` §9(b)
/// treats the bare peer id as canonical and normalizes on ingest, which is
/// what [`PeerId::normalize`] does. The wire type itself (`libp2p::PeerId`)
/// lives in `dht_engine`; this is its stable, hash/serde-friendly shadow.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self::normalize(&raw.into())
    }

    /// Strips a trailing `/p2p/<id>` multiaddr suffix if present, otherwise
    /// returns the input unchanged.
    pub fn normalize(raw: &str) -> Self {
        let id = match raw.rsplit_once("/p2p/") {
            Some((_, tail)) => tail,
            None => raw,
        };
        PeerId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::normalize(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId::normalize(&value)
    }
}

/// Error kinds of `spec.md` §7. Deliberately a flat enum of *kinds*, not a
/// type hierarchy: each crate keeps its own `thiserror` error type for the
/// detail it owns and maps into this taxonomy only at the event-bus/host-API
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    ConnectionRefused,
    ReservationDenied,
    ProviderLookupEmpty,
    ManifestInvalid,
    IntegrityMismatch,
    ChunkMissing,
    PeerUnavailable,
    PeerBlacklisted,
    RateLimited,
    ConfigInvalid,
    IoError,
    PermissionDenied,
    PaymentRequired,
    InsufficientPayment,
    Shutdown,
}

impl ErrorKind {
    /// Whether this kind is locally absorbed-and-retried (`spec.md` §7's
    /// "local-recoverable" class) rather than surfaced immediately.
    pub fn is_locally_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout
                | ErrorKind::ConnectionRefused
                | ErrorKind::RateLimited
                | ErrorKind::ReservationDenied
                | ErrorKind::PeerUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::ReservationDenied => "reservation_denied",
            ErrorKind::ProviderLookupEmpty => "provider_lookup_empty",
            ErrorKind::ManifestInvalid => "manifest_invalid",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::ChunkMissing => "chunk_missing",
            ErrorKind::PeerUnavailable => "peer_unavailable",
            ErrorKind::PeerBlacklisted => "peer_blacklisted",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::IoError => "io_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::PaymentRequired => "payment_required",
            ErrorKind::InsufficientPayment => "insufficient_payment",
            ErrorKind::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// A price quoted per mebibyte, carried on provider records and manifests.
/// Represented as integer micro-units of the settlement currency to avoid
/// floating point drift across the wire and in persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PricePerMib(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_is_stable_for_identical_bytes() {
        let a = Cid::of(b"hello world");
        let b = Cid::of(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Cid::of(b"hello world!"));
    }

    #[test]
    fn cid_hex_round_trips() {
        let cid = Cid::of(b"round trip me");
        let hex = cid.to_hex();
        assert_eq!(Cid::from_hex(&hex).unwrap(), cid);
    }

    #[test]
    fn peer_id_normalizes_multiaddr_suffix() {
        let p = PeerId::new("/ip4/10.0.0.1/tcp/4001/p2p/12D3KooWAbc");
        assert_eq!(p.as_str(), "12D3KooWAbc");
        let bare = PeerId::new("12D3KooWAbc");
        assert_eq!(p, bare);
    }

    #[test]
    fn recoverable_kinds_match_spec_seven() {
        assert!(ErrorKind::NetworkTimeout.is_locally_recoverable());
        assert!(!ErrorKind::IntegrityMismatch.is_locally_recoverable());
        assert!(!ErrorKind::PaymentRequired.is_locally_recoverable());
    }
}
