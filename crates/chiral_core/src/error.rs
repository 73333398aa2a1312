//! `ChiralNode`'s host-facing error type. Maps every local `thiserror` error
//! from the subsystem crates into the shared `ErrorKind` taxonomy of
//! `spec.md` §7 at this one seam, per `SPEC_FULL.md` §B.1.

use chiral_proto::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration invalid: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk store error: {0}")]
    Store(#[from] chunk_store::StoreError),
    #[error("manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),
    #[error("dht error: {0}")]
    Dht(#[from] dht_engine::DhtError),
    #[error("state db error: {0}")]
    StateDb(#[from] crate::state_db::StateDbError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),
    #[error("provider lookup for {root_cid} returned no results")]
    ProviderLookupEmpty { root_cid: String },
    #[error("no reachable seeder had chunk {index}")]
    ChunkUnavailable { index: u32 },
    #[error("unknown checkpoint session {0}")]
    UnknownSession(String),
    #[error("operation refused: node is in pure-client mode")]
    PureClientMode,
    #[error("node is shutting down")]
    Shutdown,
    #[error("relay reservation denied: {0}")]
    ReservationDenied(String),
    #[error("every known provider for chunk {index} is blacklisted for corrupted delivery")]
    PeerBlacklisted { index: u32 },
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::ConfigInvalid,
            CoreError::Io(_) => ErrorKind::IoError,
            CoreError::Store(chunk_store::StoreError::IntegrityMismatch { .. }) => {
                ErrorKind::IntegrityMismatch
            }
            CoreError::Store(chunk_store::StoreError::Missing(_)) => ErrorKind::ChunkMissing,
            CoreError::Store(chunk_store::StoreError::PermissionDenied(_)) => {
                ErrorKind::PermissionDenied
            }
            CoreError::Store(_) => ErrorKind::IoError,
            CoreError::Manifest(manifest::ManifestError::MissingChunks(_)) => {
                ErrorKind::ChunkMissing
            }
            CoreError::Manifest(manifest::ManifestError::Invalid(_)) => {
                ErrorKind::ManifestInvalid
            }
            CoreError::Manifest(_) => ErrorKind::IoError,
            CoreError::Dht(dht_engine::DhtError::Timeout) => ErrorKind::NetworkTimeout,
            CoreError::Dht(dht_engine::DhtError::DialFailed(_)) => ErrorKind::ConnectionRefused,
            CoreError::Dht(dht_engine::DhtError::ChunkNotFound) => ErrorKind::ChunkMissing,
            CoreError::Dht(dht_engine::DhtError::ClientOnly(_)) => ErrorKind::ConfigInvalid,
            CoreError::Dht(dht_engine::DhtError::BootstrapRole(_)) => ErrorKind::ConfigInvalid,
            CoreError::Dht(dht_engine::DhtError::RateLimited(_)) => ErrorKind::RateLimited,
            CoreError::Dht(_) => ErrorKind::PeerUnavailable,
            CoreError::StateDb(_) => ErrorKind::IoError,
            CoreError::Checkpoint(checkpoint::CheckpointError::NegativeAmount(_)) => {
                ErrorKind::InsufficientPayment
            }
            CoreError::Checkpoint(_) => ErrorKind::PaymentRequired,
            CoreError::ProviderLookupEmpty { .. } => ErrorKind::ProviderLookupEmpty,
            CoreError::ChunkUnavailable { .. } => ErrorKind::ChunkMissing,
            CoreError::UnknownSession(_) => ErrorKind::ConfigInvalid,
            CoreError::PureClientMode => ErrorKind::ConfigInvalid,
            CoreError::Shutdown => ErrorKind::Shutdown,
            CoreError::ReservationDenied(_) => ErrorKind::ReservationDenied,
            CoreError::PeerBlacklisted { .. } => ErrorKind::PeerBlacklisted,
        }
    }
}
