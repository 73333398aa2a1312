//! Host-process orchestration (`spec.md` §6): wires the DHT Engine, Chunk
//! Store, Manifest Service, Reputation System, Peer Health Manager,
//! Reachability & NAT Module, Relay Pool, Hole-Punch Coordinator, Chunk
//! Scheduler and Payment Checkpoint Engine behind the single [`ChiralNode`]
//! handle, the one seam between the subsystem crates and the outside world.

pub mod config;
pub mod error;
pub mod node;
mod state_db;

pub use config::{ConfigError, NodeConfig};
pub use error::CoreError;
pub use node::{CheckpointInfo, ChiralNode};
pub use state_db::{ns, StateDb, StateDbError};
