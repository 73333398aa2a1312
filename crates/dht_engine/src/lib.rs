//! Kademlia DHT participant (`spec.md` §4.5).
//!
//! A single *driver* task owns the `libp2p` [`Swarm`] and the routing
//! table; every other component talks to it through [`DhtHandle`], which
//! only ever sends commands over an `mpsc` channel (`spec.md` §5: "This
//! serializes mutation of DHT state without taking coarse locks"). The
//! handle is the only trait boundary callers see; it is backed here by
//! real `libp2p::kad` and could be swapped for a fake store in tests.

mod behaviour;
mod driver;
mod transfer;

use chiral_proto::{Cid, PeerId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use driver::DhtDriver;
pub use transfer::ChunkProvider;

const DEFAULT_COMMAND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("dht driver is no longer running")]
    DriverGone,
    #[error("invalid multiaddr: {0}")]
    InvalidAddr(String),
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("node is in client-only mode and cannot {0}")]
    ClientOnly(&'static str),
    #[error("node is running the bootstrap role and cannot {0}")]
    BootstrapRole(&'static str),
    #[error("peer does not have the requested chunk")]
    ChunkNotFound,
    #[error("too many in-flight transfer requests to peer {0}")]
    RateLimited(String),
}

/// One provider advertisement as carried in the DHT: the native
/// `libp2p::kad` provider-record peer id plus the metadata side-record
/// the engine writes alongside it (`SPEC_FULL.md` §C).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub peer: PeerId,
    pub addrs: Vec<String>,
    pub price_per_mib: Option<u64>,
    pub advertised_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtRole {
    Bootstrap,
    Normal,
}

/// `spec.md` §6 `get_dht_health()`, shape fixed by `SPEC_FULL.md` §C.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtHealth {
    pub role: DhtRole,
    pub routing_table_size: usize,
    pub connected_peers: usize,
    pub bootstrap_failures: u32,
    pub pending_queries: usize,
    pub client_only: bool,
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub listen_port: u16,
    pub bootstrap_addrs: Vec<String>,
    pub role: DhtRole,
    pub client_only: bool,
    /// Minimum bucket fill below which the routing-table refresh runs at
    /// the fast (1 s) cadence instead of the 30 s steady-state cadence.
    pub min_bucket_fill: usize,
    pub fast_refresh_interval: Duration,
    pub steady_refresh_interval: Duration,
    pub reprovide_interval: Duration,
    pub bootstrap_backoff_base: Duration,
    pub bootstrap_backoff_cap: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_addrs: Vec::new(),
            role: DhtRole::Normal,
            client_only: false,
            min_bucket_fill: 20,
            fast_refresh_interval: Duration::from_secs(1),
            steady_refresh_interval: Duration::from_secs(30),
            reprovide_interval: Duration::from_secs(3600),
            bootstrap_backoff_base: Duration::from_secs(1),
            bootstrap_backoff_cap: Duration::from_secs(300),
        }
    }
}

pub(crate) enum Command {
    Dial {
        addr: String,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    ListenOn {
        addr: String,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    PutProvider {
        root: Cid,
        price_per_mib: Option<u64>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    GetProviders {
        root: Cid,
        timeout: Duration,
        reply: oneshot::Sender<Vec<ProviderRecord>>,
    },
    Health {
        reply: oneshot::Sender<DhtHealth>,
    },
    AutonatStatus {
        reply: oneshot::Sender<Option<bool>>,
    },
    ReserveRelay {
        addr: String,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    FetchChunk {
        peer: PeerId,
        cid: Cid,
        reply: oneshot::Sender<Result<Vec<u8>, DhtError>>,
    },
    FetchManifest {
        peer: PeerId,
        root_cid: Cid,
        reply: oneshot::Sender<Result<Vec<u8>, DhtError>>,
    },
    Shutdown,
}

/// Cheaply cloneable command-channel handle to the DHT driver task.
#[derive(Clone)]
pub struct DhtHandle {
    tx: mpsc::Sender<Command>,
    local_peer_id: PeerId,
    client_only: bool,
    role: DhtRole,
}

impl DhtHandle {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub async fn dial(&self, addr: impl Into<String>) -> Result<(), DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial {
            addr: addr.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| DhtError::DriverGone)?
    }

    pub async fn listen_on(&self, addr: impl Into<String>) -> Result<(), DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ListenOn {
            addr: addr.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| DhtError::DriverGone)?
    }

    /// `spec.md` §4.5 `put_provider`. Rejected in client-only mode ("never
    /// publish provider records") and in the bootstrap role, which is a
    /// pure router and publishes no provider records of its own.
    pub async fn put_provider(
        &self,
        root: Cid,
        price_per_mib: Option<u64>,
    ) -> Result<(), DhtError> {
        if self.client_only {
            return Err(DhtError::ClientOnly("publish provider records"));
        }
        if self.role == DhtRole::Bootstrap {
            return Err(DhtError::BootstrapRole("publish provider records"));
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::PutProvider {
            root,
            price_per_mib,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DhtError::DriverGone)?
    }

    /// `spec.md` §4.5 `get_providers(root_cid, timeout)`. Works in
    /// client-only mode: "all lookups still work".
    pub async fn get_providers(
        &self,
        root: Cid,
        timeout: Duration,
    ) -> Result<Vec<ProviderRecord>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetProviders {
            root,
            timeout,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DhtError::DriverGone)
    }

    pub async fn health(&self) -> Result<DhtHealth, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Health { reply }).await?;
        rx.await.map_err(|_| DhtError::DriverGone)
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectedPeers { reply }).await?;
        rx.await.map_err(|_| DhtError::DriverGone)
    }

    /// Last `autonat` verdict: `Some(true)` publicly reachable, `Some(false)`
    /// behind a NAT/firewall, `None` not yet determined. The reachability
    /// probe loop (`spec.md` §4.6) polls this as its `ProbeOutcome` source.
    pub async fn autonat_status(&self) -> Result<Option<bool>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AutonatStatus { reply }).await?;
        rx.await.map_err(|_| DhtError::DriverGone)
    }

    /// Fetches one chunk's bytes from `peer` over the `chunk_transfer`
    /// request/response protocol (`spec.md` §4.9/§6 `download_file`).
    pub async fn fetch_chunk(&self, peer: PeerId, cid: Cid) -> Result<Vec<u8>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FetchChunk { peer, cid, reply }).await?;
        rx.await.map_err(|_| DhtError::DriverGone)?
    }

    /// Fetches a manifest's encoded bytes from `peer`
    /// (`spec.md` §6 `search_file_metadata`).
    pub async fn fetch_manifest(&self, peer: PeerId, root_cid: Cid) -> Result<Vec<u8>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FetchManifest {
            peer,
            root_cid,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DhtError::DriverGone)?
    }

    /// Starts listening on `relay_addr`'s circuit address, asking that relay
    /// for a `libp2p-relay-v2` reservation. The actual accept/reject arrives
    /// later as an `Event::RelayStateChanged` on the event bus; this call
    /// only reports whether the listen attempt was issued (`spec.md` §4.7).
    pub async fn reserve_relay(&self, relay_addr: impl Into<String>) -> Result<(), DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReserveRelay {
            addr: relay_addr.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| DhtError::DriverGone)?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), DhtError> {
        self.tx.send(cmd).await.map_err(|_| DhtError::DriverGone)
    }
}

/// Builds the keypair, `Swarm` and driver task, returning a [`DhtHandle`]
/// plus the driver future the caller spawns onto its own executor. Kept
/// separate from the handle so `chiral_core` controls the task's lifetime
/// rather than this crate spawning it implicitly.
pub fn spawn(config: DhtConfig, event_bus: std::sync::Arc<events::EventBus>) -> (DhtHandle, DhtDriver) {
    let (tx, rx) = mpsc::channel(DEFAULT_COMMAND_CAPACITY);
    let (driver, local_peer_id) = DhtDriver::new(config.clone(), rx, event_bus);
    let handle = DhtHandle {
        tx,
        local_peer_id,
        client_only: config.client_only,
        role: config.role,
    };
    (handle, driver)
}
