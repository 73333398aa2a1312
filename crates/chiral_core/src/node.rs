//! `ChiralNode`: the host-process API of `spec.md` §6. Wires every
//! subsystem crate behind one handle, owning their lifetimes between
//! `start_node` and `stop_node` (`spec.md` §9, "global mutable state becomes
//! explicit handles passed through a root context").

use crate::config::NodeConfig;
use crate::error::CoreError;
use crate::state_db::{ns, StateDb};
use chiral_proto::{Cid, Event, PeerId, PricePerMib};
use checkpoint::{CheckpointSession, Mode as CheckpointMode};
use chunk_store::ChunkStore;
use dht_engine::{ChunkProvider, DhtConfig, DhtHandle, DhtHealth, DhtRole};
use holepunch::HolePunchCoordinator;
use manifest::{Manifest, Protocol};
use parking_lot::Mutex as SyncMutex;
use peer_health::PeerHealthManager;
use reachability::{ProbeOutcome, ReachabilityConfig, ReachabilityModule};
use relay::{CandidateSource, RelayConfig, RelayPool};
use reputation::ReputationStore;
use scheduler::{PeerHealthView, PeerSelection, ReputationView, Scheduler, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const NODE_SESSION: &str = "node";
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const SCHEDULER_BATCH: usize = 8;
const SCHEDULER_TICK: Duration = Duration::from_millis(200);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serves inbound chunk/manifest requests out of the on-disk store, the
/// concrete `dht_engine::ChunkProvider` wired into the driver task at
/// `start_node` (kept a thin adapter so `dht_engine` never depends on
/// `chunk_store`/`manifest` directly).
struct ContentProvider {
    store: Arc<ChunkStore>,
    manifests_dir: PathBuf,
}

impl ChunkProvider for ContentProvider {
    fn get_chunk(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.store.get(cid).ok()
    }

    fn get_manifest(&self, root_cid: &Cid) -> Option<Vec<u8>> {
        std::fs::read(self.manifests_dir.join(format!("{}.json", root_cid.to_hex()))).ok()
    }
}

struct HealthView<'a>(&'a PeerHealthManager);

impl PeerHealthView for HealthView<'_> {
    fn should_use(&self, peer: &PeerId) -> bool {
        self.0.get_health_decision(peer).should_use
    }
    fn max_concurrent(&self, peer: &PeerId) -> u32 {
        self.0.get_health_decision(peer).max_concurrent
    }
}

struct RepView<'a>(&'a ReputationStore);

impl ReputationView for RepView<'_> {
    fn composite(&self, peer: &PeerId) -> f64 {
        self.0.composite(peer)
    }
}

/// One in-flight `spec.md` §4.10 payment session, plus the metadata the
/// Checkpoint Engine itself doesn't carry (`root_cid`, `seeder`,
/// `price_per_mib`), so `state.db` can round-trip the whole thing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointEntry {
    session: CheckpointSession,
    root_cid: Cid,
    seeder: PeerId,
    price_per_mib: PricePerMib,
}

/// Snapshot returned by `get_payment_checkpoint_info` (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub root_cid: Cid,
    pub seeder: PeerId,
    pub price_per_mib: PricePerMib,
    pub bytes_transferred: u64,
    pub next_checkpoint: u64,
    pub total_paid: f64,
    pub mode: CheckpointMode,
}

/// The handle returned by [`ChiralNode::start_node`]. Cheap to clone: every
/// field is itself a handle or an `Arc`, matching the single-driver-task /
/// explicit-handle pattern the DHT Engine already establishes.
#[derive(Clone)]
pub struct ChiralNode {
    config: NodeConfig,
    dht: DhtHandle,
    chunk_store: Arc<ChunkStore>,
    manifests_dir: PathBuf,
    state_db: Arc<StateDb>,
    reputation: Arc<ReputationStore>,
    peer_health: Arc<PeerHealthManager>,
    relay_pool: Arc<SyncMutex<RelayPool>>,
    reachability: Arc<AsyncMutex<ReachabilityModule>>,
    holepunch: Arc<SyncMutex<HolePunchCoordinator>>,
    checkpoints: Arc<SyncMutex<std::collections::HashMap<String, CheckpointEntry>>>,
    event_bus: Arc<events::EventBus>,
    shutdown: watch::Sender<bool>,
    tasks: Arc<SyncMutex<Vec<JoinHandle<()>>>>,
}

impl ChiralNode {
    /// `spec.md` §6 `start_node(cfg) -> local_peer_id`.
    pub async fn start_node(mut config: NodeConfig) -> Result<Self, CoreError> {
        config.apply_env();
        config.validate()?;

        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let manifests_dir = data_dir.join("manifests");
        std::fs::create_dir_all(&manifests_dir)?;

        let chunk_store = Arc::new(ChunkStore::open(data_dir.join("chunks"), config.chunk_size_bytes())?);
        let state_db = Arc::new(StateDb::open(data_dir.join("state.db"))?);

        let reputation = Arc::new(ReputationStore::with_default_half_life());
        let snapshot_path = data_dir.join("reputation.snapshot");
        if snapshot_path.exists() {
            match ReputationStore::load_snapshot(&snapshot_path) {
                Ok(rows) => reputation.restore(rows),
                Err(err) => warn!(subsystem = "reputation", %err, "failed to load reputation snapshot"),
            }
        }

        let peer_health = Arc::new(PeerHealthManager::new());
        let event_bus = Arc::new(events::EventBus::new());

        let mut relay_pool = RelayPool::new(RelayConfig {
            enable_relay_server: config.enable_relay_server,
            ..Default::default()
        });
        for addr in &config.preferred_relays {
            relay_pool.add_candidate(PeerId::new(addr.clone()), addr.clone(), CandidateSource::Config);
        }
        let relay_pool = Arc::new(SyncMutex::new(relay_pool));

        let reachability = Arc::new(AsyncMutex::new(ReachabilityModule::new(ReachabilityConfig {
            probe_interval: Duration::from_secs(config.autonat_probe_interval_secs as u64),
            ..Default::default()
        })));
        let holepunch = Arc::new(SyncMutex::new(HolePunchCoordinator::new()));

        let dht_config = DhtConfig {
            listen_port: config.dht_port,
            bootstrap_addrs: config.bootstrap_addrs.clone(),
            role: if config.bootstrap_role {
                DhtRole::Bootstrap
            } else {
                DhtRole::Normal
            },
            client_only: config.pure_client_mode,
            ..Default::default()
        };
        let (dht, mut driver) = dht_engine::spawn(dht_config, event_bus.clone());
        driver.set_chunk_provider(Arc::new(ContentProvider {
            store: chunk_store.clone(),
            manifests_dir: manifests_dir.clone(),
        }));
        let driver_task = tokio::spawn(driver.run());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let checkpoints = Arc::new(SyncMutex::new(load_checkpoints(&state_db)));

        let node = Self {
            config,
            dht,
            chunk_store,
            manifests_dir,
            state_db,
            reputation,
            peer_health,
            relay_pool,
            reachability,
            holepunch,
            checkpoints,
            event_bus,
            shutdown: shutdown_tx,
            tasks: Arc::new(SyncMutex::new(vec![driver_task])),
        };

        node.spawn_reachability_probe(shutdown_rx.clone());
        node.spawn_relay_maintenance(shutdown_rx.clone());
        node.spawn_holepunch_maintenance(shutdown_rx);

        info!(subsystem = "node", peer_id = %node.local_peer_id(), "node started");
        Ok(node)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.dht.local_peer_id().clone()
    }

    /// `spec.md` §5: drains inboxes with a bounded grace period (config's
    /// `shutdown_grace_secs`, `SPEC_FULL.md` §C) then forcibly aborts.
    pub async fn stop_node(self) {
        let _ = self.shutdown.send(true);
        self.dht.shutdown().await;

        if let Err(err) = self
            .reputation
            .save_snapshot(PathBuf::from(&self.config.data_dir).join("reputation.snapshot"))
        {
            warn!(subsystem = "reputation", %err, "failed to persist reputation snapshot on shutdown");
        }
        let _ = self.state_db.flush();

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let join_all = futures::future::join_all(tasks);
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!(subsystem = "node", "shutdown grace period elapsed; remaining tasks left to drop");
        }
        info!(subsystem = "node", "node stopped");
    }

    fn publish(&self, event: Event) {
        let bus = self.event_bus.clone();
        tokio::spawn(async move {
            bus.publish(NODE_SESSION, event).await;
        });
    }

    // ---- Manifest Service / publish & discover ----------------------------

    /// `spec.md` §6 `publish_file`. Refused in pure-client mode (§8 scenario 6).
    pub async fn publish_file(
        &self,
        path: impl AsRef<Path>,
        price_per_mib: Option<PricePerMib>,
        protocol: Option<Protocol>,
    ) -> Result<Manifest, CoreError> {
        if self.config.pure_client_mode {
            return Err(CoreError::PureClientMode);
        }
        let mut manifest = manifest::build(path, self.config.chunk_size_bytes(), &self.chunk_store)?;
        manifest.price_per_mib = price_per_mib;
        manifest.protocol = protocol.unwrap_or_default();
        manifest.encoded_by = Some(self.local_peer_id());

        self.save_manifest(&manifest)?;
        self.dht
            .put_provider(manifest.root_cid, price_per_mib.map(|p| p.0))
            .await?;

        self.publish(Event::PublishedFile {
            root_cid: manifest.root_cid,
            size: manifest.total_size,
        });
        Ok(manifest)
    }

    fn manifest_path(&self, root_cid: &Cid) -> PathBuf {
        self.manifests_dir.join(format!("{}.json", root_cid.to_hex()))
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<(), CoreError> {
        std::fs::write(self.manifest_path(&manifest.root_cid), manifest.encode()?)
            .map_err(|e| CoreError::Manifest(manifest::ManifestError::Io(e)))
    }

    /// `spec.md` §6 `search_file_metadata(root_cid, timeout_ms) -> Manifest | none`.
    /// Checks the local cache (covers both self-published and previously
    /// downloaded manifests) before falling back to the DHT + a remote fetch.
    pub async fn search_file_metadata(
        &self,
        root_cid: Cid,
        timeout_ms: u64,
    ) -> Result<Option<Manifest>, CoreError> {
        let cached_path = self.manifest_path(&root_cid);
        if let Ok(bytes) = std::fs::read(&cached_path) {
            return Ok(Some(Manifest::decode(&bytes)?));
        }

        let timeout = Duration::from_millis(timeout_ms);
        let providers = self.dht.get_providers(root_cid, timeout).await?;
        for provider in providers {
            match self.dht.fetch_manifest(provider.peer.clone(), root_cid).await {
                Ok(bytes) => {
                    let manifest = Manifest::decode(&bytes)?;
                    if manifest.root_cid != root_cid {
                        continue;
                    }
                    self.save_manifest(&manifest)?;
                    self.publish(Event::FoundFile {
                        root_cid,
                        seeders: vec![provider.peer],
                    });
                    return Ok(Some(manifest));
                }
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    /// `spec.md` §6 `get_file_seeders(root_cid) -> list<peer_id>`.
    pub async fn get_file_seeders(&self, root_cid: Cid) -> Result<Vec<PeerId>, CoreError> {
        let providers = self.dht.get_providers(root_cid, DEFAULT_LOOKUP_TIMEOUT).await?;
        Ok(providers.into_iter().map(|p| p.peer).collect())
    }

    // ---- Chunk Scheduler driven download -----------------------------------

    /// `spec.md` §6 `download_file(manifest, out_path) -> Manifest`. Resolves
    /// providers via the DHT, drives the scheduler (§4.9) to completion or
    /// exhaustion, and reassembles the file, emitting progress events along
    /// the way.
    pub async fn download_file(
        &self,
        manifest: &Manifest,
        out_path: impl AsRef<Path>,
    ) -> Result<Manifest, CoreError> {
        let providers = self
            .dht
            .get_providers(manifest.root_cid, DEFAULT_LOOKUP_TIMEOUT)
            .await?;
        if providers.is_empty() {
            return Err(CoreError::ProviderLookupEmpty {
                root_cid: manifest.root_cid.to_hex(),
            });
        }

        let cids: Vec<Cid> = manifest.chunks.iter().map(|c| c.cid).collect();
        let mut scheduler = Scheduler::new(
            cids,
            SchedulerConfig {
                peer_selection: PeerSelection::ReputationWeighted,
                ..Default::default()
            },
        );
        for provider in &providers {
            self.reputation.note_seen(&provider.peer);
            self.peer_health.on_success(&provider.peer, None);
            for index in 0..manifest.chunks.len() as u32 {
                scheduler.add_provider(index, provider.peer.clone());
            }
        }

        let start = Instant::now();
        loop {
            let now_ms = start.elapsed().as_millis() as u64;
            let health = HealthView(&self.peer_health);
            let rep = RepView(&self.reputation);
            let dispatches = scheduler.next_requests(SCHEDULER_BATCH, now_ms, &health, &rep);

            if dispatches.is_empty() {
                if scheduler.is_complete() {
                    break;
                }
                if !scheduler.has_pending_work() {
                    return Err(CoreError::ChunkUnavailable { index: 0 });
                }
                if let Some(index) = (0..scheduler.total_chunks() as u32)
                    .find(|i| scheduler.all_providers_blacklisted(*i))
                {
                    return Err(CoreError::PeerBlacklisted { index });
                }
                tokio::time::sleep(SCHEDULER_TICK).await;
                continue;
            }

            let fetches = dispatches.into_iter().map(|dispatch| {
                let dht = self.dht.clone();
                let peer_health = self.peer_health.clone();
                async move {
                    peer_health.begin_request(&dispatch.peer);
                    let result = dht.fetch_chunk(dispatch.peer.clone(), manifest.chunks[dispatch.chunk_index as usize].cid).await;
                    peer_health.end_request(&dispatch.peer);
                    (dispatch, result)
                }
            });
            let results = futures::future::join_all(fetches).await;

            for (dispatch, result) in results {
                match result {
                    Ok(bytes) => {
                        if self.chunk_store.put(&bytes).is_ok()
                            && scheduler.on_chunk_received(dispatch.chunk_index, &dispatch.peer, &bytes)
                        {
                            self.reputation.success(&dispatch.peer, None);
                            self.peer_health.on_success(&dispatch.peer, None);
                        } else {
                            self.reputation.failure(&dispatch.peer);
                            self.peer_health.on_failure(&dispatch.peer);
                        }
                    }
                    Err(_) => {
                        scheduler.on_chunk_failed(dispatch.chunk_index, &dispatch.peer, false);
                        self.reputation.failure(&dispatch.peer);
                        self.peer_health.on_failure(&dispatch.peer);
                    }
                }
            }

            let bytes_transferred: u64 = manifest
                .chunks
                .iter()
                .filter(|c| self.chunk_store.has(&c.cid))
                .map(|c| c.size as u64)
                .sum();
            self.publish(Event::TransferProgress {
                root_cid: manifest.root_cid,
                bytes_transferred,
                file_size: manifest.total_size,
            });
        }

        manifest::reassemble(manifest, &self.chunk_store, out_path)?;
        self.publish(Event::FileContent {
            root_cid: manifest.root_cid,
            bytes_written: manifest.total_size,
        });
        Ok(manifest.clone())
    }

    // ---- DHT passthroughs ---------------------------------------------------

    pub async fn get_dht_peer_count(&self) -> Result<u32, CoreError> {
        Ok(self.dht.connected_peers().await?.len() as u32)
    }

    pub async fn get_dht_health(&self) -> Result<DhtHealth, CoreError> {
        Ok(self.dht.health().await?)
    }

    pub async fn connect_to_peer(&self, addr: impl Into<String>) -> Result<(), CoreError> {
        Ok(self.dht.dial(addr).await?)
    }

    /// Explicitly requests a reservation from `relay_addr` and waits for the
    /// driver to report the outcome over `Event::RelayStateChanged`,
    /// surfacing a denial as a host-visible error instead of leaving it
    /// buried in `RelayPool` bookkeeping (`spec.md` §4.7).
    pub async fn reserve_relay(&self, relay_addr: impl Into<String>) -> Result<(), CoreError> {
        let relay_addr = relay_addr.into();
        let peer = relay_addr
            .rsplit("/p2p/")
            .next()
            .map(PeerId::new)
            .unwrap_or_else(|| PeerId::new(relay_addr.clone()));

        self.relay_pool.lock().record_attempt();
        self.dht.reserve_relay(relay_addr).await?;

        let mut events = self.event_bus.subscribe_lossy();
        let deadline = tokio::time::Instant::now() + DEFAULT_LOOKUP_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default();
            if remaining.is_zero() {
                return Err(CoreError::ReservationDenied(format!(
                    "no response from {peer} within timeout"
                )));
            }
            let Ok(Ok(seq_event)) = tokio::time::timeout(remaining, events.recv()).await else {
                return Err(CoreError::ReservationDenied(format!(
                    "no response from {peer} within timeout"
                )));
            };
            if let Event::RelayStateChanged {
                relay,
                healthy,
                summary,
            } = seq_event.payload
            {
                if relay != peer {
                    continue;
                }
                if healthy {
                    self.relay_pool.lock().record_reservation_success(&relay, 3600);
                    return Ok(());
                }
                self.relay_pool
                    .lock()
                    .record_reservation_failure(&relay, summary.clone());
                return Err(CoreError::ReservationDenied(summary));
            }
        }
    }

    /// Current Reachability & NAT Module verdict, for `--show-reachability`
    /// (`spec.md` §6/§4.6) and host status surfaces.
    pub async fn reachability_state(&self) -> (&'static str, &'static str) {
        let module = self.reachability.lock().await;
        (module.state().as_str(), module.confidence().as_str())
    }

    /// `spec.md` §9 "scheduler without background timers"-equivalent for the
    /// chunk store: host-triggered, not an ambient timer (`SPEC_FULL.md` §C).
    pub fn run_gc(&self) -> Result<chunk_store::GcReport, CoreError> {
        let keep = self.referenced_cids()?;
        Ok(self.chunk_store.gc(&keep)?)
    }

    fn referenced_cids(&self) -> Result<HashSet<Cid>, CoreError> {
        let mut keep = HashSet::new();
        for entry in std::fs::read_dir(&self.manifests_dir)? {
            let entry = entry?;
            if let Ok(bytes) = std::fs::read(entry.path()) {
                if let Ok(manifest) = Manifest::decode(&bytes) {
                    keep.extend(manifest.chunks.iter().map(|c| c.cid));
                }
            }
        }
        Ok(keep)
    }

    // ---- Payment Checkpoint Engine (spec.md §4.10/§6) ------------------------

    pub fn init_payment_checkpoint(
        &self,
        session_id: impl Into<String>,
        root_cid: Cid,
        file_size: u64,
        seeder: PeerId,
        price_per_mib: PricePerMib,
        mode: CheckpointMode,
    ) {
        let session_id = session_id.into();
        let entry = CheckpointEntry {
            session: CheckpointSession::new(session_id.clone(), file_size, mode),
            root_cid,
            seeder,
            price_per_mib,
        };
        self.persist_checkpoint(&session_id, &entry);
        self.checkpoints.lock().insert(session_id, entry);
    }

    fn persist_checkpoint(&self, session_id: &str, entry: &CheckpointEntry) {
        if let Err(err) = self.state_db.put(ns::CHECKPOINT, session_id, entry) {
            warn!(subsystem = "checkpoint", %err, "failed to persist checkpoint session");
        }
    }

    pub fn update_payment_checkpoint_progress(
        &self,
        session_id: &str,
        bytes: u64,
    ) -> Result<checkpoint::CheckpointState, CoreError> {
        let mut guard = self.checkpoints.lock();
        let entry = guard
            .get_mut(session_id)
            .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
        let state = entry.session.update_progress(bytes);
        if entry.session.should_pause_serving() {
            self.publish(Event::CheckpointWaiting {
                session_id: session_id.to_string(),
                next_checkpoint: entry.session.next_checkpoint,
                price_per_mib: entry.price_per_mib,
            });
        }
        self.persist_checkpoint(session_id, entry);
        Ok(state)
    }

    pub fn record_checkpoint_payment(
        &self,
        session_id: &str,
        tx_hash: impl Into<String>,
        amount: f64,
    ) -> Result<(), CoreError> {
        let mut guard = self.checkpoints.lock();
        let entry = guard
            .get_mut(session_id)
            .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
        entry.session.record_payment(tx_hash, amount, now_secs())?;
        self.publish(Event::CheckpointPaid {
            session_id: session_id.to_string(),
            total_paid: entry.session.total_paid,
            next_checkpoint: entry.session.next_checkpoint,
        });
        self.persist_checkpoint(session_id, entry);
        Ok(())
    }

    pub fn check_should_pause_serving(&self, session_id: &str) -> Result<bool, CoreError> {
        let guard = self.checkpoints.lock();
        let entry = guard
            .get(session_id)
            .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
        Ok(entry.session.should_pause_serving())
    }

    pub fn get_payment_checkpoint_info(&self, session_id: &str) -> Result<CheckpointInfo, CoreError> {
        let guard = self.checkpoints.lock();
        let entry = guard
            .get(session_id)
            .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
        Ok(CheckpointInfo {
            root_cid: entry.root_cid,
            seeder: entry.seeder.clone(),
            price_per_mib: entry.price_per_mib,
            bytes_transferred: entry.session.bytes_transferred,
            next_checkpoint: entry.session.next_checkpoint,
            total_paid: entry.session.total_paid,
            mode: entry.session.mode,
        })
    }

    pub fn mark_checkpoint_payment_failed(&self, session_id: &str) -> Result<(), CoreError> {
        let mut guard = self.checkpoints.lock();
        let entry = guard
            .get_mut(session_id)
            .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
        entry.session.mark_payment_failed();
        self.persist_checkpoint(session_id, entry);
        Ok(())
    }

    pub fn mark_checkpoint_completed(&self, session_id: &str) -> Result<(), CoreError> {
        let mut guard = self.checkpoints.lock();
        let entry = guard
            .get_mut(session_id)
            .ok_or_else(|| CoreError::UnknownSession(session_id.to_string()))?;
        entry.session.mark_completed();
        self.persist_checkpoint(session_id, entry);
        Ok(())
    }

    pub fn remove_payment_checkpoint_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.checkpoints.lock().remove(session_id);
        if let Err(err) = self.state_db.remove(ns::CHECKPOINT, session_id) {
            warn!(subsystem = "checkpoint", %err, "failed to remove checkpoint session from state.db");
        }
        Ok(())
    }

    // ---- Background tasks ---------------------------------------------------

    /// Feeds the `autonat` verdict into the Reachability & NAT Module on a
    /// jittered cadence (`spec.md` §4.6). `autonat_servers` is cycled through
    /// as the probe's "distinct server" label so repeated agreement across
    /// configured servers can raise confidence the way §8 scenario 5 expects;
    /// a node with none configured falls back to a single synthetic label,
    /// which caps confidence at `low`/`medium` until servers are added.
    fn spawn_reachability_probe(&self, shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enable_autonat {
            return;
        }
        let reachability = self.reachability.clone();
        let dht = self.dht.clone();
        let servers = if self.config.autonat_servers.is_empty() {
            vec!["local-autonat".to_string()]
        } else {
            self.config.autonat_servers.clone()
        };
        let cursor = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(async move {
            reachability::run_probe_loop(&reachability, shutdown_rx, || {
                let dht = dht.clone();
                let servers = servers.clone();
                let cursor = cursor.clone();
                async move {
                    match dht.autonat_status().await {
                        Ok(Some(true)) => {
                            let server = servers[cursor.fetch_add(1, Ordering::Relaxed) % servers.len()].clone();
                            vec![ProbeOutcome::InboundSuccess { server }]
                        }
                        Ok(Some(false)) => {
                            let server = servers[cursor.fetch_add(1, Ordering::Relaxed) % servers.len()].clone();
                            vec![ProbeOutcome::InboundFailure { server }]
                        }
                        _ => Vec::new(),
                    }
                }
            })
            .await;
        });
        self.tasks.lock().push(handle);
    }

    /// Tracks `libp2p-dcutr` outcomes into the Hole-Punch Coordinator
    /// (`spec.md` §4.8): every `Event::DcutrResult` the driver publishes
    /// updates the matching session's state machine.
    fn spawn_holepunch_maintenance(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let holepunch = self.holepunch.clone();
        let mut events = self.event_bus.subscribe_lossy();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        if let Ok(seq_event) = event {
                            if let chiral_proto::Event::DcutrResult { peer, upgraded } = seq_event.payload {
                                let mut coordinator = holepunch.lock();
                                if upgraded {
                                    coordinator.record_direct_success(&peer);
                                } else {
                                    coordinator.record_direct_failure(&peer);
                                }
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Maintains the relay pool: promotes the best candidate to an active
    /// reservation via the driver's real `libp2p-relay` circuit listen
    /// (`spec.md` §4.7); renewal/eviction bookkeeping reacts to
    /// `Event::RelayStateChanged` published by the driver.
    fn spawn_relay_maintenance(&self, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enable_autorelay {
            return;
        }
        let relay_pool = self.relay_pool.clone();
        let dht = self.dht.clone();
        let mut events = self.event_bus.subscribe_lossy();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        let candidate = relay_pool.lock().next_candidate();
                        if let Some(peer) = candidate {
                            relay_pool.lock().record_attempt();
                            let addr = relay_pool
                                .lock()
                                .candidate(&peer)
                                .map(|c| c.addr.clone());
                            if let Some(addr) = addr {
                                if let Err(err) = dht.reserve_relay(addr).await {
                                    relay_pool.lock().record_reservation_failure(&peer, err.to_string());
                                }
                            }
                        }
                        let expired = relay_pool.lock().expired();
                        for peer in expired {
                            relay_pool.lock().evict(&peer);
                        }
                    }
                    event = events.recv() => {
                        if let Ok(seq_event) = event {
                            if let chiral_proto::Event::RelayStateChanged { relay, healthy, summary } = seq_event.payload {
                                let mut pool = relay_pool.lock();
                                if healthy {
                                    pool.record_reservation_success(&relay, 3600);
                                } else {
                                    pool.record_reservation_failure(&relay, summary);
                                }
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

fn load_checkpoints(db: &StateDb) -> std::collections::HashMap<String, CheckpointEntry> {
    match db.scan::<CheckpointEntry>(ns::CHECKPOINT) {
        Ok(entries) => entries
            .into_iter()
            .map(|e| (e.session.session_id.clone(), e))
            .collect(),
        Err(err) => {
            warn!(subsystem = "checkpoint", %err, "failed to load persisted checkpoint sessions");
            std::collections::HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static NEXT_PORT: AtomicUsize = AtomicUsize::new(44_100);

    fn test_config(dir: &Path) -> NodeConfig {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed) as u16;
        NodeConfig {
            dht_port: port,
            data_dir: dir.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_and_stop_node_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let node = ChiralNode::start_node(test_config(dir.path())).await.unwrap();
        let _ = node.local_peer_id();
        node.stop_node().await;
    }

    #[tokio::test]
    async fn publish_then_search_returns_the_manifest_locally() {
        let dir = tempfile::tempdir().unwrap();
        let node = ChiralNode::start_node(test_config(dir.path())).await.unwrap();

        let input_path = dir.path().join("input.bin");
        std::fs::write(&input_path, vec![0x41u8; 1_048_576]).unwrap();
        let manifest = node.publish_file(&input_path, None, None).await.unwrap();
        assert_eq!(manifest.total_size, 1_048_576);

        let found = node
            .search_file_metadata(manifest.root_cid, 1_000)
            .await
            .unwrap();
        assert_eq!(found.unwrap().root_cid, manifest.root_cid);

        node.stop_node().await;
    }

    #[tokio::test]
    async fn pure_client_mode_refuses_publish() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.pure_client_mode = true;
        let node = ChiralNode::start_node(cfg).await.unwrap();

        let input_path = dir.path().join("input.bin");
        std::fs::write(&input_path, b"hello").unwrap();
        let err = node.publish_file(&input_path, None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::PureClientMode));

        node.stop_node().await;
    }

    #[tokio::test]
    async fn checkpoint_lifecycle_round_trips_through_state_db() {
        let dir = tempfile::tempdir().unwrap();
        let node = ChiralNode::start_node(test_config(dir.path())).await.unwrap();

        let root = Cid::of(b"a file");
        node.init_payment_checkpoint(
            "s1",
            root,
            50 * 1024 * 1024,
            PeerId::new("seeder"),
            PricePerMib(10),
            CheckpointMode::Exponential,
        );
        node.update_payment_checkpoint_progress("s1", 10 * 1024 * 1024)
            .unwrap();
        assert!(node.check_should_pause_serving("s1").unwrap());

        node.record_checkpoint_payment("s1", "0xabc", 0.01).unwrap();
        assert!(!node.check_should_pause_serving("s1").unwrap());

        let info = node.get_payment_checkpoint_info("s1").unwrap();
        assert_eq!(info.next_checkpoint, 30 * 1024 * 1024);

        node.remove_payment_checkpoint_session("s1").unwrap();
        assert!(node.get_payment_checkpoint_info("s1").is_err());

        node.stop_node().await;
    }
}
