use crate::behaviour::{ChiralBehaviour, ChiralBehaviourEvent};
use crate::transfer::{ChunkProvider, TransferRequest, TransferResponse};
use crate::{Command, DhtConfig, DhtError, DhtHealth, DhtRole, ProviderRecord};
use chiral_proto::{Cid, Event, PeerId as ChiralPeerId};
use futures::StreamExt;
use libp2p::core::multiaddr::Protocol;
use libp2p::request_response;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, identity, kad, noise, relay, tcp, yamux, Multiaddr, PeerId, Swarm, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Interval;
use tracing::{debug, info, warn};

const DHT_SESSION: &str = "dht";

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn chiral_peer(p: PeerId) -> ChiralPeerId {
    ChiralPeerId::new(p.to_string())
}

fn root_key(root: &Cid) -> kad::RecordKey {
    kad::RecordKey::new(&format!("provider/{}", root.to_hex()).into_bytes())
}

fn provider_meta_key(root: &Cid, peer: &ChiralPeerId) -> kad::RecordKey {
    kad::RecordKey::new(&format!("provider-meta/{}/{}", root.to_hex(), peer.as_str()).into_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProviderRecordMeta {
    addrs: Vec<String>,
    price_per_mib: Option<u64>,
    advertised_at: u64,
}

struct PendingGetProviders {
    root: Cid,
    deadline: Instant,
    found: Vec<ChiralPeerId>,
    reply: Option<oneshot::Sender<Vec<ProviderRecord>>>,
}

struct PendingFetch {
    peer: ChiralPeerId,
    reply: oneshot::Sender<Result<Vec<u8>, DhtError>>,
}

/// Outbound transfer requests to a single peer accepted before the driver
/// starts rejecting new ones with [`DhtError::RateLimited`]. Bounds how much
/// of the single driver task's attention one peer can claim.
const MAX_INFLIGHT_TRANSFER_REQUESTS_PER_PEER: usize = 8;

/// Owns the `Swarm` and the routing table; the only task in the process
/// allowed to mutate either (`spec.md` §5).
pub struct DhtDriver {
    swarm: Swarm<ChiralBehaviour>,
    cmd_rx: mpsc::Receiver<Command>,
    config: DhtConfig,
    event_bus: Arc<events::EventBus>,
    local_peer_id: PeerId,
    bootstrap_failures: u32,
    bootstrap_backoff: Duration,
    next_bootstrap_retry: Option<Instant>,
    refresh_period: Duration,
    connected: std::collections::HashSet<ChiralPeerId>,
    local_provider_records: HashMap<Cid, ProviderRecordMeta>,
    pending_get_providers: HashMap<kad::QueryId, PendingGetProviders>,
    pending_meta: HashMap<kad::QueryId, (Cid, ChiralPeerId)>,
    collected_meta: HashMap<(Cid, ChiralPeerId), ProviderRecord>,
    pending_fetches: HashMap<request_response::OutboundRequestId, PendingFetch>,
    chunk_provider: Option<Arc<dyn ChunkProvider>>,
    /// Last `autonat` verdict: `Some(true)` public, `Some(false)` private,
    /// `None` not yet determined. Feeds `reachability::ProbeOutcome`.
    autonat_public: Option<bool>,
}

impl DhtDriver {
    pub fn new(
        config: DhtConfig,
        cmd_rx: mpsc::Receiver<Command>,
        event_bus: Arc<events::EventBus>,
    ) -> (Self, ChiralPeerId) {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());

        let (relay_transport, relay_client) = relay::client::new(local_peer_id);
        let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default());
        let transport = relay_transport
            .or_transport(tcp_transport)
            .upgrade(libp2p::core::upgrade::Version::V1Lazy)
            .authenticate(noise::Config::new(&keypair).expect("noise static keypair"))
            .multiplex(yamux::Config::default())
            .timeout(Duration::from_secs(20))
            .boxed();

        let mut kad = kad::Behaviour::new(local_peer_id, kad::store::MemoryStore::new(local_peer_id));
        kad.set_mode(Some(if config.client_only {
            kad::Mode::Client
        } else {
            kad::Mode::Server
        }));

        let identify = identify::Behaviour::new(identify::Config::new(
            "/chiral/1.0.0".to_string(),
            keypair.public(),
        ));
        let ping = libp2p::ping::Behaviour::new(libp2p::ping::Config::new());
        let dcutr = libp2p::dcutr::Behaviour::new(local_peer_id);
        let autonat =
            libp2p::autonat::Behaviour::new(local_peer_id, libp2p::autonat::Config::default());

        let behaviour = ChiralBehaviour {
            kad,
            identify,
            ping,
            relay_client,
            dcutr,
            autonat,
            chunk_transfer: crate::transfer::new_behaviour(),
        };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(Duration::from_secs(60)),
        );

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .expect("well-formed listen multiaddr");
        if let Err(err) = swarm.listen_on(listen_addr) {
            warn!(subsystem = "dht", %err, "failed to bind listen address");
        }

        let chiral_id = chiral_peer(local_peer_id);
        let fast = config.fast_refresh_interval;
        let driver = Self {
            swarm,
            cmd_rx,
            config,
            event_bus,
            local_peer_id,
            bootstrap_failures: 0,
            bootstrap_backoff: Duration::from_secs(1),
            next_bootstrap_retry: None,
            refresh_period: fast,
            connected: Default::default(),
            local_provider_records: HashMap::new(),
            pending_get_providers: HashMap::new(),
            pending_meta: HashMap::new(),
            collected_meta: HashMap::new(),
            pending_fetches: HashMap::new(),
            chunk_provider: None,
            autonat_public: None,
        };
        (driver, chiral_id)
    }

    /// Installs the local chunk-serving callback. Left unset, inbound
    /// fetch requests are answered `NotFound` (a pure client or a node
    /// that has not opened its store yet).
    pub fn set_chunk_provider(&mut self, provider: Arc<dyn ChunkProvider>) {
        self.chunk_provider = Some(provider);
    }

    pub async fn run(mut self) {
        self.bootstrap_backoff = self.config.bootstrap_backoff_base;
        self.dial_bootstrap_peers();

        let mut refresh: Interval = tokio::time::interval(self.refresh_period);
        let mut reprovide = tokio::time::interval(self.config.reprovide_interval);
        let mut tick = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                _ = refresh.tick() => {
                    self.run_routing_refresh(&mut refresh);
                }
                _ = reprovide.tick() => {
                    self.reprovide_all();
                }
                _ = tick.tick() => {
                    self.expire_get_providers();
                    self.retry_bootstrap_if_due();
                }
            }
        }
        info!(subsystem = "dht", "driver task shutting down");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { addr, reply } => {
                let _ = reply.send(self.dial(&addr));
            }
            Command::ListenOn { addr, reply } => {
                let result = addr
                    .parse::<Multiaddr>()
                    .map_err(|_| DhtError::InvalidAddr(addr.clone()))
                    .and_then(|ma| {
                        self.swarm
                            .listen_on(ma)
                            .map(|_| ())
                            .map_err(|e| DhtError::DialFailed(e.to_string()))
                    });
                let _ = reply.send(result);
            }
            Command::PutProvider {
                root,
                price_per_mib,
                reply,
            } => {
                let _ = reply.send(self.put_provider(root, price_per_mib));
            }
            Command::GetProviders {
                root,
                timeout,
                reply,
            } => {
                let key = root_key(&root);
                let qid = self.swarm.behaviour_mut().kad.get_providers(key);
                self.pending_get_providers.insert(
                    qid,
                    PendingGetProviders {
                        root,
                        deadline: Instant::now() + timeout,
                        found: Vec::new(),
                        reply: Some(reply),
                    },
                );
            }
            Command::Health { reply } => {
                let _ = reply.send(self.health_snapshot());
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.connected.iter().cloned().collect());
            }
            Command::AutonatStatus { reply } => {
                let _ = reply.send(self.autonat_public);
            }
            Command::ReserveRelay { addr, reply } => {
                let result = format!("{addr}/p2p-circuit")
                    .parse::<Multiaddr>()
                    .map_err(|_| DhtError::InvalidAddr(addr.clone()))
                    .and_then(|ma| {
                        self.swarm
                            .listen_on(ma)
                            .map(|_| ())
                            .map_err(|e| DhtError::DialFailed(e.to_string()))
                    });
                let _ = reply.send(result);
            }
            Command::FetchChunk { peer, cid, reply } => {
                self.send_transfer_request(peer, TransferRequest::Chunk(cid), reply);
            }
            Command::FetchManifest {
                peer,
                root_cid,
                reply,
            } => {
                self.send_transfer_request(peer, TransferRequest::Manifest(root_cid), reply);
            }
            Command::Shutdown => {}
        }
    }

    fn dial(&mut self, addr: &str) -> Result<(), DhtError> {
        let ma: Multiaddr = addr
            .parse()
            .map_err(|_| DhtError::InvalidAddr(addr.to_string()))?;
        if let Some(peer_id) = extract_peer_id(&ma) {
            self.swarm.behaviour_mut().kad.add_address(&peer_id, ma.clone());
        }
        self.swarm
            .dial(ma)
            .map_err(|e| DhtError::DialFailed(e.to_string()))
    }

    fn put_provider(&mut self, root: Cid, price_per_mib: Option<u64>) -> Result<(), DhtError> {
        if self.config.client_only {
            return Err(DhtError::ClientOnly("publish provider records"));
        }
        if self.config.role == DhtRole::Bootstrap {
            return Err(DhtError::BootstrapRole("publish provider records"));
        }
        let meta = ProviderRecordMeta {
            addrs: self
                .swarm
                .listeners()
                .map(|a| a.to_string())
                .collect::<Vec<_>>(),
            price_per_mib,
            advertised_at: now_secs(),
        };
        self.advertise(&root, &meta);
        self.local_provider_records.insert(root, meta);
        Ok(())
    }

    fn advertise(&mut self, root: &Cid, meta: &ProviderRecordMeta) {
        let key = root_key(root);
        if let Err(err) = self.swarm.behaviour_mut().kad.start_providing(key) {
            warn!(subsystem = "dht", %err, "local provider store rejected start_providing");
            return;
        }
        let local = chiral_peer(self.local_peer_id);
        let meta_key = provider_meta_key(root, &local);
        let value = bincode::serialize(meta).unwrap_or_default();
        let record = kad::Record {
            key: meta_key,
            value,
            publisher: Some(self.local_peer_id),
            expires: None,
        };
        let _ = self.swarm.behaviour_mut().kad.put_record(record, kad::Quorum::One);
    }

    fn reprovide_all(&mut self) {
        if self.config.client_only || self.config.role == DhtRole::Bootstrap {
            return;
        }
        let roots: Vec<(Cid, ProviderRecordMeta)> = self
            .local_provider_records
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (root, mut meta) in roots {
            meta.advertised_at = now_secs();
            self.advertise(&root, &meta);
            self.local_provider_records.insert(root, meta);
        }
    }

    fn dial_bootstrap_peers(&mut self) {
        let addrs = self.config.bootstrap_addrs.clone();
        if addrs.is_empty() {
            return;
        }
        let mut any_added = false;
        for addr_str in &addrs {
            if let Ok(ma) = addr_str.parse::<Multiaddr>() {
                if let Some(peer_id) = extract_peer_id(&ma) {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, ma.clone());
                    any_added = true;
                }
                if let Err(err) = self.swarm.dial(ma) {
                    debug!(subsystem = "dht", %err, "bootstrap dial failed to initiate");
                }
            }
        }
        if any_added {
            if let Err(err) = self.swarm.behaviour_mut().kad.bootstrap() {
                debug!(subsystem = "dht", %err, "bootstrap self-lookup could not start (no known peers yet)");
            }
        }
    }

    fn retry_bootstrap_if_due(&mut self) {
        if let Some(at) = self.next_bootstrap_retry {
            if Instant::now() >= at {
                self.next_bootstrap_retry = None;
                self.dial_bootstrap_peers();
            }
        }
    }

    fn schedule_bootstrap_retry(&mut self) {
        self.bootstrap_failures = self.bootstrap_failures.saturating_add(1);
        metrics::counter!("dht_bootstrap_failures_total").increment(1);
        self.next_bootstrap_retry = Some(Instant::now() + self.bootstrap_backoff);
        self.bootstrap_backoff =
            (self.bootstrap_backoff * 2).min(self.config.bootstrap_backoff_cap);
    }

    fn run_routing_refresh(&mut self, refresh: &mut Interval) {
        let size = self.routing_table_size();
        let _ = self.swarm.behaviour_mut().kad.get_closest_peers(self.local_peer_id);
        let desired = if size < self.config.min_bucket_fill {
            self.config.fast_refresh_interval
        } else {
            self.config.steady_refresh_interval
        };
        if desired != self.refresh_period {
            self.refresh_period = desired;
            *refresh = tokio::time::interval(desired);
        }
    }

    fn routing_table_size(&mut self) -> usize {
        self.swarm
            .behaviour_mut()
            .kad
            .kbuckets()
            .map(|bucket| bucket.num_entries())
            .sum()
    }

    fn health_snapshot(&mut self) -> DhtHealth {
        DhtHealth {
            role: self.config.role,
            routing_table_size: self.routing_table_size(),
            connected_peers: self.connected.len(),
            bootstrap_failures: self.bootstrap_failures,
            pending_queries: self.pending_get_providers.len(),
            client_only: self.config.client_only,
        }
    }

    fn finish_get_providers(&mut self, id: kad::QueryId) {
        if let Some(mut pending) = self.pending_get_providers.remove(&id) {
            if let Some(reply) = pending.reply.take() {
                let records = pending
                    .found
                    .iter()
                    .map(|p| {
                        self.collected_meta
                            .remove(&(pending.root, p.clone()))
                            .unwrap_or_else(|| ProviderRecord {
                                peer: p.clone(),
                                addrs: Vec::new(),
                                price_per_mib: None,
                                advertised_at: 0,
                            })
                    })
                    .collect();
                let _ = reply.send(records);
            }
        }
    }

    fn expire_get_providers(&mut self) {
        let now = Instant::now();
        let expired: Vec<kad::QueryId> = self
            .pending_get_providers
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.finish_get_providers(id);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ChiralBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(subsystem = "dht", %address, "listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                self.swarm
                    .behaviour_mut()
                    .kad
                    .add_address(&peer_id, endpoint.get_remote_address().clone());
                let cp = chiral_peer(peer_id);
                self.connected.insert(cp.clone());
                metrics::gauge!("dht_connected_peers").set(self.connected.len() as f64);
                self.publish(Event::DhtPeerConnected { peer: cp });
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                let cp = chiral_peer(peer_id);
                self.connected.remove(&cp);
                metrics::gauge!("dht_connected_peers").set(self.connected.len() as f64);
                self.publish(Event::DhtPeerDisconnected { peer: cp });
            }
            SwarmEvent::OutgoingConnectionError { .. } => {
                if self.next_bootstrap_retry.is_none() && self.connected.is_empty() {
                    self.schedule_bootstrap_retry();
                }
            }
            SwarmEvent::Behaviour(ChiralBehaviourEvent::Kad(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(ChiralBehaviourEvent::ChunkTransfer(event)) => {
                self.handle_chunk_transfer_event(event)
            }
            SwarmEvent::Behaviour(ChiralBehaviourEvent::Autonat(event)) => {
                self.handle_autonat_event(event)
            }
            SwarmEvent::Behaviour(ChiralBehaviourEvent::RelayClient(event)) => {
                self.handle_relay_client_event(event)
            }
            SwarmEvent::Behaviour(ChiralBehaviourEvent::Dcutr(event)) => {
                self.handle_dcutr_event(event)
            }
            SwarmEvent::Behaviour(ChiralBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
                self.publish(Event::DhtPeerDiscovered {
                    peer: chiral_peer(peer_id),
                });
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        if let kad::Event::OutboundQueryProgressed { id, result, .. } = event {
            match result {
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    if ok.num_remaining == 0 {
                        self.bootstrap_failures = 0;
                        self.bootstrap_backoff = self.config.bootstrap_backoff_base;
                    }
                }
                kad::QueryResult::Bootstrap(Err(_)) => {
                    self.schedule_bootstrap_retry();
                }
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    if let Some(pending) = self.pending_get_providers.get_mut(&id) {
                        for peer in providers {
                            let cp = chiral_peer(peer);
                            if !pending.found.contains(&cp) {
                                let meta_key = provider_meta_key(&pending.root, &cp);
                                let mqid = self.swarm.behaviour_mut().kad.get_record(meta_key);
                                self.pending_meta.insert(mqid, (pending.root, cp.clone()));
                                pending.found.push(cp);
                            }
                        }
                    }
                }
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                ))
                | kad::QueryResult::GetProviders(Err(_)) => {
                    self.finish_get_providers(id);
                }
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(peer_record))) => {
                    if let Some((root, peer)) = self.pending_meta.remove(&id) {
                        if let Ok(meta) =
                            bincode::deserialize::<ProviderRecordMeta>(&peer_record.record.value)
                        {
                            self.collected_meta.insert(
                                (root, peer.clone()),
                                ProviderRecord {
                                    peer,
                                    addrs: meta.addrs,
                                    price_per_mib: meta.price_per_mib,
                                    advertised_at: meta.advertised_at,
                                },
                            );
                        }
                    }
                }
                kad::QueryResult::GetRecord(Ok(
                    kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. },
                ))
                | kad::QueryResult::GetRecord(Err(_)) => {
                    self.pending_meta.remove(&id);
                }
                _ => {}
            }
        }
    }

    fn send_transfer_request(
        &mut self,
        peer: ChiralPeerId,
        request: TransferRequest,
        reply: oneshot::Sender<Result<Vec<u8>, DhtError>>,
    ) {
        let in_flight = self
            .pending_fetches
            .values()
            .filter(|p| p.peer == peer)
            .count();
        if in_flight >= MAX_INFLIGHT_TRANSFER_REQUESTS_PER_PEER {
            let _ = reply.send(Err(DhtError::RateLimited(peer.to_string())));
            return;
        }
        match peer.as_str().parse::<PeerId>() {
            Ok(libp2p_peer) => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .chunk_transfer
                    .send_request(&libp2p_peer, request);
                self.pending_fetches
                    .insert(request_id, PendingFetch { peer, reply });
            }
            Err(_) => {
                let _ = reply.send(Err(DhtError::InvalidAddr(peer.to_string())));
            }
        }
    }

    fn handle_chunk_transfer_event(
        &mut self,
        event: request_response::Event<TransferRequest, TransferResponse>,
    ) {
        match event {
            request_response::Event::Message { message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let found = match (&self.chunk_provider, &request) {
                        (Some(provider), TransferRequest::Chunk(cid)) => provider.get_chunk(cid),
                        (Some(provider), TransferRequest::Manifest(root)) => {
                            provider.get_manifest(root)
                        }
                        (None, _) => None,
                    };
                    let response = match found {
                        Some(bytes) => TransferResponse::Found(bytes),
                        None => TransferResponse::NotFound,
                    };
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .chunk_transfer
                        .send_response(channel, response);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(pending) = self.pending_fetches.remove(&request_id) {
                        let result = match response {
                            TransferResponse::Found(bytes) => Ok(bytes),
                            TransferResponse::NotFound => Err(DhtError::ChunkNotFound),
                        };
                        let _ = pending.reply.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure { request_id, error, .. } => {
                if let Some(pending) = self.pending_fetches.remove(&request_id) {
                    let _ = pending.reply.send(Err(DhtError::DialFailed(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { .. }
            | request_response::Event::ResponseSent { .. } => {}
        }
    }

    /// Tracks the `libp2p-autonat` verdict so `Command::AutonatStatus` has
    /// something to answer; the reachability probe loop polls this through
    /// [`crate::DhtHandle::autonat_status`] rather than the raw event, so
    /// `chiral_core` never has to match on `libp2p::autonat` types.
    fn handle_autonat_event(&mut self, event: libp2p::autonat::Event) {
        if let libp2p::autonat::Event::StatusChanged { new, .. } = event {
            self.autonat_public = match new {
                libp2p::autonat::NatStatus::Public(_) => Some(true),
                libp2p::autonat::NatStatus::Private => Some(false),
                libp2p::autonat::NatStatus::Unknown => None,
            };
        }
    }

    /// Surfaces `libp2p-relay-v2` client reservation outcomes as
    /// `RelayStateChanged` events; `chiral_core`'s `RelayPool` is the
    /// bookkeeping layer that consumes them (`spec.md` §4.7).
    fn handle_relay_client_event(&mut self, event: relay::client::Event) {
        use relay::client::Event as RelayEvent;
        match event {
            RelayEvent::ReservationReqAccepted { relay_peer_id, .. } => {
                self.publish(Event::RelayStateChanged {
                    relay: chiral_peer(relay_peer_id),
                    healthy: true,
                    summary: "reservation accepted".to_string(),
                });
            }
            RelayEvent::ReservationReqFailed { relay_peer_id, error, .. } => {
                self.publish(Event::RelayStateChanged {
                    relay: chiral_peer(relay_peer_id),
                    healthy: false,
                    summary: error.to_string(),
                });
            }
            _ => {}
        }
    }

    /// Surfaces `libp2p-dcutr` hole-punch outcomes as `DcutrResult` events;
    /// `chiral_core`'s `HolePunchCoordinator` tracks session state from them
    /// (`spec.md` §4.8).
    fn handle_dcutr_event(&mut self, event: libp2p::dcutr::Event) {
        self.publish(Event::DcutrResult {
            peer: chiral_peer(event.remote_peer_id),
            upgraded: event.result.is_ok(),
        });
    }

    fn publish(&self, event: Event) {
        let bus = self.event_bus.clone();
        tokio::spawn(async move {
            bus.publish(DHT_SESSION, event).await;
        });
    }
}

fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
