//! Multi-source chunk scheduler (`spec.md` §4.9), the core of the core.
//!
//! The scheduler owns no I/O and no background timer: timeouts are
//! discovered lazily at the top of each [`Scheduler::next_requests`] pass
//! (`spec.md` §9, "scheduler without background timers"). It holds only
//! peer ids, never reputation/health state directly; callers pass views
//! into those stores on every call, matching the "weak reference,
//! relation-by-id" ownership note in `spec.md` §3/§9.

use chiral_proto::{Cid, PeerId};
use std::collections::{HashMap, HashSet};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkState {
    Unrequested,
    InFlight,
    Received,
    Corrupted,
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSelection {
    LoadBalanced,
    ReputationWeighted,
    RarestFirst,
}

impl Default for PeerSelection {
    fn default() -> Self {
        PeerSelection::LoadBalanced
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_concurrent_per_peer: u32,
    pub chunk_timeout_ms: u64,
    pub max_retries: u32,
    pub peer_selection: PeerSelection,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_peer: 2,
            chunk_timeout_ms: 30_000,
            max_retries: 3,
            peer_selection: PeerSelection::LoadBalanced,
        }
    }
}

/// Read-only view into the [`peer_health`] store the scheduler needs for
/// eligibility decisions. Implemented by `peer_health::PeerHealthManager`
/// in the full node; a bare `HashMap`-backed fake is enough for tests.
pub trait PeerHealthView {
    fn should_use(&self, peer: &PeerId) -> bool;
    fn max_concurrent(&self, peer: &PeerId) -> u32;
}

/// Read-only view into the [`reputation`] store.
pub trait ReputationView {
    fn composite(&self, peer: &PeerId) -> f64;
}

/// One chunk request handed to the caller to actually issue over the
/// network. `attempt` counts prior failed tries for this chunk index.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub chunk_index: u32,
    pub peer: PeerId,
    pub attempt: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
struct InFlightEntry {
    peer: PeerId,
    requested_at_ms: u64,
    timeout_ms: u64,
    attempt: u32,
}

pub struct Scheduler {
    config: SchedulerConfig,
    cids: Vec<Cid>,
    state: Vec<ChunkState>,
    attempts: Vec<u32>,
    providers: Vec<HashSet<PeerId>>,
    blacklist: HashSet<(u32, PeerId)>,
    active: HashMap<u32, InFlightEntry>,
    pending: HashMap<PeerId, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCounts {
    pub unrequested: usize,
    pub in_flight: usize,
    pub received: usize,
    pub corrupted: usize,
    pub gave_up: usize,
}

impl Scheduler {
    pub fn new(cids: Vec<Cid>, config: SchedulerConfig) -> Self {
        let n = cids.len();
        Self {
            config,
            cids,
            state: vec![ChunkState::Unrequested; n],
            attempts: vec![0; n],
            providers: vec![HashSet::new(); n],
            blacklist: HashSet::new(),
            active: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.cids.len()
    }

    pub fn state_of(&self, index: u32) -> ChunkState {
        self.state[index as usize]
    }

    pub fn add_provider(&mut self, index: u32, peer: PeerId) {
        self.providers[index as usize].insert(peer);
    }

    pub fn is_complete(&self) -> bool {
        self.state.iter().all(|s| *s == ChunkState::Received)
    }

    pub fn has_pending_work(&self) -> bool {
        self.state
            .iter()
            .any(|s| !matches!(s, ChunkState::Received | ChunkState::GaveUp))
    }

    pub fn counts(&self) -> SchedulerCounts {
        let mut c = SchedulerCounts {
            unrequested: 0,
            in_flight: 0,
            received: 0,
            corrupted: 0,
            gave_up: 0,
        };
        for s in &self.state {
            match s {
                ChunkState::Unrequested => c.unrequested += 1,
                ChunkState::InFlight => c.in_flight += 1,
                ChunkState::Received => c.received += 1,
                ChunkState::Corrupted => c.corrupted += 1,
                ChunkState::GaveUp => c.gave_up += 1,
            }
        }
        c
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_of(&self, peer: &PeerId) -> u32 {
        self.pending.get(peer).copied().unwrap_or(0)
    }

    fn effective_cap(&self, peer: &PeerId, health: &dyn PeerHealthView) -> u32 {
        self.config.max_concurrent_per_peer.min(health.max_concurrent(peer).max(1))
    }

    fn eligible_peers(&self, index: u32, health: &dyn PeerHealthView) -> Vec<PeerId> {
        self.providers[index as usize]
            .iter()
            .filter(|p| !self.blacklist.contains(&(index, (*p).clone())))
            .filter(|p| health.should_use(p))
            .filter(|p| self.pending_of(p) < self.effective_cap(p, health))
            .cloned()
            .collect()
    }

    fn pick_peer(&self, mut candidates: Vec<PeerId>, reputation: &dyn ReputationView) -> Option<PeerId> {
        if candidates.is_empty() {
            return None;
        }
        match self.config.peer_selection {
            PeerSelection::ReputationWeighted => {
                candidates.sort_by(|a, b| {
                    let ca = reputation.composite(a);
                    let cb = reputation.composite(b);
                    cb.partial_cmp(&ca)
                        .unwrap()
                        .then_with(|| self.pending_of(a).cmp(&self.pending_of(b)))
                        .then_with(|| a.as_str().cmp(b.as_str()))
                });
            }
            PeerSelection::LoadBalanced | PeerSelection::RarestFirst => {
                candidates.sort_by(|a, b| {
                    self.pending_of(a)
                        .cmp(&self.pending_of(b))
                        .then_with(|| {
                            reputation
                                .composite(b)
                                .partial_cmp(&reputation.composite(a))
                                .unwrap()
                        })
                        .then_with(|| a.as_str().cmp(b.as_str()))
                });
            }
        }
        candidates.into_iter().next()
    }

    /// Chunk indices currently eligible for (re)dispatch: `UNREQUESTED` or
    /// `CORRUPTED` (the latter may still be retried from a different peer,
    /// `spec.md` §4.9).
    fn requestable_indices(&self) -> Vec<u32> {
        self.state
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, ChunkState::Unrequested | ChunkState::Corrupted))
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Best composite among `index`'s known providers, used only to break
    /// rarest-first ties (`spec.md` §4.9 step 1: "picks rarest first but
    /// breaks ties by peer composite").
    fn best_composite_for(&self, index: u32, reputation: &dyn ReputationView) -> f64 {
        self.providers[index as usize]
            .iter()
            .map(|p| reputation.composite(p))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    fn pick_chunk(&self, health: &dyn PeerHealthView, reputation: &dyn ReputationView) -> Option<(u32, Vec<PeerId>)> {
        let mut indices = self.requestable_indices();
        match self.config.peer_selection {
            PeerSelection::LoadBalanced => {
                indices.sort_unstable();
            }
            PeerSelection::RarestFirst => {
                indices.sort_by_key(|i| (self.providers[*i as usize].len(), *i));
            }
            PeerSelection::ReputationWeighted => {
                indices.sort_by(|a, b| {
                    self.providers[*a as usize]
                        .len()
                        .cmp(&self.providers[*b as usize].len())
                        .then_with(|| {
                            self.best_composite_for(*b, reputation)
                                .partial_cmp(&self.best_composite_for(*a, reputation))
                                .unwrap()
                        })
                        .then_with(|| a.cmp(b))
                });
            }
        }
        for index in indices {
            let candidates = self.eligible_peers(index, health);
            if !candidates.is_empty() {
                return Some((index, candidates));
            }
        }
        None
    }

    /// Purges active requests whose deadline has elapsed, routing each
    /// through the non-corrupted failure path (`spec.md` §4.9 "Timeouts").
    pub fn expire_timeouts(&mut self, now_ms: u64) {
        let expired: Vec<u32> = self
            .active
            .iter()
            .filter(|(_, entry)| now_ms.saturating_sub(entry.requested_at_ms) >= entry.timeout_ms)
            .map(|(index, _)| *index)
            .collect();
        for index in expired {
            let entry = self.active.remove(&index).expect("just observed");
            trace!(subsystem = "scheduler", chunk = index, peer = %entry.peer, "request timed out");
            self.on_chunk_failed_inner(index, &entry.peer, false);
        }
    }

    /// One scheduling pass: purges expired requests, then dispatches up to
    /// `budget` new requests following `spec.md` §4.9 steps 1–4.
    pub fn next_requests(
        &mut self,
        budget: usize,
        now_ms: u64,
        health: &dyn PeerHealthView,
        reputation: &dyn ReputationView,
    ) -> Vec<Dispatch> {
        self.expire_timeouts(now_ms);
        let mut dispatched = Vec::new();
        for _ in 0..budget {
            let Some((index, candidates)) = self.pick_chunk(health, reputation) else {
                break;
            };
            let Some(peer) = self.pick_peer(candidates, reputation) else {
                break;
            };
            let attempt = self.attempts[index as usize];
            let timeout_ms = self.config.chunk_timeout_ms;
            self.active.insert(
                index,
                InFlightEntry {
                    peer: peer.clone(),
                    requested_at_ms: now_ms,
                    timeout_ms,
                    attempt,
                },
            );
            self.state[index as usize] = ChunkState::InFlight;
            *self.pending.entry(peer.clone()).or_insert(0) += 1;
            trace!(subsystem = "scheduler", chunk = index, peer = %peer, attempt, "dispatched");
            dispatched.push(Dispatch {
                chunk_index: index,
                peer,
                attempt,
                timeout_ms,
            });
        }
        dispatched
    }

    fn decrement_pending(&mut self, peer: &PeerId) {
        if let Some(count) = self.pending.get_mut(peer) {
            *count = count.saturating_sub(1);
        }
    }

    /// Verifies `bytes` against the expected CID and routes to success or
    /// the corrupted-failure path.
    pub fn on_chunk_received(&mut self, index: u32, peer: &PeerId, bytes: &[u8]) -> bool {
        let expected = self.cids[index as usize];
        if Cid::of(bytes) == expected {
            self.active.remove(&index);
            self.decrement_pending(peer);
            self.state[index as usize] = ChunkState::Received;
            trace!(subsystem = "scheduler", chunk = index, peer = %peer, "received");
            true
        } else {
            self.active.remove(&index);
            trace!(subsystem = "scheduler", chunk = index, peer = %peer, "corrupted delivery");
            self.on_chunk_failed_inner(index, peer, true);
            false
        }
    }

    pub fn on_chunk_failed(&mut self, index: u32, peer: &PeerId, corrupted: bool) {
        self.active.remove(&index);
        self.on_chunk_failed_inner(index, peer, corrupted);
    }

    fn on_chunk_failed_inner(&mut self, index: u32, peer: &PeerId, corrupted: bool) {
        self.decrement_pending(peer);
        self.attempts[index as usize] += 1;
        if corrupted {
            self.blacklist.insert((index, peer.clone()));
            self.state[index as usize] = ChunkState::Corrupted;
        } else if self.attempts[index as usize] < self.config.max_retries {
            self.state[index as usize] = ChunkState::Unrequested;
        } else {
            self.state[index as usize] = ChunkState::GaveUp;
            trace!(subsystem = "scheduler", chunk = index, attempts = self.attempts[index as usize], "gave up after max retries");
        }
    }

    pub fn attempts_for(&self, index: u32) -> u32 {
        self.attempts[index as usize]
    }

    /// True once every known provider for `index` has been blacklisted for
    /// delivering corrupted bytes, leaving no peer left to retry from
    /// (`spec.md` §4.9 "blacklist on corrupted chunk").
    pub fn all_providers_blacklisted(&self, index: u32) -> bool {
        let providers = &self.providers[index as usize];
        !providers.is_empty()
            && providers
                .iter()
                .all(|p| self.blacklist.contains(&(index, p.clone())))
    }

    /// Any active request to `peer` returns to `UNREQUESTED` and `peer`'s
    /// pending counter is zeroed outright (`spec.md` §4.9 "Peer removal").
    pub fn remove_peer(&mut self, peer: &PeerId) {
        let reverted: Vec<u32> = self
            .active
            .iter()
            .filter(|(_, entry)| &entry.peer == peer)
            .map(|(index, _)| *index)
            .collect();
        for index in reverted {
            self.active.remove(&index);
            self.state[index as usize] = ChunkState::Unrequested;
        }
        for providers in &mut self.providers {
            providers.remove(peer);
        }
        self.pending.remove(peer);
        self.blacklist.retain(|(_, p)| p != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct FakeHealth {
        should_use: StdHashMap<PeerId, bool>,
        max_concurrent: StdHashMap<PeerId, u32>,
    }

    impl FakeHealth {
        fn all_ok(peers: &[&str]) -> Self {
            let mut should_use = StdHashMap::new();
            let mut max_concurrent = StdHashMap::new();
            for p in peers {
                should_use.insert(PeerId::new(*p), true);
                max_concurrent.insert(PeerId::new(*p), 2);
            }
            Self {
                should_use,
                max_concurrent,
            }
        }
    }

    impl PeerHealthView for FakeHealth {
        fn should_use(&self, peer: &PeerId) -> bool {
            self.should_use.get(peer).copied().unwrap_or(false)
        }
        fn max_concurrent(&self, peer: &PeerId) -> u32 {
            self.max_concurrent.get(peer).copied().unwrap_or(0)
        }
    }

    struct FlatReputation;
    impl ReputationView for FlatReputation {
        fn composite(&self, _peer: &PeerId) -> f64 {
            0.5
        }
    }

    struct MapReputation(StdHashMap<PeerId, f64>);
    impl ReputationView for MapReputation {
        fn composite(&self, peer: &PeerId) -> f64 {
            self.0.get(peer).copied().unwrap_or(0.0)
        }
    }

    fn chunk_cids(n: usize) -> Vec<Cid> {
        (0..n).map(|i| Cid::of(format!("chunk-{i}").as_bytes())).collect()
    }

    #[test]
    fn conservation_invariant_holds_across_lifecycle() {
        let cids = chunk_cids(4);
        let mut sched = Scheduler::new(cids.clone(), SchedulerConfig::default());
        for i in 0..4u32 {
            sched.add_provider(i, PeerId::new("peer1"));
        }
        let health = FakeHealth::all_ok(&["peer1"]);
        let rep = FlatReputation;
        let dispatched = sched.next_requests(10, 0, &health, &rep);
        assert_eq!(dispatched.len(), 2); // max_concurrent_per_peer default is 2

        let counts = sched.counts();
        assert_eq!(
            counts.unrequested + counts.in_flight + counts.received + counts.corrupted + counts.gave_up,
            sched.total_chunks()
        );
        assert_eq!(sched.active_count(), 2);
        assert_eq!(sched.pending_of(&PeerId::new("peer1")) as usize, sched.active_count());
    }

    #[test]
    fn timeout_then_retry_from_different_peer() {
        let cids = chunk_cids(1);
        let mut sched = Scheduler::new(cids, SchedulerConfig::default());
        sched.add_provider(0, PeerId::new("peer1"));
        sched.add_provider(0, PeerId::new("peer2"));
        let health = FakeHealth::all_ok(&["peer1", "peer2"]);
        let rep = FlatReputation;

        let d1 = sched.next_requests(1, 0, &health, &rep);
        assert_eq!(d1.len(), 1);
        assert_eq!(d1[0].peer, PeerId::new("peer1"));

        // advance past the 30s default timeout
        let d2 = sched.next_requests(1, 31_000, &health, &rep);
        assert_eq!(sched.active_count(), 1);
        assert_eq!(d2.len(), 1);
        assert_eq!(d2[0].peer, PeerId::new("peer2"));
        assert_eq!(sched.attempts_for(0), 1);
    }

    #[test]
    fn corrupted_chunk_is_retried_from_a_different_peer_only() {
        let cids = chunk_cids(1);
        let mut sched = Scheduler::new(cids.clone(), SchedulerConfig::default());
        sched.add_provider(0, PeerId::new("peer1"));
        sched.add_provider(0, PeerId::new("peer2"));
        let health = FakeHealth::all_ok(&["peer1", "peer2"]);
        let rep = FlatReputation;

        let d1 = sched.next_requests(1, 0, &health, &rep);
        assert_eq!(d1[0].peer, PeerId::new("peer1"));
        let ok = sched.on_chunk_received(0, &PeerId::new("peer1"), b"wrong bytes");
        assert!(!ok);
        assert_eq!(sched.state_of(0), ChunkState::Corrupted);

        let d2 = sched.next_requests(1, 1, &health, &rep);
        assert_eq!(d2.len(), 1);
        assert_eq!(d2[0].peer, PeerId::new("peer2"));
    }

    #[test]
    fn all_providers_blacklisted_once_every_provider_delivers_corrupted_bytes() {
        let cids = chunk_cids(1);
        let mut sched = Scheduler::new(cids, SchedulerConfig::default());
        sched.add_provider(0, PeerId::new("peer1"));
        sched.add_provider(0, PeerId::new("peer2"));
        assert!(!sched.all_providers_blacklisted(0));

        sched.on_chunk_failed(0, &PeerId::new("peer1"), true);
        assert!(!sched.all_providers_blacklisted(0));

        sched.on_chunk_failed(0, &PeerId::new("peer2"), true);
        assert!(sched.all_providers_blacklisted(0));
    }

    #[test]
    fn max_retries_exhausted_gives_up() {
        let cids = chunk_cids(1);
        let mut config = SchedulerConfig::default();
        config.max_retries = 2;
        let mut sched = Scheduler::new(cids, config);
        sched.add_provider(0, PeerId::new("peer1"));
        let health = FakeHealth::all_ok(&["peer1"]);
        let rep = FlatReputation;

        let mut now = 0u64;
        for _ in 0..2 {
            let d = sched.next_requests(1, now, &health, &rep);
            assert_eq!(d.len(), 1);
            now += 31_000;
        }
        sched.next_requests(1, now, &health, &rep);
        assert_eq!(sched.state_of(0), ChunkState::GaveUp);
        assert!(!sched.has_pending_work());
    }

    #[test]
    fn no_peer_exceeds_max_concurrent_per_peer() {
        let cids = chunk_cids(6);
        let mut sched = Scheduler::new(cids, SchedulerConfig::default());
        for i in 0..6u32 {
            sched.add_provider(i, PeerId::new("peer1"));
        }
        let health = FakeHealth::all_ok(&["peer1"]);
        let rep = FlatReputation;
        let d = sched.next_requests(10, 0, &health, &rep);
        assert_eq!(d.len(), 2);
        assert!(sched.pending_of(&PeerId::new("peer1")) <= 2);
    }

    #[test]
    fn reputation_weighted_breaks_provider_count_ties_by_composite_not_index() {
        let cids = chunk_cids(3);
        let mut config = SchedulerConfig::default();
        config.peer_selection = PeerSelection::ReputationWeighted;
        let mut sched = Scheduler::new(cids, config);
        // Every chunk has exactly one provider, so provider count is tied
        // across all three; only peer composite should decide the order.
        sched.add_provider(0, PeerId::new("low"));
        sched.add_provider(1, PeerId::new("high"));
        sched.add_provider(2, PeerId::new("mid"));
        let health = FakeHealth::all_ok(&["low", "high", "mid"]);
        let mut comps = StdHashMap::new();
        comps.insert(PeerId::new("low"), 0.1);
        comps.insert(PeerId::new("high"), 0.9);
        comps.insert(PeerId::new("mid"), 0.5);
        let rep = MapReputation(comps);

        let dispatched = sched.next_requests(1, 0, &health, &rep);
        assert_eq!(dispatched.len(), 1);
        // Chunk 1's sole provider has the highest composite, so it is
        // dispatched first despite chunk 0 having the lower index.
        assert_eq!(dispatched[0].chunk_index, 1);
    }

    #[test]
    fn removing_a_peer_reverts_its_active_requests() {
        let cids = chunk_cids(2);
        let mut sched = Scheduler::new(cids, SchedulerConfig::default());
        sched.add_provider(0, PeerId::new("peer1"));
        sched.add_provider(1, PeerId::new("peer1"));
        let health = FakeHealth::all_ok(&["peer1"]);
        let rep = FlatReputation;
        sched.next_requests(10, 0, &health, &rep);
        assert_eq!(sched.active_count(), 2);

        sched.remove_peer(&PeerId::new("peer1"));
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.pending_of(&PeerId::new("peer1")), 0);
        assert_eq!(sched.state_of(0), ChunkState::Unrequested);
        assert_eq!(sched.state_of(1), ChunkState::Unrequested);
    }
}
