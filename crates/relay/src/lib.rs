//! Relay pool management, reservation lifecycle and relay-server role
//! (`spec.md` §4.7).
//!
//! Candidates and reservations are modeled as plain data next to a small
//! state-transition API (`RelayCandidate`/`Reservation`/`RelayMetrics`).
//! The actual reservation RPC is real `libp2p-relay` wire traffic driven
//! by `chiral_core`; this crate is the bookkeeping layer above it, kept
//! free of any networking dependency so it tests as plain data, no swarm
//! or async runtime required.

use chiral_proto::PeerId;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const DEFAULT_POOL_CAP: usize = 5;
const DEFAULT_ACTIVE_CAP: usize = 2;
const RENEWAL_FRACTION: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Config,
    Dht,
    PeerExchange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayCandidate {
    pub peer: PeerId,
    pub addr: String,
    pub source: CandidateSource,
    pub reachable: Option<bool>,
    pub last_success: Option<u64>,
    pub last_failure: Option<u64>,
    pub health_score: f64,
}

impl RelayCandidate {
    fn new(peer: PeerId, addr: String, source: CandidateSource) -> Self {
        Self {
            peer,
            addr,
            source,
            reachable: None,
            last_success: None,
            last_failure: None,
            health_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub acquired_at: u64,
    pub expiry: u64,
    pub renew_at: u64,
    pub renewal_count: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RelayMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub renewals: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub pool_cap: usize,
    pub active_cap: usize,
    pub enable_relay_server: bool,
    pub relay_server_cap: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pool_cap: DEFAULT_POOL_CAP,
            active_cap: DEFAULT_ACTIVE_CAP,
            enable_relay_server: false,
            relay_server_cap: DEFAULT_ACTIVE_CAP,
        }
    }
}

pub struct RelayPool {
    config: RelayConfig,
    candidates: HashMap<PeerId, RelayCandidate>,
    reservations: HashMap<PeerId, Reservation>,
    metrics: RelayMetrics,
    last_error: Option<String>,
    serving_reservations: usize,
}

impl RelayPool {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            candidates: HashMap::new(),
            reservations: HashMap::new(),
            metrics: RelayMetrics::default(),
            last_error: None,
            serving_reservations: 0,
        }
    }

    pub fn metrics(&self) -> RelayMetrics {
        self.metrics
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn candidate(&self, peer: &PeerId) -> Option<&RelayCandidate> {
        self.candidates.get(peer)
    }

    pub fn active_count(&self) -> usize {
        self.reservations.len()
    }

    /// Adds a discovered relay candidate, evicting the worst-scoring
    /// candidate when the pool is already at `pool_cap` (`spec.md` §4.7:
    /// "pool size... bounded").
    pub fn add_candidate(&mut self, peer: PeerId, addr: String, source: CandidateSource) {
        if self.candidates.contains_key(&peer) {
            return;
        }
        if self.candidates.len() >= self.config.pool_cap {
            if let Some(worst) = self
                .candidates
                .iter()
                .filter(|(p, _)| !self.reservations.contains_key(*p))
                .min_by(|(_, a), (_, b)| a.health_score.total_cmp(&b.health_score))
                .map(|(p, _)| p.clone())
            {
                debug!(subsystem = "relay", %worst, "evicted worst candidate to admit new one");
                self.candidates.remove(&worst);
                self.metrics.evictions += 1;
            } else {
                return; // every slot holds an active reservation; refuse the new candidate
            }
        }
        self.candidates
            .insert(peer.clone(), RelayCandidate::new(peer, addr, source));
    }

    /// Picks the best candidate to attempt a reservation against: not
    /// already holding a reservation, preferring the highest health score,
    /// respecting `active_cap`.
    pub fn next_candidate(&self) -> Option<PeerId> {
        if self.reservations.len() >= self.config.active_cap {
            return None;
        }
        self.candidates
            .values()
            .filter(|c| !self.reservations.contains_key(&c.peer) && c.reachable != Some(false))
            .max_by(|a, b| a.health_score.total_cmp(&b.health_score))
            .map(|c| c.peer.clone())
    }

    pub fn record_attempt(&mut self) {
        self.metrics.attempts += 1;
        metrics::counter!("relay_reservation_attempts_total").increment(1);
    }

    /// `ttl_secs` from the relay's reservation response; the renewal timer
    /// fires at `0.75 · TTL` past acquisition (`spec.md` §4.7).
    pub fn record_reservation_success(&mut self, peer: &PeerId, ttl_secs: u64) {
        let now = now_secs();
        self.metrics.successes += 1;
        metrics::counter!("relay_reservation_successes_total").increment(1);
        if let Some(candidate) = self.candidates.get_mut(peer) {
            candidate.reachable = Some(true);
            candidate.last_success = Some(now);
            candidate.health_score = (0.8 * candidate.health_score + 0.2).min(1.0);
        }
        self.reservations.insert(
            peer.clone(),
            Reservation {
                acquired_at: now,
                expiry: now + ttl_secs,
                renew_at: now + (ttl_secs as f64 * RENEWAL_FRACTION) as u64,
                renewal_count: 0,
            },
        );
        debug!(subsystem = "relay", %peer, ttl_secs, "reservation acquired");
    }

    pub fn record_reservation_failure(&mut self, peer: &PeerId, error: impl Into<String>) {
        let now = now_secs();
        self.metrics.failures += 1;
        metrics::counter!("relay_reservation_failures_total").increment(1);
        self.last_error = Some(error.into());
        if let Some(candidate) = self.candidates.get_mut(peer) {
            candidate.reachable = Some(false);
            candidate.last_failure = Some(now);
            candidate.health_score = (0.8 * candidate.health_score).max(0.0);
        }
        // Reservation loss: "immediately attempts another candidate" is the
        // caller's job once this returns the eviction.
        if self.reservations.remove(peer).is_some() {
            self.metrics.evictions += 1;
        }
    }

    /// Peers whose renewal timer has fired and are still within `expiry`.
    pub fn due_for_renewal(&self) -> Vec<PeerId> {
        let now = now_secs();
        self.reservations
            .iter()
            .filter(|(_, r)| now >= r.renew_at && now < r.expiry)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Reservations whose `expiry` has passed without a successful renewal.
    /// The driver should treat these as lost.
    pub fn expired(&self) -> Vec<PeerId> {
        let now = now_secs();
        self.reservations
            .iter()
            .filter(|(_, r)| now >= r.expiry)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn record_renewal_success(&mut self, peer: &PeerId, ttl_secs: u64) {
        let now = now_secs();
        self.metrics.renewals += 1;
        if let Some(reservation) = self.reservations.get_mut(peer) {
            reservation.acquired_at = now;
            reservation.expiry = now + ttl_secs;
            reservation.renew_at = now + (ttl_secs as f64 * RENEWAL_FRACTION) as u64;
            reservation.renewal_count += 1;
        }
    }

    pub fn evict(&mut self, peer: &PeerId) {
        if self.reservations.remove(peer).is_some() {
            self.metrics.evictions += 1;
        }
    }

    /// `spec.md` §4.7 relay-server role gate: public, high confidence,
    /// opted in, and under the configured reservation cap.
    pub fn should_serve_as_relay(&self, reachable_public: bool, high_confidence: bool) -> bool {
        self.config.enable_relay_server
            && reachable_public
            && high_confidence
            && self.serving_reservations < self.config.relay_server_cap
    }

    pub fn accept_inbound_reservation(&mut self) -> bool {
        if self.serving_reservations < self.config.relay_server_cap {
            self.serving_reservations += 1;
            true
        } else {
            false
        }
    }

    pub fn release_inbound_reservation(&mut self) {
        self.serving_reservations = self.serving_reservations.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    #[test]
    fn pool_evicts_worst_candidate_when_full() {
        let mut pool = RelayPool::new(RelayConfig {
            pool_cap: 2,
            ..Default::default()
        });
        pool.add_candidate(peer("a"), "/ip4/1.1.1.1/tcp/1".into(), CandidateSource::Config);
        pool.add_candidate(peer("b"), "/ip4/1.1.1.2/tcp/1".into(), CandidateSource::Config);
        pool.record_reservation_failure(&peer("a"), "timeout");
        pool.add_candidate(peer("c"), "/ip4/1.1.1.3/tcp/1".into(), CandidateSource::Dht);
        assert!(pool.candidate(&peer("a")).is_none());
        assert!(pool.candidate(&peer("b")).is_some());
        assert!(pool.candidate(&peer("c")).is_some());
    }

    #[test]
    fn active_cap_limits_next_candidate() {
        let mut pool = RelayPool::new(RelayConfig {
            active_cap: 1,
            ..Default::default()
        });
        pool.add_candidate(peer("a"), "addr-a".into(), CandidateSource::Config);
        pool.add_candidate(peer("b"), "addr-b".into(), CandidateSource::Config);
        let chosen = pool.next_candidate().unwrap();
        pool.record_reservation_success(&chosen, 3600);
        assert!(pool.next_candidate().is_none());
    }

    #[test]
    fn renewal_fires_at_three_quarters_ttl() {
        let mut pool = RelayPool::new(RelayConfig::default());
        pool.add_candidate(peer("a"), "addr".into(), CandidateSource::Config);
        pool.record_reservation_success(&peer("a"), 100);
        let reservation = pool.reservations.get(&peer("a")).unwrap();
        assert_eq!(reservation.expiry - reservation.acquired_at, 100);
        assert_eq!(reservation.renew_at - reservation.acquired_at, 75);
    }

    #[test]
    fn reservation_failure_evicts_active_reservation() {
        let mut pool = RelayPool::new(RelayConfig::default());
        pool.add_candidate(peer("a"), "addr".into(), CandidateSource::Config);
        pool.record_reservation_success(&peer("a"), 100);
        assert_eq!(pool.active_count(), 1);
        pool.record_reservation_failure(&peer("a"), "relay closed");
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.metrics().evictions, 1);
    }

    #[test]
    fn relay_server_role_requires_public_high_confidence_and_opt_in() {
        let pool = RelayPool::new(RelayConfig {
            enable_relay_server: true,
            ..Default::default()
        });
        assert!(!pool.should_serve_as_relay(false, true));
        assert!(!pool.should_serve_as_relay(true, false));
        assert!(pool.should_serve_as_relay(true, true));

        let opted_out = RelayPool::new(RelayConfig::default());
        assert!(!opted_out.should_serve_as_relay(true, true));
    }

    #[test]
    fn relay_server_cap_is_enforced() {
        let mut pool = RelayPool::new(RelayConfig {
            relay_server_cap: 1,
            ..Default::default()
        });
        assert!(pool.accept_inbound_reservation());
        assert!(!pool.accept_inbound_reservation());
        pool.release_inbound_reservation();
        assert!(pool.accept_inbound_reservation());
    }
}
