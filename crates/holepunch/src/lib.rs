//! DCUtR hole-punch coordination (`spec.md` §4.8).
//!
//! Pure coordination bookkeeping: the actual simultaneous-dial attempt runs
//! over `dht_engine`'s real `libp2p-dcutr` wiring; this crate tracks each
//! peer's coordination session and derives the synchronized dial delay
//! from exchanged timestamps, exactly the "bookkeeping above the wire
//! protocol" split used by [`relay`].

use chiral_proto::PeerId;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected only via a relay; a coordination attempt has not started.
    Relayed,
    /// Addresses exchanged; a synchronized dial has been scheduled.
    Coordinating,
    /// A direct connection has been confirmed; the relayed stream is kept
    /// only as fallback until the caller tears it down explicitly.
    DirectConfirmed,
}

#[derive(Debug, Clone)]
struct Session {
    state: SessionState,
    relay: PeerId,
    observed_addrs: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HolePunchMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
}

pub struct HolePunchCoordinator {
    sessions: HashMap<PeerId, Session>,
    metrics: HolePunchMetrics,
}

impl HolePunchCoordinator {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            metrics: HolePunchMetrics::default(),
        }
    }

    pub fn metrics(&self) -> HolePunchMetrics {
        self.metrics
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(|s| s.state)
    }

    /// Step 1 of `spec.md` §4.8: A observes an indirect connection to B
    /// through relay R.
    pub fn begin(&mut self, peer: PeerId, relay: PeerId) {
        self.sessions.entry(peer).or_insert(Session {
            state: SessionState::Relayed,
            relay,
            observed_addrs: Vec::new(),
        });
    }

    /// Step 2: externally-observed addresses exchanged over the relayed
    /// channel.
    pub fn observe_remote_addrs(&mut self, peer: &PeerId, addrs: Vec<String>) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.observed_addrs = addrs;
            session.state = SessionState::Coordinating;
        }
    }

    /// Step 3: derives the delay (from now) at which both ends should fire
    /// their simultaneous outbound dial, given the round-trip time observed
    /// over the relayed channel. Each side dials after its own half-RTT
    /// estimate so that, modulo clock drift, both dials land within one RTT
    /// of each other.
    pub fn schedule_dial(&mut self, peer: &PeerId, rtt: Duration) -> Option<Duration> {
        let session = self.sessions.get_mut(peer)?;
        if session.observed_addrs.is_empty() {
            return None;
        }
        self.metrics.attempts += 1;
        metrics::counter!("holepunch_attempts_total").increment(1);
        Some(rtt / 2)
    }

    pub fn observed_addrs(&self, peer: &PeerId) -> &[String] {
        self.sessions
            .get(peer)
            .map(|s| s.observed_addrs.as_slice())
            .unwrap_or(&[])
    }

    /// Step 4: first successful direct connection wins.
    pub fn record_direct_success(&mut self, peer: &PeerId) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.state = SessionState::DirectConfirmed;
        }
        self.metrics.successes += 1;
        self.metrics.last_success_at = Some(now_secs());
        metrics::counter!("holepunch_successes_total").increment(1);
        debug!(subsystem = "holepunch", %peer, "direct connection confirmed");
    }

    /// A failed direct attempt keeps the relayed stream as fallback
    /// ("retained until confirmed stable").
    pub fn record_direct_failure(&mut self, peer: &PeerId) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.state = SessionState::Relayed;
        }
        self.metrics.failures += 1;
        self.metrics.last_failure_at = Some(now_secs());
        metrics::counter!("holepunch_failures_total").increment(1);
        debug!(subsystem = "holepunch", %peer, "direct attempt failed, falling back to relay");
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.sessions.remove(peer);
    }
}

impl Default for HolePunchCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    #[test]
    fn session_starts_relayed_then_coordinates_once_addrs_exchanged() {
        let mut coordinator = HolePunchCoordinator::new();
        coordinator.begin(peer("b"), peer("relay"));
        assert_eq!(coordinator.state_of(&peer("b")), Some(SessionState::Relayed));
        coordinator.observe_remote_addrs(&peer("b"), vec!["/ip4/1.2.3.4/tcp/1".into()]);
        assert_eq!(
            coordinator.state_of(&peer("b")),
            Some(SessionState::Coordinating)
        );
    }

    #[test]
    fn schedule_dial_requires_observed_addrs() {
        let mut coordinator = HolePunchCoordinator::new();
        coordinator.begin(peer("b"), peer("relay"));
        assert!(coordinator
            .schedule_dial(&peer("b"), Duration::from_millis(100))
            .is_none());
        coordinator.observe_remote_addrs(&peer("b"), vec!["/ip4/1.2.3.4/tcp/1".into()]);
        let delay = coordinator
            .schedule_dial(&peer("b"), Duration::from_millis(100))
            .unwrap();
        assert_eq!(delay, Duration::from_millis(50));
    }

    #[test]
    fn direct_success_confirms_and_failure_falls_back_to_relayed() {
        let mut coordinator = HolePunchCoordinator::new();
        coordinator.begin(peer("b"), peer("relay"));
        coordinator.observe_remote_addrs(&peer("b"), vec!["addr".into()]);
        coordinator.record_direct_failure(&peer("b"));
        assert_eq!(coordinator.state_of(&peer("b")), Some(SessionState::Relayed));
        assert_eq!(coordinator.metrics().failures, 1);

        coordinator.record_direct_success(&peer("b"));
        assert_eq!(
            coordinator.state_of(&peer("b")),
            Some(SessionState::DirectConfirmed)
        );
        assert_eq!(coordinator.metrics().successes, 1);
    }
}
