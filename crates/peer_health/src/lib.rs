//! Short-horizon peer availability/backoff decisions (`spec.md` §4.4),
//! deliberately orthogonal to the long-horizon [`reputation`] store.

use chiral_proto::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const DEFAULT_MAX_CONCURRENT: u32 = 2;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 1;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 300;
const DEFAULT_IDLE_EXPIRY_SECS: u64 = 600;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy)]
struct PeerHealthEntry {
    consecutive_failures: u32,
    backoff_until: u64,
    pending_requests: u32,
    max_concurrent: u32,
    rtt_ema_ms: Option<f64>,
    last_touched: u64,
}

impl PeerHealthEntry {
    fn new(now: u64) -> Self {
        Self {
            consecutive_failures: 0,
            backoff_until: 0,
            pending_requests: 0,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            rtt_ema_ms: None,
            last_touched: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthDecision {
    pub should_use: bool,
    pub weight: f64,
    pub max_concurrent: u32,
}

pub struct PeerHealthManager {
    entries: Mutex<HashMap<PeerId, PeerHealthEntry>>,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
    idle_expiry_secs: u64,
}

impl PeerHealthManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            idle_expiry_secs: DEFAULT_IDLE_EXPIRY_SECS,
        }
    }

    fn touch<'a>(map: &'a mut HashMap<PeerId, PeerHealthEntry>, peer: &PeerId, now: u64) -> &'a mut PeerHealthEntry {
        map.entry(peer.clone()).or_insert_with(|| PeerHealthEntry::new(now))
    }

    pub fn on_success(&self, peer: &PeerId, rtt_ms: Option<f64>) {
        let now = now_secs();
        let mut map = self.entries.lock();
        let entry = Self::touch(&mut map, peer, now);
        entry.consecutive_failures = 0;
        entry.backoff_until = 0;
        entry.last_touched = now;
        if let Some(rtt) = rtt_ms {
            entry.rtt_ema_ms = Some(match entry.rtt_ema_ms {
                Some(prev) => 0.8 * prev + 0.2 * rtt,
                None => rtt,
            });
            // Slower observed peers get a reduced concurrency allowance.
            entry.max_concurrent = if rtt > 1500.0 {
                1
            } else {
                DEFAULT_MAX_CONCURRENT
            };
        }
    }

    pub fn on_failure(&self, peer: &PeerId) {
        let now = now_secs();
        let mut map = self.entries.lock();
        let entry = Self::touch(&mut map, peer, now);
        entry.consecutive_failures += 1;
        let backoff = self
            .backoff_base_secs
            .saturating_mul(1u64 << entry.consecutive_failures.min(20))
            .min(self.backoff_cap_secs);
        entry.backoff_until = now + backoff;
        entry.last_touched = now;
        debug!(subsystem = "peer_health", %peer, failures = entry.consecutive_failures, backoff_secs = backoff, "backoff applied");
    }

    pub fn begin_request(&self, peer: &PeerId) {
        let now = now_secs();
        let mut map = self.entries.lock();
        let entry = Self::touch(&mut map, peer, now);
        entry.pending_requests += 1;
        entry.last_touched = now;
    }

    pub fn end_request(&self, peer: &PeerId) {
        let now = now_secs();
        let mut map = self.entries.lock();
        let entry = Self::touch(&mut map, peer, now);
        entry.pending_requests = entry.pending_requests.saturating_sub(1);
        entry.last_touched = now;
    }

    pub fn pending(&self, peer: &PeerId) -> u32 {
        self.entries
            .lock()
            .get(peer)
            .map(|e| e.pending_requests)
            .unwrap_or(0)
    }

    /// `spec.md` §4.4: `should_use=false` when in backoff or the peer is
    /// unknown; `weight` bounded by recent RTT; `max_concurrent` reduced
    /// under observed slowness.
    pub fn get_health_decision(&self, peer: &PeerId) -> HealthDecision {
        let now = now_secs();
        let map = self.entries.lock();
        match map.get(peer) {
            None => HealthDecision {
                should_use: false,
                weight: 0.0,
                max_concurrent: 0,
            },
            Some(entry) => {
                let should_use = now >= entry.backoff_until;
                let weight = match entry.rtt_ema_ms {
                    Some(rtt) => (1.0 - (rtt.clamp(50.0, 3000.0) - 50.0) / 2950.0).clamp(0.05, 1.0),
                    None => 0.5,
                };
                HealthDecision {
                    should_use,
                    weight,
                    max_concurrent: entry.max_concurrent,
                }
            }
        }
    }

    /// Clears per-peer state for peers idle longer than the idle-expiry
    /// threshold (`spec.md` §3 lifecycle note for `PeerHealth`).
    pub fn sweep_idle(&self) {
        let now = now_secs();
        let mut map = self.entries.lock();
        let before = map.len();
        map.retain(|_, entry| now.saturating_sub(entry.last_touched) <= self.idle_expiry_secs);
        let swept = before - map.len();
        if swept > 0 {
            debug!(subsystem = "peer_health", swept, "idle peers expired");
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.entries.lock().remove(peer);
    }
}

impl Default for PeerHealthManager {
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
    fn unknown_peer_should_not_be_used() {
        let mgr = PeerHealthManager::new();
        let decision = mgr.get_health_decision(&peer("ghost"));
        assert!(!decision.should_use);
    }

    #[test]
    fn failures_trigger_backoff_then_success_clears_it() {
        let mgr = PeerHealthManager::new();
        let p = peer("a");
        mgr.on_failure(&p);
        let decision = mgr.get_health_decision(&p);
        assert!(!decision.should_use);
        mgr.on_success(&p, Some(100.0));
        let decision = mgr.get_health_decision(&p);
        assert!(decision.should_use);
    }

    #[test]
    fn pending_tracks_begin_and_end() {
        let mgr = PeerHealthManager::new();
        let p = peer("a");
        mgr.begin_request(&p);
        mgr.begin_request(&p);
        assert_eq!(mgr.pending(&p), 2);
        mgr.end_request(&p);
        assert_eq!(mgr.pending(&p), 1);
    }

    #[test]
    fn slow_peer_gets_reduced_concurrency() {
        let mgr = PeerHealthManager::new();
        let p = peer("slow");
        mgr.on_success(&p, Some(2500.0));
        let decision = mgr.get_health_decision(&p);
        assert_eq!(decision.max_concurrent, 1);
    }
}
