//! Per-peer Beta-distribution reputation store with time decay
//! (`spec.md` §4.3).

use chiral_proto::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

const PRIOR_ALPHA: f64 = 1.0;
const PRIOR_BETA: f64 = 1.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub alpha: f64,
    pub beta: f64,
    pub rtt_ema: Option<f64>,
    pub last_seen: u64,
    pub last_updated: u64,
}

impl PeerRecord {
    fn new(now: u64) -> Self {
        PeerRecord {
            alpha: 0.0,
            beta: 0.0,
            rtt_ema: None,
            last_seen: now,
            last_updated: now,
        }
    }

    /// Applies exponential decay `k = 0.5^(Δdays / half_life_days)` to
    /// `alpha`/`beta` before any read, per `spec.md` §4.3.
    fn decay(&mut self, now: u64, half_life_days: f64) {
        if now <= self.last_updated {
            return;
        }
        let delta_days = (now - self.last_updated) as f64 / SECONDS_PER_DAY;
        let k = 0.5f64.powf(delta_days / half_life_days);
        self.alpha *= k;
        self.beta *= k;
        self.last_updated = now;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct ReputationStore {
    records: Mutex<HashMap<PeerId, PeerRecord>>,
    half_life_days: f64,
}

impl ReputationStore {
    pub fn new(half_life_days: f64) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            half_life_days,
        }
    }

    pub fn with_default_half_life() -> Self {
        Self::new(14.0)
    }

    fn touch<'a>(
        map: &'a mut HashMap<PeerId, PeerRecord>,
        peer: &PeerId,
        now: u64,
        half_life_days: f64,
    ) -> &'a mut PeerRecord {
        let record = map
            .entry(peer.clone())
            .or_insert_with(|| PeerRecord::new(now));
        record.decay(now, half_life_days);
        record
    }

    pub fn note_seen(&self, peer: &PeerId) {
        let now = now_secs();
        let mut map = self.records.lock();
        let record = Self::touch(&mut map, peer, now, self.half_life_days);
        record.last_seen = now;
    }

    pub fn success(&self, peer: &PeerId, rtt_ms: Option<f64>) {
        let now = now_secs();
        let mut map = self.records.lock();
        let record = Self::touch(&mut map, peer, now, self.half_life_days);
        record.alpha += 1.0;
        record.last_seen = now;
        if let Some(rtt) = rtt_ms {
            record.rtt_ema = Some(match record.rtt_ema {
                Some(prev) => 0.8 * prev + 0.2 * rtt,
                None => rtt,
            });
        }
        trace!(subsystem = "reputation", %peer, alpha = record.alpha, "success recorded");
    }

    pub fn failure(&self, peer: &PeerId) {
        let now = now_secs();
        let mut map = self.records.lock();
        let record = Self::touch(&mut map, peer, now, self.half_life_days);
        record.beta += 1.0;
        trace!(subsystem = "reputation", %peer, beta = record.beta, "failure recorded");
    }

    /// Removes every row for `peer` (table-removal atomicity, `spec.md` §9).
    pub fn remove_peer(&self, peer: &PeerId) {
        self.records.lock().remove(peer);
        debug!(subsystem = "reputation", %peer, "peer state removed");
    }

    pub fn record_of(&self, peer: &PeerId) -> Option<PeerRecord> {
        let now = now_secs();
        let mut map = self.records.lock();
        map.get_mut(peer).map(|r| {
            r.decay(now, self.half_life_days);
            *r
        })
    }

    /// Composite score in `[0, 1]` per `spec.md` §4.3.
    pub fn composite(&self, peer: &PeerId) -> f64 {
        let now = now_secs();
        let record = {
            let mut map = self.records.lock();
            let record = Self::touch(&mut map, peer, now, self.half_life_days);
            *record
        };
        composite_of(&record, now)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), ReputationError> {
        let map = self.records.lock();
        let rows: Vec<(PeerId, PeerRecord)> =
            map.iter().map(|(p, r)| (p.clone(), *r)).collect();
        let bytes = bincode::serialize(&rows)?;
        std::fs::write(path, bytes)?;
        debug!(subsystem = "reputation", peers = rows.len(), "snapshot saved");
        Ok(())
    }

    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Vec<(PeerId, PeerRecord)>, ReputationError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn restore(&self, rows: Vec<(PeerId, PeerRecord)>) {
        let mut map = self.records.lock();
        for (peer, record) in rows {
            map.insert(peer, record);
        }
    }
}

fn composite_of(record: &PeerRecord, now: u64) -> f64 {
    let rep = (record.alpha + PRIOR_ALPHA) / (record.alpha + record.beta + PRIOR_ALPHA + PRIOR_BETA);
    let age_secs = now.saturating_sub(record.last_seen) as f64;
    let fresh = if age_secs < 60.0 {
        1.0
    } else if age_secs > 24.0 * 3600.0 {
        0.0
    } else {
        1.0 - (age_secs - 60.0) / (24.0 * 3600.0 - 60.0)
    };
    let rtt = record.rtt_ema.unwrap_or(2000.0).clamp(100.0, 2000.0);
    let perf = 1.0 - (rtt - 100.0) / 1900.0;
    (0.6 * rep + 0.25 * fresh + 0.15 * perf).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    #[test]
    fn composite_is_bounded() {
        let store = ReputationStore::new(14.0);
        let p = peer("a");
        for _ in 0..50 {
            store.success(&p, Some(150.0));
        }
        let c = store.composite(&p);
        assert!((0.0..=1.0).contains(&c));
    }

    #[test]
    fn success_raises_and_failure_lowers_composite() {
        let store = ReputationStore::new(14.0);
        let p = peer("b");
        store.note_seen(&p);
        let baseline = store.composite(&p);
        store.success(&p, Some(120.0));
        let after_success = store.composite(&p);
        assert!(after_success > baseline);
        store.failure(&p);
        store.failure(&p);
        store.failure(&p);
        let after_failures = store.composite(&p);
        assert!(after_failures < after_success);
    }

    #[test]
    fn decay_halves_counts_after_one_half_life() {
        let mut record = PeerRecord::new(0);
        record.alpha = 8.0;
        record.beta = 4.0;
        record.last_updated = 0;
        let half_life_days = 14.0;
        let one_half_life_secs = (half_life_days * SECONDS_PER_DAY) as u64;
        record.decay(one_half_life_secs, half_life_days);
        assert!((record.alpha - 4.0).abs() < 1e-6);
        assert!((record.beta - 2.0).abs() < 1e-6);
    }

    #[test]
    fn remove_peer_drops_all_state() {
        let store = ReputationStore::new(14.0);
        let p = peer("c");
        store.success(&p, Some(100.0));
        assert!(store.record_of(&p).is_some());
        store.remove_peer(&p);
        assert!(store.record_of(&p).is_none());
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reputation.snapshot");
        let store = ReputationStore::new(14.0);
        let p = peer("d");
        store.success(&p, Some(200.0));
        store.save_snapshot(&path).unwrap();

        let rows = ReputationStore::load_snapshot(&path).unwrap();
        let restored = ReputationStore::new(14.0);
        restored.restore(rows);
        assert!(restored.record_of(&p).is_some());
    }
}
