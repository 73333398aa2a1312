//! NAT reachability state machine (`spec.md` §4.6).
//!
//! Kept as pure decision logic over probe outcomes, independent of whatever
//! drives the actual probes: `dht_engine`'s `autonat` behaviour in the
//! production wiring, a scripted fake in tests. The trait boundary keeps
//! the state machine testable without a real `libp2p` swarm behind it.

use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const DEFAULT_MIN_PROBES: usize = 3;
const DEFAULT_HISTORY_CAP: usize = 64;
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(90);
const DEFAULT_JITTER_FRACTION: f64 = 0.2;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityState {
    Unknown,
    Private,
    Public,
}

impl ReachabilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReachabilityState::Unknown => "unknown",
            ReachabilityState::Private => "private",
            ReachabilityState::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    InboundSuccess { server: String },
    InboundFailure { server: String },
    ObservedExternalAddr { addr: String, from_peer: String },
}

#[derive(Debug, Clone)]
pub struct ReachabilityEvent {
    pub new_state: ReachabilityState,
    pub confidence: Confidence,
    pub summary: String,
    pub at: u64,
}

pub struct ReachabilityConfig {
    pub min_probes: usize,
    pub history_cap: usize,
    pub probe_interval: Duration,
    pub jitter_fraction: f64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            min_probes: DEFAULT_MIN_PROBES,
            history_cap: DEFAULT_HISTORY_CAP,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

/// The open question in `spec.md` §9(a) ("the exact confidence-threshold
/// policy... is not documented precisely") is resolved here: an inbound
/// success or failure only moves confidence once `min_probes` *agreeing*,
/// *distinct-server* observations have accumulated in the current run
/// (recorded in `agreeing_servers`); a disagreeing observation resets the
/// run rather than being averaged in, so a flapping NAT settles on `low`
/// confidence rather than oscillating at `high`. Confidence jumps straight
/// from `low` to `high` once `min_probes` agreeing observations land,
/// matching `spec.md` §8 scenario 5 (three agreeing probes at the default
/// `min_probes = 3` raise confidence from low to high in a single
/// transition, with no intermediate `medium` plateau).
pub struct ReachabilityModule {
    config: ReachabilityConfig,
    state: ReachabilityState,
    confidence: Confidence,
    agreeing_servers: HashSet<String>,
    run_direction: Option<bool>, // true = toward public, false = toward private
    history: VecDeque<ReachabilityEvent>,
}

impl ReachabilityModule {
    pub fn new(config: ReachabilityConfig) -> Self {
        Self {
            config,
            state: ReachabilityState::Unknown,
            confidence: Confidence::Low,
            agreeing_servers: HashSet::new(),
            run_direction: None,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ReachabilityState {
        self.state
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn history(&self) -> impl Iterator<Item = &ReachabilityEvent> {
        self.history.iter()
    }

    /// Next jittered delay before the caller should run another probe.
    pub fn next_probe_delay(&self) -> Duration {
        let base = self.config.probe_interval.as_secs_f64();
        let jitter = base * self.config.jitter_fraction;
        let delta = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base + delta).max(1.0))
    }

    /// Folds one probe outcome into the state machine, returning the
    /// transition event iff the outcome caused one (`spec.md` §4.6: "state
    /// transitions emit an event...").
    pub fn record(&mut self, outcome: ProbeOutcome) -> Option<ReachabilityEvent> {
        match outcome {
            ProbeOutcome::InboundSuccess { server } => self.record_direction(true, server),
            ProbeOutcome::InboundFailure { server } => self.record_direction(false, server),
            ProbeOutcome::ObservedExternalAddr { .. } => None,
        }
    }

    fn record_direction(&mut self, toward_public: bool, server: String) -> Option<ReachabilityEvent> {
        if self.run_direction != Some(toward_public) {
            self.run_direction = Some(toward_public);
            self.agreeing_servers.clear();
        }
        self.agreeing_servers.insert(server);

        let agreeing = self.agreeing_servers.len();
        let confidence = if agreeing >= self.config.min_probes {
            Confidence::High
        } else {
            Confidence::Low
        };

        let target_state = if toward_public {
            ReachabilityState::Public
        } else {
            ReachabilityState::Private
        };

        let state_changed = agreeing >= self.config.min_probes && self.state != target_state;
        let confidence_changed = confidence != self.confidence;
        if !state_changed && !confidence_changed {
            return None;
        }

        if agreeing >= self.config.min_probes {
            self.state = target_state;
        }
        self.confidence = confidence;

        let event = ReachabilityEvent {
            new_state: self.state,
            confidence: self.confidence,
            summary: format!(
                "{} agreeing probes toward {} (confidence {})",
                agreeing,
                target_state.as_str(),
                confidence.as_str()
            ),
            at: now_secs(),
        };
        self.history.push_back(event.clone());
        while self.history.len() > self.config.history_cap {
            self.history.pop_front();
        }
        debug!(subsystem = "reachability", new_state = event.new_state.as_str(), confidence = event.confidence.as_str(), "state transition");
        Some(event)
    }
}

impl Default for ReachabilityModule {
    fn default() -> Self {
        Self::new(ReachabilityConfig::default())
    }
}

/// Runs probes on a jittered interval until `shutdown` fires, feeding each
/// outcome into `module`. Kept generic over the probe function so tests
/// never touch a real socket (`SPEC_FULL.md` §B.4).
pub async fn run_probe_loop<F, Fut>(
    module: &tokio::sync::Mutex<ReachabilityModule>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    mut probe_once: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Vec<ProbeOutcome>>,
{
    loop {
        let delay = module.lock().await.next_probe_delay();
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {
                let outcomes = probe_once().await;
                let mut guard = module.lock().await;
                for outcome in outcomes {
                    guard.record(outcome);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown_with_low_confidence() {
        let module = ReachabilityModule::default();
        assert_eq!(module.state(), ReachabilityState::Unknown);
        assert_eq!(module.confidence(), Confidence::Low);
    }

    #[test]
    fn distinct_agreeing_probes_raise_toward_public() {
        let mut module = ReachabilityModule::new(ReachabilityConfig {
            min_probes: 3,
            ..Default::default()
        });
        assert!(module
            .record(ProbeOutcome::InboundSuccess { server: "a".into() })
            .is_none());
        assert!(module
            .record(ProbeOutcome::InboundSuccess { server: "b".into() })
            .is_none());
        let event = module
            .record(ProbeOutcome::InboundSuccess { server: "c".into() })
            .expect("third distinct agreeing probe should transition");
        assert_eq!(event.new_state, ReachabilityState::Public);
        assert_eq!(event.confidence, Confidence::High);
        assert_eq!(module.state(), ReachabilityState::Public);
        assert_eq!(module.confidence(), Confidence::High);
    }

    #[test]
    fn repeated_failures_settle_on_private() {
        let mut module = ReachabilityModule::new(ReachabilityConfig {
            min_probes: 2,
            ..Default::default()
        });
        module.record(ProbeOutcome::InboundFailure { server: "a".into() });
        let event = module
            .record(ProbeOutcome::InboundFailure { server: "b".into() })
            .unwrap();
        assert_eq!(event.new_state, ReachabilityState::Private);
    }

    #[test]
    fn same_server_repeated_does_not_count_twice() {
        let mut module = ReachabilityModule::new(ReachabilityConfig {
            min_probes: 2,
            ..Default::default()
        });
        module.record(ProbeOutcome::InboundSuccess { server: "a".into() });
        assert!(module
            .record(ProbeOutcome::InboundSuccess { server: "a".into() })
            .is_none());
    }

    #[test]
    fn disagreeing_observation_resets_the_run() {
        let mut module = ReachabilityModule::new(ReachabilityConfig {
            min_probes: 2,
            ..Default::default()
        });
        module.record(ProbeOutcome::InboundSuccess { server: "a".into() });
        // Disagreement clears the run: this single failure should not by
        // itself cross `min_probes` toward private.
        assert!(module
            .record(ProbeOutcome::InboundFailure { server: "x".into() })
            .is_none());
        assert_eq!(module.state(), ReachabilityState::Unknown);
    }

    #[test]
    fn history_is_bounded() {
        let mut module = ReachabilityModule::new(ReachabilityConfig {
            min_probes: 1,
            history_cap: 2,
            ..Default::default()
        });
        for i in 0..10 {
            module.record(ProbeOutcome::InboundSuccess {
                server: format!("s{i}"),
            });
        }
        assert!(module.history().count() <= 2);
    }

    #[tokio::test]
    async fn probe_loop_stops_on_shutdown() {
        let module = tokio::sync::Mutex::new(ReachabilityModule::new(ReachabilityConfig {
            probe_interval: Duration::from_millis(1),
            jitter_fraction: 0.0,
            ..Default::default()
        }));
        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            run_probe_loop(&module, rx, || async { Vec::new() }),
        )
        .await
        .expect("probe loop should stop promptly after shutdown");
    }
}
