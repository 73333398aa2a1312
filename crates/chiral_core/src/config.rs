//! `start_node(cfg)`'s configuration struct (`spec.md` §6), validated on
//! entry per the inline field constraints. Populated either by the CLI's
//! `clap`-derived flags or directly by an embedding host, matching the
//! two-layer config shape of `SPEC_FULL.md` §B.3.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("dht_port must be in [1, 65535], got {0}")]
    DhtPort(u32),
    #[error("chunk_size_kib must be in [16, 4096], got {0}")]
    ChunkSizeKib(u32),
    #[error("autonat_probe_interval_secs must be at least 1, got {0}")]
    AutonatInterval(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub dht_port: u16,
    pub bootstrap_addrs: Vec<String>,
    pub enable_autonat: bool,
    pub autonat_probe_interval_secs: u32,
    pub autonat_servers: Vec<String>,
    pub proxy_addr: Option<String>,
    pub chunk_size_kib: u32,
    pub cache_size_mib: u64,
    pub enable_autorelay: bool,
    pub preferred_relays: Vec<String>,
    pub enable_relay_server: bool,
    pub enable_upnp: bool,
    pub relay_server_alias: Option<String>,
    pub pure_client_mode: bool,
    /// Runs the node as a pure router: never publishes its own provider
    /// records, accepting only `FIND_NODE`/provider lookups from others
    /// (`spec.md` §4.5 "bootstrap role"). Distinct from `pure_client_mode`,
    /// which goes the other way and never answers as a DHT server at all.
    pub bootstrap_role: bool,
    /// Data root under which `chunks/`, `manifests/`, `reputation.snapshot`
    /// and `state.db` live (`spec.md` §6 "Persistent state layout"). Not
    /// part of the inline `cfg` schema; supplied separately by the host,
    /// similar to how a `--data-dir` flag sits alongside a `NodeConfig`.
    pub data_dir: String,
    /// `stop_node`'s grace period before forcibly aborting remaining tasks
    /// (`SPEC_FULL.md` §C).
    pub shutdown_grace_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dht_port: 4001,
            bootstrap_addrs: Vec::new(),
            enable_autonat: false,
            autonat_probe_interval_secs: 90,
            autonat_servers: Vec::new(),
            proxy_addr: None,
            chunk_size_kib: 256,
            cache_size_mib: 0,
            enable_autorelay: false,
            preferred_relays: Vec::new(),
            enable_relay_server: false,
            enable_upnp: false,
            relay_server_alias: None,
            pure_client_mode: false,
            bootstrap_role: false,
            data_dir: default_data_dir(),
            shutdown_grace_secs: 5,
        }
    }
}

fn default_data_dir() -> String {
    dirs_data_root().join("chiral-network").to_string_lossy().into_owned()
}

/// A minimal per-user data root resolver, kept inline rather than pulling
/// in a whole `dirs`/`directories`-style crate for one `home_dir` call.
fn dirs_data_root() -> std::path::PathBuf {
    std::env::var_os("CHIRAL_DATA_DIR")
        .map(std::path::PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| std::path::PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}

impl NodeConfig {
    /// Reads `CHIRAL_ENABLE_AUTONAT=1` and ORs it into `enable_autonat`
    /// before validation (`spec.md` §6 "Environment").
    pub fn apply_env(&mut self) {
        if std::env::var("CHIRAL_ENABLE_AUTONAT").as_deref() == Ok("1") {
            self.enable_autonat = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dht_port == 0 {
            return Err(ConfigError::DhtPort(0));
        }
        if !(16..=4096).contains(&self.chunk_size_kib) {
            return Err(ConfigError::ChunkSizeKib(self.chunk_size_kib));
        }
        if self.autonat_probe_interval_secs == 0 {
            return Err(ConfigError::AutonatInterval(0));
        }
        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kib as usize * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.chunk_size_kib = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ChunkSizeKib(0))));
    }

    #[test]
    fn oversize_chunk_size_is_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.chunk_size_kib = 8192;
        assert!(cfg.validate().is_err());
    }
}
