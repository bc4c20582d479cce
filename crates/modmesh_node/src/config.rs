use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modmesh_net::NamespaceSyncConfig;
use serde::{Deserialize, Serialize};

use crate::access::AccessConfig;
use crate::error::NodeError;
use crate::server::ServerConfig;
use crate::stake::StakeSyncConfig;

/// On-disk node configuration. Every table is optional; missing fields take
/// the runtime defaults. The `[identity]` table is owned by
/// `Identity::load_or_create` and ignored here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFileConfig {
    pub node: NodeSection,
    pub access: AccessSection,
    pub sync: SyncSection,
    pub stake: StakeSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,
    pub bind: String,
    pub advertise: Option<String>,
    pub root: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_request_staleness_secs: u64,
    pub frame_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub audit_history: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            name: "module".to_string(),
            bind: server.bind,
            advertise: None,
            root: PathBuf::from(".modmesh"),
            workers: server.worker_count,
            queue_capacity: server.queue_capacity,
            max_request_staleness_secs: server.max_request_staleness.as_secs(),
            frame_timeout_ms: u64::try_from(server.frame_timeout.as_millis()).unwrap_or(u64::MAX),
            idle_timeout_secs: server.idle_timeout.as_secs(),
            audit_history: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSection {
    pub period_secs: u64,
    pub base_rate: u64,
    pub stake_to_rate: u64,
    pub max_rate: u64,
    pub admins: Vec<String>,
}

impl Default for AccessSection {
    fn default() -> Self {
        let access = AccessConfig::default();
        Self {
            period_secs: access.period.as_secs(),
            base_rate: access.base_rate,
            stake_to_rate: access.stake_to_rate,
            max_rate: access.max_rate,
            admins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub interval_secs: u64,
    pub call_timeout_ms: u64,
    pub max_concurrency: usize,
    pub max_consecutive_failures: u32,
    pub max_peer_age_secs: u64,
    pub peers: Vec<String>,
}

impl Default for SyncSection {
    fn default() -> Self {
        let sync = NamespaceSyncConfig::default();
        Self {
            interval_secs: sync.interval.as_secs(),
            call_timeout_ms: u64::try_from(sync.call_timeout.as_millis()).unwrap_or(u64::MAX),
            max_concurrency: sync.max_concurrency,
            max_consecutive_failures: sync.max_consecutive_failures,
            max_peer_age_secs: sync.max_peer_age.as_secs(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeSection {
    pub interval_secs: u64,
    pub watch: Vec<String>,
    /// Static balances served by the built-in oracle.
    pub balances: HashMap<String, u64>,
}

impl Default for StakeSection {
    fn default() -> Self {
        Self {
            interval_secs: StakeSyncConfig::default().interval.as_secs(),
            watch: Vec::new(),
            balances: HashMap::new(),
        }
    }
}

impl NodeFileConfig {
    /// Parses `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|err| NodeError::InvalidConfig {
            reason: format!("read {} failed: {}", path.display(), err),
        })?;
        Self::parse(&content).map_err(|err| match err {
            NodeError::InvalidConfig { reason } => NodeError::InvalidConfig {
                reason: format!("{}: {}", path.display(), reason),
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, NodeError> {
        toml::from_str(content).map_err(|err| NodeError::InvalidConfig {
            reason: format!("parse failed: {}", err),
        })
    }

    pub fn server_config(&self) -> Result<ServerConfig, NodeError> {
        let mut config = ServerConfig::new(self.node.bind.clone())?
            .with_workers(self.node.workers, self.node.queue_capacity)?
            .with_max_request_staleness(Duration::from_secs(self.node.max_request_staleness_secs))?
            .with_frame_timeout(Duration::from_millis(self.node.frame_timeout_ms))?
            .with_idle_timeout(Duration::from_secs(self.node.idle_timeout_secs))?
            .with_audit_history(self.node.audit_history);
        if let Some(advertise) = &self.node.advertise {
            config = config.with_advertise(advertise.clone());
        }
        Ok(config)
    }

    pub fn access_config(&self) -> Result<AccessConfig, NodeError> {
        Ok(AccessConfig::new()
            .with_period(Duration::from_secs(self.access.period_secs))?
            .with_rates(
                self.access.base_rate,
                self.access.stake_to_rate,
                self.access.max_rate,
            )?
            .with_admins(self.access.admins.iter().cloned()))
    }

    pub fn sync_config(&self) -> Result<NamespaceSyncConfig, NodeError> {
        Ok(NamespaceSyncConfig::new()
            .with_interval(Duration::from_secs(self.sync.interval_secs))?
            .with_call_timeout(Duration::from_millis(self.sync.call_timeout_ms))?
            .with_max_concurrency(self.sync.max_concurrency)?
            .with_max_consecutive_failures(self.sync.max_consecutive_failures)?
            .with_max_peer_age(Duration::from_secs(self.sync.max_peer_age_secs))
            .with_boot_peers(self.sync.peers.clone()))
    }

    pub fn stake_sync_config(&self) -> Result<StakeSyncConfig, NodeError> {
        Ok(StakeSyncConfig::new()
            .with_interval(Duration::from_secs(self.stake.interval_secs))?
            .with_watch(self.stake.watch.clone()))
    }
}
