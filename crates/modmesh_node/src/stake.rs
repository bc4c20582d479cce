use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use modmesh_proto::{now_unix_ms, MeshError};
use tracing::{debug, warn};

use crate::access::AccessController;
use crate::error::NodeError;
use crate::runtime::PeriodicRuntime;
use crate::runtime_util::{read, write};

/// Source of stake balances, typically backed by a chain RPC.
pub trait StakeOracle: Send + Sync {
    fn stake_of(&self, address: &str) -> Result<u64, MeshError>;

    fn stakes(&self, addresses: &[String]) -> Result<HashMap<String, u64>, MeshError> {
        addresses
            .iter()
            .map(|address| Ok((address.clone(), self.stake_of(address)?)))
            .collect()
    }
}

/// Fixed balances held in memory; unknown addresses have zero stake.
#[derive(Debug, Default)]
pub struct StaticStakeOracle {
    balances: RwLock<HashMap<String, u64>>,
}

impl StaticStakeOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_balances(balances: HashMap<String, u64>) -> Self {
        Self {
            balances: RwLock::new(balances),
        }
    }

    pub fn with_stake(self, address: impl Into<String>, stake: u64) -> Self {
        self.set_stake(address, stake);
        self
    }

    pub fn set_stake(&self, address: impl Into<String>, stake: u64) {
        write(&self.balances).insert(address.into(), stake);
    }
}

impl StakeOracle for StaticStakeOracle {
    fn stake_of(&self, address: &str) -> Result<u64, MeshError> {
        Ok(read(&self.balances).get(address).copied().unwrap_or(0))
    }
}

/// Last stake balances fetched from the oracle. Only the stake sync task
/// writes it; the request path reads.
#[derive(Debug, Default)]
pub struct StakeSnapshot {
    stakes: RwLock<HashMap<String, u64>>,
    refreshed_at_ms: AtomicI64,
}

impl StakeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stake_of(&self, address: &str) -> u64 {
        read(&self.stakes).get(address).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        read(&self.stakes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last refresh time, or `None` before the first refresh.
    pub fn refreshed_at_ms(&self) -> Option<i64> {
        match self.refreshed_at_ms.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    pub(crate) fn replace(&self, stakes: HashMap<String, u64>, now_ms: i64) {
        *write(&self.stakes) = stakes;
        self.refreshed_at_ms.store(now_ms, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeSyncConfig {
    pub interval: Duration,
    pub watch: Vec<String>,
}

impl Default for StakeSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            watch: Vec::new(),
        }
    }
}

impl StakeSyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Result<Self, NodeError> {
        if interval.is_zero() {
            return Err(NodeError::InvalidConfig {
                reason: "stake sync interval must be positive".to_string(),
            });
        }
        self.interval = interval;
        Ok(self)
    }

    pub fn with_watch(mut self, addresses: Vec<String>) -> Self {
        let dedup: BTreeSet<String> = addresses.into_iter().collect();
        self.watch = dedup.into_iter().collect();
        self
    }
}

/// Refreshes the access controller's stake snapshot and persists its usage
/// counters.
pub struct StakeSync {
    oracle: Arc<dyn StakeOracle>,
    access: Arc<AccessController>,
    config: StakeSyncConfig,
}

impl StakeSync {
    pub fn new(
        oracle: Arc<dyn StakeOracle>,
        access: Arc<AccessController>,
        config: StakeSyncConfig,
    ) -> Self {
        Self {
            oracle,
            access,
            config,
        }
    }

    /// Fetches stake for every known caller plus watched addresses. A failed
    /// fetch keeps the previous snapshot. Callers whose window expired are
    /// dropped first.
    pub fn refresh_once(&self) -> Result<usize, MeshError> {
        self.access.prune_expired(now_unix_ms());
        let addresses: Vec<String> = self
            .access
            .known_callers()
            .into_iter()
            .chain(self.config.watch.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let stakes = self.oracle.stakes(&addresses)?;
        let refreshed = stakes.len();
        self.access.stakes().replace(stakes, now_unix_ms());
        self.access.save_usage()?;
        debug!(addresses = refreshed, "stake snapshot refreshed");
        Ok(refreshed)
    }

    /// Runs [`Self::refresh_once`] on `interval` until stopped.
    pub fn spawn(self) -> Result<PeriodicRuntime, NodeError> {
        let mut runtime = PeriodicRuntime::new("stake-sync", self.config.interval);
        runtime.start(move || {
            self.refresh_once().map(|_| ()).map_err(|err| {
                warn!(error = %err, "stake refresh failed; keeping previous snapshot");
                err.to_string()
            })
        })?;
        Ok(runtime)
    }
}
