use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use modmesh_proto::{get_json, put_json, BlobStore, MeshError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NodeError;
use crate::module::Module;
use crate::runtime_util::{lock, read, write};
use crate::stake::StakeSnapshot;

pub const USAGE_KEY: &str = "access/usage";

/// Window count above which a new caller triggers a prune of expired
/// windows.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessConfig {
    pub period: Duration,
    pub base_rate: u64,
    pub stake_to_rate: u64,
    pub max_rate: u64,
    pub admins: BTreeSet<String>,
    pub local_addresses: BTreeSet<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            base_rate: 2,
            stake_to_rate: 100,
            max_rate: 1000,
            admins: BTreeSet::new(),
            local_addresses: BTreeSet::new(),
        }
    }
}

impl AccessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_period(mut self, period: Duration) -> Result<Self, NodeError> {
        if period.is_zero() {
            return Err(NodeError::InvalidConfig {
                reason: "rate limit period must be positive".to_string(),
            });
        }
        self.period = period;
        Ok(self)
    }

    pub fn with_rates(
        mut self,
        base_rate: u64,
        stake_to_rate: u64,
        max_rate: u64,
    ) -> Result<Self, NodeError> {
        if stake_to_rate == 0 {
            return Err(NodeError::InvalidConfig {
                reason: "stake_to_rate must be positive".to_string(),
            });
        }
        if max_rate < base_rate {
            return Err(NodeError::InvalidConfig {
                reason: format!("max_rate {} is below base_rate {}", max_rate, base_rate),
            });
        }
        self.base_rate = base_rate;
        self.stake_to_rate = stake_to_rate;
        self.max_rate = max_rate;
        Ok(self)
    }

    pub fn with_admins<I, S>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admins.extend(admins.into_iter().map(Into::into));
        self
    }

    pub fn with_local_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_addresses
            .extend(addresses.into_iter().map(Into::into));
        self
    }

    fn period_ms(&self) -> i64 {
        i64::try_from(self.period.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Per-function override of the stake-to-rate conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub stake_to_rate: Option<u64>,
    pub max_rate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub caller: String,
    pub stake: u64,
    pub rate_limit: u64,
    pub count: u64,
    pub window_start_ms: i64,
    pub last_seen_ms: i64,
}

impl QuotaState {
    pub fn remaining(&self) -> u64 {
        self.rate_limit.saturating_sub(self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Present when the call went through the rate limiter.
    pub quota: Option<QuotaState>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            quota: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            quota: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CallerWindow {
    count: u64,
    window_start_ms: i64,
    last_seen_ms: i64,
}

/// Stake-weighted gate in front of every dispatched call.
pub struct AccessController {
    config: AccessConfig,
    admins: RwLock<BTreeSet<String>>,
    local_addresses: RwLock<BTreeSet<String>>,
    policies: RwLock<BTreeMap<String, RatePolicy>>,
    stakes: StakeSnapshot,
    windows: Mutex<HashMap<String, Arc<Mutex<CallerWindow>>>>,
    store: Option<Arc<dyn BlobStore>>,
}

impl std::fmt::Debug for AccessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AccessController {
    pub fn new(config: AccessConfig) -> Self {
        Self {
            admins: RwLock::new(config.admins.clone()),
            local_addresses: RwLock::new(config.local_addresses.clone()),
            config,
            policies: RwLock::new(BTreeMap::new()),
            stakes: StakeSnapshot::new(),
            windows: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Restores persisted usage counters and keeps `store` for
    /// [`Self::save_usage`].
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Result<Self, MeshError> {
        let usage: BTreeMap<String, CallerWindow> =
            get_json(store.as_ref(), USAGE_KEY)?.unwrap_or_default();
        {
            let mut windows = lock(&self.windows);
            for (caller, window) in usage {
                windows.insert(caller, Arc::new(Mutex::new(window)));
            }
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub fn stakes(&self) -> &StakeSnapshot {
        &self.stakes
    }

    /// Decides whether `caller` may invoke `function` on `module` at
    /// `now_ms`, counting the call against the caller's window when it
    /// reaches the rate limiter.
    pub fn verify(
        &self,
        caller: &str,
        function: &str,
        module: &Module,
        now_ms: i64,
    ) -> AccessDecision {
        if self.is_admin(caller) {
            return AccessDecision::allow();
        }
        if function.starts_with('_') {
            return AccessDecision::deny(format!("Function {} is private", function));
        }
        if !module.is_whitelisted(function) {
            return AccessDecision::deny(format!("Function {} not in whitelist", function));
        }
        if module.is_blacklisted(function) {
            return AccessDecision::deny(format!("Function {} is blacklisted", function));
        }
        if self.is_local(caller) {
            return AccessDecision::allow();
        }

        let stake = self.stakes.stake_of(caller);
        let rate_limit = self.rate_limit(stake, function);
        let window = self.window(caller, now_ms);
        let mut window = lock(&window);
        if now_ms.saturating_sub(window.window_start_ms) > self.config.period_ms() {
            window.count = 0;
            window.window_start_ms = now_ms;
        }
        window.count = window.count.saturating_add(1);
        window.last_seen_ms = now_ms;
        let quota = QuotaState {
            caller: caller.to_string(),
            stake,
            rate_limit,
            count: window.count,
            window_start_ms: window.window_start_ms,
            last_seen_ms: window.last_seen_ms,
        };
        if window.count > rate_limit {
            debug!(
                caller = caller,
                function = function,
                count = window.count,
                rate_limit = rate_limit,
                "rate limit exceeded"
            );
            return AccessDecision {
                allowed: false,
                reason: Some(format!(
                    "Rate limit exceeded: {} > limit {}",
                    window.count, rate_limit
                )),
                quota: Some(quota),
            };
        }
        AccessDecision {
            allowed: true,
            reason: None,
            quota: Some(quota),
        }
    }

    /// `min(base_rate + stake / stake_to_rate, max_rate)`, with the
    /// function's policy overriding the divisor and the cap.
    pub fn rate_limit(&self, stake: u64, function: &str) -> u64 {
        let policy = read(&self.policies)
            .get(function)
            .copied()
            .unwrap_or_default();
        let stake_to_rate = policy
            .stake_to_rate
            .unwrap_or(self.config.stake_to_rate)
            .max(1);
        let max_rate = policy.max_rate.unwrap_or(self.config.max_rate);
        self.config
            .base_rate
            .saturating_add(stake / stake_to_rate)
            .min(max_rate)
    }

    /// Current usage of `caller` for `function` without counting a call.
    pub fn quota(&self, caller: &str, function: &str, now_ms: i64) -> QuotaState {
        let stake = self.stakes.stake_of(caller);
        let rate_limit = self.rate_limit(stake, function);
        let window = lock(&self.windows)
            .get(caller)
            .map(|window| *lock(window))
            .unwrap_or_default();
        let expired = now_ms.saturating_sub(window.window_start_ms) > self.config.period_ms();
        QuotaState {
            caller: caller.to_string(),
            stake,
            rate_limit,
            count: if expired { 0 } else { window.count },
            window_start_ms: window.window_start_ms,
            last_seen_ms: window.last_seen_ms,
        }
    }

    pub fn set_rate_policy(&self, function: &str, policy: RatePolicy) -> Result<(), NodeError> {
        if policy.stake_to_rate == Some(0) {
            return Err(NodeError::InvalidConfig {
                reason: format!("stake_to_rate for {} must be positive", function),
            });
        }
        write(&self.policies).insert(function.to_string(), policy);
        Ok(())
    }

    pub fn clear_rate_policy(&self, function: &str) -> bool {
        write(&self.policies).remove(function).is_some()
    }

    pub fn rate_policy(&self, function: &str) -> Option<RatePolicy> {
        read(&self.policies).get(function).copied()
    }

    pub fn add_admin(&self, address: impl Into<String>) {
        write(&self.admins).insert(address.into());
    }

    pub fn remove_admin(&self, address: &str) -> bool {
        write(&self.admins).remove(address)
    }

    pub fn is_admin(&self, address: &str) -> bool {
        read(&self.admins).contains(address)
    }

    pub fn add_local_address(&self, address: impl Into<String>) {
        write(&self.local_addresses).insert(address.into());
    }

    pub fn is_local(&self, address: &str) -> bool {
        read(&self.local_addresses).contains(address)
    }

    /// Drops windows whose period ended before `now_ms` and that no call is
    /// currently using; their counters would reset on the next call anyway.
    /// Returns how many were dropped.
    pub fn prune_expired(&self, now_ms: i64) -> usize {
        let mut windows = lock(&self.windows);
        self.prune_locked(&mut windows, now_ms)
    }

    fn prune_locked(
        &self,
        windows: &mut HashMap<String, Arc<Mutex<CallerWindow>>>,
        now_ms: i64,
    ) -> usize {
        let period_ms = self.config.period_ms();
        let before = windows.len();
        windows.retain(|_, window| {
            Arc::strong_count(window) > 1
                || now_ms.saturating_sub(lock(window).window_start_ms) <= period_ms
        });
        let pruned = before - windows.len();
        if pruned > 0 {
            debug!(pruned, remaining = windows.len(), "expired caller windows pruned");
        }
        pruned
    }

    /// Every caller that has reached the rate limiter.
    pub fn known_callers(&self) -> Vec<String> {
        let mut callers: Vec<String> = lock(&self.windows).keys().cloned().collect();
        callers.sort();
        callers
    }

    /// Writes the usage counters to the blob store, if one is attached.
    pub fn save_usage(&self) -> Result<(), MeshError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let windows: Vec<(String, Arc<Mutex<CallerWindow>>)> = lock(&self.windows)
            .iter()
            .map(|(caller, window)| (caller.clone(), Arc::clone(window)))
            .collect();
        let usage: BTreeMap<String, CallerWindow> = windows
            .into_iter()
            .map(|(caller, window)| {
                let snapshot = *lock(&window);
                (caller, snapshot)
            })
            .collect();
        put_json(store.as_ref(), USAGE_KEY, &usage)
    }

    fn window(&self, caller: &str, now_ms: i64) -> Arc<Mutex<CallerWindow>> {
        let mut windows = lock(&self.windows);
        if windows.len() >= PRUNE_THRESHOLD && !windows.contains_key(caller) {
            self.prune_locked(&mut windows, now_ms);
        }
        Arc::clone(windows.entry(caller.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(CallerWindow {
                count: 0,
                window_start_ms: now_ms,
                last_seen_ms: now_ms,
            }))
        }))
    }
}
