use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use modmesh_proto::{now_unix_ms, MeshError};
use tracing::{debug, info, warn};

use crate::client::{CallOptions, Kwargs, ModuleClient};
use crate::fanout::scatter_gather;
use crate::namespace::{NamespaceMap, NamespaceScope, NamespaceStore};
use crate::peer_registry::{remote_names, PeerRegistry};

/// Function every server answers with its local namespace.
pub const NAMESPACE_FUNCTION: &str = "namespace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSyncConfig {
    pub interval: Duration,
    pub call_timeout: Duration,
    pub max_concurrency: usize,
    pub max_consecutive_failures: u32,
    pub max_peer_age: Duration,
    pub boot_peers: Vec<String>,
}

impl Default for NamespaceSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(4),
            max_concurrency: 16,
            max_consecutive_failures: 5,
            max_peer_age: Duration::from_secs(90),
            boot_peers: Vec::new(),
        }
    }
}

impl NamespaceSyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Result<Self, MeshError> {
        if interval.is_zero() {
            return Err(MeshError::InvalidConfig {
                reason: "sync interval must be positive".to_string(),
            });
        }
        self.interval = interval;
        Ok(self)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Result<Self, MeshError> {
        if timeout.is_zero() {
            return Err(MeshError::InvalidConfig {
                reason: "sync call_timeout must be positive".to_string(),
            });
        }
        self.call_timeout = timeout;
        Ok(self)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Result<Self, MeshError> {
        if max_concurrency == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "sync max_concurrency must be positive".to_string(),
            });
        }
        self.max_concurrency = max_concurrency;
        Ok(self)
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Result<Self, MeshError> {
        if failures == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "max_consecutive_failures must be positive".to_string(),
            });
        }
        self.max_consecutive_failures = failures;
        Ok(self)
    }

    pub fn with_max_peer_age(mut self, max_age: Duration) -> Self {
        self.max_peer_age = max_age;
        self
    }

    pub fn with_boot_peers(mut self, peers: Vec<String>) -> Self {
        let dedup: BTreeSet<String> = peers.into_iter().collect();
        self.boot_peers = dedup.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub reached: Vec<String>,
    pub failed: Vec<String>,
    pub evicted: Vec<String>,
    pub global_size: usize,
}

/// One refresh of the global namespace from every known peer.
#[derive(Debug)]
pub struct NamespaceSync {
    client: ModuleClient,
    namespace: Arc<NamespaceStore>,
    peers: Arc<PeerRegistry>,
    config: NamespaceSyncConfig,
    self_addresses: BTreeSet<String>,
}

impl NamespaceSync {
    pub fn new(
        client: ModuleClient,
        namespace: Arc<NamespaceStore>,
        peers: Arc<PeerRegistry>,
        config: NamespaceSyncConfig,
    ) -> Self {
        Self {
            client,
            namespace,
            peers,
            config,
            self_addresses: BTreeSet::new(),
        }
    }

    /// Skips this node's own listen address when it shows up as a peer.
    pub fn with_self_address(mut self, address: impl Into<String>) -> Self {
        self.self_addresses.insert(address.into());
        self
    }

    /// Adds every address this node answers on, for nodes bound to a
    /// wildcard host that peers may list under a concrete one.
    pub fn with_self_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.self_addresses
            .extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn config(&self) -> &NamespaceSyncConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn sync_once(&self) -> Result<SyncReport, MeshError> {
        let candidates: Vec<String> = self
            .config
            .boot_peers
            .iter()
            .cloned()
            .chain(self.peers.addresses())
            .filter(|address| !self.self_addresses.contains(address))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let options = CallOptions::default().with_timeout(self.config.call_timeout);
        let outcomes = scatter_gather(&candidates, self.config.max_concurrency, |peer| {
            self.client
                .call_with(peer, NAMESPACE_FUNCTION, &[], &Kwargs::new(), &options)
                .and_then(|payload| payload.parse_record::<NamespaceMap>())
        });

        let mut report = SyncReport::default();
        for (peer, outcome) in candidates.into_iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|reason| {
                Err(MeshError::Transport {
                    address: peer.clone(),
                    reason: format!("namespace call panicked: {}", reason),
                })
            });
            match outcome {
                Ok(namespace) => {
                    self.peers
                        .record_success(&peer, namespace, now_unix_ms())?;
                    report.reached.push(peer);
                }
                Err(err) => {
                    debug!(peer = peer.as_str(), error = %err, "namespace sync call failed");
                    if self
                        .peers
                        .record_failure(&peer, self.config.max_consecutive_failures)?
                    {
                        warn!(peer = peer.as_str(), "peer evicted after consecutive failures");
                        report.evicted.push(peer.clone());
                    }
                    report.failed.push(peer);
                }
            }
        }

        let max_age_ms = i64::try_from(self.config.max_peer_age.as_millis()).unwrap_or(i64::MAX);
        let fresh = self.peers.fresh_entries(now_unix_ms(), max_age_ms);
        self.namespace.set_remote(&remote_names(&fresh))?;
        report.global_size = self.namespace.list(NamespaceScope::Global)?.len();
        info!(
            reached = report.reached.len(),
            failed = report.failed.len(),
            evicted = report.evicted.len(),
            global_size = report.global_size,
            "namespace sync finished"
        );
        Ok(report)
    }
}
