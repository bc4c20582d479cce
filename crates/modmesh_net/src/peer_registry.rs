use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use modmesh_proto::{get_json, put_json, BlobStore, MeshError};
use serde::{Deserialize, Serialize};

use crate::namespace::{is_address_literal, NamespaceMap};

pub const PEER_REGISTRY_KEY: &str = "peers/registry";
const PEER_TAG_BYTES: usize = 4;
const WILDCARD_HOSTS: [&str; 3] = ["0.0.0.0", "::", "[::]"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub address: String,
    #[serde(default)]
    pub namespace: NamespaceMap,
    #[serde(default)]
    pub last_sync_ms: Option<i64>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl PeerEntry {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            namespace: NamespaceMap::new(),
            last_sync_ms: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_fresh(&self, now_ms: i64, max_age_ms: i64) -> bool {
        self.last_sync_ms
            .is_some_and(|last| now_ms.saturating_sub(last) <= max_age_ms)
    }
}

/// Known peers and the last namespace each one answered with.
pub struct PeerRegistry {
    store: Arc<dyn BlobStore>,
    entries: Mutex<BTreeMap<String, PeerEntry>>,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.lock_entries().len())
            .finish_non_exhaustive()
    }
}

impl PeerRegistry {
    /// Restores the registry persisted under `peers/registry`, if any.
    pub fn load(store: Arc<dyn BlobStore>) -> Result<Self, MeshError> {
        let entries = get_json::<Vec<PeerEntry>>(store.as_ref(), PEER_REGISTRY_KEY)?
            .unwrap_or_default()
            .into_iter()
            .map(|entry| (entry.address.clone(), entry))
            .collect();
        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    pub fn add_peer(&self, address: &str) -> Result<bool, MeshError> {
        self.add_peers(std::iter::once(address)).map(|added| added == 1)
    }

    pub fn add_peers<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, MeshError> {
        let addresses: Vec<&str> = addresses.into_iter().collect();
        for address in &addresses {
            validate_peer_address(address)?;
        }
        let mut entries = self.lock_entries();
        let mut added = 0;
        for address in addresses {
            if !entries.contains_key(address) {
                entries.insert(address.to_string(), PeerEntry::new(address));
                added += 1;
            }
        }
        if added > 0 {
            self.persist(&entries)?;
        }
        Ok(added)
    }

    pub fn remove_peer(&self, address: &str) -> Result<bool, MeshError> {
        let mut entries = self.lock_entries();
        if entries.remove(address).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    pub fn reset_peers(&self) -> Result<(), MeshError> {
        let mut entries = self.lock_entries();
        entries.clear();
        self.persist(&entries)
    }

    pub fn peers(&self) -> Vec<PeerEntry> {
        self.lock_entries().values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock_entries().keys().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Option<PeerEntry> {
        self.lock_entries().get(address).cloned()
    }

    /// Stores the namespace a peer answered with, with wildcard hosts
    /// replaced by the peer's own host, and clears its failure count.
    pub fn record_success(
        &self,
        address: &str,
        namespace: NamespaceMap,
        now_ms: i64,
    ) -> Result<(), MeshError> {
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(address.to_string())
            .or_insert_with(|| PeerEntry::new(address));
        entry.namespace = rewrite_wildcard_hosts(&namespace, address);
        entry.last_sync_ms = Some(now_ms);
        entry.consecutive_failures = 0;
        self.persist(&entries)
    }

    /// Bumps the failure count without touching the last sync time.
    /// Returns true when the peer crossed `max_consecutive_failures` and
    /// was evicted.
    pub fn record_failure(
        &self,
        address: &str,
        max_consecutive_failures: u32,
    ) -> Result<bool, MeshError> {
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(address.to_string())
            .or_insert_with(|| PeerEntry::new(address));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let evicted = entry.consecutive_failures >= max_consecutive_failures;
        if evicted {
            entries.remove(address);
        }
        self.persist(&entries)?;
        Ok(evicted)
    }

    pub fn fresh_entries(&self, now_ms: i64, max_age_ms: i64) -> Vec<PeerEntry> {
        self.lock_entries()
            .values()
            .filter(|entry| entry.is_fresh(now_ms, max_age_ms))
            .cloned()
            .collect()
    }

    fn persist(&self, entries: &BTreeMap<String, PeerEntry>) -> Result<(), MeshError> {
        let snapshot: Vec<&PeerEntry> = entries.values().collect();
        put_json(self.store.as_ref(), PEER_REGISTRY_KEY, &snapshot)
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<String, PeerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Short stable tag for a peer: hex of the first 4 bytes of
/// `blake3(peer_address)`.
pub fn peer_tag(peer_address: &str) -> String {
    let digest = blake3::hash(peer_address.as_bytes());
    hex::encode(&digest.as_bytes()[..PEER_TAG_BYTES])
}

/// Peer-derived names suffixed `name::<peer_tag>`.
pub fn remote_names(entries: &[PeerEntry]) -> NamespaceMap {
    let mut remote = NamespaceMap::new();
    for entry in entries {
        let tag = peer_tag(&entry.address);
        for (name, address) in &entry.namespace {
            remote.insert(format!("{name}::{tag}"), address.clone());
        }
    }
    remote
}

pub fn rewrite_wildcard_hosts(namespace: &NamespaceMap, peer_address: &str) -> NamespaceMap {
    let Some((peer_host, _)) = split_host_port(peer_address) else {
        return namespace.clone();
    };
    namespace
        .iter()
        .map(|(name, address)| {
            let rewritten = match split_host_port(address) {
                Some((host, port)) if WILDCARD_HOSTS.contains(&host) => {
                    format!("{peer_host}:{port}")
                }
                _ => address.clone(),
            };
            (name.clone(), rewritten)
        })
        .collect()
}

fn split_host_port(address: &str) -> Option<(&str, &str)> {
    let (host, port) = address.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    Some((host, port))
}

fn validate_peer_address(address: &str) -> Result<(), MeshError> {
    if is_address_literal(address) || split_host_port(address).is_some() {
        return Ok(());
    }
    Err(MeshError::InvalidConfig {
        reason: format!("peer address {} must be host:port", address),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modmesh_proto::InMemoryBlobStore;

    fn namespace(pairs: &[(&str, &str)]) -> NamespaceMap {
        pairs
            .iter()
            .map(|(name, address)| (name.to_string(), address.to_string()))
            .collect()
    }

    fn registry() -> (Arc<InMemoryBlobStore>, PeerRegistry) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let registry = PeerRegistry::load(blobs.clone()).expect("load");
        (blobs, registry)
    }

    #[test]
    fn wildcard_hosts_take_the_peer_host() {
        let rewritten = rewrite_wildcard_hosts(
            &namespace(&[
                ("a", "0.0.0.0:8001"),
                ("b", "[::]:8002"),
                ("c", "10.1.1.1:8003"),
            ]),
            "192.168.0.7:9000",
        );
        assert_eq!(rewritten["a"], "192.168.0.7:8001");
        assert_eq!(rewritten["b"], "192.168.0.7:8002");
        assert_eq!(rewritten["c"], "10.1.1.1:8003");
    }

    #[test]
    fn failures_evict_after_threshold_without_refreshing_timestamp() {
        let (_, registry) = registry();
        registry
            .record_success("10.0.0.1:1", namespace(&[("m", "10.0.0.1:2")]), 1_000)
            .expect("success");
        assert!(!registry.record_failure("10.0.0.1:1", 3).expect("failure"));
        assert!(!registry.record_failure("10.0.0.1:1", 3).expect("failure"));
        let entry = registry.get("10.0.0.1:1").expect("entry");
        assert_eq!(entry.last_sync_ms, Some(1_000));
        assert_eq!(entry.consecutive_failures, 2);
        assert!(registry.record_failure("10.0.0.1:1", 3).expect("evict"));
        assert!(registry.get("10.0.0.1:1").is_none());
    }

    #[test]
    fn success_resets_failure_count() {
        let (_, registry) = registry();
        registry.record_failure("10.0.0.1:1", 5).expect("failure");
        registry
            .record_success("10.0.0.1:1", NamespaceMap::new(), 5)
            .expect("success");
        assert_eq!(
            registry.get("10.0.0.1:1").expect("entry").consecutive_failures,
            0
        );
    }

    #[test]
    fn stale_entries_are_not_fresh() {
        let (_, registry) = registry();
        registry
            .record_success("10.0.0.1:1", NamespaceMap::new(), 1_000)
            .expect("success");
        registry.add_peer("10.0.0.2:1").expect("add");
        assert_eq!(registry.fresh_entries(1_500, 1_000).len(), 1);
        assert!(registry.fresh_entries(5_000, 1_000).is_empty());
    }

    #[test]
    fn remote_names_are_suffixed_with_peer_tag() {
        let entry = PeerEntry {
            address: "10.0.0.1:1".to_string(),
            namespace: namespace(&[("model", "10.0.0.1:2")]),
            last_sync_ms: Some(1),
            consecutive_failures: 0,
        };
        let tag = peer_tag("10.0.0.1:1");
        assert_eq!(tag.len(), PEER_TAG_BYTES * 2);
        let remote = remote_names(&[entry]);
        assert_eq!(remote[&format!("model::{tag}")], "10.0.0.1:2");
    }

    #[test]
    fn registry_persists_and_reloads() {
        let (blobs, registry) = registry();
        assert_eq!(
            registry
                .add_peers(["10.0.0.1:1", "10.0.0.2:1", "10.0.0.1:1"])
                .expect("add"),
            2
        );
        assert!(registry.remove_peer("10.0.0.2:1").expect("remove"));
        let reloaded = PeerRegistry::load(blobs.clone()).expect("reload");
        assert_eq!(reloaded.addresses(), vec!["10.0.0.1:1".to_string()]);
        reloaded.reset_peers().expect("reset");
        assert!(reloaded.peers().is_empty());
        assert!(registry.add_peer("not an address").is_err());
    }
}
