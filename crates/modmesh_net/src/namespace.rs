use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use modmesh_proto::{get_json, put_json, BlobStore, MeshError};
use serde::{Deserialize, Serialize};

pub const LOCAL_NAMESPACE_KEY: &str = "namespace/local";
pub const REMOTE_NAMESPACE_KEY: &str = "namespace/remote";
pub const GLOBAL_NAMESPACE_KEY: &str = "namespace/global";

pub type NamespaceMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceScope {
    Local,
    Global,
}

/// Name to `ip:port` mappings persisted in a blob store.
///
/// The local scope holds modules registered on this host. The global scope
/// is local plus peer-derived names; a peer entry never shadows a local
/// name. Every mutation rewrites the composed global snapshot so readers of
/// the store see a consistent view.
pub struct NamespaceStore {
    store: Arc<dyn BlobStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for NamespaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceStore").finish_non_exhaustive()
    }
}

impl NamespaceStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Maps `name` to `address`, replacing any previous mapping.
    pub fn register(&self, name: &str, address: &str) -> Result<(), MeshError> {
        validate_name(name)?;
        if address.trim().is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: format!("address for {} cannot be empty", name),
            });
        }
        let _guard = self.lock_writes();
        let mut local = self.read(LOCAL_NAMESPACE_KEY)?;
        local.insert(name.to_string(), address.to_string());
        self.write_local(&local)
    }

    pub fn deregister(&self, name: &str) -> Result<bool, MeshError> {
        let _guard = self.lock_writes();
        let mut local = self.read(LOCAL_NAMESPACE_KEY)?;
        if local.remove(name).is_none() {
            return Ok(false);
        }
        self.write_local(&local)?;
        Ok(true)
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<(), MeshError> {
        validate_name(new_name)?;
        let _guard = self.lock_writes();
        let mut local = self.read(LOCAL_NAMESPACE_KEY)?;
        let address = local.remove(old_name).ok_or_else(|| MeshError::NotFound {
            name: old_name.to_string(),
        })?;
        local.insert(new_name.to_string(), address);
        self.write_local(&local)
    }

    /// Replaces the peer-derived part of the global scope.
    pub fn set_remote(&self, remote: &NamespaceMap) -> Result<(), MeshError> {
        let _guard = self.lock_writes();
        put_json(self.store.as_ref(), REMOTE_NAMESPACE_KEY, remote)?;
        let local = self.read(LOCAL_NAMESPACE_KEY)?;
        put_json(
            self.store.as_ref(),
            GLOBAL_NAMESPACE_KEY,
            &compose(&local, remote),
        )
    }

    pub fn list(&self, scope: NamespaceScope) -> Result<NamespaceMap, MeshError> {
        let local = self.read(LOCAL_NAMESPACE_KEY)?;
        match scope {
            NamespaceScope::Local => Ok(local),
            NamespaceScope::Global => {
                let remote = self.read(REMOTE_NAMESPACE_KEY)?;
                Ok(compose(&local, &remote))
            }
        }
    }

    pub fn search(&self, scope: NamespaceScope, needle: &str) -> Result<NamespaceMap, MeshError> {
        let mut names = self.list(scope)?;
        names.retain(|name, _| name.contains(needle));
        Ok(names)
    }

    pub fn resolve(&self, name: &str) -> Result<String, MeshError> {
        self.resolve_in(NamespaceScope::Global, name)
    }

    /// Literal addresses pass through. Otherwise an exact name wins, then a
    /// unique prefix match; several prefix matches are an error listing
    /// every candidate.
    pub fn resolve_in(&self, scope: NamespaceScope, name: &str) -> Result<String, MeshError> {
        if is_address_literal(name) {
            return Ok(name.to_string());
        }
        let names = self.list(scope)?;
        if let Some(address) = names.get(name) {
            return Ok(address.clone());
        }
        let candidates: Vec<(&String, &String)> = names
            .iter()
            .filter(|(candidate, _)| candidate.starts_with(name))
            .collect();
        match candidates.as_slice() {
            [] => Err(MeshError::NotFound {
                name: name.to_string(),
            }),
            [(_, address)] => Ok((*address).clone()),
            many => Err(MeshError::AmbiguousName {
                name: name.to_string(),
                candidates: many.iter().map(|(candidate, _)| (*candidate).clone()).collect(),
            }),
        }
    }

    fn read(&self, key: &str) -> Result<NamespaceMap, MeshError> {
        Ok(get_json::<NamespaceMap>(self.store.as_ref(), key)?.unwrap_or_default())
    }

    fn write_local(&self, local: &NamespaceMap) -> Result<(), MeshError> {
        put_json(self.store.as_ref(), LOCAL_NAMESPACE_KEY, local)?;
        let remote = self.read(REMOTE_NAMESPACE_KEY)?;
        put_json(
            self.store.as_ref(),
            GLOBAL_NAMESPACE_KEY,
            &compose(local, &remote),
        )
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn compose(local: &NamespaceMap, remote: &NamespaceMap) -> NamespaceMap {
    let mut global = local.clone();
    for (name, address) in remote {
        global
            .entry(name.clone())
            .or_insert_with(|| address.clone());
    }
    global
}

fn validate_name(name: &str) -> Result<(), MeshError> {
    if name.trim().is_empty() {
        return Err(MeshError::InvalidConfig {
            reason: "module name cannot be empty".to_string(),
        });
    }
    if is_address_literal(name) {
        return Err(MeshError::InvalidConfig {
            reason: format!("module name {} looks like an address", name),
        });
    }
    Ok(())
}

/// `ip:port`, `[v6]:port` or `localhost:port`.
pub fn is_address_literal(value: &str) -> bool {
    if value.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match value.rsplit_once(':') {
        Some(("localhost", port)) => port.parse::<u16>().is_ok(),
        _ => false,
    }
}
