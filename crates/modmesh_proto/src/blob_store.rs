use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::mesh_error::MeshError;

const BLOB_EXTENSION: &str = "blob";

/// Durable get/put of named blobs. Keys are `/`-separated relative paths.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError>;
    fn remove(&self, key: &str) -> Result<bool, MeshError>;
    fn keys(&self, prefix: &str) -> Result<Vec<String>, MeshError>;
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn BlobStore,
    key: &str,
) -> Result<Option<T>, MeshError> {
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| MeshError::Storage {
            key: key.to_string(),
            reason: format!("parse failed: {}", err),
        })
}

pub fn put_json<T: Serialize>(store: &dyn BlobStore, key: &str, value: &T) -> Result<(), MeshError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| MeshError::Storage {
        key: key.to_string(),
        reason: format!("serialize failed: {}", err),
    })?;
    store.put(key, &bytes)
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStore for InMemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.lock().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError> {
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, MeshError> {
        Ok(self.lock().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, MeshError> {
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key under `root`, written through a temp file and renamed
/// into place so a crash never leaves a torn blob.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, MeshError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.{BLOB_EXTENSION}")))
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), MeshError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(storage_error(dir, "list", err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| storage_error(dir, "list", err))?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Ok(relative) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf)
            else {
                continue;
            };
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        let path = self.blob_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_error(&path, "read", err)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| storage_error(parent, "create dir", err))?;
        }
        let temp_path = path.with_extension(format!("{BLOB_EXTENSION}.tmp"));
        fs::write(&temp_path, bytes).map_err(|err| storage_error(&temp_path, "write temp", err))?;
        fs::rename(&temp_path, &path).map_err(|err| storage_error(&path, "rename temp", err))
    }

    fn remove(&self, key: &str) -> Result<bool, MeshError> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(storage_error(&path, "remove", err)),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, MeshError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn storage_error(path: &Path, action: &str, err: std::io::Error) -> MeshError {
    MeshError::Storage {
        key: path.display().to_string(),
        reason: format!("{} failed: {}", action, err),
    }
}

fn validate_key(key: &str) -> Result<(), MeshError> {
    let invalid = |reason: &str| MeshError::Storage {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("key cannot be empty"));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(invalid("key must be a relative path"));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(invalid("key has an empty or dot segment"));
    }
    if !key
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '-' | '.' | '@'))
    {
        return Err(invalid("key has characters outside [A-Za-z0-9/_-.@]"));
    }
    Ok(())
}
