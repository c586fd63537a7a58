//! Per-peripheral authorization flags
//!
//! A peripheral marks this controller as authorized by sending `Auth`; the
//! flag is remembered per hardware address and survives restarts. There is
//! no revoke message, so the store only ever sets flags to `true`.

use crate::error::StoreError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Durable boolean key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Value for `key`, `false` when absent.
    fn get(&self, key: &str) -> Result<bool, StoreError>;

    /// Persist `value` for `key` before returning.
    fn set(&self, key: &str, value: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthorizationFile {
    #[serde(default)]
    authorized: BTreeMap<String, bool>,
}

/// JSON file backend, written atomically through a temporary file.
///
/// Several processes may share one file. Every `set` re-reads the file under
/// an exclusive lock on `<path>.lock` and merges before writing back, and
/// every `get` re-reads it, so entries written elsewhere are never lost and
/// become visible without reopening.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, bool>>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = read_entries(&path)?;

        info!(
            "Loaded {} authorization entries from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, bool>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_parent(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Advisory lock shared by every store on this path; released when dropped.
    fn file_lock(&self, exclusive: bool) -> Result<File, StoreError> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.path.with_extension("json.lock"))?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(file)
    }

    fn persist(&self, entries: &BTreeMap<String, bool>) -> Result<(), StoreError> {
        let file = AuthorizationFile {
            authorized: entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut out = File::create(&tmp)?;
        out.write_all(json.as_bytes())?;
        out.sync_all()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, bool>, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str::<AuthorizationFile>(&contents)?.authorized),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No authorization file at {}, starting empty", path.display());
            Ok(BTreeMap::new())
        }
        Err(e) => Err(e.into()),
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        let _file_lock = self.file_lock(false)?;
        *entries = read_entries(&self.path)?;
        Ok(entries.get(key).copied().unwrap_or(false))
    }

    fn set(&self, key: &str, value: bool) -> Result<(), StoreError> {
        // Both locks are held across read-merge-write so writers in this and
        // other processes land one after another
        let mut entries = self.lock();
        let _file_lock = self.file_lock(true)?;
        let mut merged = read_entries(&self.path)?;
        merged.insert(key.to_string(), value);
        self.persist(&merged)?;
        *entries = merged;
        Ok(())
    }
}

/// Volatile backend for callers that do not need durability.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<bool, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).copied().unwrap_or(false))
    }

    fn set(&self, key: &str, value: bool) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Authorization flags keyed by device address.
///
/// Cloning shares the same backend.
#[derive(Clone)]
pub struct AuthorizationStore {
    backend: Arc<dyn KeyValueStore>,
}

impl AuthorizationStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// `false` for addresses never seen, and when the backend cannot be read.
    pub fn is_authorized(&self, address: &str) -> bool {
        match self.backend.get(address) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not read authorization for {}: {}", address, e);
                false
            }
        }
    }

    /// Mark `address` as authorized.
    pub fn set_authorized(&self, address: &str) -> Result<(), StoreError> {
        self.backend.set(address, true)?;
        info!("Authorized {}", address);
        Ok(())
    }
}
