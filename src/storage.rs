use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::QuizKeepError;

/// A synchronous string key/value store. Implementations may fail (quota,
/// disabled storage, I/O); `TieredStorage` is what absorbs those failures.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> crate::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> crate::Result<()>;
    fn remove(&self, key: &str) -> crate::Result<()>;
    fn keys(&self) -> crate::Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    /// Survives restarts of the owning process.
    Persistent,
    /// Lives only as long as the owning process.
    Session,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Persistent => write!(f, "persistent"),
            StorageTier::Session => write!(f, "session"),
        }
    }
}

/// In-process map. Clones share the same contents, so a test can keep a
/// handle and look at what the services wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<String, String>>>,
    quota_bytes: Option<usize>,
    disabled: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes that would push the total of key and value bytes past `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// While disabled every operation fails, like storage blocked by the host.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_enabled(&self) -> crate::Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(QuizKeepError::StorageUnavailable(
                "storage is disabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        self.check_enabled()?;
        let guard = self
            .entries
            .read()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        self.check_enabled()?;
        let mut guard = self
            .entries
            .write()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        if let Some(quota) = self.quota_bytes {
            let used: usize = guard
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(QuizKeepError::StorageUnavailable(format!(
                    "quota of {} bytes exceeded",
                    quota
                )));
            }
        }
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> crate::Result<()> {
        self.check_enabled()?;
        let mut guard = self
            .entries
            .write()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        guard.remove(key);
        Ok(())
    }

    fn keys(&self) -> crate::Result<Vec<String>> {
        self.check_enabled()?;
        let guard = self
            .entries
            .read()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        Ok(guard.keys().cloned().collect())
    }
}

/// A JSON object on disk holding every key. Each mutation rewrites the file
/// through a temp file and a rename.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();

        if path.exists() {
            let data = fs::read_to_string(&path)?;
            match serde_json::from_str::<BTreeMap<String, String>>(&data) {
                Ok(loaded) => entries = loaded,
                Err(e) => {
                    // Unreadable file: start empty, the next write replaces it.
                    warn!("discarding unreadable storage file {}: {}", path.display(), e);
                }
            }
        }

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(entries)?;
        atomic_write(&self.path, data.as_bytes())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        let guard = self
            .entries
            .read()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        let mut guard = self
            .entries
            .write()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        let previous = guard.insert(key.to_string(), value.to_string());
        if let Err(e) = self.save(&guard) {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => guard.insert(key.to_string(), old),
                None => guard.remove(key),
            };
            return Err(QuizKeepError::StorageUnavailable(e.to_string()));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> crate::Result<()> {
        let mut guard = self
            .entries
            .write()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        if guard.remove(key).is_some() {
            self.save(&guard)
                .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    fn keys(&self) -> crate::Result<Vec<String>> {
        let guard = self
            .entries
            .read()
            .map_err(|e| QuizKeepError::StorageUnavailable(e.to_string()))?;
        Ok(guard.keys().cloned().collect())
    }
}

// Write to a sibling temp file and rename it over the target.
fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    use rand::{thread_rng, Rng};

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let suffix: u64 = thread_rng().gen();
    let tmp = parent.join(format!(".quizkeep.{}.tmp", suffix));

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Ordered list of storage tiers. Writes go to every tier in order, reads
/// return the first tier that has the key, removes hit every tier. Backend
/// failures are logged and never returned to the caller.
#[derive(Clone)]
pub struct TieredStorage {
    tiers: Vec<(StorageTier, Arc<dyn StorageBackend>)>,
}

impl TieredStorage {
    pub fn new(tiers: Vec<(StorageTier, Arc<dyn StorageBackend>)>) -> Self {
        Self { tiers }
    }

    /// Persistent tier first, session tier as the fallback.
    pub fn with_backends(
        persistent: Arc<dyn StorageBackend>,
        session: Arc<dyn StorageBackend>,
    ) -> Self {
        Self::new(vec![
            (StorageTier::Persistent, persistent),
            (StorageTier::Session, session),
        ])
    }

    /// Both tiers in memory.
    pub fn in_memory() -> Self {
        Self::with_backends(Arc::new(MemoryBackend::new()), Arc::new(MemoryBackend::new()))
    }

    /// A file-backed persistent tier plus an in-memory session tier.
    pub fn with_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let persistent = FileBackend::open(path)?;
        Ok(Self::with_backends(
            Arc::new(persistent),
            Arc::new(MemoryBackend::new()),
        ))
    }

    pub fn tiers(&self) -> impl Iterator<Item = StorageTier> + '_ {
        self.tiers.iter().map(|(tier, _)| *tier)
    }

    /// Returns whether at least one tier accepted the write.
    pub fn set(&self, key: &str, value: &str) -> bool {
        let mut written = false;
        for (tier, backend) in &self.tiers {
            match backend.set(key, value) {
                Ok(()) => written = true,
                Err(e) => warn!("failed to write {} to {} storage: {}", key, tier, e),
            }
        }
        if written {
            debug!("stored {} ({} bytes)", key, value.len());
        }
        written
    }

    pub fn get(&self, key: &str) -> Option<String> {
        for (tier, backend) in &self.tiers {
            match backend.get(key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => warn!("failed to read {} from {} storage: {}", key, tier, e),
            }
        }
        None
    }

    pub fn remove(&self, key: &str) {
        for (tier, backend) in &self.tiers {
            if let Err(e) = backend.remove(key) {
                warn!("failed to remove {} from {} storage: {}", key, tier, e);
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sorted union of matching keys across tiers.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for (tier, backend) in &self.tiers {
            match backend.keys() {
                Ok(found) => keys.extend(found.into_iter().filter(|k| k.starts_with(prefix))),
                Err(e) => warn!("failed to list {} storage: {}", tier, e),
            }
        }
        keys.into_iter().collect()
    }
}

impl std::fmt::Debug for TieredStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStorage")
            .field("tiers", &self.tiers().collect::<Vec<_>>())
            .finish()
    }
}
