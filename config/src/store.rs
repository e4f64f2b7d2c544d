//! # Configuration Store
//!
//! Keyed cache of the latest successfully decoded configuration snapshots.
//!
//! The store is an ordinary value: construct it once in the composition root
//! and hand clones to the loader and to any component that wants to read
//! cached configuration. Clones share the same entries.

use crate::precedence::WorkingSet;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_yaml::Value;
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

struct StoreEntry {
    snapshot: Arc<dyn Any + Send + Sync>,
    raw: Value,
    sources: Vec<PathBuf>,
    skipped: Vec<PathBuf>,
    revision: u64,
}

/// Shared cache of decoded configuration, keyed by lowercased name.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Lets any part of the hosting process read the latest configuration for a
/// name without triggering a load.
///
/// ## Usage
/// ```rust
/// use layered_config::ConfigStore;
/// use std::sync::Arc;
///
/// let store = ConfigStore::new();
/// store.store("Billing", Arc::new(8080_u16), serde_yaml::Value::Null, Vec::new());
///
/// assert_eq!(store.load::<u16>("billing").as_deref(), Some(&8080));
/// assert!(store.load::<String>("billing").is_none());
/// ```
///
/// ## Concurrency
/// Every operation is internally synchronized. An entry is replaced as a
/// whole, so readers never observe a snapshot paired with another revision's
/// raw tree.
#[derive(Clone, Default)]
pub struct ConfigStore {
    entries: Arc<DashMap<String, StoreEntry>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("names", &self.names())
            .finish()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `name` and return its new revision.
    pub fn store<T>(&self, name: &str, snapshot: Arc<T>, raw: Value, sources: Vec<PathBuf>) -> u64
    where
        T: Send + Sync + 'static,
    {
        self.insert(
            name,
            StoreEntry {
                snapshot,
                raw,
                sources,
                skipped: Vec::new(),
                revision: 0,
            },
        )
    }

    /// Replace the entry for `name` with a snapshot decoded from `working`.
    ///
    /// Besides the merged tree and files, the overlays `working` skipped are
    /// remembered; reloads keep skipping them while they stay broken.
    pub fn store_merged<T>(&self, name: &str, snapshot: Arc<T>, working: WorkingSet) -> u64
    where
        T: Send + Sync + 'static,
    {
        self.insert(
            name,
            StoreEntry {
                snapshot,
                raw: working.value,
                sources: working.merged,
                skipped: working.skipped.into_iter().map(|s| s.path).collect(),
                revision: 0,
            },
        )
    }

    fn insert(&self, name: &str, mut entry: StoreEntry) -> u64 {
        match self.entries.entry(name.to_lowercase()) {
            Entry::Occupied(mut occupied) => {
                entry.revision = occupied.get().revision + 1;
                let revision = entry.revision;
                occupied.insert(entry);
                revision
            }
            Entry::Vacant(vacant) => {
                entry.revision = 1;
                vacant.insert(entry);
                1
            }
        }
    }

    /// Typed read. `None` if the name is unknown or was stored as another type.
    pub fn load<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.get(&name.to_lowercase())?;
        Arc::clone(&entry.snapshot).downcast::<T>().ok()
    }

    /// Merged YAML tree the snapshot was decoded from.
    pub fn load_value(&self, name: &str) -> Option<Value> {
        self.entries
            .get(&name.to_lowercase())
            .map(|entry| entry.raw.clone())
    }

    /// Files that were merged to produce the current entry.
    pub fn sources(&self, name: &str) -> Option<Vec<PathBuf>> {
        self.entries
            .get(&name.to_lowercase())
            .map(|entry| entry.sources.clone())
    }

    /// Broken overlays that were skipped when the current entry was produced.
    pub fn skipped(&self, name: &str) -> Option<Vec<PathBuf>> {
        self.entries
            .get(&name.to_lowercase())
            .map(|entry| entry.skipped.clone())
    }

    pub fn revision(&self, name: &str) -> Option<u64> {
        self.entries
            .get(&name.to_lowercase())
            .map(|entry| entry.revision)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Names with an entry, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Mutex serializing decode-and-store for `name`.
    ///
    /// Every reload of a name holds this lock for its whole cycle, so two
    /// watchers (or a watcher and a manual reload) never interleave.
    pub fn reload_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(name.to_lowercase()).or_default().value())
    }
}
