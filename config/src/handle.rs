//! # Configuration Handle
//!
//! The caller-owned target a configuration is decoded into.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Shared<T> {
    current: RwLock<Arc<T>>,
    revision: AtomicU64,
}

/// Shared, atomically swapped configuration snapshot.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Created by the caller before a load and kept for the life of the process.
/// The loader swaps a freshly decoded snapshot in on every successful load or
/// reload; a failed reload leaves the previous snapshot in place.
///
/// ## Usage
/// ```rust
/// use layered_config::ConfigHandle;
///
/// let handle = ConfigHandle::new(8080_u16);
/// let reader = handle.clone();
///
/// assert_eq!(*reader.get(), 8080);
/// assert_eq!(reader.revision(), 0);
/// ```
///
/// ## Concurrency
/// Readers get an `Arc<T>` and keep it as long as they like; a concurrent
/// reload never mutates a snapshot that has been handed out.
pub struct ConfigHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Default> Default for ConfigHandle<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("current", &self.get())
            .field("revision", &self.revision())
            .finish()
    }
}

impl<T> ConfigHandle<T> {
    pub fn new(initial: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(Arc::new(initial)),
                revision: AtomicU64::new(0),
            }),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.shared.current.read())
    }

    /// Number of successful loads and reloads applied to this handle.
    pub fn revision(&self) -> u64 {
        self.shared.revision.load(Ordering::Acquire)
    }

    /// Whether both handles share the same target.
    pub fn same_target(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn replace(&self, snapshot: Arc<T>) -> u64 {
        let mut current = self.shared.current.write();
        *current = snapshot;
        self.shared.revision.fetch_add(1, Ordering::AcqRel) + 1
    }
}
