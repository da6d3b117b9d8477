//! The [`Storage`] façade.
//!
//! One logical key space over any number of mounted drivers. Every call
//! normalizes its key, resolves the owning mount, encodes or decodes values
//! with the core codec, and dispatches to the driver using the key relative
//! to the mount. Writes to drivers without native watch support produce
//! synthetic change events.
//!
//! Operations are split by concern:
//! - `items`: single-key reads and writes
//! - `batch`: multi-key reads and writes grouped by mount
//! - `keys`: listing and clearing across mounts
//! - `meta`: per-key metadata
//! - `sync`: blocking twins of the single-key operations
//! - `prefix`: [`PrefixStorage`] views
//! - `snapshot`: export and import of a subtree

mod batch;
mod items;
mod keys;
mod meta;
mod prefix;
mod snapshot;
mod sync;

use std::sync::Arc;

use parking_lot::RwLock;
use stowage_core::codec;
use stowage_core::{normalize_key, StorageError, StorageResult, Value};
use tracing::{debug, warn};

pub use self::prefix::PrefixStorage;
pub use self::snapshot::{restore_snapshot, snapshot};
use crate::driver::{Capability, Driver, WatchEvent};
use crate::drivers::MemoryDriver;
use crate::mount::{MountPoint, MountRegistry, ResolvedMount};
use crate::watch::{WatchHandle, WatchHub};

struct StorageInner {
    registry: RwLock<MountRegistry>,
    hub: Arc<WatchHub>,
}

/// Handle to a storage instance. Cheap to clone; clones share mounts and
/// watchers.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bases: Vec<String> = self
            .inner
            .registry
            .read()
            .entries()
            .into_iter()
            .map(|m| m.base)
            .collect();
        f.debug_struct("Storage").field("mounts", &bases).finish()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Storage {
    /// Creates a storage with `root` serving every key not under another
    /// mount.
    #[must_use]
    pub fn new(root: Arc<dyn Driver>) -> Self {
        let mut registry = MountRegistry::new();
        // The root base never collides, so mounting it cannot fail.
        let _ = registry.mount("", root);
        Self::from_registry(registry)
    }

    /// Creates a storage backed by a fresh [`MemoryDriver`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDriver::new()))
    }

    /// Creates a storage with no mounts at all. Operations on keys outside
    /// later mounts fail with [`StorageError::NoRootDriver`].
    #[must_use]
    pub fn without_root() -> Self {
        Self::from_registry(MountRegistry::new())
    }

    /// Starts a [`StorageBuilder`](crate::StorageBuilder).
    #[must_use]
    pub fn builder() -> crate::StorageBuilder {
        crate::StorageBuilder::new()
    }

    pub(crate) fn from_registry(registry: MountRegistry) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                registry: RwLock::new(registry),
                hub: Arc::new(WatchHub::new()),
            }),
        }
    }

    /// Mounts `driver` at `base`. Mounting at `""` replaces the root driver.
    ///
    /// When watching is active, the new driver's native events are
    /// subscribed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateMount`] if a non-root driver is
    /// already mounted at `base`, or the driver's error when starting its
    /// watch fails.
    pub fn mount(&self, base: &str, driver: Arc<dyn Driver>) -> StorageResult<()> {
        let base = stowage_core::normalize_base_key(base);
        let mut registry = self.inner.registry.write();
        let replaced = registry.mount(&base, Arc::clone(&driver))?;
        if replaced.is_some() {
            self.inner.hub.detach(&base);
        }
        debug!(base = %base, driver = driver.name(), "mounted driver");
        self.inner.hub.attach(&base, &driver)
    }

    /// Unmounts the driver at `base`, optionally disposing it.
    ///
    /// Unmounting the root is allowed; keys outside other mounts then fail
    /// with [`StorageError::NoRootDriver`]. Unmounting a base with no driver
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates the driver's `dispose` failure.
    pub async fn unmount(&self, base: &str, dispose: bool) -> StorageResult<()> {
        let base = stowage_core::normalize_base_key(base);
        let removed = {
            let mut registry = self.inner.registry.write();
            let removed = registry.unmount(&base);
            if removed.is_some() {
                self.inner.hub.detach(&base);
            }
            removed
        };
        let Some(driver) = removed else {
            return Ok(());
        };
        debug!(base = %base, driver = driver.name(), "unmounted driver");
        if dispose && driver.capabilities().contains(Capability::Dispose) {
            driver.dispose().await?;
        }
        Ok(())
    }

    /// Mount that owns `key`. A key naming a mount base (`"cache"` for a
    /// mount at `"cache:"`) resolves to that mount.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoRootDriver`] when no mount covers `key`.
    pub fn get_mount(&self, key: &str) -> StorageResult<MountPoint> {
        let as_base = format!("{}:", normalize_key(key));
        let resolved = self.inner.registry.read().resolve(&as_base)?;
        Ok(MountPoint {
            base: resolved.base,
            driver: resolved.driver,
        })
    }

    /// Mounts overlapping `base`: those nested below it and, when
    /// `include_parents` is set, those above it. Longest base first.
    #[must_use]
    pub fn get_mounts(&self, base: &str, include_parents: bool) -> Vec<MountPoint> {
        let base = stowage_core::normalize_base_key(base);
        self.inner
            .registry
            .read()
            .mounts_under(&base, include_parents)
            .into_iter()
            .map(|m| MountPoint {
                base: m.base,
                driver: m.driver,
            })
            .collect()
    }

    /// Registers a change listener for every mount.
    ///
    /// The first listener subscribes to each watch-capable driver. Dropping
    /// the handle keeps the listener; call [`WatchHandle::unwatch`] to
    /// remove it.
    ///
    /// # Errors
    ///
    /// Propagates a driver's failure to start its native watch.
    pub fn watch<F>(&self, callback: F) -> StorageResult<WatchHandle>
    where
        F: Fn(WatchEvent, &str) + Send + Sync + 'static,
    {
        let registry = self.inner.registry.read();
        let id = self.inner.hub.subscribe(Arc::new(callback), &registry.entries())?;
        Ok(WatchHandle::new(id, &self.inner.hub))
    }

    /// Removes every listener and native subscription.
    pub fn unwatch(&self) {
        self.inner.hub.stop();
    }

    /// Stops watching and disposes every mounted driver that supports it.
    /// Mounts stay registered.
    ///
    /// # Errors
    ///
    /// Every driver is disposed even if one fails; the first failure is
    /// returned.
    pub async fn dispose(&self) -> StorageResult<()> {
        self.unwatch();
        let mounts = self.inner.registry.read().entries();
        let mut first = None;
        for mount in mounts {
            if !mount.driver.capabilities().contains(Capability::Dispose) {
                continue;
            }
            if let Err(err) = mount.driver.dispose().await {
                warn!(base = %mount.base, error = %err, "driver dispose failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Flushes buffered writes of every driver overlapping `base`.
    ///
    /// # Errors
    ///
    /// Propagates the first driver flush failure.
    pub async fn flush(&self, base: &str) -> StorageResult<()> {
        for mount in self.get_mounts(base, true) {
            if mount.driver.capabilities().contains(Capability::Flush) {
                mount.driver.flush().await?;
            }
        }
        Ok(())
    }

    /// Blocking [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncUnsupported`] if a driver buffers writes
    /// but cannot flush them synchronously.
    pub fn flush_sync(&self, base: &str) -> StorageResult<()> {
        for mount in self.get_mounts(base, true) {
            let caps = mount.driver.capabilities();
            if caps.contains(Capability::FlushSync) {
                mount.driver.flush_sync()?;
            } else if caps.contains(Capability::Flush) {
                return Err(StorageError::sync_unsupported(mount.driver.name(), "flush"));
            }
        }
        Ok(())
    }

    /// Normalizes `key` and resolves its mount.
    pub(crate) fn resolve(&self, key: &str) -> StorageResult<(String, ResolvedMount)> {
        let key = normalize_key(key);
        let resolved = self.inner.registry.read().resolve(&key)?;
        Ok((key, resolved))
    }

    pub(crate) fn registry(&self) -> parking_lot::RwLockReadGuard<'_, MountRegistry> {
        self.inner.registry.read()
    }

    /// Emits a synthetic event unless `driver` reports changes itself.
    pub(crate) fn notify(&self, driver: &dyn Driver, event: WatchEvent, key: &str) {
        if !driver.capabilities().contains(Capability::Watch) {
            self.inner.hub.emit(event, key);
        }
    }
}

pub(crate) fn encode(key: &str, value: &Value) -> StorageResult<String> {
    codec::stringify(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decodes a stored string. Undecodable data reads as absent.
pub(crate) fn decode(key: &str, text: &str) -> Option<Value> {
    match codec::parse(text) {
        Ok(Value::Undefined) => None,
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "stored value could not be decoded");
            None
        }
    }
}
