//! Mount table mapping key prefixes to drivers.
//!
//! Mount bases are normalized base keys (non-empty bases end with `:`; the
//! root is `""`). Resolution picks the longest base that is a prefix of the
//! key, so a mount at `cache:` shadows the root for `cache:*` keys and a
//! mount at `cache:hot:` shadows `cache:` in turn.

use std::collections::HashMap;
use std::sync::Arc;

use stowage_core::{normalize_base_key, StorageError, StorageResult};

use crate::driver::Driver;

/// A driver together with the base it is mounted at.
#[derive(Clone)]
pub struct MountPoint {
    pub base: String,
    pub driver: Arc<dyn Driver>,
}

impl std::fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountPoint")
            .field("base", &self.base)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Result of resolving a key against the table.
#[derive(Clone)]
pub struct ResolvedMount {
    /// Base of the mount that owns the key.
    pub base: String,
    /// Key with the mount base stripped; what the driver sees.
    pub relative_key: String,
    pub driver: Arc<dyn Driver>,
}

/// A mount overlapping a listing base, as returned by
/// [`MountRegistry::mounts_under`].
#[derive(Clone)]
pub struct MountMatch {
    pub base: String,
    /// Portion of the listing base below this mount, or `""` when the mount
    /// itself lies below the listing base.
    pub relative_base: String,
    pub driver: Arc<dyn Driver>,
}

/// Prefix-to-driver table, kept sorted longest base first.
#[derive(Default)]
pub struct MountRegistry {
    mounts: HashMap<String, Arc<dyn Driver>>,
    mountpoints: Vec<String>,
}

impl MountRegistry {
    /// Creates an empty table with no root driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `driver` at `base`.
    ///
    /// Mounting at the root replaces any existing root driver, which is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateMount`] when a non-root driver is
    /// already mounted at `base`.
    pub fn mount(&mut self, base: &str, driver: Arc<dyn Driver>) -> StorageResult<Option<Arc<dyn Driver>>> {
        let base = normalize_base_key(base);
        if base.is_empty() {
            let previous = self.mounts.insert(base.clone(), driver);
            if previous.is_none() {
                self.insert_mountpoint(base);
            }
            return Ok(previous);
        }
        if self.mounts.contains_key(&base) {
            return Err(StorageError::DuplicateMount { base });
        }
        self.mounts.insert(base.clone(), driver);
        self.insert_mountpoint(base);
        Ok(None)
    }

    /// Removes the mount at `base`, returning its driver.
    pub fn unmount(&mut self, base: &str) -> Option<Arc<dyn Driver>> {
        let base = normalize_base_key(base);
        let driver = self.mounts.remove(&base)?;
        self.mountpoints.retain(|mp| *mp != base);
        Some(driver)
    }

    /// Driver mounted exactly at `base`.
    #[must_use]
    pub fn get(&self, base: &str) -> Option<&Arc<dyn Driver>> {
        self.mounts.get(&normalize_base_key(base))
    }

    /// Resolves a normalized key to its owning mount.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoRootDriver`] when no mount base is a prefix
    /// of `key` and no root driver is mounted.
    pub fn resolve(&self, key: &str) -> StorageResult<ResolvedMount> {
        for base in &self.mountpoints {
            if !key.starts_with(base.as_str()) {
                continue;
            }
            if let Some(driver) = self.mounts.get(base) {
                return Ok(ResolvedMount {
                    base: base.clone(),
                    relative_key: key[base.len()..].to_string(),
                    driver: Arc::clone(driver),
                });
            }
        }
        Err(StorageError::NoRootDriver { key: key.to_string() })
    }

    /// Mounts that overlap the listing `base`: those below it, plus (when
    /// `include_parents` is set) those above it. Longest base first.
    #[must_use]
    pub fn mounts_under(&self, base: &str, include_parents: bool) -> Vec<MountMatch> {
        self.mountpoints
            .iter()
            .filter(|mp| mp.starts_with(base) || (include_parents && base.starts_with(mp.as_str())))
            .filter_map(|mp| {
                let driver = self.mounts.get(mp)?;
                let relative_base = base.get(mp.len()..).unwrap_or_default().to_string();
                Some(MountMatch {
                    base: mp.clone(),
                    relative_base,
                    driver: Arc::clone(driver),
                })
            })
            .collect()
    }

    /// Every mount, longest base first.
    #[must_use]
    pub fn entries(&self) -> Vec<MountPoint> {
        self.mountpoints
            .iter()
            .filter_map(|mp| {
                self.mounts.get(mp).map(|driver| MountPoint {
                    base: mp.clone(),
                    driver: Arc::clone(driver),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    fn insert_mountpoint(&mut self, base: String) {
        self.mountpoints.push(base);
        self.mountpoints.sort_by(|a, b| b.len().cmp(&a.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MemoryDriver, NullDriver};

    fn memory() -> Arc<dyn Driver> {
        Arc::new(MemoryDriver::new())
    }

    #[test]
    fn longest_prefix_wins() {
        let mut registry = MountRegistry::new();
        registry.mount("", memory()).unwrap();
        registry.mount("cache", memory()).unwrap();
        registry.mount("cache/hot", Arc::new(NullDriver)).unwrap();

        let resolved = registry.resolve("cache:hot:x").unwrap();
        assert_eq!(resolved.base, "cache:hot:");
        assert_eq!(resolved.relative_key, "x");
        assert_eq!(resolved.driver.name(), "null");

        let resolved = registry.resolve("cache:cold").unwrap();
        assert_eq!(resolved.base, "cache:");
        assert_eq!(resolved.relative_key, "cold");

        let resolved = registry.resolve("cachex").unwrap();
        assert_eq!(resolved.base, "");
        assert_eq!(resolved.relative_key, "cachex");
    }

    #[test]
    fn bare_mount_name_stays_on_root() {
        let mut registry = MountRegistry::new();
        registry.mount("", memory()).unwrap();
        registry.mount("cache", Arc::new(NullDriver)).unwrap();

        let resolved = registry.resolve("cache").unwrap();
        assert_eq!(resolved.base, "");
        assert_eq!(resolved.relative_key, "cache");
        assert_eq!(registry.resolve("cache:").unwrap().base, "cache:");
    }

    #[test]
    fn missing_root_is_an_error() {
        let mut registry = MountRegistry::new();
        registry.mount("data", memory()).unwrap();

        assert!(registry.resolve("data:x").is_ok());
        assert!(matches!(
            registry.resolve("other:x"),
            Err(StorageError::NoRootDriver { .. })
        ));
    }

    #[test]
    fn duplicate_mount_is_rejected_but_root_is_replaced() {
        let mut registry = MountRegistry::new();
        registry.mount("a", memory()).unwrap();
        assert!(matches!(
            registry.mount("a:", memory()),
            Err(StorageError::DuplicateMount { base }) if base == "a:"
        ));

        assert!(registry.mount("", memory()).unwrap().is_none());
        let replaced = registry.mount("", Arc::new(NullDriver)).unwrap();
        assert_eq!(replaced.unwrap().name(), "memory");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("z").unwrap().driver.name(), "null");
    }

    #[test]
    fn unmount_removes_from_resolution() {
        let mut registry = MountRegistry::new();
        registry.mount("", memory()).unwrap();
        registry.mount("a", Arc::new(NullDriver)).unwrap();

        assert!(registry.unmount("a").is_some());
        assert!(registry.unmount("a").is_none());
        assert_eq!(registry.resolve("a:x").unwrap().base, "");
    }

    #[test]
    fn mounts_under_reports_children_and_parents() {
        let mut registry = MountRegistry::new();
        registry.mount("", memory()).unwrap();
        registry.mount("a", memory()).unwrap();
        registry.mount("a:b", memory()).unwrap();
        registry.mount("c", memory()).unwrap();

        let children: Vec<_> = registry
            .mounts_under("a:", false)
            .into_iter()
            .map(|m| (m.base, m.relative_base))
            .collect();
        assert_eq!(
            children,
            vec![
                ("a:b:".to_string(), String::new()),
                ("a:".to_string(), String::new()),
            ]
        );

        let with_parents: Vec<_> = registry
            .mounts_under("a:b:x:", true)
            .into_iter()
            .map(|m| (m.base, m.relative_base))
            .collect();
        assert_eq!(
            with_parents,
            vec![
                ("a:b:".to_string(), "x:".to_string()),
                ("a:".to_string(), "b:x:".to_string()),
                (String::new(), "a:b:x:".to_string()),
            ]
        );
    }

    #[test]
    fn entries_are_longest_first() {
        let mut registry = MountRegistry::new();
        registry.mount("", memory()).unwrap();
        registry.mount("x", memory()).unwrap();
        registry.mount("x:y:z", memory()).unwrap();

        let bases: Vec<_> = registry.entries().into_iter().map(|m| m.base).collect();
        assert_eq!(bases, vec!["x:y:z:", "x:", ""]);
    }
}
