//! Builder for fully-wired [`Storage`] instances.
//!
//! [`StorageBuilder`] is the construction point that assembles the root
//! driver, any additional mounts, and an optional [`Migrator`] to run once
//! the mounts are in place.

use std::sync::Arc;

use stowage_core::{normalize_base_key, StorageResult};
use tracing::debug;

use crate::driver::Driver;
use crate::drivers::MemoryDriver;
use crate::migration::{MigrationReport, Migrator};
use crate::mount::MountRegistry;
use crate::storage::Storage;

enum Root {
    Memory,
    Driver(Arc<dyn Driver>),
    None,
}

/// Assembles a [`Storage`] from a root driver and mounts.
///
/// The root defaults to a fresh [`MemoryDriver`].
pub struct StorageBuilder {
    root: Root,
    mounts: Vec<(String, Arc<dyn Driver>)>,
    migrator: Option<Migrator>,
}

impl std::fmt::Debug for StorageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = match &self.root {
            Root::Memory => "memory",
            Root::Driver(driver) => driver.name(),
            Root::None => "none",
        };
        f.debug_struct("StorageBuilder")
            .field("root", &root)
            .field("mounts", &self.mounts.iter().map(|(base, _)| base).collect::<Vec<_>>())
            .field("migrator", &self.migrator)
            .finish()
    }
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Root::Memory,
            mounts: Vec::new(),
            migrator: None,
        }
    }

    /// Serves unmounted keys from `driver`.
    #[must_use]
    pub fn root(mut self, driver: Arc<dyn Driver>) -> Self {
        self.root = Root::Driver(driver);
        self
    }

    /// Leaves the root unmounted: keys outside every mount fail with
    /// [`StorageError::NoRootDriver`](stowage_core::StorageError::NoRootDriver).
    #[must_use]
    pub fn without_root(mut self) -> Self {
        self.root = Root::None;
        self
    }

    /// Adds a mount. Mounting at `""` is the same as [`root`](Self::root).
    #[must_use]
    pub fn mount(mut self, base: &str, driver: Arc<dyn Driver>) -> Self {
        let base = normalize_base_key(base);
        if base.is_empty() {
            self.root = Root::Driver(driver);
        } else {
            self.mounts.push((base, driver));
        }
        self
    }

    /// Migrations for [`build_and_migrate`](Self::build_and_migrate).
    #[must_use]
    pub fn migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// Builds the storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateMount`](stowage_core::StorageError::DuplicateMount)
    /// if two mounts share a base.
    pub fn build(self) -> StorageResult<Storage> {
        self.assemble().map(|(storage, _)| storage)
    }

    /// Builds the storage and runs the configured migrator, if any.
    ///
    /// # Errors
    ///
    /// Build failures, or [`StorageError::Migration`](stowage_core::StorageError::Migration).
    pub async fn build_and_migrate(self) -> StorageResult<(Storage, Option<MigrationReport>)> {
        let (storage, migrator) = self.assemble()?;
        let report = match migrator {
            Some(migrator) => Some(storage.migrate(&migrator).await?),
            None => None,
        };
        Ok((storage, report))
    }

    fn assemble(self) -> StorageResult<(Storage, Option<Migrator>)> {
        let mut registry = MountRegistry::new();
        match self.root {
            Root::Memory => {
                registry.mount("", Arc::new(MemoryDriver::new()))?;
            }
            Root::Driver(driver) => {
                registry.mount("", driver)?;
            }
            Root::None => {}
        }
        for (base, driver) in self.mounts {
            debug!(base = %base, driver = driver.name(), "mounting driver");
            registry.mount(&base, driver)?;
        }
        Ok((Storage::from_registry(registry), self.migrator))
    }
}

#[cfg(test)]
mod tests {
    use stowage_core::{StorageError, Value};

    use super::*;
    use crate::driver::TransactionOptions;
    use crate::drivers::NullDriver;
    use crate::migration::{current_version, VERSION_KEY};
    use crate::testing::MockDriver;

    fn opts() -> TransactionOptions {
        TransactionOptions::default()
    }

    #[tokio::test]
    async fn default_builder_has_memory_root() {
        let storage = StorageBuilder::new().build().unwrap();
        storage.set_item("k", 1, &opts()).await.unwrap();
        assert_eq!(storage.get_item("k", &opts()).await.unwrap(), Some(Value::Int(1)));
        assert_eq!(storage.get_mount("k").unwrap().driver.name(), "memory");
    }

    #[tokio::test]
    async fn mounts_are_wired() {
        let cache = Arc::new(MockDriver::new());
        let storage = Storage::builder()
            .root(Arc::new(NullDriver))
            .mount("cache/", cache.clone())
            .build()
            .unwrap();

        storage.set_item("cache:a", "x", &opts()).await.unwrap();
        assert_eq!(cache.get_item_sync("a", &opts()).unwrap().as_deref(), Some("\"x\""));
        assert_eq!(storage.get_mounts("", false).len(), 2);
    }

    #[tokio::test]
    async fn without_root_rejects_unmounted_keys() {
        let storage = StorageBuilder::new()
            .without_root()
            .mount("only", Arc::new(MockDriver::new()))
            .build()
            .unwrap();

        storage.set_item("only:k", 1, &opts()).await.unwrap();
        assert!(matches!(
            storage.get_item("elsewhere", &opts()).await,
            Err(StorageError::NoRootDriver { .. })
        ));
    }

    #[test]
    fn duplicate_mounts_fail_the_build() {
        let result = StorageBuilder::new()
            .mount("a", Arc::new(NullDriver))
            .mount("a:", Arc::new(NullDriver))
            .build();
        assert!(matches!(result, Err(StorageError::DuplicateMount { .. })));
    }

    #[tokio::test]
    async fn build_and_migrate_runs_migrations() {
        let migrator = Migrator::new(2).migration(2, |storage| async move {
            storage.set_item("seeded", true, &TransactionOptions::default()).await?;
            Ok(())
        });
        let (storage, report) = StorageBuilder::new().migrator(migrator).build_and_migrate().await.unwrap();

        assert_eq!(report.map(|r| r.applied), Some(vec![2]));
        assert_eq!(current_version(&storage).await.unwrap(), 2);
        assert!(storage.has_item(VERSION_KEY, &opts()).await.unwrap());
        assert!(storage.has_item("seeded", &opts()).await.unwrap());
    }
}
