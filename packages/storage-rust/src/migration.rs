//! Schema migrations over a persisted version counter.
//!
//! The current version lives at [`VERSION_KEY`] as a bare integer written
//! through the internal bypass. [`Migrator::run`] executes every registered
//! migration above the stored version, up to and including the target, in
//! ascending order. Versions without a migration are skipped.
//!
//! The stored version advances after each successful step, so a run that
//! fails part way resumes at the failed step on the next call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use stowage_core::{StorageError, StorageResult};
use tracing::{debug, error, info, warn};

use crate::storage::Storage;

/// Reserved key holding the persisted schema version.
pub const VERSION_KEY: &str = "__storage_version__";

type MigrationFn = Arc<dyn Fn(Storage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type HookFn = Arc<dyn Fn(u32, u32) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ErrorHookFn = Arc<dyn Fn(&anyhow::Error, u32, u32) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outcome of a [`Migrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version found in storage before the run.
    pub from: u32,
    /// Version stored after the run.
    pub to: u32,
    /// Migrations executed, in order.
    pub applied: Vec<u32>,
}

impl MigrationReport {
    /// Whether the run found storage already current.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Ordered set of migrations with lifecycle hooks.
///
/// ```ignore
/// let migrator = Migrator::new(2)
///     .migration(1, |storage| async move {
///         storage.set_item("settings:theme", "dark", &Default::default()).await?;
///         Ok(())
///     })
///     .migration(2, |storage| async move {
///         storage.remove_item("legacy", &Default::default()).await?;
///         Ok(())
///     });
/// storage.migrate(&migrator).await?;
/// ```
#[derive(Clone)]
pub struct Migrator {
    target: u32,
    migrations: BTreeMap<u32, MigrationFn>,
    before: Option<HookFn>,
    after: Option<HookFn>,
    on_error: Option<ErrorHookFn>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("target", &self.target)
            .field("migrations", &self.migrations.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Creates a migrator that brings storage up to `target`.
    #[must_use]
    pub fn new(target: u32) -> Self {
        Self {
            target,
            migrations: BTreeMap::new(),
            before: None,
            after: None,
            on_error: None,
        }
    }

    /// Target version.
    #[must_use]
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Registers the migration that produces `version`. Registering the
    /// same version twice keeps the later function.
    #[must_use]
    pub fn migration<F, Fut>(mut self, version: u32, migrate: F) -> Self
    where
        F: Fn(Storage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.migrations
            .insert(version, Arc::new(move |storage| migrate(storage).boxed()));
        self
    }

    /// Runs before the first migration with `(current, target)`. Not called
    /// when storage is already current.
    #[must_use]
    pub fn before_migration<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(u32, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before = Some(Arc::new(move |from, to| hook(from, to).boxed()));
        self
    }

    /// Runs after the target version has been persisted.
    #[must_use]
    pub fn after_migration<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(u32, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after = Some(Arc::new(move |from, to| hook(from, to).boxed()));
        self
    }

    /// Runs with the failure and `(current, target)` before the error is
    /// returned to the caller. Restoring a backup is this hook's job; the
    /// engine never rolls back.
    #[must_use]
    pub fn on_migration_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error, u32, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err: &anyhow::Error, from: u32, to: u32| {
            hook(err, from, to).boxed()
        }));
        self
    }

    /// Brings `storage` up to the target version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Migration`] when a hook, a migration, or a
    /// version write fails. The stored version then names the last
    /// migration that completed.
    pub async fn run(&self, storage: &Storage) -> StorageResult<MigrationReport> {
        // Step 1: Read the persisted version
        let current = current_version(storage).await.map_err(|source| StorageError::Migration {
            from: 0,
            to: self.target,
            source: anyhow::Error::new(source).context("reading the stored version"),
        })?;

        // Step 2: Nothing to do when already current
        if current >= self.target {
            debug!(current, target = self.target, "storage already at target version");
            return Ok(MigrationReport {
                from: current,
                to: current,
                applied: Vec::new(),
            });
        }

        info!(from = current, to = self.target, "running storage migrations");
        match self.advance(storage, current).await {
            Ok(applied) => {
                info!(from = current, to = self.target, applied = ?applied, "storage migrations complete");
                Ok(MigrationReport {
                    from: current,
                    to: self.target,
                    applied,
                })
            }
            Err(source) => {
                error!(from = current, to = self.target, error = %source, "storage migration failed");
                if let Some(hook) = &self.on_error {
                    hook(&source, current, self.target).await;
                }
                Err(StorageError::Migration {
                    from: current,
                    to: self.target,
                    source,
                })
            }
        }
    }

    async fn advance(&self, storage: &Storage, current: u32) -> anyhow::Result<Vec<u32>> {
        let target = self.target;
        if let Some(hook) = &self.before {
            hook(current, target).await.context("before-migration hook failed")?;
        }

        // Step 3: Apply each registered migration in order, recording
        // progress as we go
        let mut applied = Vec::new();
        for (&version, migrate) in self.migrations.range(current + 1..=target) {
            debug!(version, "applying migration");
            migrate(storage.clone())
                .await
                .with_context(|| format!("migration {version} failed"))?;
            store_version(storage, version).await?;
            applied.push(version);
        }

        // Step 4: Record the target even when its own migration is absent
        store_version(storage, target).await?;

        if let Some(hook) = &self.after {
            hook(current, target).await.context("after-migration hook failed")?;
        }
        Ok(applied)
    }
}

/// Reads the persisted version. A missing key is version 0; so is a value
/// that is not an unsigned integer, with a warning.
///
/// # Errors
///
/// Routing and driver failures.
pub async fn current_version(storage: &Storage) -> StorageResult<u32> {
    let Some(text) = storage.get_item_internal(VERSION_KEY).await? else {
        return Ok(0);
    };
    match text.trim().parse::<u32>() {
        Ok(version) => Ok(version),
        Err(err) => {
            warn!(value = %text, error = %err, "unreadable storage version, assuming 0");
            Ok(0)
        }
    }
}

async fn store_version(storage: &Storage, version: u32) -> anyhow::Result<()> {
    storage
        .set_item_internal(VERSION_KEY, &version.to_string())
        .await
        .with_context(|| format!("persisting version {version}"))
}

impl Storage {
    /// Runs `migrator` against this storage.
    ///
    /// # Errors
    ///
    /// See [`Migrator::run`].
    pub async fn migrate(&self, migrator: &Migrator) -> StorageResult<MigrationReport> {
        migrator.run(self).await
    }
}
