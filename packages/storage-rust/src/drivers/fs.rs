//! Filesystem [`Driver`]: one file per key below a base directory.
//!
//! Key segments map to path components (`a:b:c` is `<base>/a/b/c`). Listing
//! walks the directory tree and honors `max_depth` natively. Paths whose key
//! form matches one of the configured ignore patterns are skipped.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use stowage_core::key::KEY_SEPARATOR;
use stowage_core::{StorageError, StorageMeta, StorageResult};
use tracing::debug;

use crate::driver::{Capabilities, Capability, Driver, DriverFlags, GetKeysOptions, TransactionOptions};

/// Options for [`FsDriver`].
#[derive(Debug, Clone, Default)]
pub struct FsDriverConfig {
    /// Directory holding the files. Required.
    pub base: Option<PathBuf>,
    /// Writes and removals become no-ops.
    pub read_only: bool,
    /// `clear` becomes a no-op.
    pub no_clear: bool,
    /// Regular expressions matched against keys; matching entries are
    /// neither listed nor descended into.
    pub ignore: Vec<String>,
}

/// Stores each key as a file under a base directory.
#[derive(Debug)]
pub struct FsDriver {
    base: PathBuf,
    read_only: bool,
    no_clear: bool,
    ignore: Vec<Regex>,
}

impl FsDriver {
    /// Builds a driver from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DriverConfig`] when `base` is missing or an
    /// ignore pattern does not compile.
    pub fn new(config: FsDriverConfig) -> StorageResult<Self> {
        let base = config.base.ok_or_else(|| StorageError::DriverConfig {
            driver: "fs".to_string(),
            reason: "`base` directory is required".to_string(),
        })?;
        let ignore = config
            .ignore
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| StorageError::DriverConfig {
                    driver: "fs".to_string(),
                    reason: format!("invalid ignore pattern `{pattern}`: {e}"),
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Self {
            base,
            read_only: config.read_only,
            no_clear: config.no_clear,
            ignore,
        })
    }

    /// Directory this driver stores files under.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Maps a driver-relative key (or listing base) to a path under `base`.
    fn resolve_path(&self, key: &str) -> StorageResult<PathBuf> {
        let mut path = self.base.clone();
        for segment in key.split(KEY_SEPARATOR).filter(|s| !s.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) => path.push(part),
                _ => {
                    return Err(StorageError::invalid_key(
                        key,
                        "segment escapes the base directory",
                    ))
                }
            }
        }
        Ok(path)
    }

    fn is_ignored(&self, key: &str) -> bool {
        self.ignore.iter().any(|pattern| pattern.is_match(key))
    }

    fn listing_root(&self, base: &str) -> StorageResult<(PathBuf, String)> {
        let prefix = base.trim_end_matches(KEY_SEPARATOR);
        let dir = self.resolve_path(prefix)?;
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}{KEY_SEPARATOR}")
        };
        Ok((dir, prefix))
    }
}

fn not_found_as<T>(result: std::io::Result<T>, fallback: T) -> StorageResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(fallback),
        Err(e) => Err(e.into()),
    }
}

fn meta_from(metadata: &std::fs::Metadata) -> StorageMeta {
    StorageMeta {
        atime: metadata.accessed().ok().map(DateTime::<Utc>::from),
        mtime: metadata.modified().ok().map(DateTime::<Utc>::from),
        size: Some(metadata.len()),
        ..StorageMeta::default()
    }
}

/// One directory awaiting a listing pass.
struct Pending {
    dir: PathBuf,
    prefix: String,
    depth: usize,
}

enum Visit {
    File(String),
    Dir(Pending),
    Skip,
}

impl Pending {
    fn visit(&self, driver: &FsDriver, name: &std::ffi::OsStr, is_dir: bool, max_depth: Option<usize>) -> Visit {
        let Some(name) = name.to_str() else {
            return Visit::Skip;
        };
        let key = format!("{}{name}", self.prefix);
        if driver.is_ignored(&key) {
            return Visit::Skip;
        }
        let depth = self.depth + 1;
        if !is_dir {
            return Visit::File(key);
        }
        match max_depth {
            Some(max) if depth >= max => Visit::Skip,
            _ => Visit::Dir(Pending {
                dir: self.dir.join(name),
                prefix: format!("{key}{KEY_SEPARATOR}"),
                depth,
            }),
        }
    }
}

#[async_trait]
impl Driver for FsDriver {
    fn name(&self) -> &str {
        "fs"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
            .without(Capability::Watch)
            .without(Capability::GetItems)
            .without(Capability::SetItems)
            .without(Capability::GetItemsSync)
            .without(Capability::SetItemsSync)
    }

    fn flags(&self) -> DriverFlags {
        DriverFlags {
            max_depth: true,
            ttl: false,
        }
    }

    async fn has_item(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<bool> {
        let path = self.resolve_path(key)?;
        not_found_as(tokio::fs::metadata(&path).await.map(|m| m.is_file()), false)
    }

    async fn get_item(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<String>> {
        let path = self.resolve_path(key)?;
        not_found_as(tokio::fs::read_to_string(&path).await.map(Some), None)
    }

    async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let (dir, prefix) = self.listing_root(base)?;
        let mut keys = Vec::new();
        let mut stack = vec![Pending { dir, prefix, depth: 0 }];
        while let Some(pending) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&pending.dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let is_dir = entry.file_type().await?.is_dir();
                match pending.visit(self, &entry.file_name(), is_dir, opts.max_depth) {
                    Visit::File(key) => keys.push(key),
                    Visit::Dir(next) => stack.push(next),
                    Visit::Skip => {}
                }
            }
        }
        Ok(keys)
    }

    async fn set_item(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.set_item_raw(key, &Bytes::copy_from_slice(value.as_bytes()), opts)
            .await
    }

    async fn remove_item(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.resolve_path(key)?;
        not_found_as(tokio::fs::remove_file(&path).await, ())
    }

    async fn clear(&self, base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        if self.read_only || self.no_clear {
            return Ok(());
        }
        let (dir, _) = self.listing_root(base)?;
        debug!(dir = %dir.display(), "clearing directory");
        if dir != self.base {
            return not_found_as(tokio::fs::remove_dir_all(&dir).await, ());
        }
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn get_meta(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        let path = self.resolve_path(key)?;
        not_found_as(tokio::fs::metadata(&path).await.map(|m| Some(meta_from(&m))), None)
    }

    async fn get_item_raw(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        let path = self.resolve_path(key)?;
        not_found_as(tokio::fs::read(&path).await.map(|b| Some(Bytes::from(b))), None)
    }

    async fn set_item_raw(&self, key: &str, value: &Bytes, _opts: &TransactionOptions) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, value).await?;
        Ok(())
    }

    fn has_item_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<bool> {
        let path = self.resolve_path(key)?;
        not_found_as(std::fs::metadata(path).map(|m| m.is_file()), false)
    }

    fn get_item_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<String>> {
        let path = self.resolve_path(key)?;
        not_found_as(std::fs::read_to_string(path).map(Some), None)
    }

    fn get_keys_sync(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let (dir, prefix) = self.listing_root(base)?;
        let mut keys = Vec::new();
        let mut stack = vec![Pending { dir, prefix, depth: 0 }];
        while let Some(pending) = stack.pop() {
            let entries = match std::fs::read_dir(&pending.dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let is_dir = entry.file_type()?.is_dir();
                match pending.visit(self, &entry.file_name(), is_dir, opts.max_depth) {
                    Visit::File(key) => keys.push(key),
                    Visit::Dir(next) => stack.push(next),
                    Visit::Skip => {}
                }
            }
        }
        Ok(keys)
    }

    fn set_item_sync(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.set_item_raw_sync(key, &Bytes::copy_from_slice(value.as_bytes()), opts)
    }

    fn remove_item_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.resolve_path(key)?;
        not_found_as(std::fs::remove_file(path), ())
    }

    fn clear_sync(&self, base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        if self.read_only || self.no_clear {
            return Ok(());
        }
        let (dir, _) = self.listing_root(base)?;
        if dir != self.base {
            return not_found_as(std::fs::remove_dir_all(&dir), ());
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn get_meta_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        let path = self.resolve_path(key)?;
        not_found_as(std::fs::metadata(path).map(|m| Some(meta_from(&m))), None)
    }

    fn get_item_raw_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        let path = self.resolve_path(key)?;
        not_found_as(std::fs::read(path).map(|b| Some(Bytes::from(b))), None)
    }

    fn set_item_raw_sync(&self, key: &str, value: &Bytes, _opts: &TransactionOptions) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, value)?;
        Ok(())
    }
}
