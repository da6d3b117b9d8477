//! In-memory [`Driver`] backed by [`DashMap`].
//!
//! Supports every operation in both async and sync form. Raw values are kept
//! as bytes and framed on demand when read back as text.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use stowage_core::codec::{deserialize_raw, serialize_raw};
use stowage_core::StorageResult;

use crate::driver::{Capabilities, Capability, Driver, GetKeysOptions, TransactionOptions};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Raw(Bytes),
}

/// In-memory storage for concurrent access without external locking.
///
/// Suitable as a root driver in tests and for ephemeral data. Contents are
/// lost on drop; `dispose` clears them eagerly.
pub struct MemoryDriver {
    entries: DashMap<String, Stored>,
}

impl MemoryDriver {
    /// Creates a new, empty `MemoryDriver`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
            .without(Capability::Watch)
            .without(Capability::GetMeta)
            .without(Capability::GetMetaSync)
    }

    async fn has_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        self.has_item_sync(key, opts)
    }

    async fn get_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<String>> {
        self.get_item_sync(key, opts)
    }

    async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        self.get_keys_sync(base, opts)
    }

    async fn set_item(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.set_item_sync(key, value, opts)
    }

    async fn remove_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.remove_item_sync(key, opts)
    }

    async fn clear(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.clear_sync(base, opts)
    }

    async fn get_items(
        &self,
        keys: &[String],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        self.get_items_sync(keys, opts)
    }

    async fn set_items(&self, items: &[(String, String)], opts: &TransactionOptions) -> StorageResult<()> {
        self.set_items_sync(items, opts)
    }

    async fn get_item_raw(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        self.get_item_raw_sync(key, opts)
    }

    async fn set_item_raw(&self, key: &str, value: &Bytes, opts: &TransactionOptions) -> StorageResult<()> {
        self.set_item_raw_sync(key, value, opts)
    }

    async fn dispose(&self) -> StorageResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn has_item_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn get_item_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<String>> {
        Ok(self.entries.get(key).map(|entry| match entry.value() {
            Stored::Text(text) => text.clone(),
            Stored::Raw(bytes) => serialize_raw(bytes),
        }))
    }

    fn get_keys_sync(&self, base: &str, _opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(base))
            .map(|entry| entry.key().clone())
            .collect())
    }

    fn set_item_sync(&self, key: &str, value: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        self.entries.insert(key.to_string(), Stored::Text(value.to_string()));
        Ok(())
    }

    fn remove_item_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear_sync(&self, base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        if base.is_empty() {
            self.entries.clear();
        } else {
            self.entries.retain(|key, _| !key.starts_with(base));
        }
        Ok(())
    }

    fn get_items_sync(
        &self,
        keys: &[String],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get_item_sync(key, opts)?)))
            .collect()
    }

    fn set_items_sync(&self, items: &[(String, String)], _opts: &TransactionOptions) -> StorageResult<()> {
        for (key, value) in items {
            self.entries.insert(key.clone(), Stored::Text(value.clone()));
        }
        Ok(())
    }

    fn get_item_raw_sync(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        match entry.value() {
            Stored::Raw(bytes) => Ok(Some(bytes.clone())),
            Stored::Text(text) => Ok(Some(deserialize_raw(text).map_err(anyhow::Error::from)?)),
        }
    }

    fn set_item_raw_sync(&self, key: &str, value: &Bytes, _opts: &TransactionOptions) -> StorageResult<()> {
        self.entries.insert(key.to_string(), Stored::Raw(value.clone()));
        Ok(())
    }
}
