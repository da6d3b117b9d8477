use bytes::Bytes;
use stowage_core::{normalize_base_key, normalize_key, StorageMeta, StorageResult, Value};

use super::Storage;
use crate::driver::{GetKeysOptions, TransactionOptions};

/// A view of a [`Storage`] scoped to one base.
///
/// Keys passed in are relative to the base; keys coming back from
/// [`get_keys`](Self::get_keys) have the base stripped. The view shares the
/// underlying mounts, so writes through it are visible to the parent.
#[derive(Debug, Clone)]
pub struct PrefixStorage {
    storage: Storage,
    base: String,
}

impl Storage {
    /// Returns a view of this storage rooted at `base`.
    #[must_use]
    pub fn with_prefix(&self, base: &str) -> PrefixStorage {
        PrefixStorage {
            storage: self.clone(),
            base: normalize_base_key(base),
        }
    }
}

impl PrefixStorage {
    /// Normalized base, ending in `:` unless empty.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The storage this view reads and writes through.
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn full(&self, key: &str) -> String {
        format!("{}{}", self.base, normalize_key(key))
    }

    /// # Errors
    ///
    /// See [`Storage::has_item`].
    pub async fn has_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        self.storage.has_item(&self.full(key), opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::get_item`].
    pub async fn get_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Value>> {
        self.storage.get_item(&self.full(key), opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::set_item`].
    pub async fn set_item(&self, key: &str, value: impl Into<Value>, opts: &TransactionOptions) -> StorageResult<()> {
        self.storage.set_item(&self.full(key), value, opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::remove_item`].
    pub async fn remove_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.storage.remove_item(&self.full(key), opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::get_item_raw`].
    pub async fn get_item_raw(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        self.storage.get_item_raw(&self.full(key), opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::set_item_raw`].
    pub async fn set_item_raw(&self, key: &str, value: impl Into<Bytes>, opts: &TransactionOptions) -> StorageResult<()> {
        self.storage.set_item_raw(&self.full(key), value, opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::get_meta`].
    pub async fn get_meta(&self, key: &str, opts: &TransactionOptions) -> StorageResult<StorageMeta> {
        self.storage.get_meta(&self.full(key), opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::set_meta`].
    pub async fn set_meta(&self, key: &str, meta: &StorageMeta, opts: &TransactionOptions) -> StorageResult<()> {
        self.storage.set_meta(&self.full(key), meta, opts).await
    }

    /// Keys under `base` within the view, relative to the view's base.
    ///
    /// # Errors
    ///
    /// See [`Storage::get_keys`].
    pub async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let keys = self.storage.get_keys(&self.full(base), opts).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(self.base.as_str()).map(str::to_string))
            .collect())
    }

    /// # Errors
    ///
    /// See [`Storage::clear`].
    pub async fn clear(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.storage.clear(&self.full(base), opts).await
    }

    /// # Errors
    ///
    /// See [`Storage::get_item_sync`].
    pub fn get_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Value>> {
        self.storage.get_item_sync(&self.full(key), opts)
    }

    /// # Errors
    ///
    /// See [`Storage::set_item_sync`].
    pub fn set_item_sync(&self, key: &str, value: impl Into<Value>, opts: &TransactionOptions) -> StorageResult<()> {
        self.storage.set_item_sync(&self.full(key), value, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> TransactionOptions {
        TransactionOptions::default()
    }

    #[tokio::test]
    async fn view_prefixes_and_strips_keys() {
        let storage = Storage::in_memory();
        let users = storage.with_prefix("users/");
        assert_eq!(users.base(), "users:");

        users.set_item("alice", "admin", &opts()).await.unwrap();
        users.set_item("bob:profile", 3, &opts()).await.unwrap();
        storage.set_item("other", 1, &opts()).await.unwrap();

        assert_eq!(
            storage.get_item("users:alice", &opts()).await.unwrap(),
            Some(Value::from("admin"))
        );
        let mut keys = users.get_keys("", &GetKeysOptions::default()).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["alice", "bob:profile"]);

        let shallow = users.get_keys("", &GetKeysOptions::max_depth(1)).await.unwrap();
        assert_eq!(shallow, vec!["alice"]);
    }

    #[tokio::test]
    async fn clear_is_confined_to_the_view() {
        let storage = Storage::in_memory();
        let scratch = storage.with_prefix("scratch");
        scratch.set_item("a", 1, &opts()).await.unwrap();
        storage.set_item("keep", 1, &opts()).await.unwrap();

        scratch.clear("", &opts()).await.unwrap();

        assert!(!scratch.has_item("a", &opts()).await.unwrap());
        assert!(storage.has_item("keep", &opts()).await.unwrap());
    }

    #[tokio::test]
    async fn raw_and_meta_pass_through() {
        let storage = Storage::in_memory();
        let view = storage.with_prefix("v");
        view.set_item_raw("blob", vec![9u8, 8], &opts()).await.unwrap();
        assert_eq!(
            view.get_item_raw("blob", &opts()).await.unwrap(),
            Some(Bytes::from_static(&[9, 8]))
        );

        let meta = StorageMeta {
            ttl: Some(1),
            ..StorageMeta::default()
        };
        view.set_meta("blob", &meta, &opts()).await.unwrap();
        assert_eq!(storage.get_meta("v:blob", &opts()).await.unwrap(), meta);

        view.set_item_sync("s", 2, &opts()).unwrap();
        assert_eq!(view.get_item_sync("s", &opts()).unwrap(), Some(Value::Int(2)));
        view.remove_item("s", &opts()).await.unwrap();
        assert_eq!(view.get_item("s", &opts()).await.unwrap(), None);
    }
}
