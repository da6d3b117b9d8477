//! Per-key metadata: native driver metadata overlaid with the companion
//! `key$` entry written by [`Storage::set_meta`].

use stowage_core::key::meta_key;
use stowage_core::{StorageMeta, StorageResult};

use super::{decode, Storage};
use crate::driver::{require_sync, Capability, TransactionOptions};

impl Storage {
    /// Metadata for `key`.
    ///
    /// Native metadata comes first; unless
    /// [`TransactionOptions::native_only`] is set, fields stored at the
    /// companion key override it.
    ///
    /// # Errors
    ///
    /// Routing and driver failures.
    pub async fn get_meta(&self, key: &str, opts: &TransactionOptions) -> StorageResult<StorageMeta> {
        let (key, mount) = self.resolve(key)?;
        let mut meta = StorageMeta::default();
        if mount.driver.capabilities().contains(Capability::GetMeta) {
            if let Some(native) = mount.driver.get_meta(&mount.relative_key, opts).await? {
                meta.merge(native);
            }
        }
        if !opts.native_only {
            let companion = mount.driver.get_item(&meta_key(&mount.relative_key), opts).await?;
            if let Some(stored) = companion.and_then(|text| decode(&meta_key(&key), &text)) {
                meta.merge(StorageMeta::from_value(stored));
            }
        }
        Ok(meta)
    }

    /// Blocking [`get_meta`](Self::get_meta).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncUnsupported`](stowage_core::StorageError::SyncUnsupported)
    /// if the driver lacks `get_item_sync`, or has native metadata without
    /// `get_meta_sync`.
    pub fn get_meta_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<StorageMeta> {
        let (key, mount) = self.resolve(key)?;
        let driver = mount.driver.as_ref();
        let mut meta = StorageMeta::default();
        if driver.capabilities().contains(Capability::GetMeta) {
            require_sync(driver, Capability::GetMetaSync)?;
            if let Some(native) = driver.get_meta_sync(&mount.relative_key, opts)? {
                meta.merge(native);
            }
        }
        if !opts.native_only {
            require_sync(driver, Capability::GetItemSync)?;
            let companion = driver.get_item_sync(&meta_key(&mount.relative_key), opts)?;
            if let Some(stored) = companion.and_then(|text| decode(&meta_key(&key), &text)) {
                meta.merge(StorageMeta::from_value(stored));
            }
        }
        Ok(meta)
    }

    /// Stores user metadata for `key` at its companion key.
    ///
    /// # Errors
    ///
    /// Same as [`set_item`](Self::set_item).
    pub async fn set_meta(&self, key: &str, meta: &StorageMeta, opts: &TransactionOptions) -> StorageResult<()> {
        self.set_item(&meta_key(key), meta.to_value(), opts).await
    }

    /// Removes the companion metadata of `key`, leaving the value in place.
    ///
    /// # Errors
    ///
    /// Same as [`remove_item`](Self::remove_item).
    pub async fn remove_meta(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.remove_item(&meta_key(key), opts).await
    }
}
