//! Single-key async operations and the internal bypass used for
//! version bookkeeping.

use bytes::Bytes;
use stowage_core::codec::{deserialize_raw, serialize_raw};
use stowage_core::{StorageResult, Value};
use tracing::{debug, warn};

use super::{decode, encode, Storage};
use crate::driver::{Capability, TransactionOptions, WatchEvent};

impl Storage {
    /// Whether `key` holds a value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoRootDriver`](stowage_core::StorageError::NoRootDriver)
    /// for unmounted keys, or the driver's failure.
    pub async fn has_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        let (_, mount) = self.resolve(key)?;
        mount.driver.has_item(&mount.relative_key, opts).await
    }

    /// Reads and decodes the value at `key`. Missing keys and values that
    /// fail to decode both read as `None`.
    ///
    /// # Errors
    ///
    /// Only routing and driver failures are errors.
    pub async fn get_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Value>> {
        let (key, mount) = self.resolve(key)?;
        let text = mount.driver.get_item(&mount.relative_key, opts).await?;
        Ok(text.and_then(|text| decode(&key, &text)))
    }

    /// Encodes and writes `value` at `key`.
    ///
    /// Writing [`Value::Undefined`] removes the key. Writes to a driver
    /// without `set_item` are silently ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`](stowage_core::StorageError::Serialization)
    /// for values the codec rejects, plus routing and driver failures.
    pub async fn set_item(&self, key: &str, value: impl Into<Value>, opts: &TransactionOptions) -> StorageResult<()> {
        let value = value.into();
        if value.is_undefined() {
            return self.remove_item(key, opts).await;
        }
        // Step 1: Resolve the owning mount
        let (key, mount) = self.resolve(key)?;
        if !mount.driver.capabilities().contains(Capability::SetItem) {
            debug!(key = %key, driver = mount.driver.name(), "read-only driver, write ignored");
            return Ok(());
        }

        // Step 2: Encode before touching the driver
        let text = encode(&key, &value)?;

        // Step 3: Write and notify
        mount.driver.set_item(&mount.relative_key, &text, opts).await?;
        self.notify(mount.driver.as_ref(), WatchEvent::Update, &key);
        Ok(())
    }

    /// Removes `key`, and its metadata companion when
    /// [`TransactionOptions::remove_meta`] is set.
    ///
    /// # Errors
    ///
    /// Routing and driver failures.
    pub async fn remove_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        let (key, mount) = self.resolve(key)?;
        if !mount.driver.capabilities().contains(Capability::RemoveItem) {
            debug!(key = %key, driver = mount.driver.name(), "read-only driver, removal ignored");
            return Ok(());
        }
        mount.driver.remove_item(&mount.relative_key, opts).await?;
        if opts.remove_meta {
            let meta = stowage_core::key::meta_key(&mount.relative_key);
            mount.driver.remove_item(&meta, opts).await?;
        }
        self.notify(mount.driver.as_ref(), WatchEvent::Remove, &key);
        Ok(())
    }

    /// Reads binary data at `key`. Drivers without native raw support store
    /// bytes as base64-framed text, which is unframed here.
    ///
    /// # Errors
    ///
    /// Routing and driver failures.
    pub async fn get_item_raw(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        let (key, mount) = self.resolve(key)?;
        if mount.driver.capabilities().contains(Capability::GetItemRaw) {
            return mount.driver.get_item_raw(&mount.relative_key, opts).await;
        }
        let text = mount.driver.get_item(&mount.relative_key, opts).await?;
        Ok(text.and_then(|text| match deserialize_raw(&text) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(key = %key, error = %err, "stored raw value could not be decoded");
                None
            }
        }))
    }

    /// Writes binary data at `key`.
    ///
    /// # Errors
    ///
    /// Routing and driver failures.
    pub async fn set_item_raw(&self, key: &str, value: impl Into<Bytes>, opts: &TransactionOptions) -> StorageResult<()> {
        let value = value.into();
        let (key, mount) = self.resolve(key)?;
        let caps = mount.driver.capabilities();
        if caps.contains(Capability::SetItemRaw) {
            mount.driver.set_item_raw(&mount.relative_key, &value, opts).await?;
        } else if caps.contains(Capability::SetItem) {
            mount
                .driver
                .set_item(&mount.relative_key, &serialize_raw(&value), opts)
                .await?;
        } else {
            debug!(key = %key, driver = mount.driver.name(), "read-only driver, write ignored");
            return Ok(());
        }
        self.notify(mount.driver.as_ref(), WatchEvent::Update, &key);
        Ok(())
    }

    /// Writes a driver-level string without encoding or notification.
    pub(crate) async fn set_item_internal(&self, key: &str, text: &str) -> StorageResult<()> {
        let (_, mount) = self.resolve(key)?;
        if !mount.driver.capabilities().contains(Capability::SetItem) {
            return Ok(());
        }
        mount
            .driver
            .set_item(&mount.relative_key, text, &TransactionOptions::default())
            .await
    }

    /// Reads a driver-level string without decoding.
    pub(crate) async fn get_item_internal(&self, key: &str) -> StorageResult<Option<String>> {
        let (_, mount) = self.resolve(key)?;
        mount
            .driver
            .get_item(&mount.relative_key, &TransactionOptions::default())
            .await
    }
}
