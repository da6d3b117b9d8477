//! Blocking twins of the single-key operations.
//!
//! Each call has the same observable behavior as its async counterpart,
//! dispatched to the driver's `*_sync` method. A driver that cannot write
//! at all is read-only and ignores writes; a driver that writes only
//! asynchronously fails with `SyncUnsupported`.

use bytes::Bytes;
use stowage_core::codec::{deserialize_raw, serialize_raw};
use stowage_core::key::meta_key;
use stowage_core::{StorageResult, Value};
use tracing::{debug, warn};

use super::{decode, encode, Storage};
use crate::driver::{require_sync, Capability, Driver, TransactionOptions, WatchEvent};

/// Whether the driver can perform a write either way.
fn writable(driver: &dyn Driver, async_cap: Capability, sync_cap: Capability) -> bool {
    let caps = driver.capabilities();
    caps.contains(async_cap) || caps.contains(sync_cap)
}

impl Storage {
    /// Blocking [`has_item`](Self::has_item).
    ///
    /// # Errors
    ///
    /// `SyncUnsupported` when the driver lacks `has_item_sync`.
    pub fn has_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        let (_, mount) = self.resolve(key)?;
        require_sync(mount.driver.as_ref(), Capability::HasItemSync)?;
        mount.driver.has_item_sync(&mount.relative_key, opts)
    }

    /// Blocking [`get_item`](Self::get_item).
    ///
    /// # Errors
    ///
    /// `SyncUnsupported` when the driver lacks `get_item_sync`.
    pub fn get_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Value>> {
        let (key, mount) = self.resolve(key)?;
        require_sync(mount.driver.as_ref(), Capability::GetItemSync)?;
        let text = mount.driver.get_item_sync(&mount.relative_key, opts)?;
        Ok(text.and_then(|text| decode(&key, &text)))
    }

    /// Blocking [`set_item`](Self::set_item).
    ///
    /// # Errors
    ///
    /// `Serialization` for values the codec rejects, `SyncUnsupported` when
    /// the driver writes only asynchronously.
    pub fn set_item_sync(&self, key: &str, value: impl Into<Value>, opts: &TransactionOptions) -> StorageResult<()> {
        let value = value.into();
        if value.is_undefined() {
            return self.remove_item_sync(key, opts);
        }
        let (key, mount) = self.resolve(key)?;
        let driver = mount.driver.as_ref();
        if !writable(driver, Capability::SetItem, Capability::SetItemSync) {
            debug!(key = %key, driver = driver.name(), "read-only driver, write ignored");
            return Ok(());
        }
        require_sync(driver, Capability::SetItemSync)?;
        let text = encode(&key, &value)?;
        driver.set_item_sync(&mount.relative_key, &text, opts)?;
        self.notify(driver, WatchEvent::Update, &key);
        Ok(())
    }

    /// Blocking [`remove_item`](Self::remove_item).
    ///
    /// # Errors
    ///
    /// `SyncUnsupported` when the driver removes only asynchronously.
    pub fn remove_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        let (key, mount) = self.resolve(key)?;
        let driver = mount.driver.as_ref();
        if !writable(driver, Capability::RemoveItem, Capability::RemoveItemSync) {
            debug!(key = %key, driver = driver.name(), "read-only driver, removal ignored");
            return Ok(());
        }
        require_sync(driver, Capability::RemoveItemSync)?;
        driver.remove_item_sync(&mount.relative_key, opts)?;
        if opts.remove_meta {
            driver.remove_item_sync(&meta_key(&mount.relative_key), opts)?;
        }
        self.notify(driver, WatchEvent::Remove, &key);
        Ok(())
    }

    /// Blocking [`get_item_raw`](Self::get_item_raw).
    ///
    /// # Errors
    ///
    /// `SyncUnsupported` when the driver has neither `get_item_raw_sync`
    /// nor `get_item_sync`.
    pub fn get_item_raw_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        let (key, mount) = self.resolve(key)?;
        let driver = mount.driver.as_ref();
        if driver.capabilities().contains(Capability::GetItemRawSync) {
            return driver.get_item_raw_sync(&mount.relative_key, opts);
        }
        require_sync(driver, Capability::GetItemSync)?;
        let text = driver.get_item_sync(&mount.relative_key, opts)?;
        Ok(text.and_then(|text| match deserialize_raw(&text) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(key = %key, error = %err, "stored raw value could not be decoded");
                None
            }
        }))
    }

    /// Blocking [`set_item_raw`](Self::set_item_raw).
    ///
    /// # Errors
    ///
    /// `SyncUnsupported` when the driver writes only asynchronously.
    pub fn set_item_raw_sync(&self, key: &str, value: impl Into<Bytes>, opts: &TransactionOptions) -> StorageResult<()> {
        let value = value.into();
        let (key, mount) = self.resolve(key)?;
        let driver = mount.driver.as_ref();
        let caps = driver.capabilities();
        if caps.contains(Capability::SetItemRawSync) {
            driver.set_item_raw_sync(&mount.relative_key, &value, opts)?;
        } else if caps.contains(Capability::SetItemSync) {
            driver.set_item_sync(&mount.relative_key, &serialize_raw(&value), opts)?;
        } else if writable(driver, Capability::SetItemRaw, Capability::SetItem) {
            return Err(stowage_core::StorageError::sync_unsupported(
                driver.name(),
                Capability::SetItemRawSync.operation(),
            ));
        } else {
            debug!(key = %key, driver = driver.name(), "read-only driver, write ignored");
            return Ok(());
        }
        self.notify(driver, WatchEvent::Update, &key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use stowage_core::StorageError;

    use super::*;
    use crate::driver::Capabilities;
    use crate::drivers::NullDriver;
    use crate::testing::{Call, MockDriver};

    fn opts() -> TransactionOptions {
        TransactionOptions::default()
    }

    #[test]
    fn sync_round_trip_matches_async_encoding() {
        let driver = Arc::new(MockDriver::new());
        let storage = Storage::new(driver.clone());

        storage.set_item_sync("a/b", vec![Value::from(1), Value::Null], &opts()).unwrap();
        assert!(storage.has_item_sync("a:b", &opts()).unwrap());
        assert_eq!(
            storage.get_item_sync("a:b", &opts()).unwrap(),
            Some(Value::Array(vec![Value::Int(1), Value::Null]))
        );
        assert_eq!(driver.calls(), vec![Call::SetItemSync("a:b".to_string(), "[1,null]".to_string())]);

        storage.set_item_sync("a:b", Value::Undefined, &opts()).unwrap();
        assert!(!storage.has_item_sync("a:b", &opts()).unwrap());
    }

    #[test]
    fn async_only_drivers_reject_sync_calls() {
        let storage = Storage::new(Arc::new(MockDriver::new().async_only()));
        for result in [
            storage.set_item_sync("k", 1, &opts()),
            storage.remove_item_sync("k", &opts()),
            storage.set_item_raw_sync("k", vec![1u8], &opts()),
        ] {
            assert!(matches!(result, Err(StorageError::SyncUnsupported { .. })));
        }
        assert!(matches!(
            storage.get_item_sync("k", &opts()),
            Err(StorageError::SyncUnsupported { .. })
        ));
    }

    #[test]
    fn read_only_drivers_ignore_sync_writes() {
        let driver = Arc::new(MockDriver::new().with_capabilities(Capabilities::of(&[Capability::GetItemSync])));
        let storage = Storage::new(driver.clone());
        storage.set_item_sync("k", 1, &opts()).unwrap();
        storage.remove_item_sync("k", &opts()).unwrap();
        storage.set_item_raw_sync("k", vec![1u8], &opts()).unwrap();
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn raw_sync_falls_back_to_framed_text() {
        let caps = Capabilities::of(&[Capability::SetItemSync, Capability::GetItemSync]);
        let storage = Storage::new(Arc::new(MockDriver::new().with_capabilities(caps)));
        let bytes = Bytes::from_static(b"\x00\x01binary");

        storage.set_item_raw_sync("bin", bytes.clone(), &opts()).unwrap();
        assert_eq!(storage.get_item_raw_sync("bin", &opts()).unwrap(), Some(bytes));
    }

    #[test]
    fn sync_writes_emit_synthetic_events() {
        let storage = Storage::in_memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        storage
            .watch(move |event, key| sink.lock().push((event, key.to_string())))
            .unwrap();

        storage.set_item_sync("x", true, &opts()).unwrap();
        storage.remove_item_sync("x", &opts()).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (WatchEvent::Update, "x".to_string()),
                (WatchEvent::Remove, "x".to_string()),
            ]
        );
    }

    #[test]
    fn null_driver_accepts_and_forgets() {
        let storage = Storage::new(Arc::new(NullDriver));
        storage.set_item_sync("k", "v", &opts()).unwrap();
        assert_eq!(storage.get_item_sync("k", &opts()).unwrap(), None);
        assert!(!storage.has_item_sync("k", &opts()).unwrap());
    }
}
