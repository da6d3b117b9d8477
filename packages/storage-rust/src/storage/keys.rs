//! Listing and clearing across mounts.

use futures_util::future::try_join_all;
use stowage_core::key::{filter_key_by_base, filter_key_by_depth, key_depth};
use stowage_core::{normalize_base_key, normalize_key, StorageResult};

use super::Storage;
use crate::driver::{require_sync, Capability, Driver, GetKeysOptions, TransactionOptions, WatchEvent};
use crate::mount::MountMatch;

/// Accumulates listed keys across mounts, longest mount first.
///
/// Keys a parent mount reports under a more specific mount's base are
/// masked: the child mount is authoritative for its subtree.
struct KeyCollector<'a> {
    base: &'a str,
    max_depth: Option<usize>,
    masked: Vec<String>,
    keys: Vec<String>,
}

impl<'a> KeyCollector<'a> {
    fn new(base: &'a str, max_depth: Option<usize>) -> Self {
        Self {
            base,
            max_depth,
            masked: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// Options to send to `mount`'s driver, or `None` when the mount lies
    /// entirely below the depth limit.
    fn options_for(&self, mount: &MountMatch, opts: &GetKeysOptions) -> Option<GetKeysOptions> {
        let mut opts = opts.clone();
        if let Some(max_depth) = self.max_depth {
            // A child mount starts some segments below the listing base.
            let offset = if mount.base.len() > self.base.len() {
                key_depth(&mount.base, self.base)
            } else {
                0
            };
            opts.max_depth = Some(max_depth.checked_sub(offset).filter(|d| *d > 0)?);
        }
        Some(opts)
    }

    fn add(&mut self, mount: &MountMatch, raw: Vec<String>) {
        let native_depth = mount.driver.flags().max_depth;
        for key in raw {
            let full = format!("{}{}", mount.base, normalize_key(&key));
            if self.masked.iter().any(|m| full.starts_with(m.as_str())) {
                continue;
            }
            if !filter_key_by_base(&full, self.base) {
                continue;
            }
            if !native_depth && !filter_key_by_depth(&full, self.base, self.max_depth) {
                continue;
            }
            self.keys.push(full);
        }
        self.masked.retain(|m| !m.starts_with(mount.base.as_str()));
        self.masked.push(mount.base.clone());
    }
}

impl Storage {
    /// Lists keys under `base` across every overlapping mount.
    ///
    /// Keys come back fully qualified. Metadata companions (`key$`) are
    /// omitted. With [`GetKeysOptions::max_depth`], only keys at most that
    /// many segments below `base` are returned.
    ///
    /// # Errors
    ///
    /// Propagates the first driver failure.
    pub async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let base = normalize_base_key(base);
        let mounts = self.registry().mounts_under(&base, true);
        let mut collector = KeyCollector::new(&base, opts.max_depth);
        for mount in &mounts {
            let Some(mount_opts) = collector.options_for(mount, opts) else {
                continue;
            };
            let raw = mount.driver.get_keys(&mount.relative_base, &mount_opts).await?;
            collector.add(mount, raw);
        }
        Ok(collector.keys)
    }

    /// Blocking [`get_keys`](Self::get_keys).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncUnsupported`](stowage_core::StorageError::SyncUnsupported)
    /// if an overlapping driver lacks `get_keys_sync`.
    pub fn get_keys_sync(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let base = normalize_base_key(base);
        let mounts = self.registry().mounts_under(&base, true);
        let mut collector = KeyCollector::new(&base, opts.max_depth);
        for mount in &mounts {
            let Some(mount_opts) = collector.options_for(mount, opts) else {
                continue;
            };
            require_sync(mount.driver.as_ref(), Capability::GetKeysSync)?;
            let raw = mount.driver.get_keys_sync(&mount.relative_base, &mount_opts)?;
            collector.add(mount, raw);
        }
        Ok(collector.keys)
    }

    /// Removes every key under `base`, across every overlapping mount.
    ///
    /// Drivers without a native `clear` are cleared key by key and a
    /// `Remove` event is emitted per key; read-only drivers are skipped.
    ///
    /// # Errors
    ///
    /// Propagates the first driver failure.
    pub async fn clear(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        let base = normalize_base_key(base);
        let mounts = self.registry().mounts_under(&base, true);
        try_join_all(mounts.iter().map(|mount| self.clear_mount(mount, opts))).await?;
        Ok(())
    }

    async fn clear_mount(&self, mount: &MountMatch, opts: &TransactionOptions) -> StorageResult<()> {
        let driver: &dyn Driver = mount.driver.as_ref();
        let caps = driver.capabilities();
        if caps.contains(Capability::Clear) {
            return driver.clear(&mount.relative_base, opts).await;
        }
        if !caps.contains(Capability::RemoveItem) {
            return Ok(());
        }
        let keys = driver.get_keys(&mount.relative_base, &listing(opts)).await?;
        let keys: Vec<&String> = keys
            .iter()
            .filter(|key| key.starts_with(mount.relative_base.as_str()))
            .collect();
        try_join_all(keys.iter().map(|key| driver.remove_item(key, opts))).await?;
        for key in keys {
            self.notify(driver, WatchEvent::Remove, &format!("{}{key}", mount.base));
        }
        Ok(())
    }

    /// Blocking [`clear`](Self::clear).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncUnsupported`](stowage_core::StorageError::SyncUnsupported)
    /// if a writable driver can be cleared neither natively nor key by key
    /// synchronously.
    pub fn clear_sync(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        let base = normalize_base_key(base);
        let mounts = self.registry().mounts_under(&base, true);
        for mount in &mounts {
            let driver = mount.driver.as_ref();
            let caps = driver.capabilities();
            if caps.contains(Capability::ClearSync) {
                driver.clear_sync(&mount.relative_base, opts)?;
                continue;
            }
            if !caps.contains(Capability::Clear) && !caps.contains(Capability::RemoveItem) {
                continue;
            }
            require_sync(driver, Capability::GetKeysSync)?;
            require_sync(driver, Capability::RemoveItemSync)?;
            for key in driver.get_keys_sync(&mount.relative_base, &listing(opts))? {
                if key.starts_with(mount.relative_base.as_str()) {
                    driver.remove_item_sync(&key, opts)?;
                    self.notify(driver, WatchEvent::Remove, &format!("{}{key}", mount.base));
                }
            }
        }
        Ok(())
    }
}

fn listing(opts: &TransactionOptions) -> GetKeysOptions {
    GetKeysOptions {
        max_depth: None,
        transaction: opts.clone(),
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stowage_core::StorageError;

    use super::*;
    use crate::driver::{Capabilities, DriverFlags};
    use crate::testing::{Call, MockDriver};

    fn opts() -> TransactionOptions {
        TransactionOptions::default()
    }

    fn sorted(mut keys: Vec<String>) -> Vec<String> {
        keys.sort();
        keys
    }

    async fn seeded(keys: &[&str]) -> Storage {
        let storage = Storage::in_memory();
        for key in keys {
            storage.set_item(key, 1, &opts()).await.unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn depth_filter_counts_segments_below_base() {
        let storage = seeded(&["a:b", "a:b:c", "a:d"]).await;
        let keys = storage.get_keys("a:", &GetKeysOptions::max_depth(1)).await.unwrap();
        assert_eq!(sorted(keys), vec!["a:b", "a:d"]);
    }

    #[tokio::test]
    async fn listing_spans_mounts_and_masks_parents() {
        let storage = seeded(&["top", "data:shadowed"]).await;
        storage.mount("data", Arc::new(MockDriver::new())).unwrap();
        storage.set_item("data:x", 1, &opts()).await.unwrap();
        storage.set_item("data:y:z", 1, &opts()).await.unwrap();

        let all = sorted(storage.get_keys("", &GetKeysOptions::default()).await.unwrap());
        assert_eq!(all, vec!["data:x", "data:y:z", "top"]);

        let under = sorted(storage.get_keys("data", &GetKeysOptions::default()).await.unwrap());
        assert_eq!(under, vec!["data:x", "data:y:z"]);

        let shallow = sorted(storage.get_keys("", &GetKeysOptions::max_depth(2)).await.unwrap());
        assert_eq!(shallow, vec!["data:x", "top"]);
    }

    #[tokio::test]
    async fn meta_companions_are_hidden() {
        let storage = seeded(&["k", "k$"]).await;
        assert_eq!(storage.get_keys("", &GetKeysOptions::default()).await.unwrap(), vec!["k"]);
    }

    #[tokio::test]
    async fn native_depth_is_trusted() {
        let native = Arc::new(MockDriver::new().with_flags(DriverFlags {
            max_depth: true,
            ttl: false,
        }));
        let storage = Storage::new(native.clone());
        for key in ["a", "b:c", "b:c:d"] {
            storage.set_item(key, 1, &opts()).await.unwrap();
        }

        let keys = sorted(storage.get_keys("", &GetKeysOptions::max_depth(2)).await.unwrap());
        assert_eq!(keys, vec!["a", "b:c"]);
        assert!(native.calls().contains(&Call::GetKeys(String::new())));
    }

    #[tokio::test]
    async fn mounts_below_depth_limit_are_skipped() {
        let storage = Storage::in_memory();
        let deep = Arc::new(MockDriver::new());
        storage.mount("x:y", deep.clone()).unwrap();
        deep.clear_calls();

        storage.get_keys("", &GetKeysOptions::max_depth(2)).await.unwrap();
        assert!(deep.calls().is_empty());
    }

    #[tokio::test]
    async fn clear_reaches_nested_mounts() {
        let storage = seeded(&["a:1", "b:1"]).await;
        let nested = Arc::new(MockDriver::new());
        storage.mount("a:n", nested.clone()).unwrap();
        storage.set_item("a:n:2", 1, &opts()).await.unwrap();

        storage.clear("a", &opts()).await.unwrap();

        assert_eq!(storage.get_keys("", &GetKeysOptions::default()).await.unwrap(), vec!["b:1"]);
        assert!(nested.calls().contains(&Call::Clear(String::new())));
    }

    #[tokio::test]
    async fn clear_without_native_support_removes_each_key() {
        let caps = Capabilities::of(&[Capability::SetItem, Capability::RemoveItem]);
        let driver = Arc::new(MockDriver::new().with_capabilities(caps));
        let storage = Storage::new(driver.clone());
        for key in ["p:1", "p:2", "q:1"] {
            storage.set_item(key, 1, &opts()).await.unwrap();
        }

        storage.clear("p", &opts()).await.unwrap();

        assert_eq!(storage.get_keys("", &GetKeysOptions::default()).await.unwrap(), vec!["q:1"]);
        assert!(driver.calls().contains(&Call::RemoveItem("p:1".to_string())));
        assert!(!driver.calls().iter().any(|c| matches!(c, Call::Clear(_))));
    }

    #[test]
    fn sync_listing_and_clear() {
        let storage = Storage::in_memory();
        storage.set_item_sync("s:1", 1, &opts()).unwrap();
        storage.set_item_sync("s:2:3", 1, &opts()).unwrap();

        let keys = storage.get_keys_sync("s", &GetKeysOptions::max_depth(1)).unwrap();
        assert_eq!(keys, vec!["s:1"]);

        storage.clear_sync("s", &opts()).unwrap();
        assert!(storage.get_keys_sync("", &GetKeysOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn sync_listing_requires_sync_driver() {
        let storage = Storage::new(Arc::new(MockDriver::new().async_only()));
        let err = storage.get_keys_sync("", &GetKeysOptions::default()).unwrap_err();
        assert!(matches!(err, StorageError::SyncUnsupported { .. }));
    }

    #[tokio::test]
    async fn clearing_key_by_key_emits_remove_events() {
        let caps = Capabilities::of(&[
            Capability::SetItem,
            Capability::RemoveItem,
            Capability::GetKeysSync,
            Capability::RemoveItemSync,
        ]);
        let storage = Storage::in_memory();
        storage.mount("m", Arc::new(MockDriver::new().with_capabilities(caps))).unwrap();
        storage.set_item("m:a", 1, &opts()).await.unwrap();
        storage.set_item("m:b", 1, &opts()).await.unwrap();
        storage.set_item("m:c:d", 1, &opts()).await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        storage
            .watch(move |event, key| sink.lock().push((event, key.to_string())))
            .unwrap();

        storage.clear("m:c", &opts()).await.unwrap();
        storage.set_item("m:c:e", 1, &opts()).await.unwrap();
        storage.clear_sync("m", &opts()).unwrap();

        let mut events = seen.lock().clone();
        events.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            events,
            vec![
                (WatchEvent::Remove, "m:a".to_string()),
                (WatchEvent::Remove, "m:b".to_string()),
                (WatchEvent::Remove, "m:c:d".to_string()),
                (WatchEvent::Update, "m:c:e".to_string()),
                (WatchEvent::Remove, "m:c:e".to_string()),
            ]
        );
    }
}
