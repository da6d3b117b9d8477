//! Test doubles shared by the unit tests in this crate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use stowage_core::{StorageMeta, StorageResult};

use crate::driver::{
    Capabilities, Capability, Driver, DriverFlags, GetKeysOptions, TransactionOptions, Unwatch, WatchCallback,
    WatchEvent,
};
use crate::drivers::MemoryDriver;

/// Routes `tracing` output to the test harness. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A driver call as observed by [`MockDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    HasItem(String),
    GetItem(String),
    GetItems(Vec<String>),
    GetKeys(String),
    SetItem(String, String),
    SetItems(Vec<(String, String)>),
    SetItemRaw(String),
    RemoveItem(String),
    Clear(String),
    GetMeta(String),
    SetItemSync(String, String),
    RemoveItemSync(String),
    Dispose,
    Flush,
}

type Watchers = Arc<Mutex<Vec<(u64, WatchCallback)>>>;

/// Recording driver over a [`MemoryDriver`], with configurable
/// capabilities, injected failures and native watch support.
pub(crate) struct MockDriver {
    store: MemoryDriver,
    capabilities: Capabilities,
    flags: DriverFlags,
    calls: Mutex<Vec<Call>>,
    watchers: Watchers,
    next_watcher: AtomicU64,
    fail_set_items: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
    write_delay: Option<Duration>,
    native_meta: Mutex<Option<StorageMeta>>,
}

impl MockDriver {
    /// Supports every capability, async and sync.
    pub fn new() -> Self {
        Self {
            store: MemoryDriver::new(),
            capabilities: Capabilities::all(),
            flags: DriverFlags::default(),
            calls: Mutex::new(Vec::new()),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_watcher: AtomicU64::new(0),
            fail_set_items: AtomicBool::new(false),
            failing_keys: Mutex::new(HashSet::new()),
            write_delay: None,
            native_meta: Mutex::new(None),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.capabilities = self.capabilities.without(capability);
        self
    }

    /// Drops every synchronous capability.
    pub fn async_only(self) -> Self {
        self.with_capabilities(Capabilities::of(&Capability::ASYNC))
    }

    pub fn with_flags(mut self, flags: DriverFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Delays every async write by `delay`.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn fail_set_items(&self, fail: bool) {
        self.fail_set_items.store(fail, Ordering::SeqCst);
    }

    /// Makes single-key writes to `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    pub fn set_native_meta(&self, meta: StorageMeta) {
        *self.native_meta.lock() = Some(meta);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Every key/value pair written through the async write paths, in
    /// call order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .flat_map(|call| match call {
                Call::SetItem(key, value) => vec![(key.clone(), value.clone())],
                Call::SetItems(items) => items.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Delivers a native change event to every watcher.
    pub fn emit(&self, event: WatchEvent, key: &str) {
        let watchers: Vec<WatchCallback> = self.watchers.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for watcher in watchers {
            watcher(event, key);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check_key(&self, key: &str) -> StorageResult<()> {
        if self.failing_keys.lock().contains(key) {
            return Err(anyhow::anyhow!("injected failure for {key}").into());
        }
        Ok(())
    }

    async fn delay(&self) {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn flags(&self) -> DriverFlags {
        self.flags
    }

    async fn has_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        self.record(Call::HasItem(key.to_string()));
        self.store.has_item(key, opts).await
    }

    async fn get_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<String>> {
        self.record(Call::GetItem(key.to_string()));
        self.store.get_item(key, opts).await
    }

    async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        self.record(Call::GetKeys(base.to_string()));
        let mut keys = self.store.get_keys(base, opts).await?;
        if self.flags.max_depth {
            keys.retain(|key| stowage_core::key::filter_key_by_depth(key, base, opts.max_depth));
        }
        Ok(keys)
    }

    async fn set_item(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::SetItem(key.to_string(), value.to_string()));
        self.delay().await;
        self.check_key(key)?;
        self.store.set_item(key, value, opts).await
    }

    async fn remove_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::RemoveItem(key.to_string()));
        self.delay().await;
        self.store.remove_item(key, opts).await
    }

    async fn clear(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::Clear(base.to_string()));
        self.store.clear(base, opts).await
    }

    async fn get_meta(&self, key: &str, _opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        self.record(Call::GetMeta(key.to_string()));
        Ok(self.native_meta.lock().clone())
    }

    async fn get_items(
        &self,
        keys: &[String],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        self.record(Call::GetItems(keys.to_vec()));
        let mut items = self.store.get_items(keys, opts).await?;
        // Native batch reads do not promise request order.
        items.reverse();
        Ok(items)
    }

    async fn set_items(&self, items: &[(String, String)], opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::SetItems(items.to_vec()));
        self.delay().await;
        if self.fail_set_items.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected batch failure").into());
        }
        self.store.set_items(items, opts).await
    }

    async fn get_item_raw(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        self.store.get_item_raw(key, opts).await
    }

    async fn set_item_raw(&self, key: &str, value: &Bytes, opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::SetItemRaw(key.to_string()));
        self.delay().await;
        self.check_key(key)?;
        self.store.set_item_raw(key, value, opts).await
    }

    fn watch(&self, callback: WatchCallback) -> StorageResult<Unwatch> {
        let id = self.next_watcher.fetch_add(1, Ordering::SeqCst);
        self.watchers.lock().push((id, callback));
        let watchers = Arc::clone(&self.watchers);
        Ok(Unwatch::new(move || {
            watchers.lock().retain(|(watcher, _)| *watcher != id);
        }))
    }

    async fn dispose(&self) -> StorageResult<()> {
        self.record(Call::Dispose);
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.record(Call::Flush);
        Ok(())
    }

    fn has_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        self.store.has_item_sync(key, opts)
    }

    fn get_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<String>> {
        self.store.get_item_sync(key, opts)
    }

    fn get_keys_sync(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        self.store.get_keys_sync(base, opts)
    }

    fn set_item_sync(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::SetItemSync(key.to_string(), value.to_string()));
        self.check_key(key)?;
        self.store.set_item_sync(key, value, opts)
    }

    fn remove_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.record(Call::RemoveItemSync(key.to_string()));
        self.store.remove_item_sync(key, opts)
    }

    fn clear_sync(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.store.clear_sync(base, opts)
    }

    fn get_meta_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        Ok(self.native_meta.lock().clone())
    }

    fn get_items_sync(
        &self,
        keys: &[String],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        self.store.get_items_sync(keys, opts)
    }

    fn set_items_sync(&self, items: &[(String, String)], opts: &TransactionOptions) -> StorageResult<()> {
        self.store.set_items_sync(items, opts)
    }

    fn get_item_raw_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        self.store.get_item_raw_sync(key, opts)
    }

    fn set_item_raw_sync(&self, key: &str, value: &Bytes, opts: &TransactionOptions) -> StorageResult<()> {
        self.store.set_item_raw_sync(key, value, opts)
    }
}
