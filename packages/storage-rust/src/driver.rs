//! Driver contract for storage backends.
//!
//! Defines [`Driver`], the capability-checked interface every backend
//! implements. Three methods are mandatory (`has_item`, `get_item`,
//! `get_keys`); everything else is optional and advertised through
//! [`Capabilities`]. The [`Storage`](crate::Storage) façade inspects the
//! capability set before calling an optional method and applies the
//! documented fallback when it is absent, so the default bodies below are
//! only reached when a driver advertises a capability it does not implement.
//!
//! Every operation exists twice: an async method and a blocking `*_sync`
//! twin. Drivers decide per method which variants they support.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use stowage_core::{StorageError, StorageMeta, StorageResult};

/// An optional driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SetItem,
    RemoveItem,
    Clear,
    GetMeta,
    GetItems,
    SetItems,
    GetItemRaw,
    SetItemRaw,
    Watch,
    Dispose,
    Flush,
    HasItemSync,
    GetItemSync,
    GetKeysSync,
    SetItemSync,
    RemoveItemSync,
    ClearSync,
    GetMetaSync,
    GetItemsSync,
    SetItemsSync,
    GetItemRawSync,
    SetItemRawSync,
    FlushSync,
}

impl Capability {
    /// Every async optional operation.
    pub const ASYNC: [Capability; 11] = [
        Self::SetItem,
        Self::RemoveItem,
        Self::Clear,
        Self::GetMeta,
        Self::GetItems,
        Self::SetItems,
        Self::GetItemRaw,
        Self::SetItemRaw,
        Self::Watch,
        Self::Dispose,
        Self::Flush,
    ];

    /// Every synchronous twin, including those of the mandatory methods.
    pub const SYNC: [Capability; 12] = [
        Self::HasItemSync,
        Self::GetItemSync,
        Self::GetKeysSync,
        Self::SetItemSync,
        Self::RemoveItemSync,
        Self::ClearSync,
        Self::GetMetaSync,
        Self::GetItemsSync,
        Self::SetItemsSync,
        Self::GetItemRawSync,
        Self::SetItemRawSync,
        Self::FlushSync,
    ];

    /// Operation name used in error messages.
    #[must_use]
    pub fn operation(self) -> &'static str {
        match self {
            Self::SetItem | Self::SetItemSync => "setItem",
            Self::RemoveItem | Self::RemoveItemSync => "removeItem",
            Self::Clear | Self::ClearSync => "clear",
            Self::GetMeta | Self::GetMetaSync => "getMeta",
            Self::GetItems | Self::GetItemsSync => "getItems",
            Self::SetItems | Self::SetItemsSync => "setItems",
            Self::GetItemRaw | Self::GetItemRawSync => "getItemRaw",
            Self::SetItemRaw | Self::SetItemRawSync => "setItemRaw",
            Self::Watch => "watch",
            Self::Dispose => "dispose",
            Self::Flush | Self::FlushSync => "flush",
            Self::HasItemSync => "hasItem",
            Self::GetItemSync => "getItem",
            Self::GetKeysSync => "getKeys",
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of optional operations a driver implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    /// No optional operations: a read-only, async-only driver.
    pub const NONE: Self = Self(0);

    /// Builds a set from a list of capabilities.
    #[must_use]
    pub fn of(capabilities: &[Capability]) -> Self {
        capabilities
            .iter()
            .fold(Self::NONE, |set, &capability| set.with(capability))
    }

    /// Every optional operation, async and sync.
    #[must_use]
    pub fn all() -> Self {
        Self::of(&Capability::ASYNC).union(Self::of(&Capability::SYNC))
    }

    /// Returns a copy with `capability` added.
    #[must_use]
    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    /// Returns a copy with `capability` removed.
    #[must_use]
    pub fn without(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bit())
    }

    /// Returns a copy with `capability` added when `condition` holds.
    #[must_use]
    pub fn with_if(self, capability: Capability, condition: bool) -> Self {
        if condition {
            self.with(capability)
        } else {
            self
        }
    }

    /// Union of two sets.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether `capability` is in the set.
    #[must_use]
    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }
}

/// Declarations of features a driver handles natively, letting the core
/// skip client-side emulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverFlags {
    /// `get_keys` honors [`GetKeysOptions::max_depth`].
    pub max_depth: bool,
    /// Writes honor [`TransactionOptions::ttl`].
    pub ttl: bool,
}

/// Per-call options forwarded to drivers.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Requested expiry. Only meaningful for drivers with [`DriverFlags::ttl`].
    pub ttl: Option<Duration>,
    /// `remove_item` also removes the key's metadata companion.
    pub remove_meta: bool,
    /// `get_meta` skips the metadata companion and reports native meta only.
    pub native_only: bool,
    /// Driver-specific options.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Options for `get_keys`.
#[derive(Debug, Clone, Default)]
pub struct GetKeysOptions {
    /// Maximum depth of returned keys below the listing base.
    pub max_depth: Option<usize>,
    /// Options forwarded to the driver.
    pub transaction: TransactionOptions,
}

impl GetKeysOptions {
    /// Options limiting listing to `depth` levels below the base.
    #[must_use]
    pub fn max_depth(depth: usize) -> Self {
        Self {
            max_depth: Some(depth),
            ..Self::default()
        }
    }
}

/// Kind of change reported to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    Update,
    Remove,
}

impl WatchEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

/// Change callback: `(event, key)`.
pub type WatchCallback = Arc<dyn Fn(WatchEvent, &str) + Send + Sync>;

/// Handle that cancels a native watch subscription when called.
pub struct Unwatch(Box<dyn FnOnce() + Send>);

impl Unwatch {
    /// Wraps the teardown closure.
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(teardown))
    }

    /// Cancels the subscription.
    pub fn call(self) {
        (self.0)();
    }
}

impl std::fmt::Debug for Unwatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unwatch").finish_non_exhaustive()
    }
}

/// A storage backend.
///
/// Keys passed to a driver are normalized and relative to the driver's
/// mount base. Values are driver-level strings (already encoded by the
/// façade) or raw bytes for the `*_raw` operations.
///
/// Used as `Arc<dyn Driver>`.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Short identifier used in logs and errors (e.g. `"memory"`).
    fn name(&self) -> &str;

    /// Optional operations this driver implements.
    fn capabilities(&self) -> Capabilities;

    /// Features handled natively.
    fn flags(&self) -> DriverFlags {
        DriverFlags::default()
    }

    // --- Required ---

    /// Whether `key` holds a value.
    async fn has_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool>;

    /// Stored string for `key`, or `None`.
    async fn get_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<String>>;

    /// Keys under `base`. Drivers may return keys outside `base`; the
    /// façade filters them.
    async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>>;

    // --- Optional ---

    async fn set_item(&self, _key: &str, _value: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::unsupported(self.name(), "setItem"))
    }

    async fn remove_item(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::unsupported(self.name(), "removeItem"))
    }

    async fn clear(&self, _base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::unsupported(self.name(), "clear"))
    }

    async fn get_meta(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        Err(StorageError::unsupported(self.name(), "getMeta"))
    }

    /// Values for several keys. Entries may come back in any order and are
    /// matched by key; missing keys may be omitted.
    async fn get_items(
        &self,
        _keys: &[String],
        _opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        Err(StorageError::unsupported(self.name(), "getItems"))
    }

    async fn set_items(&self, _items: &[(String, String)], _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::unsupported(self.name(), "setItems"))
    }

    async fn get_item_raw(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        Err(StorageError::unsupported(self.name(), "getItemRaw"))
    }

    async fn set_item_raw(&self, _key: &str, _value: &Bytes, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::unsupported(self.name(), "setItemRaw"))
    }

    /// Subscribes to native change notifications. Keys passed to the
    /// callback are relative to the driver.
    fn watch(&self, _callback: WatchCallback) -> StorageResult<Unwatch> {
        Err(StorageError::unsupported(self.name(), "watch"))
    }

    /// Releases resources. Buffering drivers flush first.
    async fn dispose(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Forces buffered writes through to the medium.
    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    // --- Synchronous twins ---

    fn has_item_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<bool> {
        Err(StorageError::sync_unsupported(self.name(), "hasItem"))
    }

    fn get_item_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<String>> {
        Err(StorageError::sync_unsupported(self.name(), "getItem"))
    }

    fn get_keys_sync(&self, _base: &str, _opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        Err(StorageError::sync_unsupported(self.name(), "getKeys"))
    }

    fn set_item_sync(&self, _key: &str, _value: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::sync_unsupported(self.name(), "setItem"))
    }

    fn remove_item_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::sync_unsupported(self.name(), "removeItem"))
    }

    fn clear_sync(&self, _base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::sync_unsupported(self.name(), "clear"))
    }

    fn get_meta_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        Err(StorageError::sync_unsupported(self.name(), "getMeta"))
    }

    fn get_items_sync(
        &self,
        _keys: &[String],
        _opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        Err(StorageError::sync_unsupported(self.name(), "getItems"))
    }

    fn set_items_sync(&self, _items: &[(String, String)], _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::sync_unsupported(self.name(), "setItems"))
    }

    fn get_item_raw_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        Err(StorageError::sync_unsupported(self.name(), "getItemRaw"))
    }

    fn set_item_raw_sync(&self, _key: &str, _value: &Bytes, _opts: &TransactionOptions) -> StorageResult<()> {
        Err(StorageError::sync_unsupported(self.name(), "setItemRaw"))
    }

    fn flush_sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Fails with [`StorageError::SyncUnsupported`] unless `driver` advertises
/// the synchronous `capability`.
pub(crate) fn require_sync(driver: &dyn Driver, capability: Capability) -> StorageResult<()> {
    if driver.capabilities().contains(capability) {
        Ok(())
    } else {
        Err(StorageError::sync_unsupported(driver.name(), capability.operation()))
    }
}
