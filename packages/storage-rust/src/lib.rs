//! `Stowage`: mountable key-value storage.
//!
//! A [`Storage`] presents one colon-delimited key space over any number of
//! [`Driver`]s mounted at key prefixes. Values are structured
//! [`Value`]s encoded by the core codec; drivers only ever see strings (or
//! raw bytes, when they support them).
//!
//! - [`mount`]: longest-prefix routing of keys to drivers
//! - [`storage`]: the async and blocking façade
//! - [`watch`]: change notifications across mounts
//! - [`drivers`]: memory, filesystem, null, and the write-batching queue
//! - [`migration`]: versioned schema migrations

pub mod builder;
pub mod driver;
pub mod drivers;
pub mod migration;
pub mod mount;
pub mod storage;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::StorageBuilder;
pub use driver::{
    Capabilities, Capability, Driver, DriverFlags, GetKeysOptions, TransactionOptions, Unwatch, WatchCallback,
    WatchEvent,
};
pub use drivers::{FsDriver, FsDriverConfig, MemoryDriver, NullDriver, QueueConfig, QueueDriver};
pub use migration::{current_version, MigrationReport, Migrator, VERSION_KEY};
pub use mount::{MountPoint, MountRegistry};
pub use storage::{restore_snapshot, snapshot, PrefixStorage, Storage};
pub use stowage_core::{normalize_base_key, normalize_key, StorageError, StorageMeta, StorageResult, Value};
pub use watch::{WatchHandle, WatchHub};
