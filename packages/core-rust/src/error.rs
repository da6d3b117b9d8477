//! Storage error types.

use std::sync::Arc;

/// Errors surfaced by storage operations, drivers, and migrations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A key was rejected before it reached the storage medium.
    #[error("invalid key \"{key}\": {reason}")]
    InvalidKey { key: String, reason: String },

    /// A driver was constructed with missing or invalid options.
    #[error("driver `{driver}` misconfigured: {reason}")]
    DriverConfig { driver: String, reason: String },

    /// A synchronous call reached a driver without the matching sync method.
    #[error("driver `{driver}` does not support synchronous {operation}")]
    SyncUnsupported {
        driver: String,
        operation: &'static str,
    },

    /// An optional async method was invoked on a driver that lacks it.
    #[error("driver `{driver}` does not implement {operation}")]
    Unsupported {
        driver: String,
        operation: &'static str,
    },

    /// A value could not be encoded for storage.
    #[error("cannot serialize value for key \"{key}\": {reason}")]
    Serialization { key: String, reason: String },

    /// The key is not under any mount and no root driver is mounted.
    #[error("no driver mounted for key \"{key}\" and no root driver configured")]
    NoRootDriver { key: String },

    /// A second driver was mounted at an occupied base.
    #[error("a driver is already mounted at \"{base}\"")]
    DuplicateMount { base: String },

    /// A migration step or the version bookkeeping failed.
    #[error("migration from version {from} to {to} failed")]
    Migration {
        from: u32,
        to: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The driver has been disposed and accepts no further writes.
    #[error("driver `{driver}` has been disposed")]
    Disposed { driver: String },

    /// A shared queue flush failed; every waiter receives the same cause.
    #[error("queued flush failed: {0}")]
    Flush(#[source] Arc<StorageError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

impl StorageError {
    /// Shorthand for [`StorageError::InvalidKey`].
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`StorageError::SyncUnsupported`].
    pub fn sync_unsupported(driver: impl Into<String>, operation: &'static str) -> Self {
        Self::SyncUnsupported {
            driver: driver.into(),
            operation,
        }
    }

    /// Shorthand for [`StorageError::Unsupported`].
    pub fn unsupported(driver: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            driver: driver.into(),
            operation,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
