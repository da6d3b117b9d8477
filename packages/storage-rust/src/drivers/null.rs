//! No-op [`Driver`] implementation.
//!
//! [`NullDriver`] discards all writes and returns empty results for reads.
//! Useful for tests, benchmarks, and mounting a sink under a prefix whose
//! data should never be kept.

use async_trait::async_trait;
use stowage_core::StorageResult;

use crate::driver::{Capabilities, Capability, Driver, GetKeysOptions, TransactionOptions};

/// Driver that stores nothing.
///
/// All writes succeed immediately without side effects; all reads come back
/// empty. Both async and sync forms are supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDriver;

#[async_trait]
impl Driver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::of(&[
            Capability::SetItem,
            Capability::RemoveItem,
            Capability::Clear,
            Capability::HasItemSync,
            Capability::GetItemSync,
            Capability::GetKeysSync,
            Capability::SetItemSync,
            Capability::RemoveItemSync,
            Capability::ClearSync,
        ])
    }

    async fn has_item(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<bool> {
        Ok(false)
    }

    async fn get_item(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<String>> {
        Ok(None)
    }

    async fn get_keys(&self, _base: &str, _opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn set_item(&self, _key: &str, _value: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Ok(())
    }

    async fn remove_item(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Ok(())
    }

    async fn clear(&self, _base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Ok(())
    }

    fn has_item_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<bool> {
        Ok(false)
    }

    fn get_item_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<Option<String>> {
        Ok(None)
    }

    fn get_keys_sync(&self, _base: &str, _opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn set_item_sync(&self, _key: &str, _value: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Ok(())
    }

    fn remove_item_sync(&self, _key: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Ok(())
    }

    fn clear_sync(&self, _base: &str, _opts: &TransactionOptions) -> StorageResult<()> {
        Ok(())
    }
}
