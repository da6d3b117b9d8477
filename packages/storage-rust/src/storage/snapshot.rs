//! Export and import of a subtree as a key/value map.

use std::collections::BTreeMap;

use stowage_core::{normalize_base_key, StorageResult, Value};
use tracing::debug;

use super::Storage;
use crate::driver::{GetKeysOptions, TransactionOptions};

/// Reads every key under `base` into a map keyed by the key relative to
/// `base`. Keys whose value disappears or fails to decode mid-read are
/// left out.
///
/// # Errors
///
/// Propagates listing and read failures.
pub async fn snapshot(storage: &Storage, base: &str) -> StorageResult<BTreeMap<String, Value>> {
    let base = normalize_base_key(base);
    let keys = storage.get_keys(&base, &GetKeysOptions::default()).await?;
    let items = storage.get_items(&keys, &TransactionOptions::default()).await?;
    let snapshot: BTreeMap<String, Value> = items
        .into_iter()
        .filter_map(|(key, value)| {
            let relative = key.strip_prefix(base.as_str())?.to_string();
            Some((relative, value?))
        })
        .collect();
    debug!(base = %base, keys = snapshot.len(), "snapshot taken");
    Ok(snapshot)
}

/// Writes every entry of `snapshot` under `base`. Existing keys not in the
/// snapshot are left alone.
///
/// # Errors
///
/// Propagates encoding and write failures.
pub async fn restore_snapshot(storage: &Storage, snapshot: &BTreeMap<String, Value>, base: &str) -> StorageResult<()> {
    let base = normalize_base_key(base);
    let items: Vec<(String, Value)> = snapshot
        .iter()
        .map(|(key, value)| (format!("{base}{key}"), value.clone()))
        .collect();
    storage.set_items(items, &TransactionOptions::default()).await?;
    debug!(base = %base, keys = snapshot.len(), "snapshot restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::MockDriver;

    fn opts() -> TransactionOptions {
        TransactionOptions::default()
    }

    #[tokio::test]
    async fn snapshot_uses_relative_keys_across_mounts() {
        let storage = Storage::in_memory();
        storage.mount("app:cache", Arc::new(MockDriver::new())).unwrap();
        storage.set_item("app:name", "demo", &opts()).await.unwrap();
        storage.set_item("app:cache:hits", 3, &opts()).await.unwrap();
        storage.set_item("elsewhere", true, &opts()).await.unwrap();

        let snap = snapshot(&storage, "app").await.unwrap();
        assert_eq!(
            snap,
            BTreeMap::from([
                ("cache:hits".to_string(), Value::Int(3)),
                ("name".to_string(), Value::from("demo")),
            ])
        );
    }

    #[tokio::test]
    async fn restore_writes_under_a_new_base() {
        let source = Storage::in_memory();
        source.set_item("cfg:a", 1, &opts()).await.unwrap();
        source.set_item("cfg:b:c", Value::Null, &opts()).await.unwrap();
        let snap = snapshot(&source, "cfg").await.unwrap();

        let target = Storage::in_memory();
        target.set_item("copy:untouched", 0, &opts()).await.unwrap();
        restore_snapshot(&target, &snap, "copy").await.unwrap();

        assert_eq!(target.get_item("copy:a", &opts()).await.unwrap(), Some(Value::Int(1)));
        assert_eq!(target.get_item("copy:b:c", &opts()).await.unwrap(), Some(Value::Null));
        assert_eq!(target.get_item("copy:untouched", &opts()).await.unwrap(), Some(Value::Int(0)));
    }
}
