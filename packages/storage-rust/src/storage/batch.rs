//! Multi-key operations.
//!
//! Keys are grouped by owning mount (groups in first-seen order). A group is
//! sent to the driver's native batch method when it has one; otherwise each
//! key is issued individually and concurrently. Results always come back in
//! the caller's order.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use stowage_core::{normalize_key, StorageResult, Value};

use super::{decode, encode, Storage};
use crate::driver::{require_sync, Capability, Driver, TransactionOptions, WatchEvent};

/// Keys (with a per-key payload) owned by one mount.
struct Group<T> {
    base: String,
    driver: Arc<dyn Driver>,
    entries: Vec<Entry<T>>,
}

struct Entry<T> {
    /// Position in the caller's input.
    index: usize,
    key: String,
    relative_key: String,
    payload: T,
}

impl<T> Group<T> {
    fn relative_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.relative_key.clone()).collect()
    }
}

impl Storage {
    fn group_by_mount<T>(&self, items: Vec<(String, T)>) -> StorageResult<Vec<Group<T>>> {
        let registry = self.registry();
        let mut groups: Vec<Group<T>> = Vec::new();
        for (index, (key, payload)) in items.into_iter().enumerate() {
            let key = normalize_key(&key);
            let mount = registry.resolve(&key)?;
            let entry = Entry {
                index,
                key,
                relative_key: mount.relative_key,
                payload,
            };
            match groups.iter_mut().find(|g| g.base == mount.base) {
                Some(group) => group.entries.push(entry),
                None => groups.push(Group {
                    base: mount.base,
                    driver: mount.driver,
                    entries: vec![entry],
                }),
            }
        }
        Ok(groups)
    }

    /// Reads driver-level strings for `keys`, in input order.
    async fn fetch_many(&self, keys: Vec<String>, opts: &TransactionOptions) -> StorageResult<Vec<(String, Option<String>)>> {
        let total = keys.len();
        let groups = self.group_by_mount(keys.into_iter().map(|k| (k, ())).collect())?;
        let fetched = try_join_all(groups.iter().map(|group| fetch_group(group, opts))).await?;

        let mut slots: Vec<Option<(String, Option<String>)>> = vec![None; total];
        for (index, key, value) in fetched.into_iter().flatten() {
            slots[index] = Some((key, value));
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Reads and decodes several keys. The result lists every requested key
    /// in request order; missing or undecodable values are `None`.
    ///
    /// # Errors
    ///
    /// Routing and driver failures.
    pub async fn get_items<K: AsRef<str>>(
        &self,
        keys: &[K],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<Value>)>> {
        let keys = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let fetched = self.fetch_many(keys, opts).await?;
        Ok(fetched
            .into_iter()
            .map(|(key, text)| {
                let value = text.and_then(|text| decode(&key, &text));
                (key, value)
            })
            .collect())
    }

    /// Encodes and writes several values. [`Value::Undefined`] entries
    /// remove their key.
    ///
    /// Every value is encoded before any driver is called, so a
    /// serialization error leaves storage untouched.
    ///
    /// # Errors
    ///
    /// Serialization, routing and driver failures.
    pub async fn set_items<K, V, I>(&self, items: I, opts: &TransactionOptions) -> StorageResult<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (writes, removals) = encode_all(items)?;
        let groups = self.group_by_mount(writes)?;
        try_join_all(groups.iter().map(|group| self.write_group(group, opts))).await?;
        for key in removals {
            self.remove_item(&key, opts).await?;
        }
        Ok(())
    }

    async fn write_group(&self, group: &Group<String>, opts: &TransactionOptions) -> StorageResult<()> {
        let caps = group.driver.capabilities();
        if !caps.contains(Capability::SetItem) {
            return Ok(());
        }
        if caps.contains(Capability::SetItems) {
            let items: Vec<(String, String)> = group
                .entries
                .iter()
                .map(|e| (e.relative_key.clone(), e.payload.clone()))
                .collect();
            group.driver.set_items(&items, opts).await?;
        } else {
            try_join_all(
                group
                    .entries
                    .iter()
                    .map(|e| group.driver.set_item(&e.relative_key, &e.payload, opts)),
            )
            .await?;
        }
        for entry in &group.entries {
            self.notify(group.driver.as_ref(), WatchEvent::Update, &entry.key);
        }
        Ok(())
    }

    /// Blocking [`get_items`](Self::get_items).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncUnsupported`](stowage_core::StorageError::SyncUnsupported) if a resolved driver has
    /// neither `get_items_sync` nor `get_item_sync`.
    pub fn get_items_sync<K: AsRef<str>>(
        &self,
        keys: &[K],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<Value>)>> {
        let total = keys.len();
        let items = keys.iter().map(|k| (k.as_ref().to_string(), ())).collect();
        let groups = self.group_by_mount(items)?;

        let mut slots: Vec<Option<(String, Option<Value>)>> = vec![None; total];
        for group in &groups {
            let caps = group.driver.capabilities();
            let values: Vec<Option<String>> = if caps.contains(Capability::GetItemsSync) {
                let found: HashMap<String, Option<String>> = group
                    .driver
                    .get_items_sync(&group.relative_keys(), opts)?
                    .into_iter()
                    .collect();
                group
                    .entries
                    .iter()
                    .map(|e| found.get(&e.relative_key).cloned().flatten())
                    .collect()
            } else {
                require_sync(group.driver.as_ref(), Capability::GetItemSync)?;
                group
                    .entries
                    .iter()
                    .map(|e| group.driver.get_item_sync(&e.relative_key, opts))
                    .collect::<StorageResult<_>>()?
            };
            for (entry, text) in group.entries.iter().zip(values) {
                let value = text.and_then(|text| decode(&entry.key, &text));
                slots[entry.index] = Some((entry.key.clone(), value));
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Blocking [`set_items`](Self::set_items).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SyncUnsupported`](stowage_core::StorageError::SyncUnsupported) if a writable driver has
    /// neither `set_items_sync` nor `set_item_sync`.
    pub fn set_items_sync<K, V, I>(&self, items: I, opts: &TransactionOptions) -> StorageResult<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (writes, removals) = encode_all(items)?;
        let groups = self.group_by_mount(writes)?;
        for group in &groups {
            let caps = group.driver.capabilities();
            if !caps.contains(Capability::SetItem) && !caps.contains(Capability::SetItemSync) {
                continue;
            }
            if caps.contains(Capability::SetItemsSync) {
                let items: Vec<(String, String)> = group
                    .entries
                    .iter()
                    .map(|e| (e.relative_key.clone(), e.payload.clone()))
                    .collect();
                group.driver.set_items_sync(&items, opts)?;
            } else {
                require_sync(group.driver.as_ref(), Capability::SetItemSync)?;
                for entry in &group.entries {
                    group.driver.set_item_sync(&entry.relative_key, &entry.payload, opts)?;
                }
            }
            for entry in &group.entries {
                self.notify(group.driver.as_ref(), WatchEvent::Update, &entry.key);
            }
        }
        for key in removals {
            self.remove_item_sync(&key, opts)?;
        }
        Ok(())
    }
}

/// Splits input into encoded writes and keys to remove.
fn encode_all<K, V, I>(items: I) -> StorageResult<(Vec<(String, String)>, Vec<String>)>
where
    K: AsRef<str>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut writes = Vec::new();
    let mut removals = Vec::new();
    for (key, value) in items {
        let key = normalize_key(key.as_ref());
        let value = value.into();
        if value.is_undefined() {
            removals.push(key);
        } else {
            let text = encode(&key, &value)?;
            writes.push((key, text));
        }
    }
    Ok((writes, removals))
}

async fn fetch_group(
    group: &Group<()>,
    opts: &TransactionOptions,
) -> StorageResult<Vec<(usize, String, Option<String>)>> {
    let values: Vec<Option<String>> = if group.driver.capabilities().contains(Capability::GetItems) {
        let found: HashMap<String, Option<String>> = group
            .driver
            .get_items(&group.relative_keys(), opts)
            .await?
            .into_iter()
            .collect();
        group
            .entries
            .iter()
            .map(|e| found.get(&e.relative_key).cloned().flatten())
            .collect()
    } else {
        try_join_all(
            group
                .entries
                .iter()
                .map(|e| group.driver.get_item(&e.relative_key, opts)),
        )
        .await?
    };
    Ok(group
        .entries
        .iter()
        .zip(values)
        .map(|(e, value)| (e.index, e.key.clone(), value))
        .collect())
}
