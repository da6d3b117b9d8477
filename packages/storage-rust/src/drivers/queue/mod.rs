//! Write-buffering decorator around another [`Driver`].
//!
//! [`QueueDriver`] accepts writes into an in-memory queue keyed by driver
//! key and pushes them to the inner driver later, when one of these fires:
//!
//! 1. the flush timer (`flush_interval_ms` after the first unflushed write),
//! 2. the queue reaching `batch_size` (flushed immediately),
//! 3. the queue reaching `max_queue_size` (flushed and waited for),
//! 4. an explicit [`Driver::flush`] or [`Driver::dispose`].
//!
//! At most one flush is in flight. It runs as its own task, so it completes
//! even when every caller waiting on it gives up; concurrent callers await
//! the same shared result. Reads consult the queue, then the batch being
//! flushed, then the inner driver, so callers always see their own writes.
//! Synchronous writes bypass the queue entirely and evict any pending async
//! write for the same key. If an older write of that key is mid-flush, the
//! synchronous value is written again once the flush ends.

mod config;
mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{join_all, FutureExt};
use metrics::counter;
use parking_lot::Mutex;
use stowage_core::codec::deserialize_raw;
use stowage_core::key::filter_key_by_depth;
use stowage_core::{StorageError, StorageMeta, StorageResult};
use tracing::{debug, error, warn};

pub use self::config::QueueConfig;
use self::state::{Enqueued, FlushOutcome, QueueState, SharedFlush};
pub use self::state::{QueuedOperation, QueuedValue};
use crate::driver::{
    require_sync, Capabilities, Capability, Driver, DriverFlags, GetKeysOptions, TransactionOptions, Unwatch,
    WatchCallback,
};

/// What the queue knows about a key.
enum Pending {
    Set(QueuedValue),
    Removed,
    Unknown,
}

/// Buffers writes and flushes them to an inner driver in batches.
pub struct QueueDriver {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    inner: Arc<dyn Driver>,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl QueueDriver {
    /// Wraps `inner`. `config` is normalized so that
    /// `max_queue_size >= batch_size >= 1`.
    #[must_use]
    pub fn new(inner: Arc<dyn Driver>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                inner,
                config: config.normalized(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// The wrapped driver.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Driver> {
        &self.shared.inner
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Number of operations waiting to be flushed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether a flush is currently running.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().in_flight.is_some()
    }

    async fn enqueue(&self, key: &str, value: Option<QueuedValue>, opts: &TransactionOptions) -> StorageResult<()> {
        let config = &self.shared.config;
        let len = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(StorageError::Disposed {
                    driver: self.name().to_string(),
                });
            }
            match state.enqueue(key, value, opts.clone(), config.merge_updates) {
                Enqueued::Accepted(len) => len,
                Enqueued::Dropped => {
                    debug!(key, "key already queued; write dropped");
                    counter!("stowage_queue_dropped_total").increment(1);
                    return Ok(());
                }
            }
        };
        counter!("stowage_queue_enqueued_total").increment(1);

        if len >= config.max_queue_size {
            warn!(len, max_queue_size = config.max_queue_size, "queue full, forcing flush");
            // The first call may only join a flush that predates this write.
            self.shared.flush().await?;
            if self.pending_count() >= config.max_queue_size {
                self.shared.flush().await?;
            }
            return Ok(());
        }
        if len >= config.batch_size {
            debug!(len, "batch size reached");
            return self.shared.flush().await;
        }
        self.shared.schedule();
        Ok(())
    }

    fn pending(&self, key: &str) -> Pending {
        match self.shared.state.lock().lookup(key) {
            Some(op) => match &op.value {
                Some(value) => Pending::Set(value.clone()),
                None => Pending::Removed,
            },
            None => Pending::Unknown,
        }
    }

    /// Keys to add to and remove from an inner listing under `base`.
    fn pending_keys(&self, base: &str, opts: &GetKeysOptions) -> (Vec<String>, HashSet<String>) {
        let depth_limited = self.shared.inner.flags().max_depth;
        let state = self.shared.state.lock();
        let mut added = Vec::new();
        let mut removed = HashSet::new();
        for (key, op) in state.visible() {
            if !key.starts_with(base) {
                continue;
            }
            if op.is_remove() {
                removed.insert(key.clone());
            } else if !depth_limited || filter_key_by_depth(key, base, opts.max_depth) {
                added.push(key.clone());
            }
        }
        (added, removed)
    }

    fn merge_keys(&self, base: &str, opts: &GetKeysOptions, inner: Vec<String>) -> Vec<String> {
        let (added, removed) = self.pending_keys(base, opts);
        let mut seen = HashSet::new();
        inner
            .into_iter()
            .chain(added)
            .filter(|key| !removed.contains(key) && seen.insert(key.clone()))
            .collect()
    }

    /// Splits `keys` into answers known from the queue and keys that must
    /// be read from the inner driver.
    fn partition_reads(&self, keys: &[String]) -> (HashMap<String, Option<String>>, Vec<String>) {
        let state = self.shared.state.lock();
        let mut known = HashMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match state.lookup(key) {
                Some(op) => {
                    known.insert(key.clone(), op.value.as_ref().map(QueuedValue::to_text));
                }
                None => missing.push(key.clone()),
            }
        }
        (known, missing)
    }

    /// Records a synchronous write of `key` that went around the queue.
    fn supersede(&self, key: &str, value: Option<QueuedValue>, opts: &TransactionOptions) {
        self.shared.state.lock().supersede(key, value, opts.clone());
        debug!(key, "synchronous write bypassed the queue");
    }
}

impl QueueShared {
    /// Starts a flush, or joins the one in flight. Resolves immediately when
    /// there is nothing to do.
    async fn flush(self: &Arc<Self>) -> StorageResult<()> {
        match self.begin_flush() {
            Some(flush) => flush.await.map_err(StorageError::Flush),
            None => Ok(()),
        }
    }

    fn begin_flush(self: &Arc<Self>) -> Option<SharedFlush> {
        let mut state = self.state.lock();
        if let Some(in_flight) = &state.in_flight {
            return Some(in_flight.clone());
        }
        if state.queue.is_empty() {
            return None;
        }
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
        let ops = state.start_flush();
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = shared.apply(ops).await;
            shared.finish_flush();
            outcome
        });
        let shared = Arc::clone(self);
        let flush = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    shared.finish_flush();
                    Err(Arc::new(StorageError::from(anyhow::Error::from(err))))
                }
            }
        }
        .boxed()
        .shared();
        state.in_flight = Some(flush.clone());
        Some(flush)
    }

    fn finish_flush(self: &Arc<Self>) {
        let reschedule = {
            let mut state = self.state.lock();
            state.in_flight = None;
            let requeued = state.finish_flush();
            if requeued > 0 {
                debug!(requeued, "requeued writes made during the flush");
            }
            !state.queue.is_empty()
        };
        if reschedule {
            self.schedule();
        }
    }

    /// Arms the flush timer unless a timer or a flush is already pending.
    fn schedule(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.disposed || state.flush_timer.is_some() || state.in_flight.is_some() || state.queue.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        let delay = self.config.flush_interval();
        state.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.state.lock().flush_timer = None;
            if let Err(err) = shared.flush().await {
                error!(error = %err, "scheduled queue flush failed");
            }
        }));
    }

    async fn apply(&self, ops: Vec<QueuedOperation>) -> FlushOutcome {
        let total = ops.len();
        let (removes, sets): (Vec<_>, Vec<_>) = ops.into_iter().partition(QueuedOperation::is_remove);
        debug!(sets = sets.len(), removes = removes.len(), "flushing queue");

        let sets = self.live(sets);
        let set_result = self.apply_sets(&sets).await;
        let removes = self.live(removes);
        let remove_result = self.apply_removes(&removes).await;
        counter!("stowage_queue_flushed_total").increment(u64::try_from(total).unwrap_or(u64::MAX));
        set_result.and(remove_result).map_err(Arc::new)
    }

    /// Drops operations superseded since the flush started.
    fn live(&self, ops: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
        let state = self.state.lock();
        ops.into_iter().filter(|op| state.is_live(&op.key)).collect()
    }

    async fn apply_sets(&self, sets: &[QueuedOperation]) -> StorageResult<()> {
        if sets.is_empty() {
            return Ok(());
        }
        let batchable = sets.len() > 1
            && self.inner.capabilities().contains(Capability::SetItems)
            && sets.iter().all(|op| !op.is_raw() && plain(&op.options));
        if batchable {
            let items: Vec<(String, String)> = sets
                .iter()
                .filter_map(|op| op.value.as_ref().map(|v| (op.key.clone(), v.to_text())))
                .collect();
            match self.inner.set_items(&items, &TransactionOptions::default()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, items = items.len(), "batch write failed, retrying items individually");
                    counter!("stowage_queue_batch_fallback_total").increment(1);
                }
            }
        }
        let results = join_all(sets.iter().map(|op| self.apply_set(op))).await;
        first_failure(sets, results)
    }

    async fn apply_set(&self, op: &QueuedOperation) -> StorageResult<()> {
        let caps = self.inner.capabilities();
        match &op.value {
            Some(QueuedValue::Raw(bytes)) if caps.contains(Capability::SetItemRaw) => {
                self.inner.set_item_raw(&op.key, bytes, &op.options).await
            }
            Some(value) if caps.contains(Capability::SetItem) => {
                self.inner.set_item(&op.key, &value.to_text(), &op.options).await
            }
            _ => Ok(()),
        }
    }

    async fn apply_removes(&self, removes: &[QueuedOperation]) -> StorageResult<()> {
        if removes.is_empty() || !self.inner.capabilities().contains(Capability::RemoveItem) {
            return Ok(());
        }
        let results = join_all(
            removes
                .iter()
                .map(|op| self.inner.remove_item(&op.key, &op.options)),
        )
        .await;
        first_failure(removes, results)
    }

    /// Applies everything queued through the inner driver's synchronous
    /// methods. Nothing is drained unless every needed method exists.
    fn flush_sync(&self) -> StorageResult<()> {
        let inner = self.inner.as_ref();
        let ops = {
            let mut state = self.state.lock();
            for op in state.queue.values() {
                let needed = match &op.value {
                    None => Capability::RemoveItemSync,
                    Some(QueuedValue::Raw(_)) if inner.capabilities().contains(Capability::SetItemRawSync) => {
                        Capability::SetItemRawSync
                    }
                    Some(_) => Capability::SetItemSync,
                };
                require_sync(inner, needed)?;
            }
            if let Some(timer) = state.flush_timer.take() {
                timer.abort();
            }
            let ops = state.drain_ordered();
            for op in &ops {
                state.supersede(&op.key, op.value.clone(), op.options.clone());
            }
            ops
        };
        debug!(ops = ops.len(), "flushing queue synchronously");
        let mut results = Vec::with_capacity(ops.len());
        for op in &ops {
            results.push(match &op.value {
                None => inner.remove_item_sync(&op.key, &op.options),
                Some(QueuedValue::Raw(bytes)) if inner.capabilities().contains(Capability::SetItemRawSync) => {
                    inner.set_item_raw_sync(&op.key, bytes, &op.options)
                }
                Some(value) => inner.set_item_sync(&op.key, &value.to_text(), &op.options),
            });
        }
        first_failure(&ops, results)
    }
}

/// Options the batch write path can carry without losing information.
fn plain(opts: &TransactionOptions) -> bool {
    opts.ttl.is_none() && opts.extra.is_empty()
}

fn first_failure(ops: &[QueuedOperation], results: Vec<StorageResult<()>>) -> StorageResult<()> {
    let mut first = None;
    for (op, result) in ops.iter().zip(results) {
        if let Err(err) = result {
            error!(key = %op.key, error = %err, "queued write failed");
            counter!("stowage_queue_failed_total").increment(1);
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

#[async_trait]
impl Driver for QueueDriver {
    fn name(&self) -> &str {
        "queue"
    }

    fn capabilities(&self) -> Capabilities {
        let inner = self.shared.inner.capabilities();
        let writable = inner.contains(Capability::SetItem);
        let sync_flush =
            inner.contains(Capability::SetItemSync) && inner.contains(Capability::RemoveItemSync);
        let mirrored = [
            Capability::GetMeta,
            Capability::Watch,
            Capability::HasItemSync,
            Capability::GetItemSync,
            Capability::GetKeysSync,
            Capability::SetItemSync,
            Capability::RemoveItemSync,
            Capability::ClearSync,
            Capability::GetMetaSync,
            Capability::SetItemRawSync,
        ]
        .into_iter()
        .fold(Capabilities::NONE, |caps, cap| caps.with_if(cap, inner.contains(cap)));

        mirrored
            .with(Capability::Clear)
            .with(Capability::GetItems)
            .with(Capability::GetItemRaw)
            .with(Capability::Dispose)
            .with(Capability::Flush)
            .with_if(Capability::SetItem, writable)
            .with_if(Capability::SetItems, writable)
            .with_if(Capability::SetItemRaw, writable || inner.contains(Capability::SetItemRaw))
            .with_if(Capability::RemoveItem, inner.contains(Capability::RemoveItem))
            .with_if(Capability::GetItemsSync, inner.contains(Capability::GetItemSync))
            .with_if(Capability::SetItemsSync, inner.contains(Capability::SetItemSync))
            .with_if(
                Capability::GetItemRawSync,
                inner.contains(Capability::GetItemRawSync) || inner.contains(Capability::GetItemSync),
            )
            .with_if(Capability::FlushSync, sync_flush)
    }

    fn flags(&self) -> DriverFlags {
        self.shared.inner.flags()
    }

    async fn has_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        match self.pending(key) {
            Pending::Set(_) => Ok(true),
            Pending::Removed => Ok(false),
            Pending::Unknown => self.shared.inner.has_item(key, opts).await,
        }
    }

    async fn get_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<String>> {
        match self.pending(key) {
            Pending::Set(value) => Ok(Some(value.to_text())),
            Pending::Removed => Ok(None),
            Pending::Unknown => self.shared.inner.get_item(key, opts).await,
        }
    }

    async fn get_keys(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let inner = self.shared.inner.get_keys(base, opts).await?;
        Ok(self.merge_keys(base, opts, inner))
    }

    async fn set_item(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.enqueue(key, Some(QueuedValue::Text(value.to_string())), opts)
            .await
    }

    async fn remove_item(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        self.enqueue(key, None, opts).await
    }

    async fn clear(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        let dropped = self.shared.state.lock().discard_under(base);
        debug!(base, dropped, "clearing queue driver");
        let inner = &self.shared.inner;
        let caps = inner.capabilities();
        if caps.contains(Capability::Clear) {
            return inner.clear(base, opts).await;
        }
        if !caps.contains(Capability::RemoveItem) {
            return Ok(());
        }
        let keys = inner
            .get_keys(
                base,
                &GetKeysOptions {
                    max_depth: None,
                    transaction: opts.clone(),
                },
            )
            .await?;
        let results = join_all(
            keys.iter()
                .filter(|key| key.starts_with(base))
                .map(|key| inner.remove_item(key, opts)),
        )
        .await;
        results.into_iter().collect()
    }

    async fn get_meta(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        self.shared.inner.get_meta(key, opts).await
    }

    async fn get_items(
        &self,
        keys: &[String],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        let (mut known, missing) = self.partition_reads(keys);
        if !missing.is_empty() {
            let inner = &self.shared.inner;
            let fetched = if inner.capabilities().contains(Capability::GetItems) {
                inner.get_items(&missing, opts).await?
            } else {
                let values = futures_util::future::try_join_all(
                    missing.iter().map(|key| inner.get_item(key, opts)),
                )
                .await?;
                missing.iter().cloned().zip(values).collect()
            };
            known.extend(fetched);
        }
        Ok(keys
            .iter()
            .map(|key| (key.clone(), known.get(key).cloned().flatten()))
            .collect())
    }

    async fn set_items(&self, items: &[(String, String)], opts: &TransactionOptions) -> StorageResult<()> {
        for (key, value) in items {
            self.enqueue(key, Some(QueuedValue::Text(value.clone())), opts)
                .await?;
        }
        Ok(())
    }

    async fn get_item_raw(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        match self.pending(key) {
            Pending::Set(value) => Ok(Some(value.to_bytes()?)),
            Pending::Removed => Ok(None),
            Pending::Unknown => {
                let inner = &self.shared.inner;
                if inner.capabilities().contains(Capability::GetItemRaw) {
                    return inner.get_item_raw(key, opts).await;
                }
                match inner.get_item(key, opts).await? {
                    Some(text) => Ok(Some(deserialize_raw(&text).map_err(anyhow::Error::from)?)),
                    None => Ok(None),
                }
            }
        }
    }

    async fn set_item_raw(&self, key: &str, value: &Bytes, opts: &TransactionOptions) -> StorageResult<()> {
        self.enqueue(key, Some(QueuedValue::Raw(value.clone())), opts)
            .await
    }

    fn watch(&self, callback: WatchCallback) -> StorageResult<Unwatch> {
        self.shared.inner.watch(callback)
    }

    async fn dispose(&self) -> StorageResult<()> {
        {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.flush_timer.take() {
                timer.abort();
            }
            state.disposed = true;
        }
        // A running flush may predate writes still queued, so keep going
        // until nothing is queued or in flight.
        let mut flushed = Ok(());
        loop {
            if let Err(err) = self.shared.flush().await {
                error!(error = %err, "final queue flush failed");
                if flushed.is_ok() {
                    flushed = Err(err);
                }
            }
            let drained = {
                let state = self.shared.state.lock();
                state.queue.is_empty() && state.in_flight.is_none()
            };
            if drained {
                break;
            }
        }
        if self.shared.inner.capabilities().contains(Capability::Dispose) {
            self.shared.inner.dispose().await?;
        }
        flushed
    }

    async fn flush(&self) -> StorageResult<()> {
        self.shared.flush().await
    }

    // Synchronous reads see pending async writes; synchronous writes go
    // straight to the inner driver.

    fn has_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<bool> {
        match self.pending(key) {
            Pending::Set(_) => Ok(true),
            Pending::Removed => Ok(false),
            Pending::Unknown => self.shared.inner.has_item_sync(key, opts),
        }
    }

    fn get_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<String>> {
        match self.pending(key) {
            Pending::Set(value) => Ok(Some(value.to_text())),
            Pending::Removed => Ok(None),
            Pending::Unknown => self.shared.inner.get_item_sync(key, opts),
        }
    }

    fn get_keys_sync(&self, base: &str, opts: &GetKeysOptions) -> StorageResult<Vec<String>> {
        let inner = self.shared.inner.get_keys_sync(base, opts)?;
        Ok(self.merge_keys(base, opts, inner))
    }

    fn set_item_sync(&self, key: &str, value: &str, opts: &TransactionOptions) -> StorageResult<()> {
        require_sync(self.shared.inner.as_ref(), Capability::SetItemSync)?;
        self.shared.inner.set_item_sync(key, value, opts)?;
        self.supersede(key, Some(QueuedValue::Text(value.to_string())), opts);
        Ok(())
    }

    fn remove_item_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<()> {
        require_sync(self.shared.inner.as_ref(), Capability::RemoveItemSync)?;
        self.shared.inner.remove_item_sync(key, opts)?;
        self.supersede(key, None, opts);
        Ok(())
    }

    fn clear_sync(&self, base: &str, opts: &TransactionOptions) -> StorageResult<()> {
        require_sync(self.shared.inner.as_ref(), Capability::ClearSync)?;
        self.shared.state.lock().discard_under(base);
        self.shared.inner.clear_sync(base, opts)
    }

    fn get_meta_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<StorageMeta>> {
        self.shared.inner.get_meta_sync(key, opts)
    }

    fn get_items_sync(
        &self,
        keys: &[String],
        opts: &TransactionOptions,
    ) -> StorageResult<Vec<(String, Option<String>)>> {
        require_sync(self.shared.inner.as_ref(), Capability::GetItemSync)?;
        keys.iter()
            .map(|key| Ok((key.clone(), self.get_item_sync(key, opts)?)))
            .collect()
    }

    fn set_items_sync(&self, items: &[(String, String)], opts: &TransactionOptions) -> StorageResult<()> {
        require_sync(self.shared.inner.as_ref(), Capability::SetItemSync)?;
        for (key, value) in items {
            self.set_item_sync(key, value, opts)?;
        }
        Ok(())
    }

    fn get_item_raw_sync(&self, key: &str, opts: &TransactionOptions) -> StorageResult<Option<Bytes>> {
        match self.pending(key) {
            Pending::Set(value) => Ok(Some(value.to_bytes()?)),
            Pending::Removed => Ok(None),
            Pending::Unknown => {
                let inner = &self.shared.inner;
                if inner.capabilities().contains(Capability::GetItemRawSync) {
                    return inner.get_item_raw_sync(key, opts);
                }
                match inner.get_item_sync(key, opts)? {
                    Some(text) => Ok(Some(deserialize_raw(&text).map_err(anyhow::Error::from)?)),
                    None => Ok(None),
                }
            }
        }
    }

    fn set_item_raw_sync(&self, key: &str, value: &Bytes, opts: &TransactionOptions) -> StorageResult<()> {
        require_sync(self.shared.inner.as_ref(), Capability::SetItemRawSync)?;
        self.shared.inner.set_item_raw_sync(key, value, opts)?;
        self.supersede(key, Some(QueuedValue::Raw(value.clone())), opts);
        Ok(())
    }

    fn flush_sync(&self) -> StorageResult<()> {
        self.shared.flush_sync()
    }
}
