//! Pending-operation bookkeeping for the queue driver.

use std::collections::HashMap;
use std::mem;

use bytes::Bytes;
use futures_util::future::{BoxFuture, Shared};
use stowage_core::codec::{deserialize_raw, serialize_raw};
use stowage_core::{LogicalClock, StorageError, Timestamp};
use tokio::task::JoinHandle;

use crate::driver::TransactionOptions;

/// Outcome of a flush, shared by every caller awaiting it.
pub(crate) type FlushOutcome = Result<(), std::sync::Arc<StorageError>>;

/// Handle to the single in-flight flush.
pub(crate) type SharedFlush = Shared<BoxFuture<'static, FlushOutcome>>;

/// Payload of a queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedValue {
    Text(String),
    Raw(Bytes),
}

impl QueuedValue {
    /// String form as a text driver would store it.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Raw(bytes) => serialize_raw(bytes),
        }
    }

    /// Byte form as a raw read would return it.
    ///
    /// # Errors
    ///
    /// Fails when a text value carries a malformed base64 frame.
    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        match self {
            Self::Text(text) => Ok(deserialize_raw(text)?),
            Self::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

/// A write waiting to be flushed to the inner driver.
#[derive(Debug, Clone)]
pub struct QueuedOperation {
    pub key: String,
    /// `None` for a removal.
    pub value: Option<QueuedValue>,
    pub options: TransactionOptions,
    pub timestamp: Timestamp,
}

impl QueuedOperation {
    #[must_use]
    pub fn is_remove(&self) -> bool {
        self.value.is_none()
    }

    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self.value, Some(QueuedValue::Raw(_)))
    }
}

/// Result of offering an operation to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    /// Accepted; the queue now holds this many operations.
    Accepted(usize),
    /// An earlier write for the key is kept because merging is disabled.
    Dropped,
}

/// Mutable queue state, guarded by the driver's mutex.
#[derive(Default)]
pub(crate) struct QueueState {
    pub queue: HashMap<String, QueuedOperation>,
    /// Operations drained by the running flush, still visible to reads.
    pub flushing: HashMap<String, QueuedOperation>,
    /// Writes that bypassed the queue while an older write of the same key
    /// was being flushed. They are queued again once that flush ends.
    pub superseded: HashMap<String, QueuedOperation>,
    pub flush_timer: Option<JoinHandle<()>>,
    pub in_flight: Option<SharedFlush>,
    pub disposed: bool,
    clock: LogicalClock,
}

impl QueueState {
    /// Stamps and records an operation. With `merge` set, a later write to
    /// a queued key replaces the earlier one; otherwise the earlier one is
    /// kept and the new one dropped.
    pub fn enqueue(
        &mut self,
        key: &str,
        value: Option<QueuedValue>,
        options: TransactionOptions,
        merge: bool,
    ) -> Enqueued {
        if !merge && self.queue.contains_key(key) {
            return Enqueued::Dropped;
        }
        let timestamp = self.clock.now();
        self.queue.insert(
            key.to_string(),
            QueuedOperation {
                key: key.to_string(),
                value,
                options,
                timestamp,
            },
        );
        Enqueued::Accepted(self.queue.len())
    }

    /// The newest operation for `key`: queued first, then in flight.
    pub fn lookup(&self, key: &str) -> Option<&QueuedOperation> {
        self.queue.get(key).or_else(|| self.flushing.get(key))
    }

    /// Every operation a read should see, newest winning per key.
    pub fn visible(&self) -> impl Iterator<Item = (&String, &QueuedOperation)> + '_ {
        self.queue.iter().chain(
            self.flushing
                .iter()
                .filter(|(key, _)| !self.queue.contains_key(*key)),
        )
    }

    /// Records that `key` was written around the queue. When an older
    /// write of the key is in flight, `value` is remembered so it can be
    /// replayed after that flush and win over the stale write.
    pub fn supersede(&mut self, key: &str, value: Option<QueuedValue>, options: TransactionOptions) {
        self.queue.remove(key);
        if self.flushing.remove(key).is_none() && !self.superseded.contains_key(key) {
            return;
        }
        let timestamp = self.clock.now();
        self.superseded.insert(
            key.to_string(),
            QueuedOperation {
                key: key.to_string(),
                value,
                options,
                timestamp,
            },
        );
    }

    /// Whether the in-flight operation for `key` should still be applied.
    pub fn is_live(&self, key: &str) -> bool {
        self.flushing.contains_key(key)
    }

    /// Drops pending operations for every key under `base`. In-flight
    /// writes under `base` are superseded by removals.
    pub fn discard_under(&mut self, base: &str) -> usize {
        let before = self.queue.len();
        self.queue.retain(|key, _| !key.starts_with(base));
        let dropped = before - self.queue.len();
        let in_flight: Vec<String> = self
            .flushing
            .keys()
            .chain(self.superseded.keys())
            .filter(|key| key.starts_with(base))
            .cloned()
            .collect();
        for key in in_flight {
            self.supersede(&key, None, TransactionOptions::default());
        }
        dropped
    }

    /// Moves the queue into the in-flight set and returns its operations,
    /// oldest first.
    pub fn start_flush(&mut self) -> Vec<QueuedOperation> {
        let ops = self.drain_ordered();
        self.flushing = ops.iter().map(|op| (op.key.clone(), op.clone())).collect();
        ops
    }

    /// Clears the in-flight set and requeues writes that superseded it,
    /// unless a newer write for the key is already queued. Returns how many
    /// were requeued.
    pub fn finish_flush(&mut self) -> usize {
        self.flushing.clear();
        let mut requeued = 0;
        for (key, mut op) in mem::take(&mut self.superseded) {
            if self.queue.contains_key(&key) {
                continue;
            }
            op.timestamp = self.clock.now();
            self.queue.insert(key, op);
            requeued += 1;
        }
        requeued
    }

    /// Empties the queue, oldest operation first.
    pub fn drain_ordered(&mut self) -> Vec<QueuedOperation> {
        let mut ops: Vec<QueuedOperation> = self.queue.drain().map(|(_, op)| op).collect();
        ops.sort_by_key(|op| op.timestamp);
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Option<QueuedValue> {
        Some(QueuedValue::Text(value.to_string()))
    }

    #[test]
    fn merge_keeps_last_write() {
        let mut state = QueueState::default();
        assert_eq!(state.enqueue("k", text("1"), TransactionOptions::default(), true), Enqueued::Accepted(1));
        assert_eq!(state.enqueue("k", text("2"), TransactionOptions::default(), true), Enqueued::Accepted(1));
        assert_eq!(state.lookup("k").unwrap().value, text("2"));
    }

    #[test]
    fn without_merge_first_write_wins() {
        let mut state = QueueState::default();
        state.enqueue("k", text("1"), TransactionOptions::default(), false);
        assert_eq!(state.enqueue("k", None, TransactionOptions::default(), false), Enqueued::Dropped);
        assert_eq!(state.lookup("k").unwrap().value, text("1"));
    }

    #[test]
    fn drain_is_timestamp_ordered() {
        let mut state = QueueState::default();
        for key in ["c", "a", "b", "a"] {
            state.enqueue(key, text(key), TransactionOptions::default(), true);
        }
        let keys: Vec<_> = state.drain_ordered().into_iter().map(|op| op.key).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn discard_under_base() {
        let mut state = QueueState::default();
        for key in ["a:1", "a:2", "b:1"] {
            state.enqueue(key, text("v"), TransactionOptions::default(), true);
        }
        assert_eq!(state.discard_under("a:"), 2);
        assert!(state.lookup("b:1").is_some());
        state.supersede("b:1", None, TransactionOptions::default());
        assert!(state.queue.is_empty());
        assert!(state.superseded.is_empty());
    }

    #[test]
    fn raw_values_convert_both_ways() {
        let raw = QueuedValue::Raw(Bytes::from_static(b"\x00\x01"));
        let framed = raw.to_text();
        assert!(framed.starts_with("base64:"));
        assert_eq!(QueuedValue::Text(framed).to_bytes().unwrap(), Bytes::from_static(b"\x00\x01"));
    }

    #[test]
    fn in_flight_ops_stay_visible_until_finished() {
        let mut state = QueueState::default();
        state.enqueue("k", text("old"), TransactionOptions::default(), true);
        let ops = state.start_flush();
        assert_eq!(ops.len(), 1);
        assert!(state.queue.is_empty());
        assert_eq!(state.lookup("k").unwrap().value, text("old"));

        state.enqueue("k", text("new"), TransactionOptions::default(), true);
        assert_eq!(state.lookup("k").unwrap().value, text("new"));
        assert_eq!(state.visible().count(), 1);

        assert_eq!(state.finish_flush(), 0);
        assert!(state.flushing.is_empty());
        assert_eq!(state.lookup("k").unwrap().value, text("new"));
    }

    #[test]
    fn superseded_in_flight_write_is_requeued() {
        let mut state = QueueState::default();
        state.enqueue("k", text("async"), TransactionOptions::default(), true);
        state.enqueue("other", text("v"), TransactionOptions::default(), true);
        state.start_flush();

        state.supersede("k", text("sync"), TransactionOptions::default());
        assert!(!state.is_live("k"));
        assert!(state.is_live("other"));
        assert!(state.lookup("k").is_none());

        assert_eq!(state.finish_flush(), 1);
        assert_eq!(state.lookup("k").unwrap().value, text("sync"));
        assert!(state.superseded.is_empty());
    }

    #[test]
    fn clearing_supersedes_in_flight_writes_with_removals() {
        let mut state = QueueState::default();
        state.enqueue("a:1", text("v"), TransactionOptions::default(), true);
        state.start_flush();
        state.enqueue("a:2", text("v"), TransactionOptions::default(), true);

        assert_eq!(state.discard_under("a:"), 1);
        assert!(!state.is_live("a:1"));
        assert_eq!(state.finish_flush(), 1);
        assert!(state.lookup("a:1").unwrap().value.is_none());
    }
}
