use std::time::Duration;

/// Tuning for [`QueueDriver`](super::QueueDriver).
///
/// Controls when buffered writes are pushed to the inner driver and how
/// repeated writes to the same key are coalesced.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue length that triggers an immediate flush.
    pub batch_size: usize,
    /// Delay before a scheduled flush runs, in milliseconds.
    pub flush_interval_ms: u64,
    /// Hard cap on queue length; reaching it forces a flush and waits for
    /// it. Clamped to at least `batch_size`.
    pub max_queue_size: usize,
    /// Later writes to a queued key replace the earlier one. When disabled,
    /// the first queued write for a key wins until it is flushed.
    pub merge_updates: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1000,
            max_queue_size: 1000,
            merge_updates: true,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Applies the invariants `batch_size >= 1` and
    /// `max_queue_size >= batch_size`.
    #[must_use]
    pub(crate) fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_queue_size = self.max_queue_size.max(self.batch_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.max_queue_size, 1000);
        assert!(config.merge_updates);
    }

    #[test]
    fn max_queue_size_is_clamped_to_batch_size() {
        let config = QueueConfig {
            batch_size: 50,
            max_queue_size: 10,
            ..QueueConfig::default()
        }
        .normalized();
        assert_eq!(config.max_queue_size, 50);

        let config = QueueConfig {
            batch_size: 0,
            max_queue_size: 0,
            ..QueueConfig::default()
        }
        .normalized();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_queue_size, 1);
    }
}
