use std::time::Duration;

/// Configuration for the persistent index.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum in-memory size of the active index segment before a new
    /// segment is started (default: 20MB)
    pub index_max_memory_size_bytes: u64,

    /// Maximum number of entries in the active index segment before a new
    /// segment is started. Also bounds the journal, which keeps the journal
    /// at least as long as the active segment (default: 10000)
    pub index_max_number_of_inmem_elements: usize,

    /// Number of recent (offset, key) insertions the journal retains.
    /// Scans resuming behind this window fall back to a segment walk
    /// (default: 10000)
    pub journal_max_entries: usize,

    /// Maximum number of entries a single journal query returns
    /// (default: 5000)
    pub max_entries_to_return_from_journal: usize,

    /// Delay before the first background index flush (default: 60s)
    pub data_flush_delay: Duration,

    /// How often the background persistor flushes the index (default: 60s)
    pub data_flush_interval: Duration,

    /// Target false positive rate for segment bloom filters (default: 0.01)
    pub bloom_false_positive_rate: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index_max_memory_size_bytes: 20 * 1024 * 1024, // 20MB
            index_max_number_of_inmem_elements: 10_000,
            journal_max_entries: 10_000,
            max_entries_to_return_from_journal: 5_000,
            data_flush_delay: Duration::from_secs(60),
            data_flush_interval: Duration::from_secs(60),
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum in-memory segment size in bytes
    pub fn index_max_memory_size_bytes(mut self, size: u64) -> Self {
        self.index_max_memory_size_bytes = size;
        self
    }

    /// Set the maximum number of entries in the active segment and journal
    pub fn index_max_number_of_inmem_elements(mut self, count: usize) -> Self {
        self.index_max_number_of_inmem_elements = count;
        self
    }

    /// Set the journal retention window
    pub fn journal_max_entries(mut self, count: usize) -> Self {
        self.journal_max_entries = count;
        self
    }

    /// Set the maximum number of entries returned from a journal query
    pub fn max_entries_to_return_from_journal(mut self, count: usize) -> Self {
        self.max_entries_to_return_from_journal = count;
        self
    }

    /// Set the delay before the first background flush
    pub fn data_flush_delay(mut self, delay: Duration) -> Self {
        self.data_flush_delay = delay;
        self
    }

    /// Set the background flush interval
    pub fn data_flush_interval(mut self, interval: Duration) -> Self {
        self.data_flush_interval = interval;
        self
    }

    /// Set the bloom filter false positive rate
    pub fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.index_max_memory_size_bytes, 20 * 1024 * 1024);
        assert_eq!(config.index_max_number_of_inmem_elements, 10_000);
        assert_eq!(config.max_entries_to_return_from_journal, 5_000);
        assert_eq!(config.data_flush_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new()
            .index_max_memory_size_bytes(1024)
            .index_max_number_of_inmem_elements(2)
            .data_flush_delay(Duration::from_millis(5))
            .data_flush_interval(Duration::from_millis(10));

        assert_eq!(config.index_max_memory_size_bytes, 1024);
        assert_eq!(config.index_max_number_of_inmem_elements, 2);
        assert_eq!(config.data_flush_delay, Duration::from_millis(5));
        assert_eq!(config.data_flush_interval, Duration::from_millis(10));
    }
}
