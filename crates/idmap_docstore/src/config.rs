//! Document store configuration.

/// Configuration for opening a document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Rewrite the journal as a snapshot after this many committed
    /// batches (0 = never compact automatically).
    pub compact_after_batches: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            compact_after_batches: 0,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic compaction threshold.
    #[must_use]
    pub const fn compact_after_batches(mut self, batches: u64) -> Self {
        self.compact_after_batches = batches;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.sync_on_commit);
        assert_eq!(config.compact_after_batches, 0);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .sync_on_commit(false)
            .compact_after_batches(64);

        assert!(!config.sync_on_commit);
        assert_eq!(config.compact_after_batches, 64);
    }
}
