//! Read-only query-start configuration (spec.md §6).
//!
//! Mirrors the builder style of `datafusion::prelude::SessionConfig`: a
//! plain struct with a `Default` impl and `with_*` setters.

#[derive(Debug, Clone)]
pub struct AqseConfig {
    /// Gate for the whole system; off ⇒ the stage planner is the identity
    /// transform.
    pub adaptive_execution_enabled: bool,
    /// Enables `OptimizeJoin` (spec.md §4.6).
    pub adaptive_join_enabled: bool,
    /// Enables `HandleSkewedJoin` (spec.md §4.7).
    pub adaptive_skewed_join_enabled: bool,
    /// Byte target per coalesced post-shuffle partition.
    pub target_post_shuffle_input_size: u64,
    /// Optional row target per coalesced post-shuffle partition.
    pub adaptive_target_post_shuffle_row_count: Option<u64>,
    /// Optional lower bound on the number of coalesced groups.
    pub min_num_post_shuffle_partitions: Option<usize>,
    /// Broadcast-promotion cutoff, in bytes.
    pub adaptive_broadcast_join_threshold: i64,
    /// Skew detection multiplier over the median.
    pub adaptive_skewed_factor: f64,
    /// Absolute byte floor for skew detection.
    pub adaptive_skewed_size_threshold: u64,
    /// Absolute row-count floor for skew detection.
    pub adaptive_skewed_row_count_threshold: u64,
}

impl Default for AqseConfig {
    fn default() -> Self {
        Self {
            adaptive_execution_enabled: true,
            adaptive_join_enabled: true,
            adaptive_skewed_join_enabled: true,
            target_post_shuffle_input_size: 64 * 1024 * 1024,
            adaptive_target_post_shuffle_row_count: None,
            min_num_post_shuffle_partitions: None,
            adaptive_broadcast_join_threshold: 10 * 1024 * 1024,
            adaptive_skewed_factor: 5.0,
            adaptive_skewed_size_threshold: 64 * 1024 * 1024,
            adaptive_skewed_row_count_threshold: 0,
        }
    }
}

impl AqseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adaptive_execution_enabled(mut self, enabled: bool) -> Self {
        self.adaptive_execution_enabled = enabled;
        self
    }

    pub fn with_adaptive_join_enabled(mut self, enabled: bool) -> Self {
        self.adaptive_join_enabled = enabled;
        self
    }

    pub fn with_adaptive_skewed_join_enabled(mut self, enabled: bool) -> Self {
        self.adaptive_skewed_join_enabled = enabled;
        self
    }

    pub fn with_target_post_shuffle_input_size(mut self, bytes: u64) -> Self {
        self.target_post_shuffle_input_size = bytes;
        self
    }

    pub fn with_adaptive_target_post_shuffle_row_count(mut self, rows: Option<u64>) -> Self {
        self.adaptive_target_post_shuffle_row_count = rows;
        self
    }

    pub fn with_min_num_post_shuffle_partitions(mut self, min: Option<usize>) -> Self {
        self.min_num_post_shuffle_partitions = min;
        self
    }

    pub fn with_adaptive_broadcast_join_threshold(mut self, bytes: i64) -> Self {
        self.adaptive_broadcast_join_threshold = bytes;
        self
    }

    pub fn with_adaptive_skewed_factor(mut self, factor: f64) -> Self {
        self.adaptive_skewed_factor = factor;
        self
    }

    pub fn with_adaptive_skewed_size_threshold(mut self, bytes: u64) -> Self {
        self.adaptive_skewed_size_threshold = bytes;
        self
    }

    pub fn with_adaptive_skewed_row_count_threshold(mut self, rows: u64) -> Self {
        self.adaptive_skewed_row_count_threshold = rows;
        self
    }

    /// spec.md §7: "non-positive thresholds: accept but degrade to 'no
    /// coalescing' rather than fail". Consumers call this instead of
    /// validating eagerly at construction time.
    pub fn effective_target_post_shuffle_input_size(&self) -> u64 {
        if self.target_post_shuffle_input_size == 0 {
            log::warn!(
                "{}",
                crate::error::AqseError::configuration_range(
                    "targetPostShuffleInputSize is non-positive; degrading to no coalescing"
                )
            );
            u64::MAX
        } else {
            self.target_post_shuffle_input_size
        }
    }
}
