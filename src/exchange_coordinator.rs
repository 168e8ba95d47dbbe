//! The Exchange Coordinator (spec.md §4.2): a pure, stateless computation
//! turning measured `MapOutputStatistics` into post-shuffle partition
//! boundaries.

use std::collections::BTreeSet;

use crate::config::AqseConfig;
use crate::error::{AqseError, Result};
use crate::map_output_stats::MapOutputStatistics;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub target_post_shuffle_input_size: u64,
    pub target_post_shuffle_row_count: Option<u64>,
    pub min_num_post_shuffle_partitions: Option<usize>,
}

impl From<&AqseConfig> for CoordinatorConfig {
    fn from(cfg: &AqseConfig) -> Self {
        Self {
            target_post_shuffle_input_size: cfg.effective_target_post_shuffle_input_size(),
            target_post_shuffle_row_count: cfg.adaptive_target_post_shuffle_row_count,
            min_num_post_shuffle_partitions: cfg.min_num_post_shuffle_partitions,
        }
    }
}

pub struct ExchangeCoordinator {
    config: CoordinatorConfig,
}

impl ExchangeCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    /// Sums bytes/rows across all inputs per reducer id and checks they all
    /// agree on `P` (spec.md §4.2).
    fn sum_stats(stats: &[MapOutputStatistics]) -> Result<(Vec<u64>, Vec<u64>)> {
        let p = stats
            .first()
            .map(|s| s.num_partitions())
            .ok_or_else(|| AqseError::coordinator_precondition("no MapOutputStatistics supplied"))?;
        for s in stats {
            if s.num_partitions() != p {
                return Err(AqseError::coordinator_precondition(format!(
                    "mismatched pre-shuffle partition counts: expected {}, got {}",
                    p,
                    s.num_partitions()
                )));
            }
        }
        let mut sum_bytes = vec![0u64; p];
        let mut sum_rows = vec![0u64; p];
        for s in stats {
            for r in 0..p {
                sum_bytes[r] += s.bytes_by_partition_id[r];
                sum_rows[r] += s.rows_by_partition_id[r];
            }
        }
        Ok((sum_bytes, sum_rows))
    }

    /// The byte target per coalesced group, scaled down when
    /// `minNumPostShufflePartitions` is configured (spec.md §4.2, and the
    /// canonical resolution of the Open Question in §9: "divide target by
    /// `max(1, P / minNumPostShufflePartitions)`").
    fn target_bytes(&self, p: usize) -> u64 {
        match self.config.min_num_post_shuffle_partitions {
            Some(min) if min > 0 => {
                let divisor = std::cmp::max(1, p / min) as u64;
                std::cmp::max(1, self.config.target_post_shuffle_input_size / divisor)
            }
            _ => self.config.target_post_shuffle_input_size,
        }
    }

    /// `estimatePartitionStartIndices` (spec.md §4.2).
    pub fn estimate_partition_start_indices(&self, stats: &[MapOutputStatistics]) -> Result<Vec<u32>> {
        let (sum_bytes, sum_rows) = Self::sum_stats(stats)?;
        let p = sum_bytes.len();
        let target_bytes = self.target_bytes(p);
        let target_rows = self.config.target_post_shuffle_row_count;

        let (mut starts, _ends) = greedy_group(0, p as u32, &sum_bytes, &sum_rows, target_bytes, target_rows);

        if let Some(min) = self.config.min_num_post_shuffle_partitions {
            split_to_minimum(&mut starts, p as u32, min);
        }
        Ok(starts)
    }

    /// `estimatePartitionStartEndIndices` (spec.md §4.2): treats every
    /// reducer id in `skewed` as a gap that no coalesced group may contain.
    pub fn estimate_partition_start_end_indices(
        &self,
        stats: &[MapOutputStatistics],
        skewed: &BTreeSet<u32>,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let (sum_bytes, sum_rows) = Self::sum_stats(stats)?;
        let p = sum_bytes.len() as u32;
        let target_bytes = self.target_bytes(p as usize);
        let target_rows = self.config.target_post_shuffle_row_count;

        let mut starts = vec![];
        let mut ends = vec![];
        let mut stretch_start: Option<u32> = None;
        for r in 0..=p {
            let is_gap = r == p || skewed.contains(&r);
            if is_gap {
                if let Some(s) = stretch_start.take() {
                    let (seg_starts, seg_ends) =
                        greedy_group(s, r, &sum_bytes, &sum_rows, target_bytes, target_rows);
                    starts.extend(seg_starts);
                    ends.extend(seg_ends);
                }
            } else if stretch_start.is_none() {
                stretch_start = Some(r);
            }
        }
        Ok((starts, ends))
    }
}

/// Greedily scans `[range_start, range_end)` left to right, accumulating
/// `(bytes, rows)` and emitting a new group boundary whenever including the
/// next reducer id would push either accumulator over its target
/// (spec.md §4.2). Deterministic: no floating-point tie-breaks.
fn greedy_group(
    range_start: u32,
    range_end: u32,
    sum_bytes: &[u64],
    sum_rows: &[u64],
    target_bytes: u64,
    target_rows: Option<u64>,
) -> (Vec<u32>, Vec<u32>) {
    if range_start >= range_end {
        return (vec![], vec![]);
    }
    let mut starts = vec![range_start];
    let mut ends = vec![];
    let mut group_start = range_start;
    let mut acc_bytes = 0u64;
    let mut acc_rows = 0u64;

    for r in range_start..range_end {
        let b = sum_bytes[r as usize];
        let rr = sum_rows[r as usize];
        let would_overflow_bytes = r != group_start && acc_bytes + b > target_bytes;
        let would_overflow_rows = r != group_start
            && target_rows.map(|t| acc_rows + rr > t).unwrap_or(false);

        if would_overflow_bytes || would_overflow_rows {
            ends.push(r);
            starts.push(r);
            group_start = r;
            acc_bytes = 0;
            acc_rows = 0;
        }
        acc_bytes += b;
        acc_rows += rr;
    }
    ends.push(range_end);
    (starts, ends)
}

/// spec.md §4.2: "The resulting array has length >= `minNumPostShufflePartitions`
/// when configured, by splitting the largest groups if necessary." Splits the
/// widest group (by reducer count; ties broken by the lowest start index, to
/// stay deterministic) until the minimum is met.
fn split_to_minimum(starts: &mut Vec<u32>, p: u32, min: usize) {
    if min == 0 {
        return;
    }
    while starts.len() < min {
        let bounds: Vec<(u32, u32)> = starts
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let e = starts.get(i + 1).copied().unwrap_or(p);
                (s, e)
            })
            .collect();

        let mut widest_idx = 0usize;
        let mut widest_width = 0u32;
        for (i, &(s, e)) in bounds.iter().enumerate() {
            let width = e - s;
            if width > widest_width {
                widest_width = width;
                widest_idx = i;
            }
        }

        if widest_width < 2 {
            // Every group is already a single reducer; cannot split further.
            break;
        }
        let (s, e) = bounds[widest_idx];
        let mid = s + (e - s) / 2;

        let mut next_bounds = bounds.clone();
        next_bounds[widest_idx] = (s, mid);
        next_bounds.insert(widest_idx + 1, (mid, e));

        *starts = next_bounds.iter().map(|&(s, _)| s).collect();
    }
}
