//! Partition Range Model (spec.md §3, §4.1).
//!
//! A post-shuffle partition is a pair of contiguous ranges: `[reducer_start,
//! reducer_end)` over pre-shuffle partition ids, and `[map_start, map_end)`
//! over mapper ids. Non-skew reads span every mapper; skew-split reads
//! narrow the mapper range for a single reducer id.

use crate::map_output_stats::MapOutputStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub reducer_start: u32,
    pub reducer_end: u32,
    pub map_start: u32,
    pub map_end: u32,
}

impl PartitionRange {
    pub fn new(reducer_start: u32, reducer_end: u32, map_start: u32, map_end: u32) -> Self {
        // spec.md §4.1: "Reading with an empty range, or with reducer range
        // crossing P, is a programming error (assertion)."
        assert!(reducer_start < reducer_end, "empty reducer range");
        assert!(map_start < map_end, "empty map range");
        Self {
            reducer_start,
            reducer_end,
            map_start,
            map_end,
        }
    }

    pub fn is_skew_split(&self) -> bool {
        self.reducer_end == self.reducer_start + 1
    }
}

/// Coalesced read: partition `i` reads reducer ids `[start[i], end[i])` from
/// every mapper. `end` defaults to `start[i + 1]`, and `num_reducers` for the
/// last partition, when not supplied.
pub fn coalesced_ranges(
    start_indices: &[u32],
    end_indices: Option<&[u32]>,
    num_reducers: u32,
    num_mappers: u32,
) -> Vec<PartitionRange> {
    assert!(!start_indices.is_empty(), "coalesced read needs at least one partition");
    start_indices
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = match end_indices {
                Some(ends) => ends[i],
                None => {
                    if i + 1 < start_indices.len() {
                        start_indices[i + 1]
                    } else {
                        num_reducers
                    }
                }
            };
            PartitionRange::new(start, end, 0, num_mappers)
        })
        .collect()
}

/// Local read: one post-shuffle partition per mapper, each reading that
/// mapper's output across every reducer id. Used to avoid a second shuffle
/// once a join has been demoted to broadcast-hash (spec.md §4.6).
pub fn local_ranges(num_reducers: u32, num_mappers: u32) -> Vec<PartitionRange> {
    (0..num_mappers)
        .map(|m| PartitionRange::new(0, num_reducers, m, m + 1))
        .collect()
}

/// Default mapper-boundary split for an adaptive (skew) read: `m[i] =
/// i * num_mappers / k`.
pub fn default_map_boundaries(num_mappers: u32, k: usize) -> Vec<u32> {
    assert!(k >= 1 && k as u32 <= num_mappers);
    (0..=k)
        .map(|i| ((i as u64) * (num_mappers as u64) / (k as u64)) as u32)
        .collect()
}

/// Adaptive (skew) read: given a single reducer id and `k + 1` map-id
/// boundaries, emits `k` partitions, partition `i` reading `reducer` from
/// mapper range `[boundaries[i], boundaries[i + 1])`.
pub fn adaptive_ranges(reducer: u32, boundaries: &[u32]) -> Vec<PartitionRange> {
    assert!(boundaries.len() >= 2, "need at least one split");
    boundaries
        .windows(2)
        .map(|w| PartitionRange::new(reducer, reducer + 1, w[0], w[1]))
        .collect()
}

/// spec.md §4.1: "For any adaptive partition `[mapStart, mapEnd)`, the
/// reader exposes the set of hosts where those mapper outputs live." The
/// map-output tracker is an external collaborator (spec.md §6); this just
/// shapes the query AQSE issues against it.
pub fn preferred_locations(
    tracker: &dyn crate::collaborators::MapOutputTracker,
    stage_id: crate::stage::StageId,
    range: PartitionRange,
) -> Vec<String> {
    tracker.get_map_location(stage_id, range.map_start, range.map_end)
}

/// Validates a `MapOutputStatistics`'s reducer count against `P`, used by
/// both read-mode constructors above and the exchange coordinator.
pub fn validate_reducer_bound(stats: &MapOutputStatistics, reducer: u32) {
    assert!(
        (reducer as usize) < stats.num_partitions(),
        "reducer id {} out of bounds for P={}",
        reducer,
        stats.num_partitions()
    );
}
