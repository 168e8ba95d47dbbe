//! Read-mode resolution for a `QueryStageInput` (spec.md §4.1): turns a
//! shuffle/skewed-shuffle/broadcast input into the `PartitionRange`s its
//! reader(s) should be opened over, then hands those to the `ShuffleManager`
//! collaborator. Actual row I/O stays behind that trait (spec.md §1, §6).

use crate::collaborators::{MapOutputTracker, ShuffleManager, ShuffleReader};
use crate::error::{AqseError, Result};
use crate::partition_range::{coalesced_ranges, local_ranges, preferred_locations, PartitionRange};
use crate::stage::{QueryStage, QueryStageInput};

/// spec.md §4.1: a `ShuffleStageInput` reads in coalesced mode unless it was
/// marked local by `OptimizeJoin` (§4.6); a `SkewedShuffleStageInput` reads
/// one reducer over a narrowed mapper range; a `BroadcastStageInput` has no
/// partition ranges of its own, it reads the whole prepared broadcast.
pub fn resolve_ranges(input: &QueryStageInput) -> Result<Vec<PartitionRange>> {
    match input {
        QueryStageInput::Shuffle(s) => {
            let QueryStage::Shuffle(stage) = s.child.as_ref() else {
                return Err(AqseError::plan_invariant(
                    "ShuffleStageInput's child stage is not a ShuffleStage",
                ));
            };
            let stats = stage.map_output_statistics.get().ok_or_else(|| {
                AqseError::plan_invariant("reading a ShuffleStageInput before its map output statistics are set")
            })?;
            if s.is_local_shuffle {
                return Ok(local_ranges(stats.num_partitions() as u32, stats.num_mappers));
            }
            let starts = s.partition_start_indices.as_ref().ok_or_else(|| {
                AqseError::plan_invariant("reading a non-local ShuffleStageInput before reducer ranges are assigned")
            })?;
            Ok(coalesced_ranges(
                starts,
                s.partition_end_indices.as_deref(),
                stats.num_partitions() as u32,
                stats.num_mappers,
            ))
        }
        QueryStageInput::SkewedShuffle(s) => Ok(vec![PartitionRange::new(
            s.partition_id,
            s.partition_id + 1,
            s.start_map_id,
            s.end_map_id,
        )]),
        QueryStageInput::Broadcast(_) => Ok(vec![]),
    }
}

/// Opens one reader per resolved range (spec.md §6's `ShuffleManager.
/// getReader`). A `BroadcastStageInput` resolves to no ranges and therefore
/// no readers here; its materialized handle comes from `prepare_broadcast`.
pub fn open_readers(
    manager: &dyn ShuffleManager,
    input: &QueryStageInput,
) -> Result<Vec<Box<dyn ShuffleReader>>> {
    let stage_id = input.child_stage().id();
    let ranges = resolve_ranges(input)?;
    Ok(ranges
        .into_iter()
        .map(|r| manager.get_reader(stage_id, r.reducer_start, r.reducer_end, r.map_start, r.map_end))
        .collect())
}

/// Preferred hosts for each resolved range (spec.md §4.1's "the reader
/// exposes the set of hosts where those mapper outputs live").
pub fn preferred_locations_for(tracker: &dyn MapOutputTracker, input: &QueryStageInput) -> Result<Vec<Vec<String>>> {
    let stage_id = input.child_stage().id();
    let ranges = resolve_ranges(input)?;
    Ok(ranges
        .into_iter()
        .map(|r| preferred_locations(tracker, stage_id, r))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{NoopMapOutputTracker, NoopShuffleManager};
    use crate::map_output_stats::MapOutputStatistics;
    use crate::stage::{BroadcastStageInput, ShuffleStageInput, SkewedShuffleStageInput, StageIdAllocator};
    use crate::test_support::{dummy_leaf, dummy_properties};
    use std::sync::Arc;

    fn shuffle_stage_with_stats(bytes: Vec<u64>, rows: Vec<u64>, num_mappers: u32) -> Arc<QueryStage> {
        let ids = StageIdAllocator::default();
        let stage = Arc::new(QueryStage::new_shuffle(ids.next(), dummy_leaf("l")));
        if let QueryStage::Shuffle(s) = stage.as_ref() {
            s.map_output_statistics
                .set(MapOutputStatistics::new(bytes, rows, num_mappers))
                .expect("single assignment");
        }
        stage
    }

    #[test]
    fn coalesced_read_uses_assigned_reducer_ranges() {
        let stage = shuffle_stage_with_stats(vec![10, 10, 10, 10], vec![1, 1, 1, 1], 3);
        let input = ShuffleStageInput::new(stage, vec![], dummy_properties())
            .with_partition_indices(vec![0, 2], None);
        let ranges = resolve_ranges(&QueryStageInput::Shuffle(input)).unwrap();
        assert_eq!(
            ranges,
            vec![PartitionRange::new(0, 2, 0, 3), PartitionRange::new(2, 4, 0, 3)]
        );
    }

    #[test]
    fn local_read_emits_one_partition_per_mapper() {
        let stage = shuffle_stage_with_stats(vec![10, 10], vec![1, 1], 4);
        let input = ShuffleStageInput::new(stage, vec![], dummy_properties()).with_local_shuffle(true);
        let ranges = resolve_ranges(&QueryStageInput::Shuffle(input)).unwrap();
        assert_eq!(ranges.len(), 4);
        assert!(ranges.iter().all(|r| r.reducer_start == 0 && r.reducer_end == 2));
    }

    #[test]
    fn unassigned_non_local_input_is_a_plan_invariant_error() {
        let stage = shuffle_stage_with_stats(vec![10, 10], vec![1, 1], 4);
        let input = ShuffleStageInput::new(stage, vec![], dummy_properties());
        let err = resolve_ranges(&QueryStageInput::Shuffle(input)).unwrap_err();
        assert!(matches!(err, AqseError::PlanInvariantViolation(_)));
    }

    #[test]
    fn skewed_shuffle_input_resolves_to_its_own_narrow_range() {
        let stage = shuffle_stage_with_stats(vec![10, 10], vec![1, 1], 10);
        let input = QueryStageInput::SkewedShuffle(SkewedShuffleStageInput {
            child: stage,
            output: vec![],
            partition_id: 1,
            start_map_id: 4,
            end_map_id: 6,
            properties: dummy_properties(),
        });
        let ranges = resolve_ranges(&input).unwrap();
        assert_eq!(ranges, vec![PartitionRange::new(1, 2, 4, 6)]);
    }

    #[test]
    fn broadcast_input_has_no_ranges() {
        let stage = Arc::new(QueryStage::new_broadcast(0, dummy_leaf("b")));
        let input = QueryStageInput::Broadcast(BroadcastStageInput {
            child: stage,
            output: vec![],
            properties: dummy_properties(),
        });
        assert!(resolve_ranges(&input).unwrap().is_empty());
    }

    #[test]
    fn open_readers_matches_resolved_range_count() {
        let stage = shuffle_stage_with_stats(vec![10, 10, 10, 10], vec![1, 1, 1, 1], 3);
        let input = ShuffleStageInput::new(stage, vec![], dummy_properties())
            .with_partition_indices(vec![0, 2], None);
        let readers = open_readers(&NoopShuffleManager, &QueryStageInput::Shuffle(input)).unwrap();
        assert_eq!(readers.len(), 2);
    }

    #[test]
    fn preferred_locations_matches_resolved_range_count() {
        let stage = shuffle_stage_with_stats(vec![10, 10, 10, 10], vec![1, 1, 1, 1], 3);
        let input = ShuffleStageInput::new(stage, vec![], dummy_properties())
            .with_partition_indices(vec![0, 2], None);
        let locations = preferred_locations_for(&NoopMapOutputTracker, &QueryStageInput::Shuffle(input)).unwrap();
        assert_eq!(locations.len(), 2);
    }
}
