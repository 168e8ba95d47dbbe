//! `HandleSkewedJoin` (spec.md §4.7): splits a skewed reducer on the left
//! side of a two-way join into several sub-joins over narrower mapper
//! ranges, so they can execute in parallel instead of as one oversized task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use datafusion::logical_expr::JoinType;

use crate::config::AqseConfig;
use crate::map_output_stats::MapOutputStatistics;
use crate::partition_range::{adaptive_ranges, default_map_boundaries};
use crate::plan::{NodeProperties, PlanNode, PlanRef, SortMergeJoinNode, SortNode, UnionNode};
use crate::stage::{QueryStage, QueryStageInput, ShuffleStageInput, SkewedShuffleStageInput};

/// spec.md §4.7: "never more than 5 splits". The source also carries an
/// undocumented `min(10, adaptiveShuffleReducerNum)` cap in one branch of
/// adaptive reducer splitting that is absent elsewhere (spec.md §9 Open
/// Questions); this implementation follows the rule stated in the body of
/// §4.7 and does not apply that second cap.
pub const MAX_SKEW_SPLITS: usize = 5;

pub fn handle_skewed_join(child: &PlanRef, config: &AqseConfig) -> PlanRef {
    if !config.adaptive_skewed_join_enabled {
        return child.clone();
    }
    if count_shuffle_stage_inputs(child) != 2 {
        return child.clone();
    }
    child.transform_up(&mut |node: &PlanRef| match node.as_ref() {
        PlanNode::SortMergeJoin(smj) if matches!(smj.join_type, JoinType::Inner | JoinType::LeftSemi) => {
            try_split(smj, config)
        }
        _ => None,
    })
}

fn count_shuffle_stage_inputs(plan: &PlanRef) -> usize {
    let here = usize::from(matches!(
        plan.as_ref(),
        PlanNode::StageInput(QueryStageInput::Shuffle(_))
    ));
    here + plan.children().iter().map(count_shuffle_stage_inputs).sum::<usize>()
}

fn sort_and_shuffle_input(side: &PlanRef) -> Option<(NodeProperties, ShuffleStageInput)> {
    let PlanNode::Sort(sort) = side.as_ref() else {
        return None;
    };
    let PlanNode::StageInput(QueryStageInput::Shuffle(s)) = sort.child.as_ref() else {
        return None;
    };
    Some((sort.properties.clone(), s.clone()))
}

fn wrap_sort_shuffle(sort_properties: NodeProperties, input: ShuffleStageInput) -> PlanRef {
    Arc::new(PlanNode::Sort(SortNode {
        child: Arc::new(PlanNode::StageInput(QueryStageInput::Shuffle(input))),
        properties: sort_properties,
    }))
}

fn median(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2
    }
}

/// spec.md §4.7 step 1. Returns a map from skewed reducer id to split count.
///
/// spec.md §7: a non-positive `adaptiveSkewedSizeThreshold`/
/// `adaptiveSkewedRowCountThreshold` is "disabled for this call", logged
/// once, rather than satisfied by every partition (the naive `bytes >
/// threshold` check would invert to "always skewed" at `threshold == 0`).
fn skewed_partitions(stats: &MapOutputStatistics, config: &AqseConfig) -> BTreeMap<u32, usize> {
    let median_bytes = median(&stats.bytes_by_partition_id);
    let median_rows = median(&stats.rows_by_partition_id);

    let size_threshold = if config.adaptive_skewed_size_threshold == 0 {
        log::warn!(
            "{}",
            crate::error::AqseError::configuration_range(
                "adaptiveSkewedSizeThreshold is non-positive; disabling byte-based skew detection for this call"
            )
        );
        None
    } else {
        Some(config.adaptive_skewed_size_threshold)
    };
    let row_threshold = if config.adaptive_skewed_row_count_threshold == 0 {
        log::warn!(
            "{}",
            crate::error::AqseError::configuration_range(
                "adaptiveSkewedRowCountThreshold is non-positive; disabling row-based skew detection for this call"
            )
        );
        None
    } else {
        Some(config.adaptive_skewed_row_count_threshold)
    };

    let mut result = BTreeMap::new();

    for p in 0..stats.bytes_by_partition_id.len() {
        let bytes = stats.bytes_by_partition_id[p];
        let rows = stats.rows_by_partition_id[p];

        let bytes_skewed = size_threshold.is_some_and(|threshold| {
            median_bytes > 0
                && (bytes as f64) > (median_bytes as f64) * config.adaptive_skewed_factor
                && bytes > threshold
        });
        let rows_skewed = row_threshold.is_some_and(|threshold| {
            median_rows > 0
                && (rows as f64) > (median_rows as f64) * config.adaptive_skewed_factor
                && rows > threshold
        });

        if !bytes_skewed && !rows_skewed {
            continue;
        }

        let size_splits = if median_bytes == 0 {
            usize::MAX
        } else {
            (bytes / median_bytes) as usize
        };
        let row_splits = if median_rows == 0 {
            usize::MAX
        } else {
            (rows / median_rows) as usize
        };
        let split_count = MAX_SKEW_SPLITS
            .min(size_splits.min(row_splits))
            .min(stats.num_mappers as usize)
            .max(1);
        result.insert(p as u32, split_count);
    }
    result
}

fn try_split(smj: &SortMergeJoinNode, config: &AqseConfig) -> Option<PlanRef> {
    let (left_sort_props, left_input) = sort_and_shuffle_input(&smj.left)?;
    let (right_sort_props, right_input) = sort_and_shuffle_input(&smj.right)?;

    let QueryStage::Shuffle(left_stage_data) = left_input.child.as_ref() else {
        return None;
    };
    let left_stats = left_stage_data.map_output_statistics.get()?.clone();

    let skewed = skewed_partitions(&left_stats, config);
    if skewed.is_empty() {
        return None;
    }

    let QueryStage::Shuffle(right_stage_data) = right_input.child.as_ref() else {
        return None;
    };
    let right_num_mappers = right_stage_data
        .map_output_statistics
        .get()
        .map(|s| s.num_mappers)
        .unwrap_or(left_stats.num_mappers);

    let mut sub_joins = Vec::new();
    for (&partition_id, &num_split) in &skewed {
        let boundaries = default_map_boundaries(left_stats.num_mappers, num_split);
        for range in adaptive_ranges(partition_id, &boundaries) {
            let sub_left = Arc::new(PlanNode::StageInput(QueryStageInput::SkewedShuffle(
                SkewedShuffleStageInput {
                    child: left_input.child.clone(),
                    output: left_input.output.clone(),
                    partition_id,
                    start_map_id: range.map_start,
                    end_map_id: range.map_end,
                    properties: left_input.properties.clone(),
                },
            )));
            let sub_right = Arc::new(PlanNode::StageInput(QueryStageInput::SkewedShuffle(
                SkewedShuffleStageInput {
                    child: right_input.child.clone(),
                    output: right_input.output.clone(),
                    partition_id,
                    start_map_id: 0,
                    end_map_id: right_num_mappers,
                    properties: right_input.properties.clone(),
                },
            )));
            sub_joins.push(Arc::new(PlanNode::SortMergeJoin(SortMergeJoinNode {
                left: sub_left,
                right: sub_right,
                left_keys: smj.left_keys.clone(),
                right_keys: smj.right_keys.clone(),
                join_type: smj.join_type,
                condition: smj.condition.clone(),
                properties: smj.properties.clone(),
            })));
        }
    }

    let skewed_ids: BTreeSet<u32> = skewed.keys().copied().collect();
    let new_left = left_input.with_skewed_partitions(skewed_ids.clone());
    let new_right = right_input.with_skewed_partitions(skewed_ids.clone());

    let original = Arc::new(PlanNode::SortMergeJoin(SortMergeJoinNode {
        left: wrap_sort_shuffle(left_sort_props, new_left),
        right: wrap_sort_shuffle(right_sort_props, new_right),
        left_keys: smj.left_keys.clone(),
        right_keys: smj.right_keys.clone(),
        join_type: smj.join_type,
        condition: smj.condition.clone(),
        properties: smj.properties.clone(),
    }));

    log::info!(
        "handle_skewed_join: split {} skewed partitions into {} sub-joins",
        skewed_ids.len(),
        sub_joins.len()
    );

    let mut children = vec![original];
    children.extend(sub_joins);
    Some(Arc::new(PlanNode::Union(UnionNode {
        children,
        properties: smj.properties.clone(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageIdAllocator;
    use crate::test_support::{dummy_leaf, dummy_properties};

    fn shuffle_input(id_alloc: &StageIdAllocator, num_mappers: u32, bytes: Vec<u64>, rows: Vec<u64>) -> (PlanRef, Arc<QueryStage>) {
        let stage = Arc::new(QueryStage::new_shuffle(id_alloc.next(), dummy_leaf("l")));
        if let QueryStage::Shuffle(s) = stage.as_ref() {
            s.map_output_statistics
                .set(MapOutputStatistics::new(bytes, rows, num_mappers))
                .expect("single assignment");
        }
        let input = ShuffleStageInput::new(stage.clone(), vec![], dummy_properties());
        let sorted = Arc::new(PlanNode::Sort(SortNode {
            child: Arc::new(PlanNode::StageInput(QueryStageInput::Shuffle(input))),
            properties: dummy_properties(),
        }));
        (sorted, stage)
    }

    fn inner_join(left: PlanRef, right: PlanRef) -> PlanRef {
        Arc::new(PlanNode::SortMergeJoin(SortMergeJoinNode {
            left,
            right,
            left_keys: vec![0],
            right_keys: vec![0],
            join_type: JoinType::Inner,
            condition: None,
            properties: dummy_properties(),
        }))
    }

    #[test]
    fn scenario_d_skew_split() {
        let ids = StageIdAllocator::default();
        let (left, _) = shuffle_input(&ids, 10, vec![1, 1, 1, 100], vec![10, 10, 10, 1000]);
        let (right, _) = shuffle_input(&ids, 10, vec![1, 1, 1, 1], vec![10, 10, 10, 10]);
        let root = inner_join(left, right);

        let config = AqseConfig::new()
            .with_adaptive_skewed_factor(5.0)
            .with_adaptive_skewed_size_threshold(50)
            .with_adaptive_skewed_row_count_threshold(50);
        let result = handle_skewed_join(&root, &config);

        let PlanNode::Union(u) = result.as_ref() else {
            panic!("expected a union, got {:?}", result)
        };
        assert_eq!(u.children.len(), 1 + 5);

        let mut left_ranges = vec![];
        for sub in &u.children[1..] {
            let PlanNode::SortMergeJoin(j) = sub.as_ref() else {
                panic!("expected sort-merge sub-join")
            };
            let PlanNode::StageInput(QueryStageInput::SkewedShuffle(s)) = j.left.as_ref() else {
                panic!("expected a skewed shuffle input on the left")
            };
            assert_eq!(s.partition_id, 3);
            left_ranges.push((s.start_map_id, s.end_map_id));
        }
        left_ranges.sort();
        assert_eq!(
            left_ranges,
            vec![(0, 2), (2, 4), (4, 6), (6, 8), (8, 10)]
        );

        let PlanNode::SortMergeJoin(original) = u.children[0].as_ref() else {
            panic!("expected the original join preserved")
        };
        let (_, left_input) = sort_and_shuffle_input(&original.left).unwrap();
        assert_eq!(left_input.skewed_partitions, Some([3u32].into_iter().collect()));
    }

    #[test]
    fn no_op_without_exactly_two_shuffle_inputs() {
        let ids = StageIdAllocator::default();
        let (left, _) = shuffle_input(&ids, 10, vec![1, 1, 1, 100], vec![10, 10, 10, 1000]);
        let root = Arc::new(PlanNode::SortMergeJoin(SortMergeJoinNode {
            left,
            right: dummy_leaf("r"),
            left_keys: vec![0],
            right_keys: vec![0],
            join_type: JoinType::Inner,
            condition: None,
            properties: dummy_properties(),
        }));
        let config = AqseConfig::new();
        let result = handle_skewed_join(&root, &config);
        assert!(Arc::ptr_eq(&result, &root));
    }

    #[test]
    fn disabled_flag_is_identity() {
        let ids = StageIdAllocator::default();
        let (left, _) = shuffle_input(&ids, 10, vec![1, 1, 1, 100], vec![10, 10, 10, 1000]);
        let (right, _) = shuffle_input(&ids, 10, vec![1, 1, 1, 1], vec![10, 10, 10, 10]);
        let root = inner_join(left, right);
        let config = AqseConfig::new().with_adaptive_skewed_join_enabled(false);
        let result = handle_skewed_join(&root, &config);
        assert!(Arc::ptr_eq(&result, &root));
    }
}
