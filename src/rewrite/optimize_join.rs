//! `OptimizeJoin` (spec.md §4.6): demotes a sort-merge join to a
//! broadcast-hash join when one side is small enough, dropping the sorts
//! and shuffles the sort-merge plan needed.

use std::sync::Arc;

use datafusion::logical_expr::JoinType;

use crate::collaborators::PlanRule;
use crate::config::AqseConfig;
use crate::plan::{BroadcastHashJoinNode, BuildSide, ExchangeKind, PlanNode, PlanRef, SortMergeJoinNode};
use crate::stage::QueryStageInput;

/// Runs `OptimizeJoin` over a stage's child plan. `stage_tolerates_one_exchange`
/// is true when the enclosing stage is a `ShuffleStage`, which may absorb one
/// final shuffle itself (spec.md §4.6's acceptance rule).
pub fn optimize_join(
    child: &PlanRef,
    config: &AqseConfig,
    stage_tolerates_one_exchange: bool,
    ensure_requirements: &dyn PlanRule,
) -> PlanRef {
    if !config.adaptive_join_enabled {
        return child.clone();
    }
    child.transform_up(&mut |node: &PlanRef| match node.as_ref() {
        PlanNode::SortMergeJoin(smj) => {
            try_optimize(smj, config, stage_tolerates_one_exchange, ensure_requirements)
        }
        _ => None,
    })
}

fn right_buildable(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::Inner | JoinType::Left | JoinType::LeftSemi | JoinType::LeftAnti
    )
}

fn left_buildable(join_type: JoinType) -> bool {
    matches!(join_type, JoinType::Inner | JoinType::Right)
}

fn within_threshold(side: &PlanRef, threshold: i64) -> bool {
    side.properties()
        .stats
        .size_in_bytes
        .map(|bytes| bytes >= 0 && bytes <= threshold)
        .unwrap_or(false)
}

fn strip_sort(side: &PlanRef) -> PlanRef {
    match side.as_ref() {
        PlanNode::Sort(s) => s.child.clone(),
        _ => side.clone(),
    }
}

fn try_optimize(
    smj: &SortMergeJoinNode,
    config: &AqseConfig,
    stage_tolerates_one_exchange: bool,
    ensure_requirements: &dyn PlanRule,
) -> Option<PlanRef> {
    let threshold = config.adaptive_broadcast_join_threshold;
    let right_ok = right_buildable(smj.join_type) && within_threshold(&smj.right, threshold);
    let left_ok = left_buildable(smj.join_type) && within_threshold(&smj.left, threshold);

    let build_side = if right_ok {
        BuildSide::Right
    } else if left_ok {
        BuildSide::Left
    } else {
        return None;
    };

    let candidate = Arc::new(PlanNode::BroadcastHashJoin(BroadcastHashJoinNode {
        left: strip_sort(&smj.left),
        right: strip_sort(&smj.right),
        left_keys: smj.left_keys.clone(),
        right_keys: smj.right_keys.clone(),
        join_type: smj.join_type,
        condition: smj.condition.clone(),
        build_side,
        properties: smj.properties.clone(),
    }));

    // `EnsureRequirements` is applied to the candidate subtree rather than
    // the whole stage plan: swapping the join only changes partitioning
    // requirements at and below it, and the stage-level `EnsureRequirements`
    // pass that follows both rewriters (spec.md §4.4 step 2) repairs
    // anything needed further up if this join's mutation requires it.
    let checked = ensure_requirements.apply(candidate);
    let remaining_exchanges = count_shuffle_exchanges(&checked);

    let accept = remaining_exchanges == 0 || (stage_tolerates_one_exchange && remaining_exchanges == 1);
    if !accept {
        log::debug!(
            "optimize_join: rejecting broadcast candidate for {:?} join, {} shuffle exchanges remain",
            smj.join_type,
            remaining_exchanges
        );
        return None;
    }

    log::info!(
        "optimize_join: demoting sort-merge join to broadcast-hash join, build_side={:?}",
        build_side
    );
    Some(mark_direct_shuffle_inputs_local(&checked))
}

fn count_shuffle_exchanges(plan: &PlanRef) -> usize {
    let here = match plan.as_ref() {
        PlanNode::Exchange(ex) if ex.kind == ExchangeKind::Shuffle => 1,
        _ => 0,
    };
    here + plan.children().iter().map(count_shuffle_exchanges).sum::<usize>()
}

fn mark_if_shuffle_input(child: &PlanRef) -> PlanRef {
    match child.as_ref() {
        PlanNode::StageInput(QueryStageInput::Shuffle(s)) => Arc::new(PlanNode::StageInput(
            QueryStageInput::Shuffle(s.with_local_shuffle(true)),
        )),
        _ => child.clone(),
    }
}

/// spec.md §4.6: "for every `ShuffleStageInput` that is a direct child of
/// the accepted broadcast-hash join, set `isLocalShuffle = true`".
fn mark_direct_shuffle_inputs_local(plan: &PlanRef) -> PlanRef {
    match plan.as_ref() {
        PlanNode::BroadcastHashJoin(j) => Arc::new(PlanNode::BroadcastHashJoin(BroadcastHashJoinNode {
            left: mark_if_shuffle_input(&j.left),
            right: mark_if_shuffle_input(&j.right),
            ..j.clone()
        })),
        _ => {
            let new_children: Vec<PlanRef> = plan.children().iter().map(mark_direct_shuffle_inputs_local).collect();
            if new_children
                .iter()
                .zip(plan.children().iter())
                .all(|(a, b)| Arc::ptr_eq(a, b))
            {
                plan.clone()
            } else {
                Arc::new(plan.with_new_children(new_children))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::IdentityRule;
    use crate::plan::SortNode;
    use crate::stage::{QueryStage, ShuffleStageInput};
    use crate::test_support::{dummy_leaf, dummy_properties, dummy_properties_with_stats};

    fn shuffle_input_leaf(name: &str) -> PlanRef {
        let stage = Arc::new(QueryStage::new_shuffle(0, dummy_leaf(name)));
        Arc::new(PlanNode::StageInput(QueryStageInput::Shuffle(
            ShuffleStageInput::new(stage, vec![], dummy_properties()),
        )))
    }

    fn sorted(child: PlanRef) -> PlanRef {
        Arc::new(PlanNode::Sort(SortNode {
            child,
            properties: dummy_properties(),
        }))
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
    fn scenario_e_broadcast_demotion() {
        let a = shuffle_input_leaf("a");
        let b_leaf = Arc::new(PlanNode::Other(crate::plan::OtherNode {
            name: "b".to_string(),
            children: vec![],
            properties: dummy_properties_with_stats(Some(1024), Some(10)),
        }));
        let root = inner_join(sorted(a), sorted(b_leaf));

        let config = AqseConfig::new().with_adaptive_broadcast_join_threshold(10 * 1024 * 1024);
        let rule = IdentityRule;
        let result = optimize_join(&root, &config, false, &rule);

        let PlanNode::BroadcastHashJoin(j) = result.as_ref() else {
            panic!("expected a broadcast-hash join, got {:?}", result)
        };
        assert_eq!(j.build_side, BuildSide::Right);
        assert!(!matches!(j.left.as_ref(), PlanNode::Sort(_)));
        assert!(!matches!(j.right.as_ref(), PlanNode::Sort(_)));
        match j.left.as_ref() {
            PlanNode::StageInput(QueryStageInput::Shuffle(s)) => assert!(s.is_local_shuffle),
            other => panic!("expected the left shuffle input, got {:?}", other),
        }
    }

    #[test]
    fn rejects_when_neither_side_fits_threshold() {
        let a = Arc::new(PlanNode::Other(crate::plan::OtherNode {
            name: "a".to_string(),
            children: vec![],
            properties: dummy_properties_with_stats(Some(1_000_000_000), None),
        }));
        let b = Arc::new(PlanNode::Other(crate::plan::OtherNode {
            name: "b".to_string(),
            children: vec![],
            properties: dummy_properties_with_stats(Some(1_000_000_000), None),
        }));
        let root = inner_join(a, b);
        let config = AqseConfig::new().with_adaptive_broadcast_join_threshold(1024);
        let rule = IdentityRule;
        let result = optimize_join(&root, &config, false, &rule);
        assert!(Arc::ptr_eq(&result, &root));
    }

    #[test]
    fn disabled_flag_is_identity() {
        let root = inner_join(dummy_leaf("a"), dummy_leaf("b"));
        let config = AqseConfig::new().with_adaptive_join_enabled(false);
        let rule = IdentityRule;
        let result = optimize_join(&root, &config, false, &rule);
        assert!(Arc::ptr_eq(&result, &root));
    }
}
