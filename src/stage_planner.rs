//! The Stage Planner, `PlanQueryStage` (spec.md §4.3): a one-shot, bottom-up
//! transform that wraps every `Exchange` in a `QueryStageInput` over a fresh
//! `QueryStage`, reusing a stage when two exchanges are semantically equal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AqseConfig;
use crate::plan::{ExchangeKind, ExchangeNode, PlanNode, PlanRef};
use crate::stage::{
    BroadcastStageInput, QueryStage, QueryStageInput, ShuffleStageInput, StageIdAllocator,
};

pub enum PlannedQuery {
    /// `adaptiveExecutionEnabled` is off, or the root is a side-effecting
    /// command: the plan passes through unwrapped.
    Identity(PlanRef),
    Staged(Arc<QueryStage>),
}

/// spec.md §4.3's "mapping from output schema to a list of stages already
/// emitted". `semantic_key()` already folds the output shape and the whole
/// subtree's shape (modulo attribute ids) into one string, so a plain map
/// lookup plays the role the spec describes as "scan that list for any
/// whose child plan is semantically equal".
#[derive(Default)]
pub struct StageReuseTable {
    by_child_shape: HashMap<String, Arc<QueryStage>>,
}

impl StageReuseTable {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn plan_query_stage(
    root: PlanRef,
    is_command: bool,
    config: &AqseConfig,
    id_alloc: &StageIdAllocator,
    reuse: &mut StageReuseTable,
) -> PlannedQuery {
    if !config.adaptive_execution_enabled {
        return PlannedQuery::Identity(root);
    }

    let transformed = wrap_exchanges(&root, id_alloc, reuse);

    if is_command {
        PlannedQuery::Identity(transformed)
    } else {
        let id = id_alloc.next();
        PlannedQuery::Staged(Arc::new(QueryStage::new_result(id, transformed)))
    }
}

fn wrap_exchanges(plan: &PlanRef, id_alloc: &StageIdAllocator, reuse: &mut StageReuseTable) -> PlanRef {
    plan.transform_up(&mut |node: &PlanRef| match node.as_ref() {
        PlanNode::Exchange(ex) => Some(wrap_one_exchange(ex, id_alloc, reuse)),
        _ => None,
    })
}

fn wrap_one_exchange(ex: &ExchangeNode, id_alloc: &StageIdAllocator, reuse: &mut StageReuseTable) -> PlanRef {
    let child = ex.child.clone();
    let key = format!("{:?}:{}", ex.kind, child.semantic_key());

    // spec.md §3: "ShuffleStage -- child is a ShuffleExchange producing map
    // outputs" (likewise for BroadcastStage). The stage's child is the
    // exchange node itself, not the subtree feeding it, so the runtime can
    // later hand it straight to `eager_execute`/`prepare`.
    let exchange_node: PlanRef = Arc::new(PlanNode::Exchange(ExchangeNode {
        kind: ex.kind,
        child: child.clone(),
        properties: ex.properties.clone(),
    }));

    let stage = reuse.by_child_shape.get(&key).cloned().unwrap_or_else(|| {
        let id = id_alloc.next();
        let stage = Arc::new(match ex.kind {
            ExchangeKind::Shuffle => QueryStage::new_shuffle(id, exchange_node.clone()),
            ExchangeKind::Broadcast => QueryStage::new_broadcast(id, exchange_node.clone()),
        });
        reuse.by_child_shape.insert(key, stage.clone());
        stage
    });

    let input = match ex.kind {
        ExchangeKind::Shuffle => QueryStageInput::Shuffle(ShuffleStageInput::new(
            stage,
            ex.properties.output.clone(),
            ex.properties.clone(),
        )),
        ExchangeKind::Broadcast => QueryStageInput::Broadcast(BroadcastStageInput {
            child: stage,
            output: ex.properties.output.clone(),
            properties: ex.properties.clone(),
        }),
    };
    Arc::new(PlanNode::StageInput(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ExchangeKind, ExchangeNode, PlanNode, UnionNode};
    use crate::test_support::{dummy_leaf, dummy_properties};

    fn shuffle_exchange_over(leaf_name: &str) -> PlanRef {
        Arc::new(PlanNode::Exchange(ExchangeNode {
            kind: ExchangeKind::Shuffle,
            child: dummy_leaf(leaf_name),
            properties: dummy_properties(),
        }))
    }

    #[test]
    fn disabled_flag_is_identity() {
        let root = shuffle_exchange_over("x");
        let config = AqseConfig::new().with_adaptive_execution_enabled(false);
        let mut reuse = StageReuseTable::new();
        let id_alloc = StageIdAllocator::default();
        match plan_query_stage(root.clone(), false, &config, &id_alloc, &mut reuse) {
            PlannedQuery::Identity(p) => assert!(Arc::ptr_eq(&p, &root)),
            PlannedQuery::Staged(_) => panic!("expected identity"),
        }
    }

    #[test]
    fn scenario_f_two_identical_exchanges_reuse_one_stage() {
        let left = shuffle_exchange_over("x");
        let right = shuffle_exchange_over("x");
        let root = Arc::new(PlanNode::Union(UnionNode {
            children: vec![left, right],
            properties: dummy_properties(),
        }));
        let config = AqseConfig::new();
        let mut reuse = StageReuseTable::new();
        let id_alloc = StageIdAllocator::default();

        let staged = match plan_query_stage(root, false, &config, &id_alloc, &mut reuse) {
            PlannedQuery::Staged(s) => s,
            PlannedQuery::Identity(_) => panic!("expected a staged result"),
        };
        let union = staged.child();
        let PlanNode::Union(u) = union.as_ref() else {
            panic!("expected union root")
        };
        let stage_id = |n: &PlanRef| match n.as_ref() {
            PlanNode::StageInput(i) => i.child_stage().id(),
            other => panic!("expected a stage input, got {:?}", other),
        };
        assert_eq!(stage_id(&u.children[0]), stage_id(&u.children[1]));
    }

    #[test]
    fn result_stage_wraps_non_command_root() {
        let root = dummy_leaf("x");
        let config = AqseConfig::new();
        let mut reuse = StageReuseTable::new();
        let id_alloc = StageIdAllocator::default();
        match plan_query_stage(root, false, &config, &id_alloc, &mut reuse) {
            PlannedQuery::Staged(s) => assert!(matches!(*s, QueryStage::Result(_))),
            PlannedQuery::Identity(_) => panic!("expected a result stage"),
        }
    }

    #[test]
    fn command_root_is_not_wrapped_but_exchanges_still_planned() {
        let root = shuffle_exchange_over("x");
        let config = AqseConfig::new();
        let mut reuse = StageReuseTable::new();
        let id_alloc = StageIdAllocator::default();
        match plan_query_stage(root, true, &config, &id_alloc, &mut reuse) {
            PlannedQuery::Identity(p) => assert!(matches!(p.as_ref(), PlanNode::StageInput(_))),
            PlannedQuery::Staged(_) => panic!("command roots must not be wrapped in a ResultStage"),
        }
    }
}
