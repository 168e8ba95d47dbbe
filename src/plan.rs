//! The physical plan tree AQSE rewrites and fragments.
//!
//! spec.md §9 prescribes replacing dynamic inheritance with a sum type and
//! an external visitor for rewrites: `PlanNode` is that sum type. Real
//! operators (scans, projects, filters, the physical join/sort/union
//! implementations) are out of AQSE's scope (spec.md §1) and live behind
//! the opaque `Other` leaf; AQSE only needs to pattern-match on the
//! handful of shapes it rewrites or fragments at.

use std::fmt;
use std::sync::Arc;

use datafusion::arrow::datatypes::DataType;
use datafusion::logical_expr::JoinType;
use datafusion::physical_expr::PhysicalSortExpr;
use datafusion::physical_plan::Partitioning;

use crate::stage::QueryStageInput;

pub type PlanRef = Arc<PlanNode>;

/// A stable attribute identity, distinct from its position in the schema.
/// spec.md §3: "A `QueryStageInput`'s `output` attribute identities may
/// differ from its child stage's; an attribute-rewriting map is applied
/// when propagating `outputPartitioning` and `outputOrdering` upward."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub id: AttributeId,
    pub name: String,
    pub data_type: DataType,
}

pub type Schema = Vec<Attribute>;

/// The estimated `stats` record every plan node carries (spec.md §3).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanStats {
    pub size_in_bytes: Option<i64>,
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NodeProperties {
    pub output: Schema,
    pub output_partitioning: Partitioning,
    pub output_ordering: Option<Vec<PhysicalSortExpr>>,
    pub stats: PlanStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Shuffle,
    Broadcast,
}

#[derive(Debug, Clone)]
pub struct ExchangeNode {
    pub kind: ExchangeKind,
    pub child: PlanRef,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSide {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct SortMergeJoinNode {
    pub left: PlanRef,
    pub right: PlanRef,
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    pub join_type: JoinType,
    pub condition: Option<String>,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone)]
pub struct BroadcastHashJoinNode {
    pub left: PlanRef,
    pub right: PlanRef,
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    pub join_type: JoinType,
    pub condition: Option<String>,
    pub build_side: BuildSide,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone)]
pub struct SortNode {
    pub child: PlanRef,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone)]
pub struct UnionNode {
    pub children: Vec<PlanRef>,
    pub properties: NodeProperties,
}

/// An opaque leaf or unmodeled operator: scans, projects, filters, and
/// anything else AQSE does not need to rewrite. `name` is only used for
/// display and for the stage planner's semantic-equality check.
#[derive(Debug, Clone)]
pub struct OtherNode {
    pub name: String,
    pub children: Vec<PlanRef>,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone)]
pub enum PlanNode {
    Exchange(ExchangeNode),
    SortMergeJoin(SortMergeJoinNode),
    BroadcastHashJoin(BroadcastHashJoinNode),
    Sort(SortNode),
    Union(UnionNode),
    StageInput(QueryStageInput),
    Other(OtherNode),
}

impl PlanNode {
    pub fn properties(&self) -> &NodeProperties {
        match self {
            PlanNode::Exchange(n) => &n.properties,
            PlanNode::SortMergeJoin(n) => &n.properties,
            PlanNode::BroadcastHashJoin(n) => &n.properties,
            PlanNode::Sort(n) => &n.properties,
            PlanNode::Union(n) => &n.properties,
            PlanNode::StageInput(n) => n.properties(),
            PlanNode::Other(n) => &n.properties,
        }
    }

    pub fn children(&self) -> Vec<PlanRef> {
        match self {
            PlanNode::Exchange(n) => vec![n.child.clone()],
            PlanNode::SortMergeJoin(n) => vec![n.left.clone(), n.right.clone()],
            PlanNode::BroadcastHashJoin(n) => vec![n.left.clone(), n.right.clone()],
            PlanNode::Sort(n) => vec![n.child.clone()],
            PlanNode::Union(n) => n.children.clone(),
            PlanNode::StageInput(_) => vec![],
            PlanNode::Other(n) => n.children.clone(),
        }
    }

    /// Rebuilds this node with new children, in the same order `children()`
    /// returned them. Used by rewrites that only change the subtree below a
    /// node (spec.md §9: "build a new subtree, then swap the root child").
    pub fn with_new_children(&self, mut new_children: Vec<PlanRef>) -> PlanNode {
        match self {
            PlanNode::Exchange(n) => {
                assert_eq!(new_children.len(), 1);
                PlanNode::Exchange(ExchangeNode {
                    kind: n.kind,
                    child: new_children.remove(0),
                    properties: n.properties.clone(),
                })
            }
            PlanNode::SortMergeJoin(n) => {
                assert_eq!(new_children.len(), 2);
                let right = new_children.remove(1);
                let left = new_children.remove(0);
                PlanNode::SortMergeJoin(SortMergeJoinNode {
                    left,
                    right,
                    left_keys: n.left_keys.clone(),
                    right_keys: n.right_keys.clone(),
                    join_type: n.join_type,
                    condition: n.condition.clone(),
                    properties: n.properties.clone(),
                })
            }
            PlanNode::BroadcastHashJoin(n) => {
                assert_eq!(new_children.len(), 2);
                let right = new_children.remove(1);
                let left = new_children.remove(0);
                PlanNode::BroadcastHashJoin(BroadcastHashJoinNode {
                    left,
                    right,
                    left_keys: n.left_keys.clone(),
                    right_keys: n.right_keys.clone(),
                    join_type: n.join_type,
                    condition: n.condition.clone(),
                    build_side: n.build_side,
                    properties: n.properties.clone(),
                })
            }
            PlanNode::Sort(n) => {
                assert_eq!(new_children.len(), 1);
                PlanNode::Sort(SortNode {
                    child: new_children.remove(0),
                    properties: n.properties.clone(),
                })
            }
            PlanNode::Union(n) => {
                assert_eq!(new_children.len(), n.children.len());
                PlanNode::Union(UnionNode {
                    children: new_children,
                    properties: n.properties.clone(),
                })
            }
            PlanNode::StageInput(n) => {
                assert!(new_children.is_empty());
                PlanNode::StageInput(n.clone())
            }
            PlanNode::Other(n) => PlanNode::Other(OtherNode {
                name: n.name.clone(),
                children: new_children,
                properties: n.properties.clone(),
            }),
        }
    }

    /// Recursively replaces every node for which `matcher` returns a
    /// replacement, bottom-up, leaving everything else structurally shared.
    pub fn transform_up<F>(self: &PlanRef, f: &mut F) -> PlanRef
    where
        F: FnMut(&PlanRef) -> Option<PlanRef>,
    {
        let new_children: Vec<PlanRef> = self
            .children()
            .iter()
            .map(|c| c.transform_up(f))
            .collect();
        let rebuilt: PlanRef = if new_children
            .iter()
            .zip(self.children().iter())
            .all(|(a, b)| Arc::ptr_eq(a, b))
        {
            self.clone()
        } else {
            Arc::new(self.with_new_children(new_children))
        };
        f(&rebuilt).unwrap_or(rebuilt)
    }

    /// A structural fingerprint used by the stage planner's reuse rule
    /// (spec.md §4.3): two exchanges whose children produce an equal
    /// fingerprint are considered semantically equal "modulo attribute
    /// renaming", since attribute names/types/shape are compared but
    /// attribute ids are not.
    pub fn semantic_key(&self) -> String {
        let shape = self
            .properties()
            .output
            .iter()
            .map(|a| format!("{}:{:?}", a.name, a.data_type))
            .collect::<Vec<_>>()
            .join(",");
        let children_keys = self
            .children()
            .iter()
            .map(|c| c.semantic_key())
            .collect::<Vec<_>>()
            .join("|");
        format!("{}[{}]({})", self.kind_name(), shape, children_keys)
    }

    fn kind_name(&self) -> String {
        match self {
            PlanNode::Exchange(n) => match n.kind {
                ExchangeKind::Shuffle => "ShuffleExchange".to_string(),
                ExchangeKind::Broadcast => "BroadcastExchange".to_string(),
            },
            PlanNode::SortMergeJoin(_) => "SortMergeJoin".to_string(),
            PlanNode::BroadcastHashJoin(_) => "BroadcastHashJoin".to_string(),
            PlanNode::Sort(_) => "Sort".to_string(),
            PlanNode::Union(_) => "Union".to_string(),
            PlanNode::StageInput(_) => "StageInput".to_string(),
            PlanNode::Other(n) => n.name.clone(),
        }
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind_name())?;
        let children = self.children();
        if !children.is_empty() {
            write!(f, "(")?;
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", c)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
