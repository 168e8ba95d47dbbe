//! Fixtures shared by unit tests across modules. Not part of the public API.

use std::sync::Arc;

use datafusion::physical_plan::Partitioning;

use crate::plan::{Attribute, AttributeId, NodeProperties, OtherNode, PlanNode, PlanRef, PlanStats, Schema};

pub fn attr(id: u64, name: &str) -> Attribute {
    Attribute {
        id: AttributeId(id),
        name: name.to_string(),
        data_type: datafusion::arrow::datatypes::DataType::Int64,
    }
}

pub fn dummy_schema(names: &[&str]) -> Schema {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| attr(i as u64, n))
        .collect()
}

pub fn dummy_properties() -> NodeProperties {
    dummy_properties_with_stats(None, None)
}

pub fn dummy_properties_with_stats(size_in_bytes: Option<i64>, row_count: Option<u64>) -> NodeProperties {
    NodeProperties {
        output: dummy_schema(&["a"]),
        output_partitioning: Partitioning::UnknownPartitioning(1),
        output_ordering: None,
        stats: PlanStats {
            size_in_bytes,
            row_count,
        },
    }
}

/// A leaf `Other` node standing in for a scan/project — the operator
/// library is out of AQSE's scope (spec.md §1).
pub fn dummy_leaf(name: &str) -> PlanRef {
    Arc::new(PlanNode::Other(OtherNode {
        name: name.to_string(),
        children: vec![],
        properties: dummy_properties(),
    }))
}
