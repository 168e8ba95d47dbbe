//! `QueryStage` and `QueryStageInput` (spec.md §3).
//!
//! `mapOutputStatistics` and `cachedResult`/`prepared` are single-assignment
//! slots guarded by the stage's own monitor (spec.md §3, §5). `tokio::sync::
//! OnceCell::get_or_try_init` gives exactly that for free: concurrent
//! callers serialize on the same cell and only the first actually runs the
//! initializer, which is precisely spec.md §5's "concurrent `execute` calls
//! on the same stage serialize and only the first does the work."
//!
//! The stage id allocator mirrors the teacher's `ExecutionGraph` (`raysql`'s
//! `query_stages: HashMap<usize, Arc<QueryStage>>` keyed off an
//! `AtomicUsize` generator) rather than re-deriving an equivalent structure.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::collaborators::BroadcastHandle;
use crate::map_output_stats::MapOutputStatistics;
use crate::plan::{NodeProperties, PlanRef, Schema};

pub type StageId = usize;

#[derive(Debug, Default)]
pub struct StageIdAllocator(AtomicUsize);

impl StageIdAllocator {
    pub fn next(&self) -> StageId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// The artifact a non-broadcast stage's `execute()` produces. Standing in
/// for the `Rdd` spec.md describes: actual shuffle I/O is an external
/// collaborator (spec.md §1), so this only remembers the finalized plan
/// that was executed, post adaptive-rewrite.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub final_plan: PlanRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutput(pub BroadcastHandle);

/// Fields shared by all three `QueryStage` variants.
#[derive(Debug)]
pub struct StageCore {
    pub id: StageId,
    child: Mutex<PlanRef>,
    cached_result: OnceCell<StageOutput>,
}

impl StageCore {
    pub fn new(id: StageId, child: PlanRef) -> Self {
        Self {
            id,
            child: Mutex::new(child),
            cached_result: OnceCell::new(),
        }
    }

    pub fn child(&self) -> PlanRef {
        self.child.lock().expect("stage monitor poisoned").clone()
    }

    /// spec.md §5: "rewrite mutations are buffered into a new child value
    /// and assigned atomically." Rewriters never mutate the tree in place;
    /// they build a replacement and swap it in here.
    pub fn set_child(&self, new_child: PlanRef) {
        *self.child.lock().expect("stage monitor poisoned") = new_child;
    }

    pub fn cached_result(&self) -> Option<StageOutput> {
        self.cached_result.get().cloned()
    }

    /// spec.md §5: "concurrent `execute` calls on the same stage serialize
    /// and only the first does the work." `OnceCell::get_or_try_init`
    /// provides exactly that; a failed initializer leaves the cell empty so
    /// the next call retries the whole protocol (spec.md §5: "no partial
    /// state is committed").
    pub async fn get_or_try_init_result<F, Fut>(&self, init: F) -> crate::error::Result<StageOutput>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<StageOutput>>,
    {
        self.cached_result.get_or_try_init(init).await.cloned()
    }
}

#[derive(Debug)]
pub struct ShuffleStage {
    pub core: StageCore,
    pub map_output_statistics: OnceCell<MapOutputStatistics>,
}

#[derive(Debug)]
pub struct BroadcastStage {
    pub core: StageCore,
    pub prepared: OnceCell<BroadcastOutput>,
}

impl BroadcastStage {
    /// spec.md §4.5: "`prepareBroadcast()` is idempotent (guarded by
    /// `prepared`)."
    pub async fn get_or_try_init_prepared<F, Fut>(&self, init: F) -> crate::error::Result<BroadcastOutput>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<BroadcastOutput>>,
    {
        self.prepared.get_or_try_init(init).await.map(|v| *v)
    }
}

#[derive(Debug)]
pub struct ResultStage {
    pub core: StageCore,
}

#[derive(Debug)]
pub enum QueryStage {
    Shuffle(ShuffleStage),
    Broadcast(BroadcastStage),
    Result(ResultStage),
}

impl QueryStage {
    pub fn new_shuffle(id: StageId, child: PlanRef) -> Self {
        QueryStage::Shuffle(ShuffleStage {
            core: StageCore::new(id, child),
            map_output_statistics: OnceCell::new(),
        })
    }

    pub fn new_broadcast(id: StageId, child: PlanRef) -> Self {
        QueryStage::Broadcast(BroadcastStage {
            core: StageCore::new(id, child),
            prepared: OnceCell::new(),
        })
    }

    pub fn new_result(id: StageId, child: PlanRef) -> Self {
        QueryStage::Result(ResultStage {
            core: StageCore::new(id, child),
        })
    }

    pub fn core(&self) -> &StageCore {
        match self {
            QueryStage::Shuffle(s) => &s.core,
            QueryStage::Broadcast(s) => &s.core,
            QueryStage::Result(s) => &s.core,
        }
    }

    pub fn id(&self) -> StageId {
        self.core().id
    }

    pub fn child(&self) -> PlanRef {
        self.core().child()
    }

    pub fn is_prepared(&self) -> bool {
        match self {
            QueryStage::Broadcast(s) => s.prepared.initialized(),
            _ => self.core().cached_result.initialized(),
        }
    }
}

/// A leaf in the parent stage's plan that hides a child stage
/// (spec.md §3).
#[derive(Debug, Clone)]
pub enum QueryStageInput {
    Shuffle(ShuffleStageInput),
    SkewedShuffle(SkewedShuffleStageInput),
    Broadcast(BroadcastStageInput),
}

impl QueryStageInput {
    pub fn properties(&self) -> &NodeProperties {
        match self {
            QueryStageInput::Shuffle(s) => &s.properties,
            QueryStageInput::SkewedShuffle(s) => &s.properties,
            QueryStageInput::Broadcast(s) => &s.properties,
        }
    }

    pub fn child_stage(&self) -> Arc<QueryStage> {
        match self {
            QueryStageInput::Shuffle(s) => s.child.clone(),
            QueryStageInput::SkewedShuffle(s) => s.child.clone(),
            QueryStageInput::Broadcast(s) => s.child.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShuffleStageInput {
    pub child: Arc<QueryStage>,
    pub output: Schema,
    pub is_local_shuffle: bool,
    pub skewed_partitions: Option<BTreeSet<u32>>,
    pub partition_start_indices: Option<Vec<u32>>,
    pub partition_end_indices: Option<Vec<u32>>,
    pub properties: NodeProperties,
}

impl ShuffleStageInput {
    pub fn new(child: Arc<QueryStage>, output: Schema, properties: NodeProperties) -> Self {
        Self {
            child,
            output,
            is_local_shuffle: false,
            skewed_partitions: None,
            partition_start_indices: None,
            partition_end_indices: None,
            properties,
        }
    }

    /// spec.md §3: "`partitionStartIndices` and `partitionEndIndices`, if
    /// both set, have equal length and `start[i] < end[i] <= start[i+1]`."
    pub fn validate(&self) {
        if let (Some(starts), Some(ends)) = (
            self.partition_start_indices.as_ref(),
            self.partition_end_indices.as_ref(),
        ) {
            assert_eq!(starts.len(), ends.len());
            for i in 0..starts.len() {
                assert!(starts[i] < ends[i]);
                if i + 1 < starts.len() {
                    assert!(ends[i] <= starts[i + 1]);
                }
            }
        }
    }

    /// Produces a clone with `partition_start_indices`/`partition_end_indices`
    /// set, enforcing the write-once lifecycle (spec.md §3) by asserting the
    /// fields were previously unset.
    pub fn with_partition_indices(&self, start: Vec<u32>, end: Option<Vec<u32>>) -> Self {
        debug_assert!(
            self.partition_start_indices.is_none(),
            "partitionStartIndices must be written exactly once"
        );
        let mut next = self.clone();
        next.partition_start_indices = Some(start);
        next.partition_end_indices = end;
        next.validate();
        next
    }

    pub fn with_skewed_partitions(&self, skewed: BTreeSet<u32>) -> Self {
        debug_assert!(
            self.skewed_partitions.is_none(),
            "skewedPartitions must be written exactly once"
        );
        let mut next = self.clone();
        next.skewed_partitions = Some(skewed);
        next
    }

    pub fn with_local_shuffle(&self, is_local_shuffle: bool) -> Self {
        let mut next = self.clone();
        next.is_local_shuffle = is_local_shuffle;
        next
    }
}

#[derive(Debug, Clone)]
pub struct SkewedShuffleStageInput {
    pub child: Arc<QueryStage>,
    pub output: Schema,
    pub partition_id: u32,
    pub start_map_id: u32,
    pub end_map_id: u32,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone)]
pub struct BroadcastStageInput {
    pub child: Arc<QueryStage>,
    pub output: Schema,
    pub properties: NodeProperties,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn validate_rejects_overlapping_ranges() {
        let input = ShuffleStageInput {
            child: Arc::new(QueryStage::new_shuffle(0, crate::test_support::dummy_leaf("l"))),
            output: vec![],
            is_local_shuffle: false,
            skewed_partitions: None,
            partition_start_indices: Some(vec![0, 2]),
            partition_end_indices: Some(vec![3, 4]),
            properties: crate::test_support::dummy_properties(),
        };
        input.validate();
    }
}
