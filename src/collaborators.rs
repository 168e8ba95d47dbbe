//! The external interfaces AQSE consumes but does not implement
//! (spec.md §1, §6). The physical operator library, the shuffle I/O
//! subsystem, codegen fusion, and the cluster scheduler all live behind
//! these trait objects so the stage runtime and rewriters can be exercised
//! against fakes without pulling in a real distributed engine.

use std::sync::Arc;

use crate::error::Result;
use crate::map_output_stats::MapOutputStatistics;
use crate::plan::{BuildSide, PlanRef};
use crate::stage::StageId;

/// `ShuffleExchange.eagerExecute() -> Rdd` (spec.md §6): runs a shuffle
/// write end-to-end for the given child plan and partitioning, returning
/// the statistics the coordinator needs. The `Rdd` itself is not
/// represented; shuffle block storage is an external subsystem AQSE only
/// references by handle (spec.md §5).
pub trait ShuffleExecutor: Send + Sync {
    fn eager_execute(&self, stage_id: StageId, child: &PlanRef) -> Result<MapOutputStatistics>;
}

/// `prepareBroadcast()`'s side effect (spec.md §4.5): materializes the
/// child plan and distributes it, returning an opaque handle.
pub trait BroadcastExecutor: Send + Sync {
    fn prepare(&self, stage_id: StageId, child: &PlanRef, build_side_hint: Option<BuildSide>) -> Result<BroadcastHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastHandle(pub StageId);

/// A pure plan-to-plan rule: `EnsureRequirements(plan) -> plan` or
/// `CollapseCodegenStages(plan) -> plan` (spec.md §6).
pub trait PlanRule: Send + Sync {
    fn apply(&self, plan: PlanRef) -> PlanRef;
}

/// `MapOutputTracker.getMapLocation(dep, startMapId, endMapId) -> [host]`
/// (spec.md §6), used for the preferred-location contract in §4.1.
pub trait MapOutputTracker: Send + Sync {
    fn get_map_location(&self, stage_id: StageId, start_map_id: u32, end_map_id: u32) -> Vec<String>;
}

/// `ShuffleManager.getReader(..) -> Reader<(Int, Row)>` (spec.md §6). The
/// reader's row stream is out of scope; only the handle matters here.
pub trait ShuffleReader: Send + Sync {}

pub trait ShuffleManager: Send + Sync {
    fn get_reader(
        &self,
        stage_id: StageId,
        reducer_start: u32,
        reducer_end: u32,
        map_start: u32,
        map_end: u32,
    ) -> Box<dyn ShuffleReader>;
}

/// The event bus `post(AdaptiveExecutionUpdate)` hook (spec.md §4.4 step 5).
pub trait EventBus: Send + Sync {
    fn post_adaptive_execution_update(&self, stage_id: StageId, plan_display: String);
}

/// The bundle of collaborators the stage runtime and rewriters are wired
/// against. Dependency-injected rather than looked up globally so tests can
/// swap in fakes (spec.md §1: these are all "external collaborators").
#[derive(Clone)]
pub struct Collaborators {
    pub shuffle_executor: Arc<dyn ShuffleExecutor>,
    pub broadcast_executor: Arc<dyn BroadcastExecutor>,
    pub ensure_requirements: Arc<dyn PlanRule>,
    pub collapse_codegen_stages: Arc<dyn PlanRule>,
    pub map_output_tracker: Arc<dyn MapOutputTracker>,
    pub shuffle_manager: Arc<dyn ShuffleManager>,
    pub event_bus: Arc<dyn EventBus>,
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Returns precomputed statistics for each stage, as if the shuffle
    /// write had already happened. Good enough to drive the stage runtime
    /// protocol in tests without real shuffle I/O.
    pub struct FixedShuffleExecutor {
        pub stats: Mutex<std::collections::HashMap<StageId, MapOutputStatistics>>,
    }

    impl FixedShuffleExecutor {
        pub fn new() -> Self {
            Self {
                stats: Mutex::new(std::collections::HashMap::new()),
            }
        }

        pub fn with_stats(self, stage_id: StageId, stats: MapOutputStatistics) -> Self {
            self.stats.lock().unwrap().insert(stage_id, stats);
            self
        }
    }

    impl ShuffleExecutor for FixedShuffleExecutor {
        fn eager_execute(&self, stage_id: StageId, _child: &PlanRef) -> Result<MapOutputStatistics> {
            self.stats
                .lock()
                .unwrap()
                .get(&stage_id)
                .cloned()
                .ok_or_else(|| crate::error::AqseError::plan_invariant(format!(
                    "no fixture statistics registered for stage {:?}",
                    stage_id
                )))
        }
    }

    pub struct NoopBroadcastExecutor;

    impl BroadcastExecutor for NoopBroadcastExecutor {
        fn prepare(&self, stage_id: StageId, _child: &PlanRef, _build_side_hint: Option<BuildSide>) -> Result<BroadcastHandle> {
            Ok(BroadcastHandle(stage_id))
        }
    }

    pub struct IdentityRule;

    impl PlanRule for IdentityRule {
        fn apply(&self, plan: PlanRef) -> PlanRef {
            plan
        }
    }

    pub struct NoopMapOutputTracker;

    impl MapOutputTracker for NoopMapOutputTracker {
        fn get_map_location(&self, _stage_id: StageId, _start_map_id: u32, _end_map_id: u32) -> Vec<String> {
            vec![]
        }
    }

    pub struct NoopShuffleReader;
    impl ShuffleReader for NoopShuffleReader {}

    pub struct NoopShuffleManager;

    impl ShuffleManager for NoopShuffleManager {
        fn get_reader(
            &self,
            _stage_id: StageId,
            _reducer_start: u32,
            _reducer_end: u32,
            _map_start: u32,
            _map_end: u32,
        ) -> Box<dyn ShuffleReader> {
            Box::new(NoopShuffleReader)
        }
    }

    pub struct RecordingEventBus {
        pub events: Mutex<Vec<(StageId, String)>>,
    }

    impl RecordingEventBus {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(vec![]),
            }
        }
    }

    impl EventBus for RecordingEventBus {
        fn post_adaptive_execution_update(&self, stage_id: StageId, plan_display: String) {
            self.events.lock().unwrap().push((stage_id, plan_display));
        }
    }

    pub fn fake_collaborators(shuffle_executor: FixedShuffleExecutor) -> Collaborators {
        Collaborators {
            shuffle_executor: Arc::new(shuffle_executor),
            broadcast_executor: Arc::new(NoopBroadcastExecutor),
            ensure_requirements: Arc::new(IdentityRule),
            collapse_codegen_stages: Arc::new(IdentityRule),
            map_output_tracker: Arc::new(NoopMapOutputTracker),
            shuffle_manager: Arc::new(NoopShuffleManager),
            event_bus: Arc::new(RecordingEventBus::new()),
        }
    }
}
