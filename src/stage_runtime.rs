//! The Stage Runtime (spec.md §4.4, §4.5): executes the DAG of stages,
//! firing child stages concurrently, running the adaptive rewriters once
//! their statistics are in, then executing the stage itself.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, OnceLock};

use crate::collaborators::{BroadcastHandle, Collaborators};
use crate::config::AqseConfig;
use crate::error::{AqseError, Result};
use crate::exchange_coordinator::{CoordinatorConfig, ExchangeCoordinator};
use crate::map_output_stats::MapOutputStatistics;
use crate::plan::{ExchangeKind, PlanNode, PlanRef};
use crate::rewrite::{handle_skewed_join, optimize_join};
use crate::stage::{BroadcastOutput, QueryStage, QueryStageInput, ShuffleStageInput, StageId, StageOutput};

/// spec.md §5: "a single process-wide, daemonized, unbounded-cached thread
/// pool named `adaptive-query-stage-pool`". A dedicated multi-threaded Tokio
/// runtime plays that role: `JoinHandle`s it hands out can be awaited from
/// any other runtime, so callers on the host's own executor simply await
/// the submission without blocking a worker thread on it.
fn stage_pool() -> &'static tokio::runtime::Runtime {
    static POOL: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    POOL.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("adaptive-query-stage-pool")
            .enable_all()
            .build()
            .expect("failed to start the adaptive-query-stage-pool")
    })
}

#[derive(Clone)]
pub struct StageRuntime {
    collaborators: Collaborators,
    config: AqseConfig,
}

impl StageRuntime {
    pub fn new(collaborators: Collaborators, config: AqseConfig) -> Self {
        Self { collaborators, config }
    }

    /// `QueryStage.execute()` (spec.md §4.4). Memoized: concurrent callers
    /// serialize on the stage's own cell and only the first runs the
    /// protocol (spec.md §5).
    pub async fn execute(&self, stage: &Arc<QueryStage>) -> Result<StageOutput> {
        match stage.as_ref() {
            QueryStage::Broadcast(_) => Err(AqseError::plan_invariant(
                "BroadcastStage.execute() called; broadcast stages do not produce an Rdd",
            )),
            QueryStage::Shuffle(_) | QueryStage::Result(_) => {
                stage.core().get_or_try_init_result(|| self.run_stage(stage)).await
            }
        }
    }

    /// `QueryStage.prepareBroadcast()` (spec.md §4.5).
    pub async fn prepare_broadcast(&self, stage: &Arc<QueryStage>) -> Result<BroadcastOutput> {
        let QueryStage::Broadcast(b) = stage.as_ref() else {
            return Err(AqseError::plan_invariant(
                "prepare_broadcast called on a non-broadcast stage",
            ));
        };
        b.get_or_try_init_prepared(|| self.run_broadcast(stage)).await
    }

    /// `QueryStage.executeBroadcast()` (spec.md §4.5).
    pub async fn execute_broadcast(&self, stage: &Arc<QueryStage>) -> Result<BroadcastHandle> {
        let output = self.prepare_broadcast(stage).await?;
        Ok(output.0)
    }

    async fn run_stage(&self, stage: &Arc<QueryStage>) -> Result<StageOutput> {
        let original_child = stage.child();

        // Step 1: child-stage fan-out.
        self.prepare_children(&original_child).await?;

        // Step 2: adaptive rewriting.
        let stage_tolerates_one_exchange = matches!(stage.as_ref(), QueryStage::Shuffle(_));
        let mut rewritten = optimize_join(
            &original_child,
            &self.config,
            stage_tolerates_one_exchange,
            self.collaborators.ensure_requirements.as_ref(),
        );
        rewritten = handle_skewed_join(&rewritten, &self.config);
        if !Arc::ptr_eq(&rewritten, &original_child) {
            rewritten = self.collaborators.ensure_requirements.apply(rewritten);
        }

        // Step 3: reducer-count determination.
        rewritten = self.assign_reducer_ranges(&rewritten)?;

        // Step 4: codegen collapse.
        rewritten = self.collaborators.collapse_codegen_stages.apply(rewritten);

        stage.core().set_child(rewritten.clone());

        // Step 5: observability hook.
        self.collaborators
            .event_bus
            .post_adaptive_execution_update(stage.id(), rewritten.to_string());

        // Step 6: execute.
        match stage.as_ref() {
            QueryStage::Shuffle(shuffle_stage) => {
                let PlanNode::Exchange(ex) = rewritten.as_ref() else {
                    return Err(AqseError::plan_invariant("ShuffleStage.child is not a ShuffleExchange"));
                };
                if ex.kind != ExchangeKind::Shuffle {
                    return Err(AqseError::plan_invariant("ShuffleStage.child is not a ShuffleExchange"));
                }
                let stats = self.collaborators.shuffle_executor.eager_execute(stage.id(), &rewritten)?;
                shuffle_stage
                    .map_output_statistics
                    .set(stats)
                    .map_err(|_| AqseError::plan_invariant("mapOutputStatistics set twice"))?;
                log::info!("stage {}: shuffle execution completed", stage.id());
            }
            QueryStage::Result(_) => {
                log::info!("stage {}: result stage execution completed", stage.id());
            }
            QueryStage::Broadcast(_) => unreachable!("rejected above"),
        }

        Ok(StageOutput { final_plan: rewritten })
    }

    async fn run_broadcast(&self, stage: &Arc<QueryStage>) -> Result<BroadcastOutput> {
        let original_child = stage.child();
        self.prepare_children(&original_child).await?;
        let collapsed = self.collaborators.collapse_codegen_stages.apply(original_child);
        stage.core().set_child(collapsed.clone());
        let handle = self
            .collaborators
            .broadcast_executor
            .prepare(stage.id(), &collapsed, None)?;
        log::info!("stage {}: broadcast preparation completed", stage.id());
        Ok(BroadcastOutput(handle))
    }

    /// Step 1 of spec.md §4.4: submit every distinct child stage referenced
    /// by a `ShuffleStageInput`/`BroadcastStageInput` to the shared pool and
    /// join all of them before proceeding.
    async fn prepare_children(&self, plan: &PlanRef) -> Result<()> {
        let mut seen = HashSet::new();
        let mut children = Vec::new();
        collect_child_stages(plan, &mut seen, &mut children);

        let mut handles = Vec::with_capacity(children.len());
        for child in children {
            let runtime = self.clone();
            handles.push(stage_pool().spawn(async move { runtime.ready_child(&child).await }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| AqseError::plan_invariant(format!("child stage task panicked: {e}")))??;
        }
        Ok(())
    }

    // Boxed (rather than a plain `async fn`) so the mutual recursion with
    // `execute`/`run_stage` doesn't force the compiler to unfold an
    // infinite future type while proving this is `Send`, which is required
    // since this future is handed to `stage_pool().spawn`.
    fn ready_child<'a>(
        &'a self,
        stage: &'a Arc<QueryStage>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match stage.as_ref() {
                QueryStage::Broadcast(_) => {
                    self.prepare_broadcast(stage).await?;
                }
                QueryStage::Shuffle(_) | QueryStage::Result(_) => {
                    self.execute(stage).await?;
                }
            }
            Ok(())
        })
    }

    /// Step 3 of spec.md §4.4.
    fn assign_reducer_ranges(&self, plan: &PlanRef) -> Result<PlanRef> {
        let mut eligible = Vec::new();
        collect_eligible_shuffle_inputs(plan, &mut eligible);
        if eligible.is_empty() {
            return Ok(plan.clone());
        }

        let stats: Vec<MapOutputStatistics> = eligible
            .iter()
            .map(|input| stats_for(input))
            .collect::<Result<_>>()?;

        let coordinator = ExchangeCoordinator::new(CoordinatorConfig::from(&self.config));
        let skewed_inputs: Vec<&ShuffleStageInput> =
            eligible.iter().filter(|s| s.skewed_partitions.is_some()).collect();

        let (starts, ends) = if eligible.len() == 2 && skewed_inputs.len() == 2 {
            let union_skew: BTreeSet<u32> = skewed_inputs
                .iter()
                .flat_map(|s| s.skewed_partitions.clone().unwrap_or_default())
                .collect();
            let (starts, ends) = coordinator.estimate_partition_start_end_indices(&stats, &union_skew)?;
            (starts, Some(ends))
        } else {
            (coordinator.estimate_partition_start_indices(&stats)?, None)
        };

        Ok(assign_ranges(plan, &starts, &ends))
    }
}

fn stats_for(input: &ShuffleStageInput) -> Result<MapOutputStatistics> {
    match input.child.as_ref() {
        QueryStage::Shuffle(shuffle) => shuffle
            .map_output_statistics
            .get()
            .cloned()
            .ok_or_else(|| AqseError::plan_invariant("eligible shuffle input has no map output statistics")),
        _ => Err(AqseError::plan_invariant(
            "ShuffleStageInput.child is not a ShuffleStage",
        )),
    }
}

fn collect_child_stages(plan: &PlanRef, seen: &mut HashSet<StageId>, out: &mut Vec<Arc<QueryStage>>) {
    match plan.as_ref() {
        PlanNode::StageInput(QueryStageInput::Shuffle(s)) => push_unique(&s.child, seen, out),
        PlanNode::StageInput(QueryStageInput::Broadcast(b)) => push_unique(&b.child, seen, out),
        _ => {}
    }
    for child in plan.children() {
        collect_child_stages(&child, seen, out);
    }
}

fn push_unique(stage: &Arc<QueryStage>, seen: &mut HashSet<StageId>, out: &mut Vec<Arc<QueryStage>>) {
    if seen.insert(stage.id()) {
        out.push(stage.clone());
    }
}

fn collect_eligible_shuffle_inputs(plan: &PlanRef, out: &mut Vec<ShuffleStageInput>) {
    if let PlanNode::StageInput(QueryStageInput::Shuffle(s)) = plan.as_ref() {
        if s.partition_start_indices.is_none() && !s.is_local_shuffle {
            out.push(s.clone());
        }
    }
    for child in plan.children() {
        collect_eligible_shuffle_inputs(&child, out);
    }
}

fn assign_ranges(plan: &PlanRef, starts: &[u32], ends: &Option<Vec<u32>>) -> PlanRef {
    if let PlanNode::StageInput(QueryStageInput::Shuffle(s)) = plan.as_ref() {
        if s.partition_start_indices.is_none() && !s.is_local_shuffle {
            let updated = s.with_partition_indices(starts.to_vec(), ends.clone());
            return Arc::new(PlanNode::StageInput(QueryStageInput::Shuffle(updated)));
        }
        return plan.clone();
    }
    let new_children: Vec<PlanRef> = plan
        .children()
        .iter()
        .map(|c| assign_ranges(c, starts, ends))
        .collect();
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
