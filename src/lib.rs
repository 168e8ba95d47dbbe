// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Adaptive Query Stage Engine: reducer-count determination, skew handling
//! and join-strategy rewriting for a staged, DataFusion-based distributed
//! query engine. The physical operator library, the shuffle I/O subsystem,
//! codegen fusion, and the cluster scheduler are external collaborators
//! this crate depends on through the traits in [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod error;
pub mod exchange_coordinator;
pub mod map_output_stats;
pub mod partition_range;
pub mod plan;
pub mod rewrite;
pub mod shuffle;
pub mod stage;
pub mod stage_planner;
pub mod stage_runtime;

#[cfg(test)]
mod test_support;

pub use collaborators::{
    BroadcastExecutor, BroadcastHandle, Collaborators, EventBus, MapOutputTracker, PlanRule,
    ShuffleExecutor, ShuffleManager, ShuffleReader,
};
pub use config::AqseConfig;
pub use error::{AqseError, Result};
pub use stage::{QueryStage, QueryStageInput, StageId, StageIdAllocator};
pub use stage_planner::{plan_query_stage, PlannedQuery, StageReuseTable};
pub use stage_runtime::StageRuntime;
