// Copyright 2024 The Streampool Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use streampool_error::Error;
use streampool_util::inclusive_ranges::InclusiveRanges;
use streampool_util::processor_messages::{
    DataMeta, EventRefs, EventSearchSpec, FilterId, FilterTracker, FindDataCriteria,
    FindTaskCriteria, NodeId, ProcessorFilter, StreamId, StreamTask, TaskStatus,
};

/// Result of durably creating a batch of tasks. Tasks whose stream was
/// unlocked at creation time come back eagerly owned by the creating node and
/// ready to queue; the rest stay in the store until reclaimed.
#[derive(Debug, Default)]
pub struct CreatedTasks {
    pub available: Vec<StreamTask>,
    pub total_created: usize,
}

/// Source of processor filters. Implementations back onto whatever stores
/// filter definitions (and may see concurrent edits, hence `reload`).
#[async_trait]
pub trait FilterSource: Send + Sync {
    /// Returns every filter whose processor and filter flags are both
    /// enabled.
    async fn find_enabled_filters(&self) -> Result<Vec<ProcessorFilter>, Error>;

    /// Fetches the latest persisted state of `filter`. Returns `None` if the
    /// filter was deleted since it was found.
    async fn reload(&self, filter: &ProcessorFilter) -> Result<Option<ProcessorFilter>, Error>;
}

/// The sole sanctioned mutation surface for tasks and trackers. Every status
/// transition must go through `change_task_status` so persistence and
/// concurrency invariants stay consistent.
#[async_trait]
pub trait TaskStateManager: Send + Sync {
    /// Transitions `task` to `status`, bound to `node` (or unbound when
    /// `None`). Returns `None` when the transition was rejected, e.g. the
    /// task was concurrently modified; callers must then treat the task as
    /// not obtained.
    async fn change_task_status(
        &self,
        task: &StreamTask,
        node: Option<NodeId>,
        status: TaskStatus,
    ) -> Result<Option<StreamTask>, Error>;

    /// Finds previously created tasks matching `criteria`, ordered by task
    /// id ascending.
    async fn find_tasks(&self, criteria: FindTaskCriteria) -> Result<Vec<StreamTask>, Error>;

    /// Durably creates one task per entry of `creation_map` and advances the
    /// filter's tracker past the created streams. The tracker passed in must
    /// be the most recently saved instance.
    #[allow(clippy::too_many_arguments)]
    async fn create_new_tasks(
        &self,
        filter: &ProcessorFilter,
        tracker: &FilterTracker,
        stream_query_time_ms: u64,
        creation_map: Vec<(DataMeta, Option<InclusiveRanges>)>,
        node: NodeId,
        max_meta_id: Option<StreamId>,
        reached_limit: bool,
    ) -> Result<CreatedTasks, Error>;

    /// Returns every unprocessed task owned by `node` to the unowned pool.
    /// Used for crash recovery at startup.
    async fn release_owned_tasks(&self, node: NodeId) -> Result<u64, Error>;

    /// Persists `tracker` and returns the stored instance. Callers must use
    /// the returned value for any further mutation.
    async fn save_tracker(
        &self,
        filter_id: FilterId,
        tracker: FilterTracker,
    ) -> Result<FilterTracker, Error>;
}

/// Read access to the stream store's metadata.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Finds data items matching `criteria`, ordered ascending by id.
    async fn find(&self, criteria: FindDataCriteria) -> Result<Vec<DataMeta>, Error>;

    /// The highest data item id currently in the store, if any.
    async fn max_id(&self) -> Result<Option<StreamId>, Error>;

    async fn get(&self, id: StreamId) -> Result<Option<DataMeta>, Error>;
}

/// Dispatches a bounded event search. The task creator runs this on a
/// background task so a slow search never blocks a creation pass.
#[async_trait]
pub trait EventSearch: Send + Sync {
    async fn search(&self, spec: EventSearchSpec) -> Result<EventRefs, Error>;
}

/// Best-effort sink for internal statistics. Failures are logged and
/// swallowed by callers.
pub trait StatisticsSink: Send + Sync {
    fn emit_queue_size(&self, queue_size: usize, timestamp_ms: u64) -> Result<(), Error>;
}

/// Resolves this process's node identity. A deployment without a configured
/// node is a hard configuration error, so `default_node` failures propagate.
pub trait NodeSource: Send + Sync {
    fn default_node(&self) -> Result<NodeId, Error>;
}
