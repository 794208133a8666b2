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

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use streampool_error::{make_err, Code, Error};
use streampool_util::inclusive_ranges::InclusiveRanges;
use streampool_util::processor_messages::{
    Condition, DataMeta, DataStatus, EventRefs, EventSearchSpec, ExpressionItem, ExpressionOp,
    ExpressionOperator, FilterId, FilterTracker, FindDataCriteria, FindTaskCriteria, NodeId,
    ProcessorFilter, StreamId, StreamTask, TaskId, TaskStatus, TrackerStatus,
};
use tokio::sync::Notify;

use crate::task_state_manager::{
    CreatedTasks, EventSearch, FilterSource, MetaStore, NodeSource, StatisticsSink,
    TaskStateManager,
};

#[derive(Default)]
struct State {
    filters: HashMap<FilterId, ProcessorFilter>,
    trackers: HashMap<FilterId, FilterTracker>,
    tasks: BTreeMap<TaskId, StreamTask>,
    metas: BTreeMap<StreamId, DataMeta>,
    next_task_id: TaskId,
}

/// In-memory filter, tracker, task and stream-meta state.
///
/// Backs the integration tests and the single-process deployment. Status
/// transitions carry the same version-checked semantics a durable store
/// would have, so stale or duplicate transitions are rejected.
#[derive(Default)]
pub struct MemoryTaskState {
    state: Mutex<State>,
}

impl MemoryTaskState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_filter(&self, filter: ProcessorFilter) {
        let mut state = self.state.lock();
        state.trackers.insert(filter.id, filter.tracker.clone());
        state.filters.insert(filter.id, filter);
    }

    pub fn remove_filter(&self, filter_id: FilterId) {
        let mut state = self.state.lock();
        state.filters.remove(&filter_id);
    }

    pub fn set_filter_enabled(&self, filter_id: FilterId, enabled: bool) {
        if let Some(filter) = self.state.lock().filters.get_mut(&filter_id) {
            filter.enabled = enabled;
        }
    }

    pub fn insert_meta(&self, meta: DataMeta) {
        self.state.lock().metas.insert(meta.id, meta);
    }

    /// Inserts a pre-existing task, e.g. one left over from a previous run.
    pub fn insert_task(&self, task: StreamTask) {
        let mut state = self.state.lock();
        state.next_task_id = state.next_task_id.max(task.id + 1);
        state.tasks.insert(task.id, task);
    }

    pub fn task(&self, task_id: TaskId) -> Option<StreamTask> {
        self.state.lock().tasks.get(&task_id).cloned()
    }

    pub fn tasks_for_filter(&self, filter_id: FilterId) -> Vec<StreamTask> {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|task| task.filter_id == filter_id)
            .cloned()
            .collect()
    }

    pub fn tracker(&self, filter_id: FilterId) -> Option<FilterTracker> {
        self.state.lock().trackers.get(&filter_id).cloned()
    }

    fn filter_with_current_tracker(state: &State, filter: &ProcessorFilter) -> ProcessorFilter {
        let mut filter = filter.clone();
        if let Some(tracker) = state.trackers.get(&filter.id) {
            filter.tracker = tracker.clone();
        }
        filter
    }
}

fn expression_matches(expression: &ExpressionOperator, meta: &DataMeta) -> bool {
    let results = expression
        .children
        .iter()
        .map(|item| match item {
            ExpressionItem::Operator(op) => expression_matches(op, meta),
            ExpressionItem::Term(term) => {
                // Only feed terms are meaningful for in-memory metadata.
                if !term.field.eq_ignore_ascii_case("feed") {
                    return true;
                }
                match term.condition {
                    Condition::Equals => meta.feed == term.value,
                    Condition::Contains => meta.feed.contains(&term.value),
                    _ => true,
                }
            }
        })
        .collect::<Vec<bool>>();
    match expression.op {
        ExpressionOp::And => results.iter().all(|v| *v),
        ExpressionOp::Or => results.is_empty() || results.iter().any(|v| *v),
        ExpressionOp::Not => !results.iter().all(|v| *v),
    }
}

#[async_trait]
impl FilterSource for MemoryTaskState {
    async fn find_enabled_filters(&self) -> Result<Vec<ProcessorFilter>, Error> {
        let state = self.state.lock();
        Ok(state
            .filters
            .values()
            .filter(|filter| filter.is_enabled())
            .map(|filter| Self::filter_with_current_tracker(&state, filter))
            .collect())
    }

    async fn reload(&self, filter: &ProcessorFilter) -> Result<Option<ProcessorFilter>, Error> {
        let state = self.state.lock();
        Ok(state
            .filters
            .get(&filter.id)
            .map(|filter| Self::filter_with_current_tracker(&state, filter)))
    }
}

#[async_trait]
impl TaskStateManager for MemoryTaskState {
    async fn change_task_status(
        &self,
        task: &StreamTask,
        node: Option<NodeId>,
        status: TaskStatus,
    ) -> Result<Option<StreamTask>, Error> {
        let mut state = self.state.lock();
        let Some(stored) = state.tasks.get_mut(&task.id) else {
            return Ok(None);
        };
        // A version mismatch means somebody else got to the task first.
        if stored.version != task.version {
            return Ok(None);
        }
        stored.status = status;
        stored.node = node;
        stored.version += 1;
        Ok(Some(stored.clone()))
    }

    async fn find_tasks(&self, criteria: FindTaskCriteria) -> Result<Vec<StreamTask>, Error> {
        let state = self.state.lock();
        let mut found = Vec::new();
        for task in state.tasks.values() {
            if found.len() >= criteria.limit {
                break;
            }
            if task.filter_id != criteria.filter_id {
                continue;
            }
            if !criteria.statuses.contains(&task.status) {
                continue;
            }
            if criteria.unowned_only && task.node.is_some() {
                continue;
            }
            if criteria.stream_unlocked_only {
                let unlocked = state
                    .metas
                    .get(&task.stream_id)
                    .is_some_and(|meta| meta.status == DataStatus::Unlocked);
                if !unlocked {
                    continue;
                }
            }
            found.push(task.clone());
        }
        Ok(found)
    }

    async fn create_new_tasks(
        &self,
        filter: &ProcessorFilter,
        tracker: &FilterTracker,
        stream_query_time_ms: u64,
        creation_map: Vec<(DataMeta, Option<InclusiveRanges>)>,
        node: NodeId,
        _max_meta_id: Option<StreamId>,
        reached_limit: bool,
    ) -> Result<CreatedTasks, Error> {
        let mut state = self.state.lock();
        let mut created = CreatedTasks::default();
        let mut tracker = tracker.clone();
        let mut max_stream_id = None;
        let mut event_count = 0;

        for (meta, ranges) in creation_map {
            let task_id = state.next_task_id;
            state.next_task_id += 1;
            let unlocked = meta.status == DataStatus::Unlocked;
            if let Some(ranges) = &ranges {
                event_count += ranges.event_count();
            }
            let task = StreamTask {
                id: task_id,
                version: 0,
                filter_id: filter.id,
                stream_id: meta.id,
                status: TaskStatus::Unprocessed,
                // Tasks over unlocked streams are handed straight to the
                // creating node; locked ones wait to be reclaimed later.
                node: unlocked.then_some(node),
                event_ranges: ranges.map(|ranges| ranges.to_string()),
                create_time_ms: stream_query_time_ms,
            };
            max_stream_id = max_stream_id.max(Some(meta.id));
            state.tasks.insert(task_id, task.clone());
            created.total_created += 1;
            if unlocked {
                created.available.push(task);
            }
        }

        // The cursor advances here, at creation time, and never rewinds.
        if let Some(max_stream_id) = max_stream_id {
            tracker.min_stream_id = tracker.min_stream_id.max(max_stream_id + 1);
            tracker.min_event_id = 0;
        }
        tracker.stream_count += created.total_created as u64;
        tracker.event_count += event_count;
        tracker.last_poll_ms = Some(stream_query_time_ms);
        tracker.last_poll_task_count = Some(created.total_created as u64);
        tracker.status = if reached_limit {
            TrackerStatus::Complete
        } else {
            TrackerStatus::Active
        };
        tracker.version += 1;
        state.trackers.insert(filter.id, tracker);

        Ok(created)
    }

    async fn release_owned_tasks(&self, node: NodeId) -> Result<u64, Error> {
        let mut state = self.state.lock();
        let mut released = 0;
        for task in state.tasks.values_mut() {
            if task.node != Some(node) {
                continue;
            }
            if matches!(
                task.status,
                TaskStatus::Unprocessed | TaskStatus::Assigned | TaskStatus::Processing
            ) {
                task.status = TaskStatus::Unprocessed;
                task.node = None;
                task.version += 1;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn save_tracker(
        &self,
        filter_id: FilterId,
        tracker: FilterTracker,
    ) -> Result<FilterTracker, Error> {
        let mut state = self.state.lock();
        let mut tracker = tracker;
        tracker.version += 1;
        state.trackers.insert(filter_id, tracker.clone());
        Ok(tracker)
    }
}

#[async_trait]
impl MetaStore for MemoryTaskState {
    async fn find(&self, criteria: FindDataCriteria) -> Result<Vec<DataMeta>, Error> {
        // Visibility scoping for `run_as` is a property of real deployments;
        // in-memory state treats all data as visible.
        let state = self.state.lock();
        Ok(state
            .metas
            .range(criteria.min_stream_id..)
            .map(|(_, meta)| meta)
            .filter(|meta| criteria.statuses.contains(&meta.status))
            .filter(|meta| expression_matches(&criteria.expression, meta))
            .take(criteria.limit)
            .cloned()
            .collect())
    }

    async fn max_id(&self) -> Result<Option<StreamId>, Error> {
        Ok(self.state.lock().metas.keys().next_back().copied())
    }

    async fn get(&self, id: StreamId) -> Result<Option<DataMeta>, Error> {
        Ok(self.state.lock().metas.get(&id).cloned())
    }
}

/// Event search that replays prepared results, optionally holding each call
/// until released. Used by tests and the single-process deployment.
#[derive(Default)]
pub struct MemoryEventSearch {
    results: Mutex<VecDeque<Result<EventRefs, Error>>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MemoryEventSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_result(&self, result: Result<EventRefs, Error>) {
        self.results.lock().push_back(result);
    }

    /// Makes subsequent searches wait until the returned handle is notified.
    pub fn hold_searches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl EventSearch for MemoryEventSearch {
    async fn search(&self, _spec: EventSearchSpec) -> Result<EventRefs, Error> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(EventRefs::default()))
    }
}

/// Records emitted queue-size samples for inspection.
#[derive(Default)]
pub struct MemoryStatisticsSink {
    samples: Mutex<Vec<(usize, u64)>>,
}

impl MemoryStatisticsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn samples(&self) -> Vec<(usize, u64)> {
        self.samples.lock().clone()
    }
}

impl StatisticsSink for MemoryStatisticsSink {
    fn emit_queue_size(&self, queue_size: usize, timestamp_ms: u64) -> Result<(), Error> {
        self.samples.lock().push((queue_size, timestamp_ms));
        Ok(())
    }
}

/// Node source backed by an optional fixed identity.
#[derive(Default)]
pub struct StaticNodeSource {
    node: Option<NodeId>,
}

impl StaticNodeSource {
    pub fn new(node: NodeId) -> Arc<Self> {
        Arc::new(Self { node: Some(node) })
    }

    /// A source with no configured node; `default_node` always fails.
    pub fn unconfigured() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NodeSource for StaticNodeSource {
    fn default_node(&self) -> Result<NodeId, Error> {
        self.node
            .ok_or_else(|| make_err!(Code::FailedPrecondition, "No default node is configured"))
    }
}
