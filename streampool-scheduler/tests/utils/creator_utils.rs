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

use std::sync::Arc;
use std::time::Duration;

use mock_instant::thread_local::MockClock;
use streampool_config::processor::ProcessorConfig;
use streampool_scheduler::memory_task_state::{
    MemoryEventSearch, MemoryStatisticsSink, MemoryTaskState, StaticNodeSource,
};
use streampool_scheduler::task_creator::TaskCreator;
use streampool_util::instant_wrapper::MockInstantWrapped;
use streampool_util::processor_messages::{
    DataMeta, DataStatus, DataSource, ExpressionOperator, FilterId, FilterTracker, NodeId,
    ProcessorFilter, QueryData, QueryLimits, StreamId, StreamTask, TaskId, TaskStatus,
};

pub(crate) const START_TIME_MS: u64 = 1_000_000;

pub(crate) type TestTaskCreator = Arc<TaskCreator<MockInstantWrapped, fn() -> MockInstantWrapped>>;

fn mock_now() -> MockInstantWrapped {
    MockInstantWrapped::default()
}

pub(crate) struct TestHarness {
    pub(crate) creator: TestTaskCreator,
    pub(crate) state: Arc<MemoryTaskState>,
    pub(crate) event_search: Arc<MemoryEventSearch>,
    pub(crate) stats: Arc<MemoryStatisticsSink>,
    pub(crate) node: NodeId,
}

pub(crate) fn make_harness(config: ProcessorConfig) -> TestHarness {
    MockClock::set_time(Duration::from_millis(START_TIME_MS));
    let state = MemoryTaskState::new();
    let event_search = MemoryEventSearch::new();
    let stats = MemoryStatisticsSink::new();
    let node = NodeId::new();
    let creator = TaskCreator::new(
        &config,
        state.clone(),
        state.clone(),
        state.clone(),
        event_search.clone(),
        stats.clone(),
        StaticNodeSource::new(node),
        mock_now as fn() -> MockInstantWrapped,
    );
    TestHarness {
        creator,
        state,
        event_search,
        stats,
        node,
    }
}

pub(crate) fn make_config(queue_size: usize) -> ProcessorConfig {
    ProcessorConfig {
        queue_size,
        ..Default::default()
    }
}

pub(crate) fn make_criteria_filter(id: FilterId, priority: i32) -> ProcessorFilter {
    ProcessorFilter {
        id,
        priority,
        enabled: true,
        processor_enabled: true,
        create_time_ms: 0,
        create_user: "admin".to_string(),
        query_data: QueryData {
            data_source: DataSource::StreamStore,
            expression: ExpressionOperator::default(),
            limits: None,
        },
        tracker: FilterTracker::default(),
    }
}

pub(crate) fn make_search_filter(
    id: FilterId,
    priority: i32,
    limits: Option<QueryLimits>,
) -> ProcessorFilter {
    let mut filter = make_criteria_filter(id, priority);
    filter.query_data.data_source = DataSource::Searchable("event-index".to_string());
    filter.query_data.limits = limits;
    filter
}

pub(crate) fn make_meta(id: StreamId) -> DataMeta {
    DataMeta {
        id,
        feed: "TEST_FEED".to_string(),
        status: DataStatus::Unlocked,
        create_time_ms: 0,
    }
}

pub(crate) fn add_metas(state: &MemoryTaskState, ids: std::ops::RangeInclusive<StreamId>) {
    for id in ids {
        state.insert_meta(make_meta(id));
    }
}

pub(crate) fn make_unowned_task(id: TaskId, filter_id: FilterId, stream_id: StreamId) -> StreamTask {
    StreamTask {
        id,
        version: 0,
        filter_id,
        stream_id,
        status: TaskStatus::Unprocessed,
        node: None,
        event_ranges: None,
        create_time_ms: 0,
    }
}

/// Lets any dispatched background work (lazy fills, search continuations)
/// run to completion on the current-thread test runtime.
pub(crate) async fn drain_background() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
