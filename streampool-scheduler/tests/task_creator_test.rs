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

use std::time::Duration;

use mock_instant::thread_local::MockClock;
use pretty_assertions::assert_eq;
use streampool_error::Error;
use streampool_macro::streampool_test;
use streampool_scheduler::memory_task_state::{MemoryEventSearch, MemoryTaskState, StaticNodeSource};
use streampool_scheduler::task_creator::TaskCreator;
use streampool_scheduler::task_state_manager::TaskStateManager;
use streampool_util::instant_wrapper::MockInstantWrapped;
use streampool_util::processor_messages::{
    EventRef, EventRefs, NodeId, QueryLimits, TaskStatus, TrackerStatus,
};
use utils::creator_utils::{
    add_metas, drain_background, make_config, make_criteria_filter, make_harness, make_meta,
    make_search_filter, make_unowned_task, START_TIME_MS,
};

mod utils {
    pub(crate) mod creator_utils;
}

#[streampool_test]
async fn fair_split_across_two_filters_by_priority() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    harness.state.add_filter(make_criteria_filter(2, 1));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    // Both filters are under-filled so the half-queue-size gate applies to
    // each equally.
    assert_eq!(harness.creator.filter_queue_size_for_test(1), 5);
    assert_eq!(harness.creator.filter_queue_size_for_test(2), 5);
    assert_eq!(harness.creator.task_queue_size(), 10);
    Ok(())
}

#[streampool_test]
async fn total_queue_size_is_bounded() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    for filter_id in 1..=3 {
        harness
            .state
            .add_filter(make_criteria_filter(filter_id, 10 + filter_id as i32));
    }
    add_metas(&harness.state, 1..=500);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    assert!(harness.creator.task_queue_size() <= 10);

    // Repeated passes never push the aggregate above the configured total.
    harness.creator.create_tasks().await?;
    harness.creator.create_tasks().await?;
    assert!(harness.creator.task_queue_size() <= 10);
    Ok(())
}

#[streampool_test]
async fn assignment_drains_filters_in_priority_order() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    harness.state.add_filter(make_criteria_filter(2, 5));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.filter_queue_size_for_test(1), 5);
    assert_eq!(harness.creator.filter_queue_size_for_test(2), 5);

    let assigned = harness.creator.assign_tasks(harness.node, 5).await;
    assert_eq!(assigned.len(), 5);
    for task in &assigned {
        // Every task must come from the higher priority filter and be bound
        // to the requesting node.
        assert_eq!(task.filter_id, 1);
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.node, Some(harness.node));
    }
    drain_background().await;
    Ok(())
}

#[streampool_test]
async fn assignment_spills_to_lower_priority_when_drained() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    harness.state.add_filter(make_criteria_filter(2, 5));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    let assigned = harness.creator.assign_tasks(harness.node, 8).await;
    assert_eq!(assigned.len(), 8);
    let from_high: Vec<_> = assigned.iter().filter(|task| task.filter_id == 1).collect();
    let from_low: Vec<_> = assigned.iter().filter(|task| task.filter_id == 2).collect();
    assert_eq!(from_high.len(), 5);
    assert_eq!(from_low.len(), 3);
    // The high priority filter drains completely before the low one starts.
    assert!(assigned[..5].iter().all(|task| task.filter_id == 1));
    drain_background().await;
    Ok(())
}

#[streampool_test]
async fn concurrent_fill_attempts_are_single_flight() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_search_filter(1, 10, None));
    harness.state.insert_meta(make_meta(1));
    let gate = harness.event_search.hold_searches();
    harness.event_search.push_result(Ok(EventRefs {
        refs: vec![
            EventRef::new(1, 1),
            EventRef::new(1, 2),
            EventRef::new(1, 3),
        ],
        reached_limit: false,
    }));

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    assert!(harness.creator.is_filter_filling_for_test(1));

    // A second pass observes the filling flag and must not dispatch another
    // search.
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.metrics().searches_dispatched.count(), 1);

    gate.notify_one();
    drain_background().await;

    assert!(!harness.creator.is_filter_filling_for_test(1));
    assert_eq!(harness.creator.filter_queue_size_for_test(1), 1);
    let tasks = harness.state.tasks_for_filter(1);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].event_ranges.as_deref(), Some("1-3"));

    let tracker = harness.state.tracker(1).unwrap();
    assert_eq!(tracker.min_stream_id, 2);
    assert_eq!(tracker.event_count, 3);
    Ok(())
}

#[streampool_test]
async fn tracker_cursor_only_moves_forward() -> Result<(), Error> {
    let harness = make_harness(make_config(4));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=10);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    let first = harness.state.tracker(1).unwrap().min_stream_id;
    assert_eq!(first, 3);

    let assigned = harness.creator.assign_tasks(harness.node, 2).await;
    assert_eq!(assigned.len(), 2);
    drain_background().await;

    let second = harness.state.tracker(1).unwrap().min_stream_id;
    assert!(second >= first);
    assert_eq!(second, 5);
    Ok(())
}

#[streampool_test]
async fn complete_tracker_produces_no_tasks_and_zeroes_poll_count() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    let mut filter = make_criteria_filter(1, 10);
    filter.tracker.status = TrackerStatus::Complete;
    filter.tracker.last_poll_task_count = Some(5);
    harness.state.add_filter(filter);
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    assert_eq!(harness.creator.task_queue_size(), 0);
    assert_eq!(harness.creator.metrics().tasks_created.count(), 0);
    let tracker = harness.state.tracker(1).unwrap();
    assert_eq!(tracker.status, TrackerStatus::Complete);
    assert_eq!(tracker.last_poll_task_count, Some(0));
    assert_eq!(tracker.last_poll_ms, Some(START_TIME_MS));
    Ok(())
}

#[streampool_test]
async fn duplicate_status_transition_is_rejected() -> Result<(), Error> {
    let state = MemoryTaskState::new();
    let node = NodeId::new();
    state.insert_task(make_unowned_task(1, 1, 1));
    let task = state.task(1).unwrap();

    let assigned = state
        .change_task_status(&task, Some(node), TaskStatus::Assigned)
        .await?;
    assert!(assigned.is_some());

    // The second transition carries a stale version and must be rejected.
    let rejected = state
        .change_task_status(&task, Some(node), TaskStatus::Assigned)
        .await?;
    assert_eq!(rejected, None);
    Ok(())
}

#[streampool_test]
async fn assignment_on_empty_store_still_triggers_fill() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    let assigned = harness.creator.assign_tasks(harness.node, 3).await;
    assert!(assigned.is_empty());

    // The lazily kicked off creation pass lands in the background.
    drain_background().await;
    assert_eq!(harness.creator.metrics().create_passes.count(), 1);
    assert_eq!(harness.creator.filter_queue_size_for_test(1), 5);
    Ok(())
}

#[streampool_test]
async fn lazy_fill_respects_the_poll_window() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.assign_tasks(harness.node, 1).await;
    drain_background().await;
    assert_eq!(harness.creator.metrics().create_passes.count(), 1);

    // Within the poll window nothing new is kicked off.
    harness.creator.assign_tasks(harness.node, 1).await;
    drain_background().await;
    assert_eq!(harness.creator.metrics().create_passes.count(), 1);

    // Once the window passes the next assignment triggers another pass.
    MockClock::advance(Duration::from_secs(11));
    harness.creator.assign_tasks(harness.node, 1).await;
    drain_background().await;
    assert_eq!(harness.creator.metrics().create_passes.count(), 2);
    Ok(())
}

#[streampool_test]
async fn disabled_filter_has_queued_tasks_released() -> Result<(), Error> {
    let harness = make_harness(make_config(8));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=4);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.filter_queue_size_for_test(1), 4);

    // The filter disappears between two ticks while tasks are still queued.
    harness.state.remove_filter(1);
    harness.creator.create_tasks().await?;

    assert_eq!(harness.creator.filter_queue_size_for_test(1), 0);
    assert_eq!(harness.creator.metrics().tasks_released.count(), 4);
    for task in harness.state.tasks_for_filter(1) {
        assert_eq!(task.status, TaskStatus::Unprocessed);
        assert_eq!(task.node, None);
    }
    Ok(())
}

#[streampool_test]
async fn reclaim_consuming_entire_budget_skips_generation() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    let mut filter = make_criteria_filter(1, 10);
    filter.tracker.min_stream_id = 6;
    harness.state.add_filter(filter);
    // Streams behind the tracker back the unowned tasks; fresh streams ahead
    // of it would be picked up by generation if it ran.
    add_metas(&harness.state, 1..=20);
    for task_id in 1..=5 {
        harness
            .state
            .insert_task(make_unowned_task(task_id, 1, task_id));
    }

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    assert_eq!(harness.creator.filter_queue_size_for_test(1), 5);
    assert_eq!(harness.creator.metrics().tasks_reclaimed.count(), 5);
    assert_eq!(harness.creator.metrics().tasks_created.count(), 0);
    // Generation never ran so the cursor did not move.
    assert_eq!(harness.state.tracker(1).unwrap().min_stream_id, 6);
    Ok(())
}

#[streampool_test]
async fn partial_reclaim_leaves_budget_for_generation() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    let mut filter = make_criteria_filter(1, 10);
    filter.tracker.min_stream_id = 3;
    harness.state.add_filter(filter);
    add_metas(&harness.state, 1..=14);
    harness.state.insert_task(make_unowned_task(1, 1, 1));
    harness.state.insert_task(make_unowned_task(2, 1, 2));

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    assert_eq!(harness.creator.metrics().tasks_reclaimed.count(), 2);
    assert_eq!(harness.creator.metrics().tasks_created.count(), 3);
    assert_eq!(harness.creator.filter_queue_size_for_test(1), 5);
    // Generation consumed streams 3, 4 and 5.
    assert_eq!(harness.state.tracker(1).unwrap().min_stream_id, 6);
    Ok(())
}

#[streampool_test]
async fn consumed_stream_limit_completes_tracker_without_search() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    let mut filter = make_search_filter(
        1,
        10,
        Some(QueryLimits {
            duration_ms: None,
            stream_count: Some(10),
            event_count: None,
        }),
    );
    filter.tracker.stream_count = 10;
    harness.state.add_filter(filter);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    assert_eq!(harness.creator.metrics().searches_dispatched.count(), 0);
    assert_eq!(
        harness.state.tracker(1).unwrap().status,
        TrackerStatus::Complete
    );
    // A limit-complete filter must not leave its filling flag held.
    assert!(!harness.creator.is_filter_filling_for_test(1));
    Ok(())
}

#[streampool_test]
async fn expired_duration_limit_completes_tracker_without_search() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    // The filter was created at time zero and only allowed to create tasks
    // for one second.
    let filter = make_search_filter(
        1,
        10,
        Some(QueryLimits {
            duration_ms: Some(1000),
            stream_count: None,
            event_count: None,
        }),
    );
    harness.state.add_filter(filter);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;

    assert_eq!(harness.creator.metrics().searches_dispatched.count(), 0);
    assert_eq!(
        harness.state.tracker(1).unwrap().status,
        TrackerStatus::Complete
    );
    Ok(())
}

#[streampool_test]
async fn search_hitting_limit_completes_tracker() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_search_filter(1, 10, None));
    harness.state.insert_meta(make_meta(1));
    harness.state.insert_meta(make_meta(2));
    harness.event_search.push_result(Ok(EventRefs {
        refs: vec![EventRef::new(1, 1), EventRef::new(2, 4)],
        reached_limit: true,
    }));

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    drain_background().await;

    assert_eq!(harness.creator.filter_queue_size_for_test(1), 2);
    let tracker = harness.state.tracker(1).unwrap();
    assert_eq!(tracker.status, TrackerStatus::Complete);

    // Once complete no further generation happens, only the poll count gets
    // normalized.
    harness.creator.assign_tasks(harness.node, 2).await;
    MockClock::advance(Duration::from_secs(11));
    harness.creator.create_tasks().await?;
    drain_background().await;
    assert_eq!(harness.creator.metrics().searches_dispatched.count(), 1);
    assert_eq!(
        harness.state.tracker(1).unwrap().last_poll_task_count,
        Some(0)
    );
    Ok(())
}

#[streampool_test]
async fn failed_search_clears_filling_flag() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_search_filter(1, 10, None));
    harness.event_search.push_result(Err(streampool_error::make_err!(
        streampool_error::Code::Unavailable,
        "index offline"
    )));

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    drain_background().await;

    assert!(!harness.creator.is_filter_filling_for_test(1));
    assert_eq!(harness.creator.metrics().search_failures.count(), 1);
    assert_eq!(harness.creator.task_queue_size(), 0);
    Ok(())
}

#[streampool_test]
async fn startup_releases_previously_owned_tasks() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    let mut task = make_unowned_task(1, 1, 1);
    task.status = TaskStatus::Assigned;
    task.node = Some(harness.node);
    harness.state.insert_task(task);

    harness.creator.startup().await?;

    let task = harness.state.task(1).unwrap();
    assert_eq!(task.status, TaskStatus::Unprocessed);
    assert_eq!(task.node, None);
    Ok(())
}

#[streampool_test]
async fn shutdown_drains_queues_without_reassigning_tasks() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.task_queue_size(), 5);

    harness.creator.shutdown().await;
    assert_eq!(harness.creator.task_queue_size(), 0);

    // Queued tasks stay owned in the store so the next startup reclaims
    // them.
    for task in harness.state.tasks_for_filter(1) {
        assert_eq!(task.status, TaskStatus::Unprocessed);
        assert_eq!(task.node, Some(harness.node));
    }

    // Further creation passes are no-ops until the next startup.
    let passes_before = harness.creator.metrics().create_passes.count();
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.metrics().create_passes.count(), passes_before);
    Ok(())
}

#[streampool_test]
async fn missing_default_node_fails_startup() -> Result<(), Error> {
    MockClock::set_time(Duration::from_millis(START_TIME_MS));
    let state = MemoryTaskState::new();
    let creator = TaskCreator::new(
        &make_config(10),
        state.clone(),
        state.clone(),
        state,
        MemoryEventSearch::new(),
        streampool_scheduler::memory_task_state::MemoryStatisticsSink::new(),
        StaticNodeSource::unconfigured(),
        (|| MockInstantWrapped::default()) as fn() -> MockInstantWrapped,
    );
    let err = creator.startup().await.unwrap_err();
    assert_eq!(err.code, streampool_error::Code::FailedPrecondition);
    Ok(())
}

#[streampool_test]
async fn queue_statistics_only_emit_on_change() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=100);
    harness.creator.startup().await?;

    harness.creator.write_queue_statistics();
    harness.creator.write_queue_statistics();
    assert_eq!(harness.stats.samples(), vec![(0, START_TIME_MS)]);

    harness.creator.create_tasks().await?;
    harness.creator.write_queue_statistics();
    assert_eq!(
        harness.stats.samples(),
        vec![(0, START_TIME_MS), (5, START_TIME_MS)]
    );
    Ok(())
}

#[streampool_test]
async fn assignment_disabled_by_config_returns_nothing() -> Result<(), Error> {
    let mut config = make_config(10);
    config.assign_tasks = false;
    let harness = make_harness(config);
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.task_queue_size(), 5);

    let assigned = harness.creator.assign_tasks(harness.node, 5).await;
    assert!(assigned.is_empty());
    assert_eq!(harness.creator.task_queue_size(), 5);
    drain_background().await;
    Ok(())
}

#[streampool_test]
async fn abandoned_tasks_return_to_the_unowned_pool() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.state.add_filter(make_criteria_filter(1, 10));
    add_metas(&harness.state, 1..=100);

    harness.creator.startup().await?;
    harness.creator.create_tasks().await?;
    let assigned = harness.creator.assign_tasks(harness.node, 3).await;
    assert_eq!(assigned.len(), 3);

    harness.creator.abandon_tasks(harness.node, &assigned).await;
    for task in &assigned {
        let stored = harness.state.task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Unprocessed);
        assert_eq!(stored.node, None);
    }

    // Abandoning again with the now stale instances is rejected per task
    // without aborting the batch.
    let rejections_before = harness
        .creator
        .metrics()
        .status_change_rejections
        .count();
    harness.creator.abandon_tasks(harness.node, &assigned).await;
    assert_eq!(
        harness
            .creator
            .metrics()
            .status_change_rejections
            .count(),
        rejections_before + 3
    );
    drain_background().await;
    Ok(())
}

#[streampool_test]
async fn delete_schedule_is_armed_once() -> Result<(), Error> {
    let harness = make_harness(make_config(10));
    harness.creator.startup().await?;
    assert_eq!(harness.creator.next_delete_ms(), 0);

    harness.creator.create_tasks().await?;
    let armed = harness.creator.next_delete_ms();
    assert_eq!(armed, START_TIME_MS + 100 * 1000);

    // Further passes leave an armed schedule alone.
    MockClock::advance(Duration::from_secs(5));
    harness.creator.create_tasks().await?;
    assert_eq!(harness.creator.next_delete_ms(), armed);
    Ok(())
}
