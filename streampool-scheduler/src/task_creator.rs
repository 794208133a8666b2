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

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use streampool_config::processor::ProcessorConfig;
use streampool_error::{Error, ResultExt};
use streampool_util::background_spawn;
use streampool_util::inclusive_ranges::InclusiveRanges;
use streampool_util::instant_wrapper::InstantWrapper;
use streampool_util::metrics_utils::{CounterWithTime, FuncCounterWrapper};
use streampool_util::processor_messages::{
    DataMeta, DataStatus, EventRef, EventRefs, EventSearchSpec, FilterId, FilterTracker,
    FindDataCriteria, FindTaskCriteria, NodeId, ProcessorFilter, StreamId, StreamTask, TaskStatus,
    TrackerStatus,
};
use tracing::{event, Level};

use crate::task_queue::{TaskQueue, TaskStore};
use crate::task_state_manager::{
    EventSearch, FilterSource, MetaStore, NodeSource, StatisticsSink, TaskStateManager,
};
use crate::task_status_trace_log::TaskStatusTraceLog;

/// Default total number of tasks to keep queued across all filters.
/// If this changes, remember to change the documentation in the config.
const DEFAULT_TOTAL_QUEUE_SIZE: usize = 1000;

/// Default seconds between fill attempts triggered from the assignment path.
/// If this changes, remember to change the documentation in the config.
const DEFAULT_POLL_INTERVAL_S: u64 = 10;

/// Default seconds ahead to arm the periodic task delete schedule.
/// If this changes, remember to change the documentation in the config.
const DEFAULT_DELETE_INTERVAL_S: u64 = 100;

/// Hard cap on events returned by one search dispatch.
const DEFAULT_MAX_EVENTS: u64 = 1_000_000;

/// Hard cap on events per stream returned by one search dispatch.
const MAX_EVENTS_PER_STREAM: u64 = 1000;

/// Event ranges per stream beyond this are trimmed and accumulation for that
/// stream stops.
const MAX_RANGES_PER_STREAM: usize = 1000;

/// Keeps a pool of stream tasks ready to go.
///
/// A creation pass tops the per-filter queues back up whenever they fall
/// below the low water mark (half the configured total), splitting the total
/// across filters in priority order. Worker nodes drain the queues through
/// `assign_tasks` without taking the creation lock, so assignment stays
/// responsive while a slow fill is in progress.
pub struct TaskCreator<I: InstantWrapper, NowFn: Fn() -> I + Send + Sync + Clone + 'static> {
    config: ProcessorConfig,
    filter_source: Arc<dyn FilterSource>,
    task_state: Arc<dyn TaskStateManager>,
    meta_store: Arc<dyn MetaStore>,
    event_search: Arc<dyn EventSearch>,
    stats_sink: Arc<dyn StatisticsSink>,
    node_source: Arc<dyn NodeSource>,

    /// Serializes `startup`, `shutdown` and `create_tasks` so the queue map
    /// and trackers are only restructured by one of them at a time.
    create_tasks_lock: async_lock::Mutex<()>,

    /// Snapshot of enabled filters, highest priority first. Swapped whole on
    /// every creation pass and read by the assignment path.
    prioritised_filters: RwLock<Arc<Vec<Arc<ProcessorFilter>>>>,

    task_store: TaskStore,
    exhausted_filters: Arc<Mutex<HashMap<FilterId, bool>>>,

    /// Time at which the assignment path may next kick off a fill.
    next_poll_ms: AtomicU64,
    /// Time at which the periodic delete should next run, 0 when unarmed.
    next_delete_ms: AtomicU64,
    /// Set while a lazily triggered fill is outstanding.
    filling: AtomicBool,

    last_queue_size_for_stats: AtomicI64,

    /// The task store may not be filled until this node has run `startup()`
    /// and has not run `shutdown()`.
    allow_fill_task_store: AtomicBool,
    /// Cooperative cancellation signal checked at task-loop boundaries.
    shutdown_requested: AtomicBool,

    metrics: Arc<Metrics>,
    trace_log: TaskStatusTraceLog,
    now_fn: NowFn,
    _instant: PhantomData<I>,
}

impl<I: InstantWrapper, NowFn: Fn() -> I + Send + Sync + Clone + 'static> TaskCreator<I, NowFn> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ProcessorConfig,
        filter_source: Arc<dyn FilterSource>,
        task_state: Arc<dyn TaskStateManager>,
        meta_store: Arc<dyn MetaStore>,
        event_search: Arc<dyn EventSearch>,
        stats_sink: Arc<dyn StatisticsSink>,
        node_source: Arc<dyn NodeSource>,
        now_fn: NowFn,
    ) -> Arc<Self> {
        let mut config = config.clone();
        if config.queue_size == 0 {
            config.queue_size = DEFAULT_TOTAL_QUEUE_SIZE;
        }
        if config.poll_interval_s == 0 {
            config.poll_interval_s = DEFAULT_POLL_INTERVAL_S;
        }
        if config.delete_interval_s == 0 {
            config.delete_interval_s = DEFAULT_DELETE_INTERVAL_S;
        }
        Arc::new(Self {
            config,
            filter_source,
            task_state,
            meta_store,
            event_search,
            stats_sink,
            node_source,
            create_tasks_lock: async_lock::Mutex::new(()),
            prioritised_filters: RwLock::new(Arc::new(Vec::new())),
            task_store: TaskStore::new(),
            exhausted_filters: Arc::new(Mutex::new(HashMap::new())),
            next_poll_ms: AtomicU64::new(0),
            next_delete_ms: AtomicU64::new(0),
            filling: AtomicBool::new(false),
            last_queue_size_for_stats: AtomicI64::new(-1),
            allow_fill_task_store: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            metrics: Arc::new(Metrics::default()),
            trace_log: TaskStatusTraceLog,
            now_fn,
            _instant: PhantomData,
        })
    }

    fn now_ms(&self) -> u64 {
        (self.now_fn)().unix_timestamp_ms()
    }

    /// Releases any tasks this node owned before a previous crash, then
    /// allows the task store to be filled. Serialized with `create_tasks`.
    pub async fn startup(&self) -> Result<(), Error> {
        let _lock = self.create_tasks_lock.lock().await;
        self.shutdown_requested.store(false, Ordering::Release);
        let node = self
            .node_source
            .default_node()
            .err_tip(|| "Resolving node in startup()")?;
        match self.task_state.release_owned_tasks(node).await {
            Ok(released) if released > 0 => {
                event!(Level::INFO, released, %node, "Released previously owned tasks");
            }
            Ok(_) => {}
            Err(err) => {
                event!(Level::ERROR, ?err, "Failed to release previously owned tasks");
            }
        }
        self.allow_fill_task_store.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops further filling and drains every queue without reassigning the
    /// queued tasks. They remain node-owned in the durable store for the
    /// next startup's reclaim.
    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        let _lock = self.create_tasks_lock.lock().await;
        self.allow_fill_task_store.store(false, Ordering::Release);
        self.task_store.clear();
    }

    /// Runs one creation pass. Only one pass runs at a time; concurrent
    /// callers wait on the creation lock and become no-ops once the startup
    /// or shutdown gate flips.
    ///
    /// Everything but a missing node identity is contained per filter: a bad
    /// filter is logged and skipped without affecting the rest of the pass.
    pub async fn create_tasks(&self) -> Result<(), Error> {
        let _lock = self.create_tasks_lock.lock().await;
        if !self.allow_fill_task_store.load(Ordering::Acquire) {
            return Ok(());
        }
        let node = self
            .node_source
            .default_node()
            .err_tip(|| "Resolving node in create_tasks()")?;
        self.do_create_tasks(node).await;
        Ok(())
    }

    async fn do_create_tasks(&self, node: NodeId) {
        self.metrics.create_passes.inc();
        let total_queue_size = self.config.queue_size;
        let start = (self.now_fn)();
        event!(Level::DEBUG, total_queue_size, "Starting task creation pass");

        // Get an up to date list of all enabled filters, sorted by priority.
        let filters = match self.filter_source.find_enabled_filters().await {
            Ok(filters) => filters,
            Err(err) => {
                event!(Level::ERROR, ?err, "Failed to load enabled filters");
                return;
            }
        };
        let mut filters: Vec<Arc<ProcessorFilter>> = filters.into_iter().map(Arc::new).collect();
        filters.sort();
        event!(Level::TRACE, count = filters.len(), "Found enabled filters");

        // Publish the snapshot for the assignment path.
        let filters = Arc::new(filters);
        *self.prioritised_filters.write() = filters.clone();

        let half_queue_size = total_queue_size / 2;
        let mut remaining = total_queue_size as i64;
        for filter in filters.iter() {
            if self.shutdown_requested.load(Ordering::Acquire) {
                break;
            }
            let queue = self.task_store.get_or_create(filter.id);
            let queue_size = queue.size();

            // Reduce the number of tasks we need by what is already queued.
            remaining -= queue_size as i64;

            if remaining > 0
                && queue_size < half_queue_size
                && queue.compare_and_set_filling(false, true)
            {
                // Each filter is topped up to the half-size water mark,
                // bounded by whatever is left of the global total.
                let budget =
                    std::cmp::min(remaining, (half_queue_size - queue_size) as i64) as usize;
                let added = self.create_tasks_for_filter(node, filter, &queue, budget).await;
                remaining -= added as i64;
            }
        }

        // Release items from the queue that no longer have an enabled filter.
        let enabled_filter_ids: HashSet<FilterId> =
            filters.iter().map(|filter| filter.id).collect();
        for filter_id in self.task_store.filter_ids() {
            if enabled_filter_ids.contains(&filter_id) {
                continue;
            }
            if let Some(queue) = self.task_store.remove(filter_id) {
                while let Some(task) = queue.poll() {
                    self.release(&task).await;
                }
            }
            self.exhausted_filters.lock().remove(&filter_id);
        }

        // We must be the master node so set a time in the future to run a
        // delete.
        self.schedule_delete();

        event!(Level::DEBUG, elapsed = ?start.elapsed(), "Finished task creation pass");
    }

    /// Fills one filter's queue. Returns the number of tasks added
    /// synchronously; search-mode generation lands later via a background
    /// task. The queue's filling flag is cleared here unless a search is
    /// outstanding, in which case its continuation clears it.
    async fn create_tasks_for_filter(
        &self,
        node: NodeId,
        filter: &Arc<ProcessorFilter>,
        queue: &Arc<TaskQueue>,
        tasks_to_create: usize,
    ) -> usize {
        match self.fill_filter_queue(node, filter, queue, tasks_to_create).await {
            Ok((added, searching)) => {
                if !searching {
                    queue.set_filling(false);
                }
                added
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    filter_id = filter.id,
                    ?err,
                    "Error creating tasks for filter"
                );
                queue.set_filling(false);
                0
            }
        }
    }

    async fn fill_filter_queue(
        &self,
        node: NodeId,
        filter: &Arc<ProcessorFilter>,
        queue: &Arc<TaskQueue>,
        tasks_to_create: usize,
    ) -> Result<(usize, bool), Error> {
        // Reload as the filter could have changed, or even been deleted,
        // since we found it.
        let Some(loaded) = self
            .filter_source
            .reload(filter)
            .await
            .err_tip(|| "Reloading filter before fill")?
        else {
            return Ok((0, false));
        };

        // Only try and create tasks if the processor and filter are enabled.
        if !loaded.is_enabled() {
            return Ok((0, false));
        }
        let loaded = Arc::new(loaded);
        self.metrics.filters_filled.inc();

        let mut tasks_to_create = tasks_to_create;
        let mut count = 0;

        // If there are any tasks for this filter that were previously
        // created but are unprocessed, not owned by any node and their
        // associated stream is unlocked then add them here.
        if self.config.fill_task_queue {
            count = self.add_unowned_tasks(node, &loaded, queue, tasks_to_create).await;
        }

        let mut searching = false;
        if self.config.create_tasks {
            tasks_to_create = tasks_to_create.saturating_sub(count);

            let exhausted = *self
                .exhausted_filters
                .lock()
                .entry(loaded.id)
                .or_insert(false);

            // Skip once we have done all that is required.
            if tasks_to_create > 0 && !self.shutdown_requested.load(Ordering::Acquire) {
                // Record the time before we are going to query for streams
                // for tracking purposes.
                let stream_query_time = self.now_ms();
                let tracker = loaded.tracker.clone();
                event!(
                    Level::DEBUG,
                    filter_id = loaded.id,
                    exhausted,
                    "Generating tasks for filter"
                );

                if tracker.status.is_complete() {
                    // If the tracker is complete we need to make sure the
                    // last poll count is zeroed so observers can see that it
                    // is not delivering any more tasks.
                    if tracker.last_poll_task_count.unwrap_or(0) > 0 {
                        let mut tracker = tracker;
                        tracker.last_poll_ms = Some(stream_query_time);
                        tracker.last_poll_task_count = Some(0);
                        self.task_state
                            .save_tracker(loaded.id, tracker)
                            .await
                            .err_tip(|| "Zeroing last poll count on complete tracker")?;
                    }
                } else if !loaded.query_data.is_stream_store_search() {
                    // Create tasks by executing a search.
                    searching = self
                        .create_tasks_from_search_query(
                            &loaded,
                            stream_query_time,
                            node,
                            tasks_to_create,
                            queue,
                            tracker,
                        )
                        .await?;
                } else {
                    // Create tasks from a standard stream filter criteria.
                    count += self
                        .create_tasks_from_criteria(
                            &loaded,
                            stream_query_time,
                            node,
                            tasks_to_create,
                            queue,
                            tracker,
                        )
                        .await?;
                }
            }
        } else {
            // We terminated early so assume this filter is not exhausted.
            event!(
                Level::DEBUG,
                filter_id = loaded.id,
                "No tasks needed at this time, assuming not exhausted"
            );
            self.exhausted_filters.lock().insert(loaded.id, false);
        }

        Ok((count, searching))
    }

    /// Reclaims previously created tasks that are unprocessed, unowned and
    /// whose stream is unlocked, claiming each for this node.
    async fn add_unowned_tasks(
        &self,
        node: NodeId,
        filter: &ProcessorFilter,
        queue: &Arc<TaskQueue>,
        tasks_to_create: usize,
    ) -> usize {
        let mut count = 0;

        let result: Result<(), Error> = async {
            let criteria = FindTaskCriteria {
                filter_id: filter.id,
                statuses: vec![TaskStatus::Unprocessed],
                unowned_only: true,
                stream_unlocked_only: true,
                limit: tasks_to_create,
            };
            let tasks = self.task_state.find_tasks(criteria).await?;
            let size = tasks.len();
            self.trace_log.reclaim_tasks(&tasks);

            for task in tasks {
                match self
                    .task_state
                    .change_task_status(&task, Some(node), TaskStatus::Unprocessed)
                    .await
                {
                    Ok(Some(modified)) => {
                        queue.add(modified);
                        count += 1;
                        self.metrics.tasks_reclaimed.inc();
                        event!(Level::TRACE, count, size, "Adding unowned tasks");
                    }
                    Ok(None) => {
                        self.metrics.status_change_rejections.inc();
                    }
                    Err(err) => {
                        event!(
                            Level::ERROR,
                            task_id = task.id,
                            ?err,
                            "Failed to grab unowned task"
                        );
                    }
                }

                if self.shutdown_requested.load(Ordering::Acquire) {
                    break;
                }
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            event!(
                Level::ERROR,
                filter_id = filter.id,
                ?err,
                "Failed to find unowned tasks"
            );
        }

        if count > 0 {
            event!(Level::DEBUG, count, "Added tasks that are no longer locked");
        }
        count
    }

    /// Generates tasks by running the filter's criteria directly against the
    /// stream store metadata. Returns the number of tasks queued.
    async fn create_tasks_from_criteria(
        &self,
        filter: &Arc<ProcessorFilter>,
        stream_query_time: u64,
        node: NodeId,
        required_tasks: usize,
        queue: &Arc<TaskQueue>,
        tracker: FilterTracker,
    ) -> Result<usize, Error> {
        // Update the tracker status message.
        let mut tracker = tracker;
        tracker.status = TrackerStatus::Progress("Creating...".to_string());
        let updated_tracker = self
            .task_state
            .save_tracker(filter.id, tracker)
            .await
            .err_tip(|| "Saving tracker before criteria fill")?;

        let max_meta_id = self
            .meta_store
            .max_id()
            .await
            .err_tip(|| "Getting max meta id")?;

        // This will contain locked and unlocked streams.
        let criteria = FindDataCriteria {
            expression: filter.query_data.expression.clone(),
            min_stream_id: updated_tracker.min_stream_id,
            statuses: vec![DataStatus::Unlocked, DataStatus::Locked],
            limit: required_tasks,
            run_as: filter.create_user.clone(),
        };
        let streams = self
            .meta_store
            .find(criteria)
            .await
            .err_tip(|| "Selecting streams for task creation")?;

        // Just create regular stream processing tasks.
        let creation_map: Vec<(DataMeta, Option<InclusiveRanges>)> =
            streams.into_iter().map(|meta| (meta, None)).collect();

        let created = self
            .task_state
            .create_new_tasks(
                filter,
                &updated_tracker,
                stream_query_time,
                creation_map,
                node,
                max_meta_id,
                false,
            )
            .await
            .err_tip(|| "Creating new tasks from criteria")?;

        // Transfer the newly created (and available) tasks to the queue.
        let available = created.available.len();
        for task in created.available {
            queue.add(task);
        }
        self.metrics.tasks_created.add(created.total_created as u64);
        event!(
            Level::DEBUG,
            total_created = created.total_created,
            required_tasks,
            filter_id = filter.id,
            "Created tasks for filter"
        );
        self.exhausted_filters
            .lock()
            .insert(filter.id, created.total_created == 0);
        Ok(available)
    }

    /// Dispatches an asynchronous event search for a non-stream-store
    /// filter. Returns true when a search is outstanding, in which case the
    /// queue's filling flag is cleared by the search continuation rather
    /// than the caller.
    async fn create_tasks_from_search_query(
        &self,
        filter: &Arc<ProcessorFilter>,
        stream_query_time: u64,
        node: NodeId,
        required_tasks: usize,
        queue: &Arc<TaskQueue>,
        tracker: FilterTracker,
    ) -> Result<bool, Error> {
        let mut tracker = tracker;
        let mut max_streams = required_tasks as u64;
        let mut max_events = DEFAULT_MAX_EVENTS;

        // Are there any limits set on the query.
        if let Some(limits) = &filter.query_data.limits {
            // If there is a duration limit set on task creation then set the
            // tracker to complete and return if we have exceeded it.
            if let Some(duration_ms) = limits.duration_ms {
                let end = filter.create_time_ms + duration_ms;
                if end < self.now_ms() {
                    tracker.status = TrackerStatus::Complete;
                    self.task_state
                        .save_tracker(filter.id, tracker)
                        .await
                        .err_tip(|| "Completing tracker on duration limit")?;
                    return Ok(false);
                }
            }

            if let Some(stream_count) = limits.stream_count {
                let stream_limit = stream_count.saturating_sub(tracker.stream_count);
                max_streams = std::cmp::min(stream_limit, max_streams);
                if max_streams == 0 {
                    tracker.status = TrackerStatus::Complete;
                    self.task_state
                        .save_tracker(filter.id, tracker)
                        .await
                        .err_tip(|| "Completing tracker on stream limit")?;
                    return Ok(false);
                }
            }

            if let Some(event_count) = limits.event_count {
                let event_limit = event_count.saturating_sub(tracker.event_count);
                max_events = std::cmp::min(event_limit, max_events);
                if max_events == 0 {
                    tracker.status = TrackerStatus::Complete;
                    self.task_state
                        .save_tracker(filter.id, tracker)
                        .await
                        .err_tip(|| "Completing tracker on event limit")?;
                    return Ok(false);
                }
            }
        }

        // Update the tracker status message.
        tracker.status = TrackerStatus::Progress("Searching...".to_string());
        let updated_tracker = self
            .task_state
            .save_tracker(filter.id, tracker)
            .await
            .err_tip(|| "Saving tracker before search dispatch")?;

        let spec = EventSearchSpec {
            query: filter.query_data.clone(),
            min_event: EventRef::new(updated_tracker.min_stream_id, updated_tracker.min_event_id),
            max_event: EventRef::new(StreamId::MAX, 0),
            max_streams,
            max_events,
            max_events_per_stream: MAX_EVENTS_PER_STREAM,
            run_as: filter.create_user.clone(),
        };
        let max_meta_id = self
            .meta_store
            .max_id()
            .await
            .err_tip(|| "Getting max meta id before search dispatch")?;

        let event_search = self.event_search.clone();
        let task_state = self.task_state.clone();
        let meta_store = self.meta_store.clone();
        let exhausted_filters = self.exhausted_filters.clone();
        let metrics = self.metrics.clone();
        let queue = queue.clone();
        let filter = filter.clone();
        let filter_id = filter.id;
        self.metrics.searches_dispatched.inc();
        background_spawn!(
            "filter_event_search",
            async move {
                // The filling flag clears exactly once whichever way the
                // search ends.
                let queue = scopeguard::guard(queue, |queue| queue.set_filling(false));
                match event_search.search(spec).await {
                    Ok(result) => {
                        let fill_result = finish_search_fill(
                            task_state,
                            meta_store,
                            &queue,
                            exhausted_filters,
                            &metrics,
                            &filter,
                            updated_tracker,
                            stream_query_time,
                            node,
                            max_meta_id,
                            result,
                        )
                        .await;
                        if let Err(err) = fill_result {
                            metrics.search_failures.inc();
                            event!(
                                Level::ERROR,
                                filter_id = filter.id,
                                ?err,
                                "Failed to create tasks from search results"
                            );
                        }
                    }
                    Err(err) => {
                        metrics.search_failures.inc();
                        event!(Level::ERROR, filter_id = filter.id, ?err, "Event search failed");
                    }
                }
            },
            filter_id
        );

        Ok(true)
    }

    /// Returns up to `count` tasks drawn across filters strictly in priority
    /// order, each transitioned to assigned and bound to `node`. Does not
    /// take the creation lock, only non-blocking polls against published
    /// queues. Always finishes with a best-effort fill attempt.
    pub async fn assign_tasks(self: &Arc<Self>, node: NodeId, count: usize) -> Vec<StreamTask> {
        let mut assigned = Vec::new();

        if self.config.assign_tasks && count > 0 {
            // Get a local reference to the list in case it is swapped out.
            let filters = self.prioritised_filters.read().clone();
            for filter in filters.iter() {
                if assigned.len() >= count {
                    break;
                }
                let Some(queue) = self.task_store.get(filter.id) else {
                    continue;
                };
                // Take as many tasks as we can for this filter.
                while assigned.len() < count {
                    let Some(task) = queue.poll() else {
                        break;
                    };
                    match self
                        .task_state
                        .change_task_status(&task, Some(node), TaskStatus::Assigned)
                        .await
                    {
                        Ok(Some(task)) => {
                            self.metrics.tasks_assigned.inc();
                            assigned.push(task);
                        }
                        Ok(None) => {
                            self.metrics.status_change_rejections.inc();
                        }
                        Err(err) => {
                            event!(
                                Level::ERROR,
                                task_id = task.id,
                                %node,
                                ?err,
                                "Failed to assign task"
                            );
                        }
                    }
                }
            }
        }

        // Have a go at kicking off a fill.
        self.fill_task_store();

        // Output some trace logging so we can see where tasks go.
        self.trace_log.assign_tasks(&assigned, node);

        assigned
    }

    /// Returns each task to the unowned, unprocessed pool. Per-task failures
    /// are logged and do not abort the batch.
    pub async fn abandon_tasks(&self, node: NodeId, tasks: &[StreamTask]) {
        // Output some trace logging so we can see where tasks go.
        self.trace_log.abandon_tasks(tasks, node);

        for task in tasks {
            event!(Level::WARN, task_id = task.id, %node, "Abandoning task");
            match self
                .task_state
                .change_task_status(task, None, TaskStatus::Unprocessed)
                .await
            {
                Ok(Some(_)) => self.metrics.tasks_abandoned.inc(),
                Ok(None) => self.metrics.status_change_rejections.inc(),
                Err(err) => {
                    event!(Level::ERROR, task_id = task.id, ?err, "Failed to abandon task");
                }
            }
        }
    }

    async fn release(&self, task: &StreamTask) {
        event!(Level::WARN, task_id = task.id, "Releasing task with no enabled filter");
        match self
            .task_state
            .change_task_status(task, None, TaskStatus::Unprocessed)
            .await
        {
            Ok(Some(_)) => self.metrics.tasks_released.inc(),
            Ok(None) => self.metrics.status_change_rejections.inc(),
            Err(err) => {
                event!(Level::ERROR, task_id = task.id, ?err, "Failed to release task");
            }
        }
    }

    /// Lazy fill: dispatches a background creation pass if none is
    /// outstanding and the poll window has elapsed.
    fn fill_task_store(self: &Arc<Self>) {
        if !self.allow_fill_task_store.load(Ordering::Acquire) {
            return;
        }
        // Only kick off the work if we are not already filling.
        if self
            .filling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // See if it has been long enough since we last filled.
        if !self.is_scheduled() {
            self.filling.store(false, Ordering::Release);
            return;
        }
        event!(Level::DEBUG, "Kicking off a background creation pass");
        let this = self.clone();
        background_spawn!("fill_task_store", async move {
            let guard_this = this.clone();
            let _filling_guard =
                scopeguard::guard((), move |()| guard_this.filling.store(false, Ordering::Release));
            match this.create_tasks().await {
                Ok(()) => this.schedule_next_poll(),
                Err(err) => {
                    event!(Level::ERROR, ?err, "Background creation pass failed");
                }
            }
        });
    }

    fn is_scheduled(&self) -> bool {
        // If we have passed the window since the last time we ran then yes.
        let time_now_ms = self.now_ms();
        if time_now_ms > self.next_poll_ms.load(Ordering::Acquire) {
            event!(
                Level::TRACE,
                queue_size = self.task_queue_size(),
                "Fill is due as the poll window has passed"
            );
            return true;
        }
        false
    }

    /// Move the timer based schedule forward.
    fn schedule_next_poll(&self) {
        self.next_poll_ms.store(
            self.now_ms() + self.config.poll_interval_s * 1000,
            Ordering::Release,
        );
    }

    /// Schedule a delete if we don't have one.
    fn schedule_delete(&self) {
        if self.next_delete_ms.load(Ordering::Acquire) == 0 {
            let next_delete_ms = self.now_ms() + self.config.delete_interval_s * 1000;
            self.next_delete_ms.store(next_delete_ms, Ordering::Release);
            event!(Level::DEBUG, next_delete_ms, "Armed the delete schedule");
        }
    }

    /// When the periodic delete executor should next run, 0 when unarmed.
    pub fn next_delete_ms(&self) -> u64 {
        self.next_delete_ms.load(Ordering::Acquire)
    }

    /// Aggregate number of queued tasks across all filters.
    pub fn task_queue_size(&self) -> usize {
        self.task_store.total_size()
    }

    /// Writes the aggregate queue size to the statistics sink, but only when
    /// it changed since the last emission. Under little load the queue size
    /// will be 0.
    pub fn write_queue_statistics(&self) {
        let queue_size = self.task_store.total_size() as i64;
        if queue_size != self.last_queue_size_for_stats.load(Ordering::Acquire) {
            let timestamp_ms = self.now_ms();
            let result = self.metrics.queue_stats_emitted.wrap(|| {
                self.stats_sink
                    .emit_queue_size(queue_size as usize, timestamp_ms)
            });
            if let Err(err) = result {
                event!(Level::ERROR, ?err, "Failed to write queue size statistic");
            }
            self.last_queue_size_for_stats
                .store(queue_size, Ordering::Release);
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Checks if the given filter's queue is currently being filled. Should
    /// only be used in unit tests.
    #[must_use]
    pub fn is_filter_filling_for_test(&self, filter_id: FilterId) -> bool {
        self.task_store
            .get(filter_id)
            .is_some_and(|queue| queue.is_filling())
    }

    /// Queue size for one filter. Should only be used in unit tests.
    #[must_use]
    pub fn filter_queue_size_for_test(&self, filter_id: FilterId) -> usize {
        self.task_store
            .get(filter_id)
            .map_or(0, |queue| queue.size())
    }
}

/// The success continuation of a dispatched search: records progress on the
/// tracker, folds the event hits into per-stream ranges, durably creates the
/// tasks and queues the available ones.
#[allow(clippy::too_many_arguments)]
async fn finish_search_fill(
    task_state: Arc<dyn TaskStateManager>,
    meta_store: Arc<dyn MetaStore>,
    queue: &Arc<TaskQueue>,
    exhausted_filters: Arc<Mutex<HashMap<FilterId, bool>>>,
    metrics: &Metrics,
    filter: &Arc<ProcessorFilter>,
    tracker: FilterTracker,
    stream_query_time: u64,
    node: NodeId,
    max_meta_id: Option<StreamId>,
    result: EventRefs,
) -> Result<(), Error> {
    let result_size = result.len();
    let reached_limit = result.reached_limit;

    // Update the tracker status message.
    let mut tracker = tracker;
    tracker.status = TrackerStatus::Progress("Creating...".to_string());
    let tracker = task_state
        .save_tracker(filter.id, tracker)
        .await
        .err_tip(|| "Saving tracker before creating search tasks")?;

    // Create a task for each stream reference.
    let creation_map = build_stream_map(meta_store.as_ref(), &result).await?;
    let created = task_state
        .create_new_tasks(
            filter,
            &tracker,
            stream_query_time,
            creation_map,
            node,
            max_meta_id,
            reached_limit,
        )
        .await
        .err_tip(|| "Creating new tasks from search results")?;

    // Transfer the newly created (and available) tasks to the queue.
    for task in created.available {
        queue.add(task);
    }
    metrics.tasks_created.add(created.total_created as u64);
    event!(
        Level::DEBUG,
        total_created = created.total_created,
        result_size,
        reached_limit,
        filter_id = filter.id,
        "Created tasks from search results"
    );

    exhausted_filters
        .lock()
        .insert(filter.id, result_size == 0 || reached_limit);
    Ok(())
}

/// Folds ordered event hits into a per-stream compact range set. Ranges per
/// stream are capped; once one stream gets trimmed no further events are
/// accumulated at all.
async fn build_stream_map(
    meta_store: &dyn MetaStore,
    event_refs: &EventRefs,
) -> Result<Vec<(DataMeta, Option<InclusiveRanges>)>, Error> {
    let mut creation_map = Vec::new();
    let mut current_stream: Option<DataMeta> = None;
    let mut current_stream_id: Option<StreamId> = None;
    let mut ranges = InclusiveRanges::new();
    let mut trimmed = false;

    for event_ref in &event_refs.refs {
        // When the stream id changes add the current ranges to the map.
        if current_stream_id != Some(event_ref.stream_id) {
            if let Some(stream) = current_stream.take() {
                let mut ranges = std::mem::take(&mut ranges);
                if ranges.len() > MAX_RANGES_PER_STREAM {
                    ranges = ranges.sub_ranges(MAX_RANGES_PER_STREAM);
                    trimmed = true;
                }
                creation_map.push((stream, Some(ranges)));
                if trimmed {
                    break;
                }
            }
            current_stream_id = Some(event_ref.stream_id);
            current_stream = meta_store
                .get(event_ref.stream_id)
                .await
                .err_tip(|| "Looking up stream for search hit")?;
            if current_stream.is_none() {
                event!(
                    Level::DEBUG,
                    stream_id = event_ref.stream_id,
                    "Search hit references an unknown stream"
                );
            }
            ranges = InclusiveRanges::new();
        }
        ranges.add(event_ref.event_id);
    }

    // Add the final ranges to the map.
    if !trimmed {
        if let Some(stream) = current_stream.take() {
            let mut ranges = ranges;
            if ranges.len() > MAX_RANGES_PER_STREAM {
                ranges = ranges.sub_ranges(MAX_RANGES_PER_STREAM);
            }
            if !ranges.is_empty() {
                creation_map.push((stream, Some(ranges)));
            }
        }
    }

    Ok(creation_map)
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub create_passes: CounterWithTime,
    pub filters_filled: CounterWithTime,
    pub tasks_reclaimed: CounterWithTime,
    pub tasks_created: CounterWithTime,
    pub tasks_assigned: CounterWithTime,
    pub tasks_abandoned: CounterWithTime,
    pub tasks_released: CounterWithTime,
    pub status_change_rejections: CounterWithTime,
    pub searches_dispatched: CounterWithTime,
    pub search_failures: CounterWithTime,
    pub queue_stats_emitted: FuncCounterWrapper,
}
