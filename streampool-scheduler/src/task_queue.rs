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

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use streampool_util::processor_messages::{FilterId, StreamTask};

/// A bounded-by-convention FIFO of unassigned tasks for one filter.
///
/// `poll()` never blocks and is safe under concurrent producers (fill) and
/// consumers (assignment). The `filling` flag guarantees at most one fill is
/// in flight for this queue at any time.
#[derive(Debug, Default)]
pub struct TaskQueue {
    queue: Mutex<VecDeque<StreamTask>>,
    filling: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll(&self) -> Option<StreamTask> {
        self.queue.lock().pop_front()
    }

    pub fn add(&self, task: StreamTask) {
        self.queue.lock().push_back(task);
    }

    /// Approximate size, good enough for fill-gating decisions.
    pub fn size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Atomically flips the filling flag from `expect` to `update`. Returns
    /// true if the flag held `expect` and was updated.
    pub fn compare_and_set_filling(&self, expect: bool, update: bool) -> bool {
        self.filling
            .compare_exchange(expect, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_filling(&self, filling: bool) {
        self.filling.store(filling, Ordering::Release);
    }

    pub fn is_filling(&self) -> bool {
        self.filling.load(Ordering::Acquire)
    }
}

/// Concurrent map from filter to its task queue. Entries are created lazily
/// on first fill attempt and removed when a filter leaves the enabled set.
#[derive(Debug, Default)]
pub struct TaskStore {
    queues: RwLock<HashMap<FilterId, Arc<TaskQueue>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filter_id: FilterId) -> Option<Arc<TaskQueue>> {
        self.queues.read().get(&filter_id).cloned()
    }

    pub fn get_or_create(&self, filter_id: FilterId) -> Arc<TaskQueue> {
        if let Some(queue) = self.get(filter_id) {
            return queue;
        }
        self.queues
            .write()
            .entry(filter_id)
            .or_insert_with(|| Arc::new(TaskQueue::new()))
            .clone()
    }

    pub fn remove(&self, filter_id: FilterId) -> Option<Arc<TaskQueue>> {
        self.queues.write().remove(&filter_id)
    }

    pub fn filter_ids(&self) -> Vec<FilterId> {
        self.queues.read().keys().copied().collect()
    }

    /// Aggregate number of queued tasks across all filters.
    pub fn total_size(&self) -> usize {
        self.queues.read().values().map(|q| q.size()).sum()
    }

    /// Removes every queue, draining queued tasks without reassigning them.
    pub fn clear(&self) {
        let queues: Vec<Arc<TaskQueue>> = {
            let mut map = self.queues.write();
            map.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            while queue.poll().is_some() {}
        }
    }
}
