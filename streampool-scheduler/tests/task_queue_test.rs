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

use pretty_assertions::assert_eq;
use streampool_macro::streampool_test;
use streampool_scheduler::task_queue::{TaskQueue, TaskStore};
use streampool_util::processor_messages::{StreamTask, TaskId, TaskStatus};

fn make_task(id: TaskId) -> StreamTask {
    StreamTask {
        id,
        version: 0,
        filter_id: 1,
        stream_id: id,
        status: TaskStatus::Unprocessed,
        node: None,
        event_ranges: None,
        create_time_ms: 0,
    }
}

#[streampool_test]
async fn poll_returns_tasks_in_fifo_order() {
    let queue = TaskQueue::new();
    for id in 1..=3 {
        queue.add(make_task(id));
    }
    assert_eq!(queue.size(), 3);
    assert_eq!(queue.poll().map(|task| task.id), Some(1));
    assert_eq!(queue.poll().map(|task| task.id), Some(2));
    assert_eq!(queue.poll().map(|task| task.id), Some(3));
}

#[streampool_test]
async fn poll_on_empty_queue_never_blocks() {
    let queue = TaskQueue::new();
    assert_eq!(queue.poll(), None);
    queue.add(make_task(1));
    assert_eq!(queue.poll().map(|task| task.id), Some(1));
    assert_eq!(queue.poll(), None);
}

#[streampool_test]
async fn filling_flag_has_compare_and_set_semantics() {
    let queue = TaskQueue::new();
    assert!(!queue.is_filling());
    assert!(queue.compare_and_set_filling(false, true));
    // Only one caller can win the flag.
    assert!(!queue.compare_and_set_filling(false, true));
    assert!(queue.is_filling());
    queue.set_filling(false);
    assert!(queue.compare_and_set_filling(false, true));
}

#[streampool_test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_concurrent_caller_wins_the_filling_flag() {
    let queue = Arc::new(TaskQueue::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.compare_and_set_filling(false, true)
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[streampool_test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_and_consumers_lose_no_tasks() {
    let queue = Arc::new(TaskQueue::new());
    let producer_queue = queue.clone();
    let producer = tokio::spawn(async move {
        for id in 0..1000 {
            producer_queue.add(make_task(id));
        }
    });

    let mut consumed = 0;
    producer.await.unwrap();
    while queue.poll().is_some() {
        consumed += 1;
    }
    assert_eq!(consumed, 1000);
    assert_eq!(queue.size(), 0);
}

#[streampool_test]
async fn store_creates_queues_lazily_and_reuses_them() {
    let store = TaskStore::new();
    assert!(store.get(1).is_none());
    let queue = store.get_or_create(1);
    queue.add(make_task(1));
    let same_queue = store.get_or_create(1);
    assert_eq!(same_queue.size(), 1);
    assert_eq!(store.filter_ids(), vec![1]);
}

#[streampool_test]
async fn store_total_size_sums_all_queues() {
    let store = TaskStore::new();
    store.get_or_create(1).add(make_task(1));
    store.get_or_create(1).add(make_task(2));
    store.get_or_create(2).add(make_task(3));
    assert_eq!(store.total_size(), 3);

    store.clear();
    assert_eq!(store.total_size(), 0);
    assert!(store.get(1).is_none());
}

#[streampool_test]
async fn removed_queue_keeps_its_tasks_for_the_caller() {
    let store = TaskStore::new();
    store.get_or_create(1).add(make_task(1));
    let queue = store.remove(1).unwrap();
    assert!(store.get(1).is_none());
    assert_eq!(queue.poll().map(|task| task.id), Some(1));
}
