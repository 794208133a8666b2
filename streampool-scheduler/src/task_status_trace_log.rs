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

use streampool_util::processor_messages::{NodeId, StreamTask, TaskId};
use tracing::{enabled, event, Level};

/// Emits DEBUG-level summaries of task batches as they move between states so
/// task movements can be traced through the logs.
#[derive(Debug, Default)]
pub(crate) struct TaskStatusTraceLog;

impl TaskStatusTraceLog {
    pub(crate) fn assign_tasks(&self, tasks: &[StreamTask], node: NodeId) {
        if !tasks.is_empty() {
            self.log_batch("Assigning tasks to node", tasks, Some(node));
        }
    }

    pub(crate) fn abandon_tasks(&self, tasks: &[StreamTask], node: NodeId) {
        if !tasks.is_empty() {
            self.log_batch("Abandoning tasks from node", tasks, Some(node));
        }
    }

    pub(crate) fn reclaim_tasks(&self, tasks: &[StreamTask]) {
        if !tasks.is_empty() {
            self.log_batch("Reclaiming unowned tasks", tasks, None);
        }
    }

    fn log_batch(&self, msg: &str, tasks: &[StreamTask], node: Option<NodeId>) {
        if !enabled!(Level::DEBUG) {
            return;
        }
        let task_ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
        match node {
            Some(node) => event!(
                Level::DEBUG,
                count = tasks.len(),
                ?task_ids,
                %node,
                "{msg}"
            ),
            None => event!(Level::DEBUG, count = tasks.len(), ?task_ids, "{msg}"),
        }
    }
}
