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

use serde::Deserialize;

use crate::serde_utils::{convert_duration_with_shellexpand, convert_numeric_with_shellexpand};

fn default_true() -> bool {
    true
}

/// Configuration for the stream task creator and assignment service.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Total number of tasks to keep queued across all filters. A filter's
    /// queue is only refilled while it is below half of this value.
    /// Default: 1000
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub queue_size: usize,

    /// If task assignment to worker nodes is allowed. When false,
    /// `assign_tasks()` always returns an empty batch.
    /// Default: true
    #[serde(default = "default_true")]
    pub assign_tasks: bool,

    /// If previously created but unowned tasks should be reclaimed into the
    /// queue before new tasks are generated.
    /// Default: true
    #[serde(default = "default_true")]
    pub fill_task_queue: bool,

    /// If new tasks should be generated from filter queries. When false only
    /// the reclaim phase runs.
    /// Default: true
    #[serde(default = "default_true")]
    pub create_tasks: bool,

    /// How long to wait between fill attempts triggered by the assignment
    /// path, in seconds.
    /// Default: 10 (seconds)
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub poll_interval_s: u64,

    /// How far in the future to arm the periodic task delete schedule, in
    /// seconds.
    /// Default: 100 (seconds)
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub delete_interval_s: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_size: 0,
            assign_tasks: true,
            fill_task_queue: true,
            create_tasks: true,
            poll_interval_s: 0,
            delete_interval_s: 0,
        }
    }
}

/// Top level configuration for a streampool deployment.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct StreampoolConfig {
    /// Stream task creation and assignment settings.
    #[serde(default)]
    pub processor: ProcessorConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_fields() {
        let config: StreampoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.processor.queue_size, 0);
        assert!(config.processor.assign_tasks);
        assert!(config.processor.fill_task_queue);
        assert!(config.processor.create_tasks);
    }

    #[test]
    fn numeric_fields_accept_strings() {
        let config: StreampoolConfig = serde_json::from_str(
            r#"{"processor": {"queue_size": "25", "poll_interval_s": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.processor.queue_size, 25);
        assert_eq!(config.processor.poll_interval_s, 5);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<StreampoolConfig, _> =
            serde_json::from_str(r#"{"processor": {"qeue_size": 25}}"#);
        assert!(result.is_err());
    }
}
