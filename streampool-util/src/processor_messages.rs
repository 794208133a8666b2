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

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default priority filters get when not provided. Higher is more important,
/// so 1 is low, 10 is medium and 20 is high.
pub const DEFAULT_FILTER_PRIORITY: i32 = 10;

pub type FilterId = u32;
pub type TaskId = u64;
pub type StreamId = u64;
pub type EventId = u64;
pub type UserName = String;

/// Unique identifier of a processing node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Assignment status of a stream task. Only `Unprocessed` and `Assigned` are
/// driven by the task creator; the rest are reported by workers through the
/// same status-change entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Unprocessed,
    Assigned,
    Processing,
    Complete,
    Failed,
    Deleted,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unprocessed => "UNPROCESSED",
            Self::Assigned => "ASSIGNED",
            Self::Processing => "PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Progress status of a filter tracker. `Complete` is terminal, no further
/// tasks are produced once set. `Progress` carries transient stage messages
/// such as "Searching..." or "Creating...".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrackerStatus {
    #[default]
    Active,
    Complete,
    Progress(String),
}

impl TrackerStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("Active"),
            Self::Complete => f.write_str("Complete"),
            Self::Progress(msg) => f.write_str(msg),
        }
    }
}

/// Durable progress cursor for one filter. `min_stream_id` only ever moves
/// forward; it advances when tasks are durably created, never before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilterTracker {
    pub min_stream_id: StreamId,
    pub min_event_id: EventId,
    pub stream_count: u64,
    pub event_count: u64,
    pub last_poll_ms: Option<u64>,
    pub last_poll_task_count: Option<u64>,
    pub max_stream_create_ms: Option<u64>,
    pub status: TrackerStatus,
    /// Bumped on every save, used to reject stale writers.
    pub version: u64,
}

/// Data source a filter's query runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// The stream store itself; tasks are created directly from matching
    /// metadata rows.
    StreamStore,
    /// A named searchable source; tasks are created from an asynchronous
    /// event search against it.
    Searchable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Equals,
    Contains,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionTerm {
    pub field: String,
    pub condition: Condition,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExpressionOp {
    #[default]
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionItem {
    Operator(ExpressionOperator),
    Term(ExpressionTerm),
}

/// A minimal boolean expression tree over field terms. The engine never
/// evaluates these itself, it only passes them through to the meta store and
/// search collaborators with extra bounds applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExpressionOperator {
    pub op: ExpressionOp,
    pub children: Vec<ExpressionItem>,
}

impl ExpressionOperator {
    pub fn term(field: impl Into<String>, condition: Condition, value: impl Into<String>) -> Self {
        Self {
            op: ExpressionOp::And,
            children: vec![ExpressionItem::Term(ExpressionTerm {
                field: field.into(),
                condition,
                value: value.into(),
            })],
        }
    }
}

/// Optional result limits on a filter's query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryLimits {
    pub duration_ms: Option<u64>,
    pub stream_count: Option<u64>,
    pub event_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryData {
    pub data_source: DataSource,
    pub expression: ExpressionOperator,
    pub limits: Option<QueryLimits>,
}

impl QueryData {
    pub fn is_stream_store_search(&self) -> bool {
        matches!(self.data_source, DataSource::StreamStore)
    }
}

/// A named, prioritized rule describing what data a processor should consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorFilter {
    pub id: FilterId,
    /// The higher the number the higher the priority.
    pub priority: i32,
    pub enabled: bool,
    pub processor_enabled: bool,
    pub create_time_ms: u64,
    /// Queries issued for this filter run as this user so only data visible
    /// to them is selected.
    pub create_user: UserName,
    pub query_data: QueryData,
    pub tracker: FilterTracker,
}

impl ProcessorFilter {
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.processor_enabled
    }
}

impl PartialEq for ProcessorFilter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProcessorFilter {}

impl Hash for ProcessorFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for ProcessorFilter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessorFilter {
    /// Highest priority first. Ties are broken by the tracker positions so
    /// filters that are furthest behind sort first, then by id so the order
    /// is total.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.tracker.min_stream_id.cmp(&other.tracker.min_stream_id))
            .then_with(|| self.tracker.min_event_id.cmp(&other.tracker.min_event_id))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// One unit of assignable processing work for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTask {
    pub id: TaskId,
    /// Bumped on every status change, used to reject stale transitions.
    pub version: u64,
    pub filter_id: FilterId,
    pub stream_id: StreamId,
    pub status: TaskStatus,
    pub node: Option<NodeId>,
    /// Compact encoding of the event sub-ranges this task covers, if the
    /// task was derived from an event search.
    pub event_ranges: Option<String>,
    pub create_time_ms: u64,
}

/// Status of a data item in the stream store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStatus {
    Unlocked,
    Locked,
    Deleted,
}

/// One data item (stream) in the stream store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMeta {
    pub id: StreamId,
    pub feed: String,
    pub status: DataStatus,
    pub create_time_ms: u64,
}

/// Criteria for selecting data items from the meta store. Results are always
/// ordered ascending by stream id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindDataCriteria {
    pub expression: ExpressionOperator,
    pub min_stream_id: StreamId,
    pub statuses: Vec<DataStatus>,
    pub limit: usize,
    /// The user the query runs as; items invisible to them are excluded.
    pub run_as: UserName,
}

/// Criteria for selecting previously created tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindTaskCriteria {
    pub filter_id: FilterId,
    pub statuses: Vec<TaskStatus>,
    /// Only match tasks not owned by any node.
    pub unowned_only: bool,
    /// Only match tasks whose underlying stream is unlocked.
    pub stream_unlocked_only: bool,
    pub limit: usize,
}

/// A single event hit returned from an event search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub stream_id: StreamId,
    pub event_id: EventId,
}

impl EventRef {
    pub const fn new(stream_id: StreamId, event_id: EventId) -> Self {
        Self {
            stream_id,
            event_id,
        }
    }
}

/// Ordered event search results plus whether a configured limit was hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRefs {
    pub refs: Vec<EventRef>,
    pub reached_limit: bool,
}

impl EventRefs {
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Bounds for an asynchronous event search dispatched by the task creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSearchSpec {
    pub query: QueryData,
    pub min_event: EventRef,
    pub max_event: EventRef,
    pub max_streams: u64,
    pub max_events: u64,
    pub max_events_per_stream: u64,
    /// The user the search runs as; events invisible to them are excluded.
    pub run_as: UserName,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn make_filter(id: FilterId, priority: i32, min_stream_id: StreamId) -> ProcessorFilter {
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
            tracker: FilterTracker {
                min_stream_id,
                ..Default::default()
            },
        }
    }

    #[test]
    fn filters_sort_highest_priority_first() {
        let mut filters = vec![
            make_filter(1, 1, 0),
            make_filter(2, 20, 0),
            make_filter(3, 10, 0),
        ];
        filters.sort();
        let ids: Vec<FilterId> = filters.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn priority_ties_break_on_tracker_position() {
        let mut filters = vec![make_filter(1, 10, 500), make_filter(2, 10, 10)];
        filters.sort();
        let ids: Vec<FilterId> = filters.iter().map(|f| f.id).collect();
        // The filter that is furthest behind goes first.
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn filter_equality_is_by_id() {
        let a = make_filter(7, 10, 0);
        let mut b = make_filter(7, 3, 99);
        b.create_user = "someone_else".to_string();
        assert_eq!(a, b);
    }
}
