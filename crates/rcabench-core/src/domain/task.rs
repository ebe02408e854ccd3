//! The `UnifiedTask` envelope and its wire encoding.
//!
//! The envelope is the unit the scheduler moves between queues. Queues hold
//! the JSON-encoded form; everything the scheduler needs to make a decision
//! (type, timing, attempts) travels inside the envelope itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use super::errors::CoreError;
use super::ids::{GroupId, TaskId, TraceId};

/// Closed set of task types. Wire values are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    RestartService,
    FaultInjection,
    BuildDataset,
    RunAlgorithm,
    CollectResult,
    BuildImage,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::RestartService => "RestartService",
            TaskType::FaultInjection => "FaultInjection",
            TaskType::BuildDataset => "BuildDataset",
            TaskType::RunAlgorithm => "RunAlgorithm",
            TaskType::CollectResult => "CollectResult",
            TaskType::BuildImage => "BuildImage",
        }
    }

    /// Tail types: a Completed status on one of these ends the pipeline.
    pub fn is_tail(&self) -> bool {
        matches!(self, TaskType::CollectResult | TaskType::BuildImage)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RestartService" => Ok(TaskType::RestartService),
            "FaultInjection" => Ok(TaskType::FaultInjection),
            "BuildDataset" => Ok(TaskType::BuildDataset),
            "RunAlgorithm" => Ok(TaskType::RunAlgorithm),
            "CollectResult" => Ok(TaskType::CollectResult),
            "BuildImage" => Ok(TaskType::BuildImage),
            other => Err(CoreError::validation(format!("unknown task type: {other}"))),
        }
    }
}

/// Task status as persisted and published. Wire values are case-sensitive.
///
/// State transitions (driven by Admission and the Scheduler only):
/// - Pending -> Ready(queue) -> Running -> Completed | Error | Cancelled | Rescheduled
/// - Scheduled is the pre-ready status of delayed tasks
/// - Rescheduled -> Ready(queue) once the backoff elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
    Scheduled,
    Rescheduled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Error => "Error",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Scheduled => "Scheduled",
            TaskStatus::Rescheduled => "Rescheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TaskStatus::Pending),
            "Running" => Ok(TaskStatus::Running),
            "Completed" => Ok(TaskStatus::Completed),
            "Error" => Ok(TaskStatus::Error),
            "Cancelled" => Ok(TaskStatus::Cancelled),
            "Scheduled" => Ok(TaskStatus::Scheduled),
            "Rescheduled" => Ok(TaskStatus::Rescheduled),
            other => Err(CoreError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// The task envelope.
///
/// Design:
/// - `task_id` is assigned at admission; `TaskId::nil()` means "not yet".
/// - `trace_id` never changes once set. The head task of a pipeline has
///   `trace_id == task_id`.
/// - `attempts` counts failed executions; it is incremented by the
///   scheduler when a retry is parked, never by handlers.
/// - Unknown JSON fields are ignored on decode so older controllers can
///   read envelopes written by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTask {
    pub task_id: TaskId,
    pub trace_id: TraceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Type-specific payload. `serde_json::Map` keeps keys sorted, which
    /// makes the encoding byte-stable across decode/encode round trips.
    #[serde(default)]
    pub payload: Map<String, Value>,

    pub immediate: bool,

    /// Unix seconds; 0 for immediate tasks.
    #[serde(default)]
    pub execute_time: i64,

    #[serde(default)]
    pub attempts: u32,

    /// Tracing context propagated across asynchronous boundaries.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub group_ctx: HashMap<String, String>,
}

impl UnifiedTask {
    /// A fresh immediate task with an unset id (admission assigns it).
    pub fn new(task_type: TaskType, payload: Map<String, Value>) -> Self {
        Self {
            task_id: TaskId::nil(),
            trace_id: TraceId::nil(),
            group_id: None,
            project_id: None,
            task_type,
            payload,
            immediate: true,
            execute_time: 0,
            attempts: 0,
            group_ctx: HashMap::new(),
        }
    }

    /// Same task, delayed until `execute_time` (unix seconds).
    pub fn delayed(task_type: TaskType, payload: Map<String, Value>, execute_time: i64) -> Self {
        let mut task = Self::new(task_type, payload);
        task.immediate = false;
        task.execute_time = execute_time;
        task
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(CoreError::encode)
    }

    /// Decode from the JSON wire form. Unknown fields are ignored.
    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(CoreError::decode)
    }

    /// String payload field accessor; `None` when absent or not a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Integer payload field accessor.
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }
}
