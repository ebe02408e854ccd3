//! Relational records.
//!
//! Rows persisted by admission and the orchestrator. The relational store is
//! consulted for status reconciliation and read models only; queue state
//! lives in the KV store. Stage outputs are keyed so that re-executing a
//! stage upserts instead of duplicating (at-least-once delivery).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{GroupId, TaskId, TraceId};
use super::task::{TaskStatus, TaskType};

/// Minimal task row, written at admission and updated by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: TaskId,
    pub trace_id: TraceId,
    pub group_id: Option<GroupId>,
    pub project_id: Option<i64>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub immediate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn new(
        task_id: TaskId,
        trace_id: TraceId,
        group_id: Option<GroupId>,
        project_id: Option<i64>,
        task_type: TaskType,
        status: TaskStatus,
        immediate: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            trace_id,
            group_id,
            project_id,
            task_type,
            status,
            immediate,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Record of one fault-injection run: inputs, timing, outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultInjectionSchedule {
    pub trace_id: TraceId,
    pub fault_type: String,
    /// The injection spec as submitted (opaque to the controller).
    pub spec: Value,
    pub start_time: i64,
    pub end_time: i64,
}

/// Record of one algorithm execution against a datapack.
///
/// Keyed by `(trace_id, algorithm)`: re-delivery of a completed RunAlgorithm
/// stage overwrites the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub trace_id: TraceId,
    pub algorithm: String,
    pub datapack: String,
    pub created_at: DateTime<Utc>,
}

/// Ranked localization output at one granularity level. Keyed by
/// `(trace_id, level)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranularityResult {
    pub trace_id: TraceId,
    pub level: String,
    pub result: Value,
}

/// Detector verdict for a trace. Keyed by `(trace_id, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub trace_id: TraceId,
    pub name: String,
    pub anomaly_detected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn task_row_status_updates_touch_updated_at() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 5).unwrap();
        let task_id = TaskId::random();

        let mut row = TaskRow::new(
            task_id,
            task_id.as_trace(),
            None,
            None,
            TaskType::BuildDataset,
            TaskStatus::Pending,
            true,
            t0,
        );
        assert_eq!(row.updated_at, t0);

        row.set_status(TaskStatus::Running, t1);
        assert_eq!(row.status, TaskStatus::Running);
        assert_eq!(row.created_at, t0);
        assert_eq!(row.updated_at, t1);
    }

    #[test]
    fn records_serialize_roundtrip() {
        let trace_id = TaskId::random().as_trace();
        let schedule = FaultInjectionSchedule {
            trace_id,
            fault_type: "network-delay".into(),
            spec: serde_json::json!({"latency_ms": 200}),
            start_time: 1_700_000_000,
            end_time: 1_700_000_060,
        };
        let s = serde_json::to_string(&schedule).unwrap();
        let back: FaultInjectionSchedule = serde_json::from_str(&s).unwrap();
        assert_eq!(back, schedule);
    }
}
