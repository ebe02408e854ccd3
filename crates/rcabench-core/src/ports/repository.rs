//! Repository port: narrow operations over the relational store.
//!
//! The core never joins tables; it asks for exactly the read models it
//! needs. Stage upserts are keyed (see `domain::records`) so at-least-once
//! handler invocation cannot duplicate rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CoreError, Detector, ExecutionResult, FaultInjectionSchedule, GranularityResult, GroupId,
    TaskId, TaskRow, TaskStatus, TraceId,
};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_task(&self, row: TaskRow) -> Result<(), CoreError>;
    async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;
    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRow>, CoreError>;

    /// Distinct trace ids belonging to one submission group, in insertion
    /// order. This is the group index derived from the task table.
    async fn group_traces(&self, group_id: GroupId) -> Result<Vec<TraceId>, CoreError>;

    // Stage records. Upsert semantics: same key overwrites.
    async fn upsert_injection(&self, record: FaultInjectionSchedule) -> Result<(), CoreError>;
    async fn upsert_execution(&self, record: ExecutionResult) -> Result<(), CoreError>;
    async fn upsert_granularity(&self, record: GranularityResult) -> Result<(), CoreError>;
    async fn upsert_detector(&self, record: Detector) -> Result<(), CoreError>;

    // Read models for reconciliation and analytics.
    async fn injection(&self, trace_id: TraceId)
    -> Result<Option<FaultInjectionSchedule>, CoreError>;
    async fn executions(&self, trace_id: TraceId) -> Result<Vec<ExecutionResult>, CoreError>;
    async fn granularities(&self, trace_id: TraceId) -> Result<Vec<GranularityResult>, CoreError>;
    async fn detectors(&self, trace_id: TraceId) -> Result<Vec<Detector>, CoreError>;
}
