//! In-memory Repository for development and tests.
//!
//! Upserts follow the stage-record keys, so re-delivered stages overwrite
//! instead of duplicating, exactly like the SQL `ON CONFLICT ... DO UPDATE`
//! a production binding would use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    CoreError, Detector, ExecutionResult, FaultInjectionSchedule, GranularityResult, GroupId,
    TaskId, TaskRow, TaskStatus, TraceId,
};
use crate::ports::repository::Repository;

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRow>,
    task_order: Vec<TaskId>,
    injections: HashMap<TraceId, FaultInjectionSchedule>,
    executions: Vec<ExecutionResult>,
    granularities: Vec<GranularityResult>,
    detectors: Vec<Detector>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_task(&self, row: TaskRow) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&row.task_id) {
            inner.task_order.push(row.task_id);
        }
        inner.tasks.insert(row.task_id, row);
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&task_id) {
            Some(row) => {
                row.set_status(status, now);
                Ok(())
            }
            None => Err(CoreError::inconsistency(format!(
                "status update for unknown task {task_id}"
            ))),
        }
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRow>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&task_id).cloned())
    }

    async fn group_traces(&self, group_id: GroupId) -> Result<Vec<TraceId>, CoreError> {
        let inner = self.inner.lock().await;
        let mut traces = Vec::new();
        for task_id in &inner.task_order {
            if let Some(row) = inner.tasks.get(task_id)
                && row.group_id == Some(group_id)
                && !traces.contains(&row.trace_id)
            {
                traces.push(row.trace_id);
            }
        }
        Ok(traces)
    }

    async fn upsert_injection(&self, record: FaultInjectionSchedule) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.injections.insert(record.trace_id, record);
        Ok(())
    }

    async fn upsert_execution(&self, record: ExecutionResult) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let key = (record.trace_id, record.algorithm.clone());
        match inner
            .executions
            .iter_mut()
            .find(|e| (e.trace_id, e.algorithm.clone()) == key)
        {
            Some(existing) => *existing = record,
            None => inner.executions.push(record),
        }
        Ok(())
    }

    async fn upsert_granularity(&self, record: GranularityResult) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        match inner
            .granularities
            .iter_mut()
            .find(|g| g.trace_id == record.trace_id && g.level == record.level)
        {
            Some(existing) => *existing = record,
            None => inner.granularities.push(record),
        }
        Ok(())
    }

    async fn upsert_detector(&self, record: Detector) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        match inner
            .detectors
            .iter_mut()
            .find(|d| d.trace_id == record.trace_id && d.name == record.name)
        {
            Some(existing) => *existing = record,
            None => inner.detectors.push(record),
        }
        Ok(())
    }

    async fn injection(
        &self,
        trace_id: TraceId,
    ) -> Result<Option<FaultInjectionSchedule>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.injections.get(&trace_id).cloned())
    }

    async fn executions(&self, trace_id: TraceId) -> Result<Vec<ExecutionResult>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn granularities(&self, trace_id: TraceId) -> Result<Vec<GranularityResult>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .granularities
            .iter()
            .filter(|g| g.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn detectors(&self, trace_id: TraceId) -> Result<Vec<Detector>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .detectors
            .iter()
            .filter(|d| d.trace_id == trace_id)
            .cloned()
            .collect())
    }
}
