//! Pipeline orchestrator: the inter-task protocol as data, not callbacks.
//!
//! Canonical shapes:
//! - RCA run:        RestartService -> FaultInjection -> BuildDataset -> RunAlgorithm -> CollectResult
//! - Dataset build:  BuildDataset -> CollectResult
//! - Algorithm-only: RunAlgorithm -> CollectResult
//! - Container build: BuildImage
//!
//! The orchestrator only writes (dispatches handlers, posts child tasks);
//! the stream processor only reads the event bus. No shared mutable state
//! between the two.

use std::sync::Arc;

use serde_json::Value;

use super::handlers::{HandlerRegistry, HandlerVerdict, StageOutput};
use crate::domain::{CoreError, TaskId, TaskType, UnifiedTask};
use crate::queue::admission::{Admission, SubmitReceipt};
use crate::queue::TaskContext;

pub struct Orchestrator {
    registry: HandlerRegistry,
    admission: Arc<Admission>,
}

impl Orchestrator {
    pub fn new(registry: HandlerRegistry, admission: Arc<Admission>) -> Self {
        Self {
            registry,
            admission,
        }
    }

    /// Dispatch a task to its handler.
    pub async fn execute(
        &self,
        task: &UnifiedTask,
        ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        let handler = self
            .registry
            .get(task.task_type)
            .ok_or(CoreError::HandlerNotFound(task.task_type))?;
        handler.handle(task, ctx).await
    }

    /// The stage that follows `task_type`, given the (already merged)
    /// payload of the completed stage. `None` means the pipeline ends.
    ///
    /// BuildDataset forks on the payload: with a non-empty `algorithms`
    /// list the pack is analysed, otherwise collection runs directly
    /// (dataset-build pipelines).
    pub fn next_stage(task_type: TaskType, payload: &StageOutput) -> Option<TaskType> {
        match task_type {
            TaskType::RestartService => Some(TaskType::FaultInjection),
            TaskType::FaultInjection => Some(TaskType::BuildDataset),
            TaskType::BuildDataset => {
                let has_algorithms = payload
                    .get("algorithms")
                    .and_then(Value::as_array)
                    .is_some_and(|a| !a.is_empty());
                if has_algorithms {
                    Some(TaskType::RunAlgorithm)
                } else {
                    Some(TaskType::CollectResult)
                }
            }
            TaskType::RunAlgorithm => Some(TaskType::CollectResult),
            TaskType::CollectResult | TaskType::BuildImage => None,
        }
    }

    /// Materialize and submit the next stage after `task` completed with
    /// `outputs`. The child preserves the trace (and group/project), runs
    /// immediately, and sees the parent payload overlaid with the outputs.
    pub async fn advance(
        &self,
        task: &UnifiedTask,
        outputs: StageOutput,
    ) -> Result<Option<SubmitReceipt>, CoreError> {
        let mut payload = task.payload.clone();
        for (key, value) in outputs {
            payload.insert(key, value);
        }

        let Some(next_type) = Self::next_stage(task.task_type, &payload) else {
            tracing::info!(trace_id = %task.trace_id, tail = %task.task_type, "pipeline finished");
            return Ok(None);
        };

        let child = UnifiedTask {
            task_id: TaskId::nil(), // admission assigns
            trace_id: task.trace_id,
            group_id: task.group_id,
            project_id: task.project_id,
            task_type: next_type,
            payload,
            immediate: true,
            execute_time: 0,
            attempts: 0,
            group_ctx: task.group_ctx.clone(),
        };

        let receipt = self.admission.submit(child).await?;
        tracing::debug!(
            trace_id = %task.trace_id,
            parent = %task.task_type,
            child = %next_type,
            child_task = %receipt.task_id,
            "next stage posted"
        );
        Ok(Some(receipt))
    }
}
