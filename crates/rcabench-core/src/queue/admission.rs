//! Admission: accepts validated task specs and publishes them to a queue.
//!
//! Payload validation happened in the HTTP layer; admission only assigns
//! ids, links pipelines, publishes to ready/delayed and persists the
//! minimal task row.

use std::sync::Arc;

use serde::Serialize;

use super::CancelRegistry;
use crate::domain::{CoreError, GroupId, TaskId, TaskRow, TaskStatus, TraceEvent, TraceId, UnifiedTask};
use crate::events::bus::EventBus;
use crate::origin;
use crate::ports::clock::Clock;
use crate::ports::kv_store::{KvStore, Script, ScriptReply};
use crate::ports::repository::Repository;
use crate::store::keys;

/// What the caller gets back: the assigned ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub trace_id: TraceId,
}

/// Receipt for a batch submission: one pipeline per entry.
#[derive(Debug, Clone, Serialize)]
pub struct GroupReceipt {
    pub group_id: GroupId,
    pub pipelines: Vec<SubmitReceipt>,
}

pub struct Admission {
    store: Arc<dyn KvStore>,
    repository: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    cancels: Arc<CancelRegistry>,
}

impl Admission {
    pub fn new(
        store: Arc<dyn KvStore>,
        repository: Arc<dyn Repository>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            store,
            repository,
            bus,
            clock,
            cancels,
        }
    }

    /// Submit one task. Immediate tasks go to the ready list, delayed ones
    /// to the delayed zset with their absolute `execute_time` as score
    /// (clock skew is tolerated because the time is absolute).
    ///
    /// A task with an unset `trace_id` is the head of a new pipeline and
    /// gets `trace_id := task_id`.
    pub async fn submit(&self, mut task: UnifiedTask) -> Result<SubmitReceipt, CoreError> {
        if task.task_id.is_nil() {
            task.task_id = TaskId::random();
        }
        if task.trace_id.is_nil() {
            task.trace_id = task.task_id.as_trace();
        }

        let id_str = task.task_id.to_string();
        // UUID collisions are vanishingly rare; this guards against
        // double submission of the same envelope.
        if self.store.hash_exists(keys::INDEX, &id_str).await? {
            return Err(CoreError::AlreadyExists(task.task_id));
        }

        let encoded = task.encode()?;
        let status = if task.immediate {
            self.store.list_push_head(keys::READY, &encoded).await?;
            self.store.hash_set(keys::INDEX, &id_str, keys::READY).await?;
            TaskStatus::Pending
        } else {
            self.store
                .zset_add(keys::DELAYED, task.execute_time, &encoded)
                .await?;
            self.store
                .hash_set(keys::INDEX, &id_str, keys::DELAYED)
                .await?;
            TaskStatus::Scheduled
        };

        self.repository
            .create_task(TaskRow::new(
                task.task_id,
                task.trace_id,
                task.group_id,
                task.project_id,
                task.task_type,
                status,
                task.immediate,
                self.clock.now(),
            ))
            .await?;

        tracing::info!(
            task_id = %task.task_id,
            trace_id = %task.trace_id,
            task_type = %task.task_type,
            immediate = task.immediate,
            "task admitted"
        );
        Ok(SubmitReceipt {
            task_id: task.task_id,
            trace_id: task.trace_id,
        })
    }

    /// Submit for immediate execution, regardless of how the envelope was
    /// built.
    pub async fn submit_immediate(&self, mut task: UnifiedTask) -> Result<SubmitReceipt, CoreError> {
        task.immediate = true;
        task.execute_time = 0;
        self.submit(task).await
    }

    /// Submit for execution at `execute_time` (absolute unix seconds).
    pub async fn submit_delayed(
        &self,
        mut task: UnifiedTask,
        execute_time: i64,
    ) -> Result<SubmitReceipt, CoreError> {
        task.immediate = false;
        task.execute_time = execute_time;
        self.submit(task).await
    }

    /// Submit a batch as one group: every entry becomes the head of its own
    /// pipeline, all sharing a fresh `group_id`. Pipelines are independent;
    /// nothing coordinates them afterwards.
    pub async fn submit_group(
        &self,
        tasks: Vec<UnifiedTask>,
    ) -> Result<GroupReceipt, CoreError> {
        let group_id = GroupId::random();
        let mut pipelines = Vec::with_capacity(tasks.len());
        for task in tasks {
            pipelines.push(self.submit(task.with_group(group_id)).await?);
        }
        Ok(GroupReceipt {
            group_id,
            pipelines,
        })
    }

    /// Cancel a task.
    ///
    /// Queued tasks are removed atomically from whichever queue holds them
    /// and their index entry is erased. A task that is in no queue may be
    /// in flight; cancellation is then requested cooperatively through the
    /// registry and the scheduler finishes the bookkeeping.
    ///
    /// Returns true when the task was found in either place.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, CoreError> {
        let reply = self
            .store
            .eval(Script::CancelTask {
                ready_key: keys::READY.into(),
                delayed_key: keys::DELAYED.into(),
                dead_key: keys::DEAD.into(),
                index_key: keys::INDEX.into(),
                task_id: task_id.to_string(),
            })
            .await?;

        match reply {
            ScriptReply::Removed(Some(queue)) => {
                let now = self.clock.now();
                self.repository
                    .update_task_status(task_id, TaskStatus::Cancelled, now)
                    .await?;
                if let Some(row) = self.repository.get_task(task_id).await? {
                    self.bus
                        .append(
                            row.trace_id,
                            task_id,
                            row.task_type,
                            &TraceEvent::TaskStatusUpdate {
                                status: TaskStatus::Cancelled,
                                reason: Some("cancelled by user".into()),
                            },
                            origin!("admission.cancel"),
                        )
                        .await?;
                }
                tracing::info!(%task_id, %queue, "task cancelled from queue");
                Ok(true)
            }
            _ => Ok(self.cancels.request(task_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use crate::impls::InMemoryRepository;
    use crate::ports::clock::SystemClock;
    use crate::store::InMemoryStore;
    use serde_json::Map;
    use std::time::Duration;

    fn admission() -> (Admission, Arc<InMemoryStore>, Arc<InMemoryRepository>) {
        let store = Arc::new(InMemoryStore::new());
        let repository = Arc::new(InMemoryRepository::new());
        let bus = Arc::new(EventBus::new(store.clone(), 10_000));
        let admission = Admission::new(
            store.clone(),
            repository.clone(),
            bus,
            Arc::new(SystemClock),
            Arc::new(CancelRegistry::new()),
        );
        (admission, store, repository)
    }

    #[tokio::test]
    async fn head_task_links_trace_to_itself() {
        let (admission, store, repository) = admission();

        let receipt = admission
            .submit(UnifiedTask::new(TaskType::RestartService, Map::new()))
            .await
            .unwrap();
        assert_eq!(receipt.task_id.as_uuid(), receipt.trace_id.as_uuid());

        assert_eq!(store.list_len(keys::READY).await.unwrap(), 1);
        assert_eq!(
            store
                .hash_get(keys::INDEX, &receipt.task_id.to_string())
                .await
                .unwrap()
                .as_deref(),
            Some(keys::READY)
        );

        let row = repository.get_task(receipt.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert!(row.immediate);
    }

    #[tokio::test]
    async fn non_head_task_keeps_its_trace() {
        let (admission, _, _) = admission();
        let head = TaskId::random();

        let mut child = UnifiedTask::new(TaskType::FaultInjection, Map::new());
        child.trace_id = head.as_trace();
        let receipt = admission.submit(child).await.unwrap();

        assert_eq!(receipt.trace_id, head.as_trace());
        assert_ne!(receipt.task_id.as_uuid(), receipt.trace_id.as_uuid());
    }

    #[tokio::test]
    async fn delayed_submission_lands_in_the_delayed_set() {
        let (admission, store, repository) = admission();

        let task = UnifiedTask::delayed(TaskType::BuildDataset, Map::new(), 2_000_000_000);
        let receipt = admission.submit(task).await.unwrap();

        assert_eq!(store.list_len(keys::READY).await.unwrap(), 0);
        assert_eq!(store.zset_len(keys::DELAYED).await.unwrap(), 1);
        let row = repository.get_task(receipt.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Scheduled);
    }

    #[tokio::test]
    async fn submit_wrappers_override_timing() {
        let (admission, store, _) = admission();

        // A delayed envelope forced immediate.
        let delayed = UnifiedTask::delayed(TaskType::BuildDataset, Map::new(), 2_000_000_000);
        admission.submit_immediate(delayed).await.unwrap();
        assert_eq!(store.list_len(keys::READY).await.unwrap(), 1);
        assert_eq!(store.zset_len(keys::DELAYED).await.unwrap(), 0);

        // An immediate envelope forced onto the delayed set.
        let immediate = UnifiedTask::new(TaskType::BuildDataset, Map::new());
        admission
            .submit_delayed(immediate, 2_000_000_000)
            .await
            .unwrap();
        assert_eq!(store.zset_len(keys::DELAYED).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let (admission, _, _) = admission();

        let mut task = UnifiedTask::new(TaskType::BuildImage, Map::new());
        task.task_id = TaskId::random();
        task.trace_id = task.task_id.as_trace();

        admission.submit(task.clone()).await.unwrap();
        let err = admission.submit(task).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn group_submission_fans_out_independent_pipelines() {
        let (admission, store, repository) = admission();

        let receipt = admission
            .submit_group(vec![
                UnifiedTask::new(TaskType::RestartService, Map::new()),
                UnifiedTask::new(TaskType::RestartService, Map::new()),
                UnifiedTask::new(TaskType::RestartService, Map::new()),
            ])
            .await
            .unwrap();

        assert_eq!(receipt.pipelines.len(), 3);
        assert_eq!(store.list_len(keys::READY).await.unwrap(), 3);

        // Every pipeline heads its own trace, all in one group.
        for p in &receipt.pipelines {
            assert_eq!(p.task_id.as_uuid(), p.trace_id.as_uuid());
        }
        let traces = repository.group_traces(receipt.group_id).await.unwrap();
        assert_eq!(traces.len(), 3);
    }

    #[tokio::test]
    async fn cancel_removes_queued_task_and_writes_status() {
        let (admission, store, repository) = admission();

        let receipt = admission
            .submit(UnifiedTask::delayed(
                TaskType::RunAlgorithm,
                Map::new(),
                2_000_000_000,
            ))
            .await
            .unwrap();

        assert!(admission.cancel(receipt.task_id).await.unwrap());
        assert_eq!(store.zset_len(keys::DELAYED).await.unwrap(), 0);
        assert!(
            !store
                .hash_exists(keys::INDEX, &receipt.task_id.to_string())
                .await
                .unwrap()
        );
        let row = repository.get_task(receipt.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_of_unknown_task_reports_false() {
        let (admission, _, _) = admission();
        assert!(!admission.cancel(TaskId::random()).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_task_is_not_poppable() {
        let (admission, store, _) = admission();
        let receipt = admission
            .submit(UnifiedTask::new(TaskType::CollectResult, Map::new()))
            .await
            .unwrap();
        assert!(admission.cancel(receipt.task_id).await.unwrap());

        let popped = store
            .list_blocking_pop_tail(keys::READY, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(popped.is_none());
    }
}
