//! Scheduler: promotion loop, worker group, concurrency bound, retries.
//!
//! All retry/dead decisions are made here, centrally. Handlers report typed
//! errors; the scheduler classifies them, parks retries in the dead set
//! with a backoff score, and leaves exhausted or permanent failures there
//! for operator inspection. No handler writes `task:dead` directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{CancelRegistry, RetryPolicy, TaskContext};
use crate::config::ControllerConfig;
use crate::domain::{CoreError, ErrorKind, TaskStatus, TraceEvent, UnifiedTask};
use crate::events::bus::EventBus;
use crate::origin;
use crate::pipeline::handlers::{HandlerVerdict, StageOutput};
use crate::pipeline::Orchestrator;
use crate::ports::clock::Clock;
use crate::ports::kv_store::{KvStore, Script, ScriptReply};
use crate::ports::repository::Repository;
use crate::store::keys;

/// Handle for the spawned loops.
/// - dropping or calling `request_shutdown` stops all of them
/// - `shutdown_and_join` waits for the workers to drain
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Request shutdown. In-flight handler execution is not forcibly
    /// cancelled; workers stop taking new leases and handlers observe the
    /// signal through their context.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn KvStore>,
    repository: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    cancels: Arc<CancelRegistry>,
    config: ControllerConfig,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        repository: Arc<dyn Repository>,
        bus: Arc<EventBus>,
        orchestrator: Arc<Orchestrator>,
        clock: Arc<dyn Clock>,
        cancels: Arc<CancelRegistry>,
        config: ControllerConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            store,
            repository,
            bus,
            orchestrator,
            clock,
            retry,
            cancels,
            config,
        }
    }

    /// Spawn the promotion loop and `config.workers` workers.
    pub fn spawn(self: &Arc<Self>) -> WorkerGroup {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(self.config.workers + 1);

        let promoter = Arc::clone(self);
        let mut promoter_rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move {
            promoter.promotion_loop(&mut promoter_rx).await;
        }));

        for worker_id in 0..self.config.workers {
            let scheduler = Arc::clone(self);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, &mut rx).await;
            }));
        }

        WorkerGroup { shutdown_tx, joins }
    }

    /// One promotion pass: delayed tasks that are due, then parked retries
    /// whose backoff elapsed. Atomic per script, idempotent, safe to invoke
    /// concurrently.
    pub async fn promote_once(&self) -> Result<u64, CoreError> {
        let now = self.clock.now_unix();

        let due = self
            .store
            .eval(Script::PromoteDue {
                delayed_key: keys::DELAYED.into(),
                ready_key: keys::READY.into(),
                index_key: keys::INDEX.into(),
                now,
            })
            .await?;
        let retries = self
            .store
            .eval(Script::PromoteRetries {
                dead_key: keys::DEAD.into(),
                ready_key: keys::READY.into(),
                index_key: keys::INDEX.into(),
                now,
                max_attempts: self.retry.max_attempts,
            })
            .await?;

        let count = |reply: ScriptReply| match reply {
            ScriptReply::Promoted(n) => n,
            _ => 0,
        };
        let promoted = count(due) + count(retries);
        if promoted > 0 {
            tracing::debug!(promoted, "promotion tick");
        }
        Ok(promoted)
    }

    async fn promotion_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.promote_interval());
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.promote_once().await {
                        tracing::warn!(%err, "promotion tick failed");
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, worker_id: usize, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // pop は「待つ」ので shutdown と競合させる
            let popped = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                popped = self
                    .store
                    .list_blocking_pop_tail(keys::READY, self.config.pop_timeout()) => popped,
            };

            match popped {
                Ok(Some(raw)) => self.process(worker_id, raw, shutdown_rx.clone()).await,
                Ok(None) => continue, // timeout; resume polling
                Err(err) => {
                    tracing::warn!(worker_id, %err, "pop failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn process(&self, worker_id: usize, raw: String, shutdown: watch::Receiver<bool>) {
        let task = match UnifiedTask::decode(&raw) {
            Ok(task) => task,
            Err(err) => {
                // Corrupt envelope: nothing to retry, nothing to report to.
                tracing::error!(worker_id, %err, "dropping undecodable envelope");
                return;
            }
        };

        // Global concurrency bound. Atomic INCR first, back off when over.
        match self.store.counter_incr(keys::CONCURRENCY_LOCK).await {
            Ok(n) if n > self.config.max_concurrency => {
                let _ = self.store.counter_decr(keys::CONCURRENCY_LOCK).await;
                if let Err(err) = self.store.list_push_head(keys::READY, &raw).await {
                    tracing::error!(worker_id, %err, "failed to push task back");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(worker_id, %err, "slot acquire failed");
                let _ = self.store.list_push_head(keys::READY, &raw).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                return;
            }
        }

        if let Err(err) = self.run_task(task, shutdown).await {
            tracing::error!(worker_id, %err, "task bookkeeping failed");
        }
        if let Err(err) = self.store.counter_decr(keys::CONCURRENCY_LOCK).await {
            tracing::warn!(worker_id, %err, "slot release failed");
        }
    }

    async fn run_task(
        &self,
        task: UnifiedTask,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), CoreError> {
        let id_str = task.task_id.to_string();
        // In-flight: the envelope now belongs to this worker, not a queue.
        self.store.hash_del(keys::INDEX, &id_str).await?;
        self.repository
            .update_task_status(task.task_id, TaskStatus::Running, self.clock.now())
            .await?;
        self.bus
            .append_for(
                &task,
                &TraceEvent::TaskStarted {
                    attempt: task.attempts + 1,
                },
                origin!("scheduler.dispatch"),
            )
            .await?;

        let cancel_rx = self.cancels.register(task.task_id);
        let mut ctx = TaskContext::new(shutdown, cancel_rx);

        // Optional per-task deadline, supplied in the payload.
        let outcome = match task.payload_i64("timeout_secs") {
            Some(secs) if secs > 0 => {
                match tokio::time::timeout(
                    Duration::from_secs(secs as u64),
                    self.orchestrator.execute(&task, &mut ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::transient(format!(
                        "deadline exceeded after {secs}s"
                    ))),
                }
            }
            _ => self.orchestrator.execute(&task, &mut ctx).await,
        };

        self.cancels.deregister(task.task_id);

        match outcome {
            Ok(HandlerVerdict::Completed(outputs)) => self.complete(task, outputs).await,
            Ok(HandlerVerdict::Requeue { delay, reason }) => {
                self.requeue(task, delay, reason).await
            }
            Err(err) => self.fail(task, err).await,
        }
    }

    async fn complete(&self, task: UnifiedTask, outputs: StageOutput) -> Result<(), CoreError> {
        self.repository
            .update_task_status(task.task_id, TaskStatus::Completed, self.clock.now())
            .await?;
        self.bus
            .append_for(
                &task,
                &TraceEvent::TaskStatusUpdate {
                    status: TaskStatus::Completed,
                    reason: None,
                },
                origin!("scheduler.complete"),
            )
            .await?;

        // Fan out the next stage. A failure here is an integrity problem of
        // this pipeline only; it terminates with Error, others continue.
        if let Err(err) = self.orchestrator.advance(&task, outputs).await {
            tracing::error!(trace_id = %task.trace_id, %err, "failed to post next stage");
            self.bus
                .append_for(
                    &task,
                    &TraceEvent::TaskStatusUpdate {
                        status: TaskStatus::Error,
                        reason: Some(format!("failed to post next stage: {err}")),
                    },
                    origin!("scheduler.complete"),
                )
                .await?;
        }
        Ok(())
    }

    /// Not a failure: the stage yielded (namespace wait). Back to the
    /// delayed queue without consuming an attempt.
    async fn requeue(
        &self,
        mut task: UnifiedTask,
        delay: Duration,
        reason: String,
    ) -> Result<(), CoreError> {
        task.immediate = false;
        task.execute_time = self.clock.now_unix() + delay.as_secs() as i64;

        let encoded = task.encode()?;
        self.store
            .zset_add(keys::DELAYED, task.execute_time, &encoded)
            .await?;
        self.store
            .hash_set(keys::INDEX, &task.task_id.to_string(), keys::DELAYED)
            .await?;
        self.repository
            .update_task_status(task.task_id, TaskStatus::Scheduled, self.clock.now())
            .await?;
        self.bus
            .append_for(
                &task,
                &TraceEvent::TaskStatusUpdate {
                    status: TaskStatus::Scheduled,
                    reason: Some(reason),
                },
                origin!("scheduler.requeue"),
            )
            .await?;
        Ok(())
    }

    async fn fail(&self, mut task: UnifiedTask, err: CoreError) -> Result<(), CoreError> {
        let now = self.clock.now_unix();
        match err.kind() {
            ErrorKind::Cancelled => {
                self.repository
                    .update_task_status(task.task_id, TaskStatus::Cancelled, self.clock.now())
                    .await?;
                self.bus
                    .append_for(
                        &task,
                        &TraceEvent::TaskStatusUpdate {
                            status: TaskStatus::Error,
                            reason: Some("cancelled".into()),
                        },
                        origin!("scheduler.fail"),
                    )
                    .await?;
                tracing::info!(task_id = %task.task_id, "task cancelled in flight");
            }

            ErrorKind::Transient => {
                task.attempts += 1;
                self.bus
                    .append_for(
                        &task,
                        &TraceEvent::TaskStatusUpdate {
                            status: TaskStatus::Rescheduled,
                            reason: Some(err.to_string()),
                        },
                        origin!("scheduler.fail"),
                    )
                    .await?;

                if self.retry.exhausted(task.attempts) {
                    // Dead-lettered: parked at the failure time, never
                    // promoted again.
                    self.park(&task, now).await?;
                    self.repository
                        .update_task_status(task.task_id, TaskStatus::Error, self.clock.now())
                        .await?;
                    self.bus
                        .append_for(
                            &task,
                            &TraceEvent::TaskStatusUpdate {
                                status: TaskStatus::Error,
                                reason: Some(err.to_string()),
                            },
                            origin!("scheduler.fail"),
                        )
                        .await?;
                    tracing::warn!(
                        task_id = %task.task_id,
                        attempts = task.attempts,
                        %err,
                        "retry budget exhausted, dead-lettered"
                    );
                } else {
                    let delay = self.retry.next_delay(task.attempts);
                    self.park(&task, now + delay.as_secs() as i64).await?;
                    self.repository
                        .update_task_status(task.task_id, TaskStatus::Rescheduled, self.clock.now())
                        .await?;
                    tracing::info!(
                        task_id = %task.task_id,
                        attempts = task.attempts,
                        ?delay,
                        "retry scheduled"
                    );
                }
            }

            ErrorKind::Validation | ErrorKind::Permanent | ErrorKind::Inconsistency => {
                self.park(&task, now).await?;
                self.repository
                    .update_task_status(task.task_id, TaskStatus::Error, self.clock.now())
                    .await?;
                self.bus
                    .append_for(
                        &task,
                        &TraceEvent::TaskStatusUpdate {
                            status: TaskStatus::Error,
                            reason: Some(err.to_string()),
                        },
                        origin!("scheduler.fail"),
                    )
                    .await?;
                tracing::warn!(task_id = %task.task_id, %err, "task failed permanently");
            }
        }
        Ok(())
    }

    /// Park the envelope in the dead set with the given score.
    async fn park(&self, task: &UnifiedTask, score: i64) -> Result<(), CoreError> {
        let encoded = task.encode()?;
        self.store.zset_add(keys::DEAD, score, &encoded).await?;
        self.store
            .hash_set(keys::INDEX, &task.task_id.to_string(), keys::DEAD)
            .await?;
        Ok(())
    }
}
