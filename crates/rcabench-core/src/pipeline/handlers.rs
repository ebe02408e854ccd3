//! Stage handlers: one per task type, behind a registry.
//!
//! Handlers execute side effects through the adapter ports and emit the
//! bracketing domain events. They return a typed verdict; the scheduler
//! owns every retry/dead decision, so handlers report failures as typed
//! errors and never touch the queues themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{
    CoreError, Detector, ExecutionResult, FaultInjectionSchedule, GranularityResult, TraceEvent,
    TaskType, UnifiedTask,
};
use crate::events::bus::EventBus;
use crate::origin;
use crate::ports::adapters::{
    AlgorithmRunner, Collection, DatasetBuilder, ImageBuilder, InjectionAdapter, NamespacePool,
    RestartAdapter, ResultCollector,
};
use crate::ports::clock::Clock;
use crate::ports::repository::Repository;
use crate::queue::TaskContext;

/// Stage outputs merged into the next stage's payload.
pub type StageOutput = Map<String, Value>;

/// What a handler invocation decided.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerVerdict {
    /// Stage done; outputs feed the next stage.
    Completed(StageOutput),

    /// Not an error: the stage cannot run yet (no namespace free). The
    /// scheduler parks the task in the delayed queue without consuming an
    /// attempt.
    Requeue { delay: Duration, reason: String },
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &UnifiedTask,
        ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError>;
}

/// Registry of handlers (task_type -> handler).
///
/// Built during wiring (mutable), used at runtime (immutable); no locks.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), CoreError> {
        if self.handlers.contains_key(&task_type) {
            return Err(CoreError::validation(format!(
                "duplicate handler for task_type={task_type}"
            )));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.keys().copied().collect()
    }
}

/// Restart the service-under-test inside a reserved namespace.
///
/// The namespace pool is an external semaphore: when empty, the task waits
/// in the delayed queue rather than holding a worker slot.
pub struct RestartServiceHandler {
    pub pool: Arc<dyn NamespacePool>,
    pub adapter: Arc<dyn RestartAdapter>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub retry_delay: Duration,
}

#[async_trait]
impl TaskHandler for RestartServiceHandler {
    async fn handle(
        &self,
        task: &UnifiedTask,
        _ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        let Some(namespace) = self.pool.acquire().await? else {
            self.bus
                .append_for(task, &TraceEvent::NoNamespaceAvailable, origin!("restart.handle"))
                .await?;
            return Ok(HandlerVerdict::Requeue {
                delay: self.retry_delay,
                reason: "no namespace available".into(),
            });
        };

        self.bus
            .append_for(
                task,
                &TraceEvent::RestartServiceStarted {
                    namespace: namespace.clone(),
                },
                origin!("restart.handle"),
            )
            .await?;

        let started = self.clock.now();
        let restart = self.adapter.restart(&namespace, &task.payload).await;
        // Release before reporting; the reservation is per restart, not per
        // pipeline.
        self.pool.release(&namespace).await?;

        match restart {
            Ok(()) => {
                let duration_secs = (self.clock.now() - started).num_milliseconds() as f64 / 1000.0;
                self.bus
                    .append_for(
                        task,
                        &TraceEvent::RestartServiceCompleted {
                            namespace: namespace.clone(),
                            duration_secs,
                        },
                        origin!("restart.handle"),
                    )
                    .await?;
                let mut outputs = StageOutput::new();
                outputs.insert("namespace".into(), Value::String(namespace));
                outputs.insert("restart_duration_secs".into(), duration_secs.into());
                Ok(HandlerVerdict::Completed(outputs))
            }
            Err(err) => {
                self.bus
                    .append_for(
                        task,
                        &TraceEvent::RestartServiceFailed {
                            reason: err.to_string(),
                        },
                        origin!("restart.handle"),
                    )
                    .await?;
                Err(err.into())
            }
        }
    }
}

/// Inject the prescribed fault and record its schedule.
pub struct FaultInjectionHandler {
    pub adapter: Arc<dyn InjectionAdapter>,
    pub repository: Arc<dyn Repository>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl TaskHandler for FaultInjectionHandler {
    async fn handle(
        &self,
        task: &UnifiedTask,
        _ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        let fault_type = task.payload_str("fault_type").unwrap_or("unknown").to_string();
        self.bus
            .append_for(
                task,
                &TraceEvent::FaultInjectionStarted {
                    fault_type: fault_type.clone(),
                },
                origin!("injection.handle"),
            )
            .await?;

        match self.adapter.inject(task.trace_id, &task.payload).await {
            Ok(report) => {
                self.repository
                    .upsert_injection(FaultInjectionSchedule {
                        trace_id: task.trace_id,
                        fault_type: report.fault_type.clone(),
                        spec: Value::Object(task.payload.clone()),
                        start_time: report.start_time,
                        end_time: report.end_time,
                    })
                    .await?;
                self.bus
                    .append_for(
                        task,
                        &TraceEvent::FaultInjectionCompleted {
                            start_time: report.start_time,
                            end_time: report.end_time,
                        },
                        origin!("injection.handle"),
                    )
                    .await?;
                let mut outputs = StageOutput::new();
                outputs.insert("fault_type".into(), Value::String(report.fault_type));
                outputs.insert("inject_start_time".into(), report.start_time.into());
                outputs.insert("inject_end_time".into(), report.end_time.into());
                Ok(HandlerVerdict::Completed(outputs))
            }
            Err(err) => {
                self.bus
                    .append_for(
                        task,
                        &TraceEvent::FaultInjectionFailed {
                            reason: err.to_string(),
                        },
                        origin!("injection.handle"),
                    )
                    .await?;
                Err(err.into())
            }
        }
    }
}

/// Build the labelled datapack from the trace's telemetry window.
pub struct BuildDatasetHandler {
    pub builder: Arc<dyn DatasetBuilder>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl TaskHandler for BuildDatasetHandler {
    async fn handle(
        &self,
        task: &UnifiedTask,
        _ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        let datapack = self.builder.build(task.trace_id, &task.payload).await?;
        self.bus
            .append_for(
                task,
                &TraceEvent::DatasetBuildSucceed {
                    datapack: datapack.clone(),
                },
                origin!("dataset.handle"),
            )
            .await?;
        let mut outputs = StageOutput::new();
        outputs.insert("datapack".into(), Value::String(datapack));
        Ok(HandlerVerdict::Completed(outputs))
    }
}

/// Run each requested algorithm against the datapack.
pub struct RunAlgorithmHandler {
    pub runner: Arc<dyn AlgorithmRunner>,
    pub repository: Arc<dyn Repository>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl TaskHandler for RunAlgorithmHandler {
    async fn handle(
        &self,
        task: &UnifiedTask,
        ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        let datapack = task
            .payload_str("datapack")
            .ok_or_else(|| CoreError::validation("RunAlgorithm payload missing datapack"))?
            .to_string();
        let algorithms: Vec<String> = task
            .payload
            .get("algorithms")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if algorithms.is_empty() {
            return Err(CoreError::validation(
                "RunAlgorithm payload has no algorithms",
            ));
        }

        for algorithm in &algorithms {
            if ctx.is_cancelled() {
                return Err(CoreError::cancelled("algorithm run interrupted"));
            }
            self.runner.run(algorithm, &datapack, &task.payload).await?;
            self.repository
                .upsert_execution(ExecutionResult {
                    trace_id: task.trace_id,
                    algorithm: algorithm.clone(),
                    datapack: datapack.clone(),
                    created_at: self.clock.now(),
                })
                .await?;
            self.bus
                .append_for(
                    task,
                    &TraceEvent::AlgoRunSucceed {
                        algorithm: algorithm.clone(),
                    },
                    origin!("algorithm.handle"),
                )
                .await?;
        }

        Ok(HandlerVerdict::Completed(StageOutput::new()))
    }
}

/// Collect conclusions and persist the evaluation records.
pub struct CollectResultHandler {
    pub collector: Arc<dyn ResultCollector>,
    pub repository: Arc<dyn Repository>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl TaskHandler for CollectResultHandler {
    async fn handle(
        &self,
        task: &UnifiedTask,
        _ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        match self.collector.collect(task.trace_id, &task.payload).await? {
            Collection::NoAnomaly => {
                self.bus
                    .append_for(task, &TraceEvent::DatasetNoAnomaly, origin!("collect.handle"))
                    .await?;
            }
            Collection::NoConclusionFile { path } => {
                self.bus
                    .append_for(
                        task,
                        &TraceEvent::DatasetNoConclusionFile { path },
                        origin!("collect.handle"),
                    )
                    .await?;
            }
            Collection::Results {
                granularities,
                detectors,
            } => {
                let results = granularities.len() as u64;
                for (level, result) in granularities {
                    self.repository
                        .upsert_granularity(GranularityResult {
                            trace_id: task.trace_id,
                            level,
                            result,
                        })
                        .await?;
                }
                for (name, anomaly_detected) in detectors {
                    self.repository
                        .upsert_detector(Detector {
                            trace_id: task.trace_id,
                            name,
                            anomaly_detected,
                        })
                        .await?;
                }
                self.bus
                    .append_for(
                        task,
                        &TraceEvent::DatasetResultCollection { results },
                        origin!("collect.handle"),
                    )
                    .await?;
            }
        }
        Ok(HandlerVerdict::Completed(StageOutput::new()))
    }
}

/// Build a container image (standalone pipeline).
pub struct BuildImageHandler {
    pub builder: Arc<dyn ImageBuilder>,
}

#[async_trait]
impl TaskHandler for BuildImageHandler {
    async fn handle(
        &self,
        task: &UnifiedTask,
        _ctx: &mut TaskContext,
    ) -> Result<HandlerVerdict, CoreError> {
        let image = self.builder.build_image(&task.payload).await?;
        let mut outputs = StageOutput::new();
        outputs.insert("image".into(), Value::String(image));
        Ok(HandlerVerdict::Completed(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TraceEvent};
    use crate::impls::{
        FakeCollector, FakeInjection, FakeRestart, InMemoryRepository, StaticNamespacePool,
    };
    use crate::ports::clock::SystemClock;
    use crate::store::InMemoryStore;

    fn wiring() -> (Arc<EventBus>, Arc<InMemoryRepository>, Arc<dyn Clock>) {
        let store = Arc::new(InMemoryStore::new());
        (
            Arc::new(EventBus::new(store, 10_000)),
            Arc::new(InMemoryRepository::new()),
            Arc::new(SystemClock),
        )
    }

    fn task_of(task_type: TaskType, payload: StageOutput) -> UnifiedTask {
        let mut task = UnifiedTask::new(task_type, payload);
        task.task_id = TaskId::random();
        task.trace_id = task.task_id.as_trace();
        task
    }

    #[tokio::test]
    async fn restart_brackets_with_events_and_returns_namespace() {
        let (bus, _, clock) = wiring();
        let handler = RestartServiceHandler {
            pool: Arc::new(StaticNamespacePool::new(vec!["ns-a".into()])),
            adapter: Arc::new(FakeRestart::reliable()),
            bus: bus.clone(),
            clock,
            retry_delay: Duration::from_secs(30),
        };

        let task = task_of(TaskType::RestartService, StageOutput::new());
        let verdict = handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();

        let HandlerVerdict::Completed(outputs) = verdict else {
            panic!("expected completion");
        };
        assert_eq!(outputs["namespace"], "ns-a");

        let names: Vec<String> = bus
            .read_all(task.trace_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.event_name.clone())
            .collect();
        assert_eq!(names, vec!["RestartServiceStarted", "RestartServiceCompleted"]);
    }

    #[tokio::test]
    async fn restart_without_namespace_requeues() {
        let (bus, _, clock) = wiring();
        let pool = Arc::new(StaticNamespacePool::new(vec![]));
        let handler = RestartServiceHandler {
            pool,
            adapter: Arc::new(FakeRestart::reliable()),
            bus: bus.clone(),
            clock,
            retry_delay: Duration::from_secs(30),
        };

        let task = task_of(TaskType::RestartService, StageOutput::new());
        let verdict = handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();

        assert!(matches!(
            verdict,
            HandlerVerdict::Requeue { delay, .. } if delay == Duration::from_secs(30)
        ));
        let records = bus.read_all(task.trace_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_name, "NoNamespaceAvailable");
    }

    #[tokio::test]
    async fn restart_failure_emits_failed_and_releases_namespace() {
        let (bus, _, clock) = wiring();
        let pool = Arc::new(StaticNamespacePool::new(vec!["ns-a".into()]));
        let handler = RestartServiceHandler {
            pool: pool.clone(),
            adapter: Arc::new(FakeRestart::failing_times(99)),
            bus: bus.clone(),
            clock,
            retry_delay: Duration::from_secs(30),
        };

        let task = task_of(TaskType::RestartService, StageOutput::new());
        let err = handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let names: Vec<String> = bus
            .read_all(task.trace_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.event_name.clone())
            .collect();
        assert_eq!(names, vec!["RestartServiceStarted", "RestartServiceFailed"]);

        // Namespace is back in the pool after the failure.
        assert_eq!(pool.acquire().await.unwrap().as_deref(), Some("ns-a"));
    }

    #[tokio::test]
    async fn injection_records_schedule_idempotently() {
        let (bus, repository, _) = wiring();
        let handler = FaultInjectionHandler {
            adapter: Arc::new(FakeInjection::new("network-delay", 60)),
            repository: repository.clone(),
            bus: bus.clone(),
        };

        let mut payload = StageOutput::new();
        payload.insert("fault_type".into(), "network-delay".into());
        let task = task_of(TaskType::FaultInjection, payload);

        handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();
        // Re-delivery of the same stage must not duplicate the record.
        handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();

        let schedule = repository.injection(task.trace_id).await.unwrap().unwrap();
        assert_eq!(schedule.fault_type, "network-delay");
        assert_eq!(schedule.end_time - schedule.start_time, 60);
    }

    #[tokio::test]
    async fn run_algorithm_requires_payload_fields() {
        let (bus, repository, clock) = wiring();
        let handler = RunAlgorithmHandler {
            runner: Arc::new(crate::impls::FakeRunner::new()),
            repository,
            bus,
            clock,
        };

        let task = task_of(TaskType::RunAlgorithm, StageOutput::new());
        let err = handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn run_algorithm_records_one_execution_per_algorithm() {
        let (bus, repository, clock) = wiring();
        let handler = RunAlgorithmHandler {
            runner: Arc::new(crate::impls::FakeRunner::new()),
            repository: repository.clone(),
            bus: bus.clone(),
            clock,
        };

        let mut payload = StageOutput::new();
        payload.insert("datapack".into(), "/packs/t1".into());
        payload.insert(
            "algorithms".into(),
            serde_json::json!(["e-diagnose", "micro-rca"]),
        );
        let task = task_of(TaskType::RunAlgorithm, payload);

        handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();

        let executions = repository.executions(task.trace_id).await.unwrap();
        assert_eq!(executions.len(), 2);
        let events = bus.read_all(task.trace_id).await.unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|r| r.event_name == "AlgoRunSucceed")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn collect_emits_the_verdict_event() {
        let (bus, repository, _) = wiring();
        let handler = CollectResultHandler {
            collector: Arc::new(FakeCollector::new(Collection::Results {
                granularities: vec![("service".into(), serde_json::json!({"rank": ["cart"]}))],
                detectors: vec![("spike".into(), true)],
            })),
            repository: repository.clone(),
            bus: bus.clone(),
        };

        let task = task_of(TaskType::CollectResult, StageOutput::new());
        handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();

        let records = bus.read_all(task.trace_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].event(),
            Some(TraceEvent::DatasetResultCollection { results: 1 })
        );
        assert_eq!(repository.granularities(task.trace_id).await.unwrap().len(), 1);
        assert_eq!(repository.detectors(task.trace_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn collect_no_anomaly_path() {
        let (bus, repository, _) = wiring();
        let handler = CollectResultHandler {
            collector: Arc::new(FakeCollector::new(Collection::NoAnomaly)),
            repository,
            bus: bus.clone(),
        };

        let task = task_of(TaskType::CollectResult, StageOutput::new());
        handler
            .handle(&task, &mut TaskContext::detached())
            .await
            .unwrap();

        let records = bus.read_all(task.trace_id).await.unwrap();
        assert_eq!(records[0].event(), Some(TraceEvent::DatasetNoAnomaly));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let (bus, _, _) = wiring();
        let mut registry = HandlerRegistry::new();
        let handler: Arc<dyn TaskHandler> = Arc::new(BuildDatasetHandler {
            builder: Arc::new(crate::impls::FakeDatasetBuilder::new()),
            bus,
        });

        registry
            .register(TaskType::BuildDataset, handler.clone())
            .unwrap();
        assert!(registry.register(TaskType::BuildDataset, handler).is_err());
        assert!(registry.get(TaskType::BuildDataset).is_some());
        assert!(registry.get(TaskType::BuildImage).is_none());
    }
}
