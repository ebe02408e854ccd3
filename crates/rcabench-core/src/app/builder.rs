//! Application wiring.
//!
//! Dependencies are injected explicitly; there are no process-wide
//! singletons. `build()` fails fast on missing wiring so a misconfigured
//! deployment dies at startup, not on the first task.

use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::domain::{CoreError, GroupId, TaskId, TaskType, TraceId, UnifiedTask};
use crate::events::bus::EventBus;
use crate::events::processor::{GroupStatistic, TraceStatistic};
use crate::events::sse;
use crate::pipeline::handlers::{
    BuildDatasetHandler, BuildImageHandler, CollectResultHandler, FaultInjectionHandler,
    HandlerRegistry, RestartServiceHandler, RunAlgorithmHandler,
};
use crate::pipeline::Orchestrator;
use crate::ports::adapters::{
    AlgorithmRunner, DatasetBuilder, ImageBuilder, InjectionAdapter, NamespacePool, RestartAdapter,
    ResultCollector,
};
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::kv_store::KvStore;
use crate::ports::repository::Repository;
use crate::queue::admission::{Admission, GroupReceipt, SubmitReceipt};
use crate::queue::scheduler::{Scheduler, WorkerGroup};
use crate::queue::{queue_counts, CancelRegistry, QueueCounts};
use crate::store::stream_id::StreamId;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing dependency: {0}. Wire it on the builder before build().")]
    Missing(&'static str),
}

#[derive(Default)]
pub struct AppBuilder {
    config: Option<ControllerConfig>,
    store: Option<Arc<dyn KvStore>>,
    repository: Option<Arc<dyn Repository>>,
    clock: Option<Arc<dyn Clock>>,
    namespaces: Option<Arc<dyn NamespacePool>>,
    restart: Option<Arc<dyn RestartAdapter>>,
    injection: Option<Arc<dyn InjectionAdapter>>,
    dataset: Option<Arc<dyn DatasetBuilder>>,
    runner: Option<Arc<dyn AlgorithmRunner>>,
    collector: Option<Arc<dyn ResultCollector>>,
    image: Option<Arc<dyn ImageBuilder>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn namespaces(mut self, namespaces: Arc<dyn NamespacePool>) -> Self {
        self.namespaces = Some(namespaces);
        self
    }

    pub fn restart_adapter(mut self, adapter: Arc<dyn RestartAdapter>) -> Self {
        self.restart = Some(adapter);
        self
    }

    pub fn injection_adapter(mut self, adapter: Arc<dyn InjectionAdapter>) -> Self {
        self.injection = Some(adapter);
        self
    }

    pub fn dataset_builder(mut self, builder: Arc<dyn DatasetBuilder>) -> Self {
        self.dataset = Some(builder);
        self
    }

    pub fn algorithm_runner(mut self, runner: Arc<dyn AlgorithmRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn result_collector(mut self, collector: Arc<dyn ResultCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.image = Some(builder);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let config = self.config.unwrap_or_default();
        let store = self.store.ok_or(BuildError::Missing("store"))?;
        let repository = self.repository.ok_or(BuildError::Missing("repository"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let namespaces = self.namespaces.ok_or(BuildError::Missing("namespaces"))?;
        let restart = self.restart.ok_or(BuildError::Missing("restart_adapter"))?;
        let injection = self
            .injection
            .ok_or(BuildError::Missing("injection_adapter"))?;
        let dataset = self.dataset.ok_or(BuildError::Missing("dataset_builder"))?;
        let runner = self.runner.ok_or(BuildError::Missing("algorithm_runner"))?;
        let collector = self
            .collector
            .ok_or(BuildError::Missing("result_collector"))?;
        let image = self.image.ok_or(BuildError::Missing("image_builder"))?;

        let bus = Arc::new(EventBus::new(store.clone(), config.stream_max_len));
        let cancels = Arc::new(CancelRegistry::new());
        let admission = Arc::new(Admission::new(
            store.clone(),
            repository.clone(),
            bus.clone(),
            clock.clone(),
            cancels.clone(),
        ));

        // One handler per task type; a duplicate here is a wiring bug, so
        // the expect is deliberate.
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                TaskType::RestartService,
                Arc::new(RestartServiceHandler {
                    pool: namespaces,
                    adapter: restart,
                    bus: bus.clone(),
                    clock: clock.clone(),
                    retry_delay: config.namespace_retry_delay(),
                }),
            )
            .expect("RestartService registered once");
        registry
            .register(
                TaskType::FaultInjection,
                Arc::new(FaultInjectionHandler {
                    adapter: injection,
                    repository: repository.clone(),
                    bus: bus.clone(),
                }),
            )
            .expect("FaultInjection registered once");
        registry
            .register(
                TaskType::BuildDataset,
                Arc::new(BuildDatasetHandler {
                    builder: dataset,
                    bus: bus.clone(),
                }),
            )
            .expect("BuildDataset registered once");
        registry
            .register(
                TaskType::RunAlgorithm,
                Arc::new(RunAlgorithmHandler {
                    runner,
                    repository: repository.clone(),
                    bus: bus.clone(),
                    clock: clock.clone(),
                }),
            )
            .expect("RunAlgorithm registered once");
        registry
            .register(
                TaskType::CollectResult,
                Arc::new(CollectResultHandler {
                    collector,
                    repository: repository.clone(),
                    bus: bus.clone(),
                }),
            )
            .expect("CollectResult registered once");
        registry
            .register(
                TaskType::BuildImage,
                Arc::new(BuildImageHandler { builder: image }),
            )
            .expect("BuildImage registered once");

        let orchestrator = Arc::new(Orchestrator::new(registry, admission.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            repository.clone(),
            bus.clone(),
            orchestrator,
            clock,
            cancels,
            config.clone(),
        ));

        Ok(App {
            config,
            store,
            repository,
            bus,
            admission,
            scheduler,
        })
    }
}

/// The wired controller.
pub struct App {
    config: ControllerConfig,
    store: Arc<dyn KvStore>,
    repository: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    admission: Arc<Admission>,
    scheduler: Arc<Scheduler>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    /// Spawn the promotion loop and workers.
    pub fn start(&self) -> WorkerGroup {
        tracing::info!(
            workers = self.config.workers,
            max_concurrency = self.config.max_concurrency,
            "controller starting"
        );
        self.scheduler.spawn()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub async fn submit(&self, task: UnifiedTask) -> Result<SubmitReceipt, CoreError> {
        self.admission.submit(task).await
    }

    pub async fn submit_group(&self, tasks: Vec<UnifiedTask>) -> Result<GroupReceipt, CoreError> {
        self.admission.submit_group(tasks).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, CoreError> {
        self.admission.cancel(task_id).await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, CoreError> {
        queue_counts(self.store.as_ref()).await
    }

    pub async fn trace_statistics(&self, trace_id: TraceId) -> Result<TraceStatistic, CoreError> {
        let records = self.bus.read_all(trace_id).await?;
        Ok(TraceStatistic::from_events(&records))
    }

    pub async fn group_statistics(&self, group_id: GroupId) -> Result<GroupStatistic, CoreError> {
        let traces = self.repository.group_traces(group_id).await?;
        let mut stats = Vec::with_capacity(traces.len());
        for trace_id in traces {
            stats.push(self.trace_statistics(trace_id).await?);
        }
        Ok(GroupStatistic::aggregate(stats.iter()))
    }

    /// Serve one SSE connection for a trace.
    pub async fn stream_trace<W>(
        &self,
        trace_id: TraceId,
        last_id: StreamId,
        sink: &mut W,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), CoreError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        sse::stream_trace(&self.bus, trace_id, last_id, sink, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskStatus, TaskType, TraceEvent};
    use crate::impls::{
        FakeCollector, FakeDatasetBuilder, FakeImageBuilder, FakeInjection, FakeRestart,
        FakeRunner, InMemoryRepository, StaticNamespacePool,
    };
    use crate::ports::adapters::Collection;
    use crate::store::InMemoryStore;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn fast_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.workers = 4;
        config.promote_interval_ms = 20;
        config.pop_timeout_ms = 20;
        config.namespace_retry_secs = 0;
        config.retry.base_secs = 0;
        config
    }

    fn app_with(namespaces: Vec<String>, collection: Collection) -> App {
        AppBuilder::new()
            .config(fast_config())
            .store(Arc::new(InMemoryStore::new()))
            .repository(Arc::new(InMemoryRepository::new()))
            .namespaces(Arc::new(StaticNamespacePool::new(namespaces)))
            .restart_adapter(Arc::new(FakeRestart::reliable()))
            .injection_adapter(Arc::new(FakeInjection::new("network-delay", 60)))
            .dataset_builder(Arc::new(FakeDatasetBuilder::new()))
            .algorithm_runner(Arc::new(FakeRunner::new()))
            .result_collector(Arc::new(FakeCollector::new(collection)))
            .image_builder(Arc::new(FakeImageBuilder::new()))
            .build()
            .unwrap()
    }

    fn rca_payload() -> Map<String, serde_json::Value> {
        let mut payload = Map::new();
        payload.insert("benchmark".into(), json!("ts-web"));
        payload.insert("fault_type".into(), json!("network-delay"));
        payload.insert("algorithms".into(), json!(["e-diagnose"]));
        payload
    }

    async fn wait_until_ended(app: &App, trace_id: TraceId) -> TraceStatistic {
        for _ in 0..400 {
            let stats = app.trace_statistics(trace_id).await.unwrap();
            if stats.ended {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("trace {trace_id} did not end in time");
    }

    #[test]
    fn build_fails_fast_on_missing_wiring() {
        let err = AppBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::Missing("repository")));
    }

    #[tokio::test]
    async fn full_rca_pipeline_runs_to_collection() {
        let app = app_with(
            vec!["ns-a".into()],
            Collection::Results {
                granularities: vec![("service".into(), json!({"rank": ["cart"]}))],
                detectors: vec![("spike".into(), true)],
            },
        );
        let group = app.start();

        let receipt = app
            .submit(UnifiedTask::new(TaskType::RestartService, rca_payload()))
            .await
            .unwrap();
        assert_eq!(receipt.task_id.as_uuid(), receipt.trace_id.as_uuid());

        let stats = wait_until_ended(&app, receipt.trace_id).await;
        group.shutdown_and_join().await;

        assert_eq!(stats.detect_anomaly, Some(true));
        assert!(!stats.intermediate_failed);

        // Every stage ran, in order, on the same trace.
        let records = app.bus().read_all(receipt.trace_id).await.unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.event_name.as_str()).collect();
        for expected in [
            "RestartServiceStarted",
            "RestartServiceCompleted",
            "FaultInjectionStarted",
            "FaultInjectionCompleted",
            "DatasetBuildSucceed",
            "AlgoRunSucceed",
            "DatasetResultCollection",
        ] {
            assert!(names.contains(&expected), "missing {expected} in {names:?}");
        }
        let positions: Vec<usize> = [
            "RestartServiceCompleted",
            "FaultInjectionCompleted",
            "DatasetBuildSucceed",
            "DatasetResultCollection",
        ]
        .iter()
        .map(|n| names.iter().position(|x| x == n).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        // Pipeline linking: five task ids, all head-linked to the trace.
        let mut task_ids: Vec<_> = records.iter().map(|r| r.task_id).collect();
        task_ids.sort();
        task_ids.dedup();
        assert_eq!(task_ids.len(), 5);
        assert!(task_ids.contains(&receipt.task_id));

        // Nothing left behind.
        let counts = app.queue_counts().await.unwrap();
        assert_eq!(counts.ready, 0);
        assert_eq!(counts.dead, 0);
        assert_eq!(counts.in_flight, 0);
    }

    #[tokio::test]
    async fn dataset_pipeline_skips_algorithms_without_request() {
        let app = app_with(vec!["ns-a".into()], Collection::NoAnomaly);
        let group = app.start();

        // Dataset-build shape: starts at BuildDataset, no algorithms.
        let mut payload = Map::new();
        payload.insert("benchmark".into(), json!("ts-web"));
        let receipt = app
            .submit(UnifiedTask::new(TaskType::BuildDataset, payload))
            .await
            .unwrap();

        let stats = wait_until_ended(&app, receipt.trace_id).await;
        group.shutdown_and_join().await;

        assert_eq!(stats.detect_anomaly, Some(false));
        let names: Vec<String> = app
            .bus()
            .read_all(receipt.trace_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.event_name.clone())
            .collect();
        assert!(names.contains(&"DatasetBuildSucceed".to_string()));
        assert!(names.contains(&"DatasetNoAnomaly".to_string()));
        assert!(!names.contains(&"AlgoRunSucceed".to_string()));
    }

    #[tokio::test]
    async fn namespace_contention_waits_and_recovers() {
        // Two pipelines, one namespace: one of them must wait.
        let app = app_with(
            vec!["ns-a".into()],
            Collection::Results {
                granularities: vec![("service".into(), json!({}))],
                detectors: vec![],
            },
        );
        let group = app.start();

        let receipt = app
            .submit_group(vec![
                UnifiedTask::new(TaskType::RestartService, rca_payload()),
                UnifiedTask::new(TaskType::RestartService, rca_payload()),
            ])
            .await
            .unwrap();

        let mut waits = 0;
        for pipeline in &receipt.pipelines {
            let stats = wait_until_ended(&app, pipeline.trace_id).await;
            assert_eq!(stats.detect_anomaly, Some(true));
            waits += stats.restart_wait_times;
        }
        group.shutdown_and_join().await;

        let group_stats = app.group_statistics(receipt.group_id).await.unwrap();
        assert_eq!(group_stats.traces, 2);
        assert_eq!(group_stats.ended, 2);
        assert_eq!(group_stats.anomalies_detected, 2);
        assert_eq!(group_stats.total_restart_waits, waits);
    }

    #[tokio::test]
    async fn standalone_image_build_completes() {
        let app = app_with(vec![], Collection::NoAnomaly);
        let group = app.start();

        let mut payload = Map::new();
        payload.insert("image_name".into(), json!("e-diagnose"));
        let receipt = app
            .submit(UnifiedTask::new(TaskType::BuildImage, payload))
            .await
            .unwrap();

        let stats = wait_until_ended(&app, receipt.trace_id).await;
        group.shutdown_and_join().await;

        assert!(stats.ended);
        let records = app.bus().read_all(receipt.trace_id).await.unwrap();
        let last = records.last().unwrap().event().unwrap();
        assert_eq!(
            last,
            TraceEvent::TaskStatusUpdate {
                status: TaskStatus::Completed,
                reason: None,
            }
        );
    }

    #[tokio::test]
    async fn sse_stream_of_finished_pipeline_replays_and_ends() {
        let app = app_with(
            vec!["ns-a".into()],
            Collection::Results {
                granularities: vec![("service".into(), json!({}))],
                detectors: vec![],
            },
        );
        let group = app.start();

        let receipt = app
            .submit(UnifiedTask::new(TaskType::RestartService, rca_payload()))
            .await
            .unwrap();
        wait_until_ended(&app, receipt.trace_id).await;
        group.shutdown_and_join().await;

        let (_tx, shutdown) = tokio::sync::watch::channel(false);
        let mut sink = Vec::new();
        app.stream_trace(receipt.trace_id, StreamId::ZERO, &mut sink, shutdown)
            .await
            .unwrap();

        let body = String::from_utf8(sink).unwrap();
        assert!(body.contains("DatasetResultCollection"));
        assert!(body.ends_with("event: end\ndata: null\n\n"));
    }
}
