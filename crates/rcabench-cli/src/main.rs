//! Demo binary: wire the in-memory stack, run one RCA pipeline end to end
//! and tail its SSE stream to stdout.
//!
//! `RCABENCH_LOG` controls log verbosity (default `info`); logs go to
//! stderr so stdout carries only the SSE frames. `RCABENCH_CONFIG` may
//! point at a TOML file overriding the defaults.

use std::sync::Arc;

use serde_json::{json, Map};
use tokio::sync::watch;

use rcabench_core::config::ControllerConfig;
use rcabench_core::impls::{
    FakeCollector, FakeDatasetBuilder, FakeImageBuilder, FakeInjection, FakeRestart, FakeRunner,
    InMemoryRepository, StaticNamespacePool,
};
use rcabench_core::ports::adapters::Collection;
use rcabench_core::store::InMemoryStore;
use rcabench_core::{AppBuilder, StreamId, TaskType, UnifiedTask};

fn init_logging() {
    // Logs to stderr; stdout is the SSE stream.
    let filter = tracing_subscriber::EnvFilter::try_from_env("RCABENCH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> ControllerConfig {
    match std::env::var("RCABENCH_CONFIG") {
        Ok(path) => match ControllerConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load {path}: {err}");
                std::process::exit(2);
            }
        },
        Err(_) => ControllerConfig::default(),
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    // (A) Wire the controller against the in-memory store and fakes.
    let app = AppBuilder::new()
        .config(load_config())
        .store(Arc::new(InMemoryStore::new()))
        .repository(Arc::new(InMemoryRepository::new()))
        .namespaces(Arc::new(StaticNamespacePool::new(vec![
            "ns-a".into(),
            "ns-b".into(),
        ])))
        .restart_adapter(Arc::new(FakeRestart::reliable()))
        .injection_adapter(Arc::new(FakeInjection::new("network-delay", 60)))
        .dataset_builder(Arc::new(FakeDatasetBuilder::new()))
        .algorithm_runner(Arc::new(FakeRunner::new()))
        .result_collector(Arc::new(FakeCollector::new(Collection::Results {
            granularities: vec![("service".into(), json!({"rank": ["cartservice"]}))],
            detectors: vec![("latency-spike".into(), true)],
        })))
        .image_builder(Arc::new(FakeImageBuilder::new()))
        .build()
        .expect("wiring is complete");

    // (B) Start the promotion loop and workers.
    let workers = app.start();

    // (C) Submit one RCA pipeline.
    let mut payload = Map::new();
    payload.insert("benchmark".into(), json!("ts-web"));
    payload.insert("fault_type".into(), json!("network-delay"));
    payload.insert("algorithms".into(), json!(["e-diagnose"]));
    let receipt = app
        .submit(UnifiedTask::new(TaskType::RestartService, payload))
        .await
        .expect("submission succeeds");
    tracing::info!(task_id = %receipt.task_id, trace_id = %receipt.trace_id, "pipeline submitted");

    // (D) Tail the trace to stdout until the end marker.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut stdout = tokio::io::stdout();
    app.stream_trace(receipt.trace_id, StreamId::ZERO, &mut stdout, shutdown_rx)
        .await
        .expect("stream completes");

    // (E) Print what the run produced, then stop the workers.
    let stats = app
        .trace_statistics(receipt.trace_id)
        .await
        .expect("statistics available");
    let counts = app.queue_counts().await.expect("counts available");
    tracing::info!(?stats, ?counts, "pipeline finished");

    workers.shutdown_and_join().await;
}
