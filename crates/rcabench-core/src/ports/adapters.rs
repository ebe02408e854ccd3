//! Domain adapter ports.
//!
//! These traits are the boundary to the systems that physically restart
//! services, inject faults, build data packs, run algorithms and collect
//! conclusions (Kubernetes, Chaos Mesh, the builder fleet). Their internal
//! logic is out of scope here; the controller only depends on these seams.
//!
//! Adapters signal retryability explicitly: `Transient` failures go back
//! through the scheduler's backoff, `Permanent` ones terminate the stage.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{CoreError, TraceId};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient adapter failure: {0}")]
    Transient(String),

    #[error("permanent adapter failure: {0}")]
    Permanent(String),
}

impl From<AdapterError> for CoreError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(msg) => CoreError::Transient(msg),
            AdapterError::Permanent(msg) => CoreError::Permanent(msg),
        }
    }
}

/// Reservation of isolated namespaces for the service-under-test.
///
/// This is an external semaphore, separate from the scheduler's concurrency
/// counter: a task that cannot reserve simply waits in the delayed queue.
#[async_trait]
pub trait NamespacePool: Send + Sync {
    /// Reserve a namespace; `None` when all are taken.
    async fn acquire(&self) -> Result<Option<String>, AdapterError>;
    async fn release(&self, namespace: &str) -> Result<(), AdapterError>;
}

/// Physically restarts the service-under-test inside a namespace.
#[async_trait]
pub trait RestartAdapter: Send + Sync {
    async fn restart(
        &self,
        namespace: &str,
        payload: &Map<String, Value>,
    ) -> Result<(), AdapterError>;
}

/// Outcome of one injection: what was injected and when.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionReport {
    pub fault_type: String,
    pub start_time: i64,
    pub end_time: i64,
}

#[async_trait]
pub trait InjectionAdapter: Send + Sync {
    async fn inject(
        &self,
        trace_id: TraceId,
        payload: &Map<String, Value>,
    ) -> Result<InjectionReport, AdapterError>;
}

/// Builds a labelled data pack from the telemetry of a trace.
#[async_trait]
pub trait DatasetBuilder: Send + Sync {
    /// Returns the datapack path.
    async fn build(
        &self,
        trace_id: TraceId,
        payload: &Map<String, Value>,
    ) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait AlgorithmRunner: Send + Sync {
    async fn run(
        &self,
        algorithm: &str,
        datapack: &str,
        payload: &Map<String, Value>,
    ) -> Result<(), AdapterError>;
}

/// What result collection found for a finished trace.
#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    /// The detectors saw nothing; the injection left no anomaly.
    NoAnomaly,

    /// The analysis produced no conclusion file at the expected path.
    NoConclusionFile { path: String },

    /// Localization results, per granularity level and per detector.
    Results {
        granularities: Vec<(String, Value)>,
        detectors: Vec<(String, bool)>,
    },
}

#[async_trait]
pub trait ResultCollector: Send + Sync {
    async fn collect(
        &self,
        trace_id: TraceId,
        payload: &Map<String, Value>,
    ) -> Result<Collection, AdapterError>;
}

/// Builds a container image for an algorithm or benchmark.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Returns the pushed image reference.
    async fn build_image(&self, payload: &Map<String, Value>) -> Result<String, AdapterError>;
}
