//! Scripted fake adapters for tests and the demo binary.
//!
//! Each fake does the minimum that lets a pipeline run end to end without a
//! cluster: deterministic outputs, optional scripted failures.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::domain::TraceId;
use crate::ports::adapters::{
    AdapterError, AlgorithmRunner, Collection, DatasetBuilder, ImageBuilder, InjectionAdapter,
    InjectionReport, RestartAdapter, ResultCollector,
};

/// Restart that fails transiently a scripted number of times, then works.
pub struct FakeRestart {
    remaining_failures: AtomicU32,
}

impl FakeRestart {
    pub fn reliable() -> Self {
        Self::failing_times(0)
    }

    pub fn failing_times(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl RestartAdapter for FakeRestart {
    async fn restart(
        &self,
        _namespace: &str,
        _payload: &Map<String, Value>,
    ) -> Result<(), AdapterError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(AdapterError::Transient(format!(
                "restart failed (left={left})"
            )));
        }
        Ok(())
    }
}

/// Injection with a fixed fault type and duration.
pub struct FakeInjection {
    fault_type: String,
    duration_secs: i64,
}

impl FakeInjection {
    pub fn new(fault_type: impl Into<String>, duration_secs: i64) -> Self {
        Self {
            fault_type: fault_type.into(),
            duration_secs,
        }
    }
}

#[async_trait]
impl InjectionAdapter for FakeInjection {
    async fn inject(
        &self,
        _trace_id: TraceId,
        payload: &Map<String, Value>,
    ) -> Result<InjectionReport, AdapterError> {
        let fault_type = payload
            .get("fault_type")
            .and_then(Value::as_str)
            .unwrap_or(&self.fault_type)
            .to_string();
        let start_time = Utc::now().timestamp();
        Ok(InjectionReport {
            fault_type,
            start_time,
            end_time: start_time + self.duration_secs,
        })
    }
}

/// Builds deterministic datapack paths.
#[derive(Default)]
pub struct FakeDatasetBuilder;

impl FakeDatasetBuilder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatasetBuilder for FakeDatasetBuilder {
    async fn build(
        &self,
        trace_id: TraceId,
        _payload: &Map<String, Value>,
    ) -> Result<String, AdapterError> {
        Ok(format!("/datapacks/{trace_id}"))
    }
}

/// Algorithm runner that always succeeds.
#[derive(Default)]
pub struct FakeRunner;

impl FakeRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlgorithmRunner for FakeRunner {
    async fn run(
        &self,
        _algorithm: &str,
        _datapack: &str,
        _payload: &Map<String, Value>,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Collector that returns a preconfigured verdict.
pub struct FakeCollector {
    collection: Collection,
}

impl FakeCollector {
    pub fn new(collection: Collection) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl ResultCollector for FakeCollector {
    async fn collect(
        &self,
        _trace_id: TraceId,
        _payload: &Map<String, Value>,
    ) -> Result<Collection, AdapterError> {
        Ok(self.collection.clone())
    }
}

/// Image builder with a deterministic tag.
#[derive(Default)]
pub struct FakeImageBuilder;

impl FakeImageBuilder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build_image(&self, payload: &Map<String, Value>) -> Result<String, AdapterError> {
        let name = payload
            .get("image_name")
            .and_then(Value::as_str)
            .unwrap_or("rcabench-algo");
        Ok(format!("registry.local/{name}:latest"))
    }
}
