//! rcabench-core
//!
//! Controller plane of the RCA-Bench fault-injection benchmarking service:
//! a durable multi-stage task pipeline engine over a KV-store-backed queue,
//! with delayed execution, bounded concurrency, per-trace event streaming
//! and SSE playback.
//!
//! # Module layout
//! - **domain**: ids, the `UnifiedTask` envelope, trace events, relational
//!   records, error classification
//! - **ports**: trait seams (Clock, KvStore, Repository, domain adapters)
//! - **store**: key formats, stream ids, the in-memory KV engine
//! - **queue**: admission, retry policy, scheduler (promotion + workers +
//!   concurrency bound + cancellation)
//! - **pipeline**: stage handlers and the orchestrator chaining them
//! - **events**: event bus, stream processor, statistics, SSE driver
//! - **app**: builder wiring everything, the running App
//! - **impls**: in-memory/dev implementations of the ports
//! - **config**: typed configuration with TOML loading

pub mod app;
pub mod config;
pub mod domain;
pub mod events;
pub mod impls;
pub mod pipeline;
pub mod ports;
pub mod queue;
pub mod store;

pub use app::{App, AppBuilder};
pub use config::ControllerConfig;
pub use domain::{CoreError, TaskId, TaskStatus, TaskType, TraceEvent, TraceId, UnifiedTask};
pub use queue::{Admission, Scheduler, SubmitReceipt, WorkerGroup};
pub use store::StreamId;
