//! Ports: the trait seams between the engine and everything external.
//!
//! Components accept these as explicit dependencies (no ambient globals);
//! production bindings and in-memory/dev implementations are swappable
//! behind the same traits.

pub mod adapters;
pub mod clock;
pub mod kv_store;
pub mod repository;

pub use adapters::{
    AdapterError, AlgorithmRunner, Collection, DatasetBuilder, ImageBuilder, InjectionAdapter,
    InjectionReport, NamespacePool, RestartAdapter, ResultCollector,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use kv_store::{Block, KvStore, Script, ScriptReply, StoreError, StreamEntry};
pub use repository::Repository;
