//! Implementations of the ports for development and tests.
//!
//! Production bindings (Redis store, SQL repository, Kubernetes/Chaos-Mesh
//! adapters) live in sibling crates; everything here runs in-process.

pub mod fakes;
pub mod namespaces;
pub mod repository;

pub use fakes::{
    FakeCollector, FakeDatasetBuilder, FakeImageBuilder, FakeInjection, FakeRestart, FakeRunner,
};
pub use namespaces::StaticNamespacePool;
pub use repository::InMemoryRepository;
