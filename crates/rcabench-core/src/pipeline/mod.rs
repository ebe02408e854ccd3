//! Pipeline layer: stage handlers and the orchestrator that chains them.

pub mod handlers;
pub mod orchestrator;

pub use handlers::{HandlerRegistry, HandlerVerdict, StageOutput, TaskHandler};
pub use orchestrator::Orchestrator;
