//! Domain model (ids, task envelope, trace events, records, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod records;
pub mod task;

pub use errors::{CoreError, ErrorKind};
pub use events::{EventOrigin, EventRecord, TraceEvent};
pub use ids::{GroupId, TaskId, TraceId};
pub use records::{Detector, ExecutionResult, FaultInjectionSchedule, GranularityResult, TaskRow};
pub use task::{TaskStatus, TaskType, UnifiedTask};
