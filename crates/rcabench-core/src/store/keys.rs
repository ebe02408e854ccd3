//! Key formats in the KV store.

use crate::domain::TraceId;

/// FIFO list of encoded tasks awaiting pop.
pub const READY: &str = "task:ready";

/// Sorted set of encoded tasks; score = `execute_time` (unix seconds).
pub const DELAYED: &str = "task:delayed";

/// Sorted set of failed tasks; score = retry-after / final-failure time.
pub const DEAD: &str = "task:dead";

/// Hash `task_id -> current queue name`. Diagnostics and cancellation.
pub const INDEX: &str = "task:index";

/// Integer counter of in-flight tasks.
pub const CONCURRENCY_LOCK: &str = "task:concurrency_lock";

/// Per-trace event stream.
pub fn trace_log(trace_id: TraceId) -> String {
    format!("trace:{trace_id}:log")
}
