//! Event layer: bus (append/read), stream processor, SSE driver.

pub mod bus;
pub mod processor;
pub mod sse;

pub use bus::EventBus;
pub use processor::{GroupStatistic, SseMessage, TraceProcessor, TraceStatistic};
pub use sse::stream_trace;
