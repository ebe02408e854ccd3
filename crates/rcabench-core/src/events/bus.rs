//! Event bus: append-only trace logs over the stream facade.
//!
//! Writers (scheduler, handlers) only append; readers (SSE driver,
//! analytics) only read. The stream outlives the tasks that fed it, so
//! historical replay keeps working after a pipeline finishes.

use std::str::FromStr;
use std::sync::Arc;

use crate::domain::{CoreError, EventOrigin, EventRecord, TaskId, TaskType, TraceEvent, TraceId, UnifiedTask};
use crate::ports::kv_store::{Block, KvStore, StreamEntry};
use crate::store::keys;
use crate::store::stream_id::StreamId;

pub struct EventBus {
    store: Arc<dyn KvStore>,
    /// Approximate cap per trace stream.
    max_len: usize,
}

impl EventBus {
    pub fn new(store: Arc<dyn KvStore>, max_len: usize) -> Self {
        Self { store, max_len }
    }

    /// Append one event to the trace's stream.
    pub async fn append(
        &self,
        trace_id: TraceId,
        task_id: TaskId,
        task_type: TaskType,
        event: &TraceEvent,
        origin: EventOrigin,
    ) -> Result<StreamId, CoreError> {
        let fields = vec![
            ("task_id".to_string(), task_id.to_string()),
            ("task_type".to_string(), task_type.as_str().to_string()),
            ("event_name".to_string(), event.name().to_string()),
            ("payload".to_string(), event.payload_value().to_string()),
            ("file".to_string(), origin.file),
            ("line".to_string(), origin.line.to_string()),
            ("fn".to_string(), origin.func),
        ];
        let id = self
            .store
            .stream_append(&keys::trace_log(trace_id), self.max_len, true, &fields)
            .await?;
        tracing::debug!(%trace_id, %task_id, event = event.name(), %id, "event appended");
        Ok(id)
    }

    /// Convenience: append on behalf of a task envelope.
    pub async fn append_for(
        &self,
        task: &UnifiedTask,
        event: &TraceEvent,
        origin: EventOrigin,
    ) -> Result<StreamId, CoreError> {
        self.append(task.trace_id, task.task_id, task.task_type, event, origin)
            .await
    }

    /// Read forward, strictly after `after`. Entries that fail to parse are
    /// skipped with a warning; one corrupt entry must not wedge a stream.
    pub async fn read(
        &self,
        trace_id: TraceId,
        after: StreamId,
        count: usize,
        block: Block,
    ) -> Result<Vec<EventRecord>, CoreError> {
        let entries = self
            .store
            .stream_read(&keys::trace_log(trace_id), after, count, block)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match parse_record(&entry) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(%trace_id, id = %entry.id, %err, "skipping unreadable event");
                    None
                }
            })
            .collect())
    }

    /// Full history of a trace, in order.
    pub async fn read_all(&self, trace_id: TraceId) -> Result<Vec<EventRecord>, CoreError> {
        let mut records = Vec::new();
        let mut after = StreamId::ZERO;
        loop {
            let batch = self.read(trace_id, after, 100, Block::None).await?;
            let Some(last) = batch.last() else {
                return Ok(records);
            };
            after = last.id;
            records.extend(batch);
        }
    }
}

fn parse_record(entry: &StreamEntry) -> Result<EventRecord, CoreError> {
    let field = |name: &str| {
        entry
            .field(name)
            .ok_or_else(|| CoreError::inconsistency(format!("event entry missing field {name:?}")))
    };

    Ok(EventRecord {
        id: entry.id,
        task_id: TaskId::from_str(field("task_id")?)
            .map_err(|e| CoreError::inconsistency(format!("bad task_id: {e}")))?,
        task_type: field("task_type")?.parse()?,
        event_name: field("event_name")?.to_string(),
        payload: field("payload")?.to_string(),
        origin: EventOrigin {
            file: field("file")?.to_string(),
            line: field("line")?.parse().unwrap_or(0),
            func: field("fn")?.to_string(),
        },
    })
}
