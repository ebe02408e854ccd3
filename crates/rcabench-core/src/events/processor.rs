//! Per-trace stream processing: SSE projection, completion predicate,
//! derived statistics.
//!
//! The processor only reads the event bus. It keeps no reference to the
//! orchestrator or scheduler; its entire state is a cursor and a completed
//! flag.

use serde::Serialize;
use serde_json::Value;

use crate::domain::{EventRecord, TaskStatus, TraceEvent};
use crate::store::stream_id::StreamId;

/// An SSE-shaped message derived from one raw event (or the final marker).
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub id: Option<StreamId>,
    pub event: &'static str,
    pub data: Value,
}

impl SseMessage {
    pub fn update(record: &EventRecord) -> Self {
        let payload: Value = serde_json::from_str(&record.payload).unwrap_or(Value::Null);
        Self {
            id: Some(record.id),
            event: "update",
            data: serde_json::json!({
                "task_id": record.task_id.to_string(),
                "task_type": record.task_type.as_str(),
                "event_name": record.event_name,
                "payload": payload,
            }),
        }
    }

    pub fn end() -> Self {
        Self {
            id: None,
            event: "end",
            data: Value::Null,
        }
    }

    /// Render the wire frame:
    /// `id: <stream_id>\nevent: update\ndata: <json>\n\n`, or the final
    /// `event: end\ndata: null\n\n`.
    pub fn to_frame(&self) -> String {
        match self.id {
            Some(id) => format!("id: {id}\nevent: {}\ndata: {}\n\n", self.event, self.data),
            None => format!("event: {}\ndata: {}\n\n", self.event, self.data),
        }
    }
}

/// Decides when a trace is over.
///
/// Terminal events are the collection verdicts, the early `*Failed` events,
/// and `TaskStatusUpdate` with Error/Cancelled for any task type or
/// Completed for a tail task type (CollectResult, BuildImage).
fn is_terminal(record: &EventRecord) -> bool {
    match record.event() {
        Some(event) if event.is_terminal_domain_event() => true,
        Some(TraceEvent::TaskStatusUpdate { status, .. }) => match status {
            TaskStatus::Error | TaskStatus::Cancelled => true,
            TaskStatus::Completed => record.task_type.is_tail(),
            _ => false,
        },
        _ => false,
    }
}

/// Per-trace aggregator feeding an SSE connection.
#[derive(Debug, Default)]
pub struct TraceProcessor {
    completed: bool,
}

impl TraceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one raw event into an SSE message, updating the completed flag.
    pub fn observe(&mut self, record: &EventRecord) -> SseMessage {
        if is_terminal(record) {
            self.completed = true;
        }
        SseMessage::update(record)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// Statistics derived from one trace's events, in stream order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceStatistic {
    /// Last event timestamp minus first, milliseconds.
    pub total_duration_ms: u64,

    /// Longest observed restart (Started -> Completed), if any completed.
    pub restart_duration_ms: Option<u64>,

    /// Injection Started -> Completed, if the injection completed.
    pub inject_duration_ms: Option<u64>,

    /// How often the pipeline waited for a namespace.
    pub restart_wait_times: u32,

    /// `Some(true)` when results were collected, `Some(false)` on a clean
    /// no-anomaly verdict, `None` when the trace failed before collection.
    pub detect_anomaly: Option<bool>,

    /// Any `*Failed` or `NoConclusionFile` on the way.
    pub intermediate_failed: bool,

    /// Whether a terminal event was seen at all.
    pub ended: bool,
}

impl TraceStatistic {
    pub fn from_events(records: &[EventRecord]) -> Self {
        let mut stats = TraceStatistic::default();
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return stats;
        };
        stats.total_duration_ms = last.id.ms.saturating_sub(first.id.ms);

        let mut restart_started: Option<u64> = None;
        let mut inject_started: Option<u64> = None;

        for record in records {
            if is_terminal(record) {
                stats.ended = true;
            }
            match record.event() {
                Some(TraceEvent::NoNamespaceAvailable) => {
                    stats.restart_wait_times += 1;
                }
                Some(TraceEvent::RestartServiceStarted { .. }) => {
                    restart_started = Some(record.id.ms);
                }
                Some(TraceEvent::RestartServiceCompleted { .. }) => {
                    if let Some(started) = restart_started.take() {
                        let duration = record.id.ms.saturating_sub(started);
                        stats.restart_duration_ms =
                            Some(stats.restart_duration_ms.map_or(duration, |d| d.max(duration)));
                    }
                }
                Some(TraceEvent::FaultInjectionStarted { .. }) => {
                    inject_started = Some(record.id.ms);
                }
                Some(TraceEvent::FaultInjectionCompleted { .. }) => {
                    if let Some(started) = inject_started.take() {
                        stats.inject_duration_ms = Some(record.id.ms.saturating_sub(started));
                    }
                }
                Some(TraceEvent::DatasetResultCollection { .. }) => {
                    stats.detect_anomaly = Some(true);
                }
                Some(TraceEvent::DatasetNoAnomaly) => {
                    stats.detect_anomaly = Some(false);
                }
                Some(TraceEvent::RestartServiceFailed { .. })
                | Some(TraceEvent::FaultInjectionFailed { .. })
                | Some(TraceEvent::DatasetNoConclusionFile { .. }) => {
                    stats.intermediate_failed = true;
                }
                _ => {}
            }
        }
        stats
    }
}

/// Per-group aggregate over the statistics of its traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStatistic {
    pub traces: usize,
    pub ended: usize,
    pub anomalies_detected: usize,
    pub no_anomaly: usize,
    pub intermediate_failed: usize,
    pub total_restart_waits: u32,
}

impl GroupStatistic {
    pub fn aggregate<'a>(stats: impl IntoIterator<Item = &'a TraceStatistic>) -> Self {
        let mut group = GroupStatistic::default();
        for s in stats {
            group.traces += 1;
            if s.ended {
                group.ended += 1;
            }
            match s.detect_anomaly {
                Some(true) => group.anomalies_detected += 1,
                Some(false) => group.no_anomaly += 1,
                None => {}
            }
            if s.intermediate_failed {
                group.intermediate_failed += 1;
            }
            group.total_restart_waits += s.restart_wait_times;
        }
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventOrigin, TaskId, TaskType};

    fn record(ms: u64, task_type: TaskType, event: &TraceEvent) -> EventRecord {
        let task_id = TaskId::random();
        EventRecord {
            id: StreamId::new(ms, 0),
            task_id,
            task_type,
            event_name: event.name().to_string(),
            payload: event.payload_value().to_string(),
            origin: EventOrigin {
                file: "test".into(),
                line: 0,
                func: "test".into(),
            },
        }
    }

    fn status(ms: u64, task_type: TaskType, status: TaskStatus) -> EventRecord {
        record(
            ms,
            task_type,
            &TraceEvent::TaskStatusUpdate {
                status,
                reason: None,
            },
        )
    }

    #[test]
    fn completed_on_tail_type_ends_the_trace() {
        let mut processor = TraceProcessor::new();
        processor.observe(&status(1, TaskType::RestartService, TaskStatus::Completed));
        assert!(!processor.is_completed());

        processor.observe(&status(2, TaskType::CollectResult, TaskStatus::Completed));
        assert!(processor.is_completed());
    }

    #[test]
    fn error_on_any_type_ends_the_trace() {
        let mut processor = TraceProcessor::new();
        processor.observe(&status(1, TaskType::BuildDataset, TaskStatus::Error));
        assert!(processor.is_completed());
    }

    #[test]
    fn collection_verdicts_end_the_trace() {
        for event in [
            TraceEvent::DatasetNoAnomaly,
            TraceEvent::DatasetResultCollection { results: 2 },
            TraceEvent::DatasetNoConclusionFile { path: "/x".into() },
        ] {
            let mut processor = TraceProcessor::new();
            processor.observe(&record(1, TaskType::CollectResult, &event));
            assert!(processor.is_completed(), "{} should end", event.name());
        }
    }

    #[test]
    fn informational_events_do_not_end_the_trace() {
        let mut processor = TraceProcessor::new();
        processor.observe(&record(1, TaskType::RestartService, &TraceEvent::TaskStarted { attempt: 1 }));
        processor.observe(&record(
            2,
            TaskType::RestartService,
            &TraceEvent::NoNamespaceAvailable,
        ));
        assert!(!processor.is_completed());
    }

    #[test]
    fn update_frame_shape() {
        let rec = record(42, TaskType::RestartService, &TraceEvent::NoNamespaceAvailable);
        let frame = SseMessage::update(&rec).to_frame();
        assert!(frame.starts_with("id: 42-0\nevent: update\ndata: "));
        assert!(frame.ends_with("\n\n"));

        assert_eq!(SseMessage::end().to_frame(), "event: end\ndata: null\n\n");
    }

    #[test]
    fn statistics_over_a_full_run() {
        let records = vec![
            record(1_000, TaskType::RestartService, &TraceEvent::TaskStarted { attempt: 1 }),
            record(1_100, TaskType::RestartService, &TraceEvent::NoNamespaceAvailable),
            record(
                2_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceStarted {
                    namespace: "ns-a".into(),
                },
            ),
            record(
                5_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceCompleted {
                    namespace: "ns-a".into(),
                    duration_secs: 3.0,
                },
            ),
            record(
                6_000,
                TaskType::FaultInjection,
                &TraceEvent::FaultInjectionStarted {
                    fault_type: "cpu-stress".into(),
                },
            ),
            record(
                9_500,
                TaskType::FaultInjection,
                &TraceEvent::FaultInjectionCompleted {
                    start_time: 6,
                    end_time: 9,
                },
            ),
            record(
                12_000,
                TaskType::CollectResult,
                &TraceEvent::DatasetResultCollection { results: 3 },
            ),
        ];

        let stats = TraceStatistic::from_events(&records);
        assert_eq!(stats.total_duration_ms, 11_000);
        assert_eq!(stats.restart_duration_ms, Some(3_000));
        assert_eq!(stats.inject_duration_ms, Some(3_500));
        assert_eq!(stats.restart_wait_times, 1);
        assert_eq!(stats.detect_anomaly, Some(true));
        assert!(!stats.intermediate_failed);
        assert!(stats.ended);
    }

    #[test]
    fn statistics_on_failed_run() {
        let records = vec![
            record(1_000, TaskType::RestartService, &TraceEvent::TaskStarted { attempt: 1 }),
            record(
                3_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceFailed {
                    reason: "node gone".into(),
                },
            ),
        ];

        let stats = TraceStatistic::from_events(&records);
        assert!(stats.intermediate_failed);
        assert!(stats.ended);
        // Anomaly verdict is undefined when the run failed mid-way.
        assert_eq!(stats.detect_anomaly, None);
    }

    #[test]
    fn statistics_of_empty_trace() {
        let stats = TraceStatistic::from_events(&[]);
        assert_eq!(stats, TraceStatistic::default());
    }

    #[test]
    fn restart_duration_takes_the_maximum() {
        let records = vec![
            record(
                1_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceStarted { namespace: "a".into() },
            ),
            record(
                2_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceCompleted {
                    namespace: "a".into(),
                    duration_secs: 1.0,
                },
            ),
            record(
                3_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceStarted { namespace: "a".into() },
            ),
            record(
                8_000,
                TaskType::RestartService,
                &TraceEvent::RestartServiceCompleted {
                    namespace: "a".into(),
                    duration_secs: 5.0,
                },
            ),
        ];
        let stats = TraceStatistic::from_events(&records);
        assert_eq!(stats.restart_duration_ms, Some(5_000));
    }

    #[test]
    fn group_aggregation_counts_verdicts() {
        let mut collected = TraceStatistic::default();
        collected.ended = true;
        collected.detect_anomaly = Some(true);
        collected.restart_wait_times = 2;

        let mut clean = TraceStatistic::default();
        clean.ended = true;
        clean.detect_anomaly = Some(false);

        let mut failed = TraceStatistic::default();
        failed.ended = true;
        failed.intermediate_failed = true;

        let group = GroupStatistic::aggregate([&collected, &clean, &failed]);
        assert_eq!(group.traces, 3);
        assert_eq!(group.ended, 3);
        assert_eq!(group.anomalies_detected, 1);
        assert_eq!(group.no_anomaly, 1);
        assert_eq!(group.intermediate_failed, 1);
        assert_eq!(group.total_restart_waits, 2);
    }
}
