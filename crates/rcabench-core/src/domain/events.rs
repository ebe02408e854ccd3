//! Trace events: the closed set of names appended to `trace:{id}:log`.
//!
//! Events are a tagged sum with a typed payload per variant; the wire form
//! stays JSON (`event_name` string + `payload` JSON string in the stream
//! entry) for compatibility with existing readers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::TaskId;
use super::task::{TaskStatus, TaskType};
use crate::store::stream_id::StreamId;

/// A domain event within a trace.
///
/// The adjacently-tagged serde form (`event_name` / `payload`) is exactly
/// the split stored on the stream, so conversion in either direction is one
/// serde pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_name", content = "payload")]
pub enum TraceEvent {
    // Lifecycle
    TaskStarted {
        attempt: u32,
    },
    TaskStatusUpdate {
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // Restart
    NoNamespaceAvailable,
    RestartServiceStarted {
        namespace: String,
    },
    RestartServiceCompleted {
        namespace: String,
        duration_secs: f64,
    },
    RestartServiceFailed {
        reason: String,
    },

    // Injection
    FaultInjectionStarted {
        fault_type: String,
    },
    FaultInjectionCompleted {
        start_time: i64,
        end_time: i64,
    },
    FaultInjectionFailed {
        reason: String,
    },

    // Dataset
    DatasetBuildSucceed {
        datapack: String,
    },

    // Algorithm
    AlgoRunSucceed {
        algorithm: String,
    },

    // Collection
    DatasetNoAnomaly,
    DatasetResultCollection {
        results: u64,
    },
    DatasetNoConclusionFile {
        path: String,
    },
}

impl TraceEvent {
    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::TaskStarted { .. } => "TaskStarted",
            TraceEvent::TaskStatusUpdate { .. } => "TaskStatusUpdate",
            TraceEvent::NoNamespaceAvailable => "NoNamespaceAvailable",
            TraceEvent::RestartServiceStarted { .. } => "RestartServiceStarted",
            TraceEvent::RestartServiceCompleted { .. } => "RestartServiceCompleted",
            TraceEvent::RestartServiceFailed { .. } => "RestartServiceFailed",
            TraceEvent::FaultInjectionStarted { .. } => "FaultInjectionStarted",
            TraceEvent::FaultInjectionCompleted { .. } => "FaultInjectionCompleted",
            TraceEvent::FaultInjectionFailed { .. } => "FaultInjectionFailed",
            TraceEvent::DatasetBuildSucceed { .. } => "DatasetBuildSucceed",
            TraceEvent::AlgoRunSucceed { .. } => "AlgoRunSucceed",
            TraceEvent::DatasetNoAnomaly => "DatasetNoAnomaly",
            TraceEvent::DatasetResultCollection { .. } => "DatasetResultCollection",
            TraceEvent::DatasetNoConclusionFile { .. } => "DatasetNoConclusionFile",
        }
    }

    /// Payload as a JSON value (without the name tag). Unit variants
    /// produce `null`.
    pub fn payload_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Parse an event back from its wire split.
    ///
    /// Two payload shapes exist in the wild for `TaskStatusUpdate`: a JSON
    /// object with a `status` field, and a bare status string. Both are
    /// accepted and treated as equivalent.
    pub fn parse(name: &str, payload: &str) -> Option<TraceEvent> {
        let mut payload_value: Value = serde_json::from_str(payload).unwrap_or(Value::Null);

        if name == "TaskStatusUpdate" && payload_value.is_string() {
            let status = payload_value.as_str().unwrap_or_default().to_string();
            payload_value = serde_json::json!({ "status": status });
        }

        let mut wrapper = serde_json::Map::new();
        wrapper.insert("event_name".into(), Value::String(name.to_string()));
        if !payload_value.is_null() {
            wrapper.insert("payload".into(), payload_value);
        }
        serde_json::from_value(Value::Object(wrapper)).ok()
    }

    /// True when this event, on its own, ends the trace regardless of the
    /// task type that emitted it.
    pub fn is_terminal_domain_event(&self) -> bool {
        matches!(
            self,
            TraceEvent::DatasetNoAnomaly
                | TraceEvent::DatasetResultCollection { .. }
                | TraceEvent::DatasetNoConclusionFile { .. }
                | TraceEvent::RestartServiceFailed { .. }
                | TraceEvent::FaultInjectionFailed { .. }
        )
    }
}

/// Origin metadata carried on every event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOrigin {
    pub file: String,
    pub line: u32,
    #[serde(rename = "fn")]
    pub func: String,
}

/// Capture the current source location as an [`EventOrigin`].
#[macro_export]
macro_rules! origin {
    ($func:expr) => {
        $crate::domain::events::EventOrigin {
            file: file!().to_string(),
            line: line!(),
            func: $func.to_string(),
        }
    };
}

/// One entry read back from a trace stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: StreamId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub event_name: String,
    /// Raw payload JSON string as stored.
    pub payload: String,
    pub origin: EventOrigin,
}

impl EventRecord {
    /// Typed view of the event; `None` for names outside the closed set.
    pub fn event(&self) -> Option<TraceEvent> {
        TraceEvent::parse(&self.event_name, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn names_match_wire_values() {
        let e = TraceEvent::RestartServiceCompleted {
            namespace: "ns-a".into(),
            duration_secs: 12.5,
        };
        assert_eq!(e.name(), "RestartServiceCompleted");
        assert_eq!(TraceEvent::DatasetNoAnomaly.name(), "DatasetNoAnomaly");
    }

    #[test]
    fn payload_splits_from_name() {
        let e = TraceEvent::FaultInjectionCompleted {
            start_time: 100,
            end_time: 160,
        };
        let payload = e.payload_value();
        assert_eq!(payload["start_time"], 100);
        assert_eq!(payload["end_time"], 160);

        let back = TraceEvent::parse(e.name(), &payload.to_string()).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn unit_variants_roundtrip_with_null_payload() {
        let e = TraceEvent::NoNamespaceAvailable;
        assert_eq!(e.payload_value(), Value::Null);
        let back = TraceEvent::parse("NoNamespaceAvailable", "null").unwrap();
        assert_eq!(back, e);
    }

    #[rstest]
    #[case::object(r#"{"status":"Error","reason":"boom"}"#)]
    #[case::bare_string(r#""Error""#)]
    fn status_update_accepts_both_payload_shapes(#[case] payload: &str) {
        let parsed = TraceEvent::parse("TaskStatusUpdate", payload).unwrap();
        match parsed {
            TraceEvent::TaskStatusUpdate { status, .. } => {
                assert_eq!(status, TaskStatus::Error);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_names_parse_to_none() {
        assert!(TraceEvent::parse("SomethingElse", "null").is_none());
    }

    #[test]
    fn terminal_domain_events() {
        assert!(TraceEvent::DatasetNoAnomaly.is_terminal_domain_event());
        assert!(
            TraceEvent::RestartServiceFailed {
                reason: "x".into()
            }
            .is_terminal_domain_event()
        );
        assert!(
            !TraceEvent::TaskStarted { attempt: 1 }.is_terminal_domain_event()
        );
    }
}
