//! Domain identifiers (strongly-typed IDs).
//!
//! Every identifier on the wire is a UUIDv4. Internally we wrap `Uuid` in a
//! phantom-typed `Id<T>` so a `TaskId` can never be passed where a `TraceId`
//! is expected, without duplicating the implementation per id kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// Marker trait for id kinds.
pub trait IdMarker: Send + Sync + 'static {}

/// Generic id type.
///
/// `T` is `PhantomData`: zero bytes at runtime, a distinct type at compile
/// time. Serializes transparently as the inner UUID string.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    uuid: Uuid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh random (v4) id.
    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.uuid
    }

    /// The all-zero id. Used as the "unset" sentinel in envelopes before
    /// admission assigns a real id.
    pub fn nil() -> Self {
        Self::from_uuid(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.uuid.is_nil()
    }
}

impl<T: IdMarker> From<Uuid> for Id<T> {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_uuid(Uuid::parse_str(s)?))
    }
}

/// Marker for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}
impl IdMarker for Task {}

/// Marker for traces (pipelines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Trace {}
impl IdMarker for Trace {}

/// Marker for submission groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}
impl IdMarker for Group {}

/// Identifier of a Task (the unit the scheduler moves).
pub type TaskId = Id<Task>;

/// Identifier of a Trace (the pipeline a task belongs to).
///
/// The head task of a pipeline has `trace_id == task_id`; a trace id is
/// therefore always some task's id, re-typed.
pub type TraceId = Id<Trace>;

/// Identifier of a Group (a batch of pipelines from one submission).
pub type GroupId = Id<Group>;

impl TaskId {
    /// Re-type a task id as the trace id it heads.
    pub fn as_trace(&self) -> TraceId {
        TraceId::from_uuid(self.uuid)
    }
}
