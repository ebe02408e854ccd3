//! KvStore port: the typed facade over the key/value store.
//!
//! The facade exposes exactly the primitives the engine needs: FIFO lists,
//! score-ordered sets, hashes, counters, capped append-only streams, and a
//! small set of atomic scripts. A production binding maps each method onto
//! the corresponding Redis command (LPUSH/BRPOP, ZADD/ZRANGEBYSCORE, HSET,
//! INCR, XADD/XREAD, EVAL); `store::memory::InMemoryStore` implements the
//! same contract for development and tests.
//!
//! Failure semantics: transient I/O is `StoreError::Io`; absent keys are
//! `Ok(None)` / empty results, and the places where absence is a protocol
//! violation (unknown consumer group) return the typed `NotFound` sentinel
//! so callers can branch without string matching.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::store::stream_id::StreamId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(String),

    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Blocking mode for stream reads: none, bounded, or indefinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    None,
    For(Duration),
    Forever,
}

/// One stream entry: store-assigned id plus flat string fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Server-side scripts, as a closed sum instead of stringly EVAL source.
///
/// Each variant executes with all-or-nothing semantics across every key it
/// touches. The variants carry their keys explicitly, mirroring the
/// KEYS/ARGV split a Redis EVAL would use.
#[derive(Debug, Clone)]
pub enum Script {
    /// Move every delayed member with `score <= now` to the head of the
    /// ready list and repoint the index entries.
    PromoteDue {
        delayed_key: String,
        ready_key: String,
        index_key: String,
        now: i64,
    },

    /// Same, over the dead set, but only for members whose envelope still
    /// has retry budget (`attempts < max_attempts`). Exhausted members stay
    /// parked for operator inspection.
    PromoteRetries {
        dead_key: String,
        ready_key: String,
        index_key: String,
        now: i64,
        max_attempts: u32,
    },

    /// Remove a task from whichever queue currently holds it (scan-and-mark
    /// on the list, member scan on the zsets) and erase its index entry.
    CancelTask {
        ready_key: String,
        delayed_key: String,
        dead_key: String,
        index_key: String,
        task_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    /// Number of members promoted to ready.
    Promoted(u64),

    /// The queue the task was removed from, if it was found in one.
    Removed(Option<String>),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    // Lists (FIFO when a single consumer pops the tail).
    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn list_blocking_pop_tail(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    // Sorted sets. Ties on score keep insertion order.
    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;
    async fn zset_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError>;
    async fn zset_remove_by_score(&self, key: &str, min: i64, max: i64)
    -> Result<u64, StoreError>;
    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zset_len(&self, key: &str) -> Result<usize, StoreError>;

    // Hashes.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    // Integer counters (the concurrency semaphore).
    async fn counter_incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn counter_decr(&self, key: &str) -> Result<i64, StoreError>;
    async fn counter_get(&self, key: &str) -> Result<i64, StoreError>;

    // Streams (append-only log, ids of the form `ms-seq`).
    async fn stream_append(
        &self,
        key: &str,
        max_len: usize,
        approx: bool,
        fields: &[(String, String)],
    ) -> Result<StreamId, StoreError>;

    /// Read forward, strictly after `after`. `Block::None` returns what is
    /// there (possibly nothing); bounded blocking waits up to the duration
    /// for at least one entry; `Forever` waits indefinitely.
    async fn stream_read(
        &self,
        key: &str,
        after: StreamId,
        count: usize,
        block: Block,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Exclusive consumption with acknowledgement. Entries past the group
    /// cursor are delivered to exactly one consumer and stay pending until
    /// acked. Reading an unknown group is `StoreError::NotFound`.
    async fn stream_create_group(&self, key: &str, group: &str) -> Result<(), StoreError>;
    async fn stream_read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Block,
    ) -> Result<Vec<StreamEntry>, StoreError>;
    async fn stream_ack(&self, key: &str, group: &str, id: StreamId) -> Result<bool, StoreError>;

    // Atomic scripts.
    async fn eval(&self, script: Script) -> Result<ScriptReply, StoreError>;
}
