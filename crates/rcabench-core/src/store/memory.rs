//! In-memory KV store implementation.
//!
//! Implements the full facade contract for development and tests: one
//! `Mutex<State>` guards every structure, which is also what gives `eval`
//! its all-or-nothing semantics (a script variant runs entirely under one
//! lock acquisition). Blocking pops and stream tails wait on `Notify`
//! handles armed before the state check, so a push between check and wait
//! cannot be lost.
//!
//! A production deployment would bind the same trait to Redis in a sibling
//! crate; nothing outside this module knows which engine is underneath.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::stream_id::StreamId;
use crate::domain::UnifiedTask;
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::kv_store::{Block, KvStore, Script, ScriptReply, StoreError, StreamEntry};

#[derive(Debug, Clone)]
struct ZEntry {
    score: i64,
    /// Global insertion counter; breaks score ties in insertion order.
    seq: u64,
    member: String,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    last: StreamId,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: StreamId,
    /// Delivered but not yet acknowledged: id -> consumer.
    pending: HashMap<StreamId, String>,
}

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<ZEntry>>,
    hashes: HashMap<String, HashMap<String, String>>,
    counters: HashMap<String, i64>,
    streams: HashMap<String, StreamState>,
    insert_seq: u64,
}

impl State {
    fn zset_insert(&mut self, key: &str, score: i64, member: &str) {
        let seq = self.insert_seq;
        self.insert_seq += 1;

        let entries = self.zsets.entry(key.to_string()).or_default();
        entries.retain(|e| e.member != member);
        let entry = ZEntry {
            score,
            seq,
            member: member.to_string(),
        };
        let pos = entries
            .binary_search_by(|e| (e.score, e.seq).cmp(&(entry.score, entry.seq)))
            .unwrap_or_else(|p| p);
        entries.insert(pos, entry);
    }

    /// Members with `min <= score <= max`, in (score, insertion) order.
    fn zset_range(&self, key: &str, min: i64, max: i64) -> Vec<String> {
        self.zsets
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.score >= min && e.score <= max)
                    .map(|e| e.member.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push members to the ready head (earliest-due deepest, so a tail pop
    /// sees them first) and repoint their index entries.
    fn promote_members(
        &mut self,
        members: Vec<(String, String)>,
        ready_key: &str,
        index_key: &str,
    ) -> u64 {
        let mut promoted = 0;
        for (task_id, member) in members {
            self.lists
                .entry(ready_key.to_string())
                .or_default()
                .push_front(member);
            self.hashes
                .entry(index_key.to_string())
                .or_default()
                .insert(task_id, ready_key.to_string());
            promoted += 1;
        }
        promoted
    }
}

pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    /// Armed by list pushes (worker wakeups).
    queue_notify: Arc<Notify>,
    /// Armed by stream appends (reader wakeups).
    stream_notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            queue_notify: Arc::new(Notify::new()),
            stream_notify: Arc::new(Notify::new()),
            clock,
        }
    }

    async fn read_after(
        &self,
        key: &str,
        after: StreamId,
        count: usize,
    ) -> Vec<StreamEntry> {
        let state = self.state.lock().await;
        state
            .streams
            .get(key)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| e.id > after)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().await;
            state
                .lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.queue_notify.notify_waiters();
        Ok(())
    }

    async fn list_blocking_pop_tail(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm before the check so a concurrent push is never missed.
            let notified = self.queue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(queue) = state.lists.get_mut(key)
                    && let Some(value) = queue.pop_back()
                {
                    return Ok(Some(value));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.zset_insert(key, score, member);
        Ok(())
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.zset_range(key, min, max))
    }

    async fn zset_remove_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let Some(entries) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| e.score < min || e.score > max);
        Ok((before - entries.len()) as u64)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(entries) = state.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| e.member != member);
        Ok(entries.len() < before)
    }

    async fn zset_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).map(Vec::len).unwrap_or(0))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .hashes
            .get_mut(key)
            .and_then(|h| h.remove(field))
            .is_some())
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.contains_key(field))
            .unwrap_or(false))
    }

    async fn counter_incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counter_decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter -= 1;
        Ok(*counter)
    }

    async fn counter_get(&self, key: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.counters.get(key).copied().unwrap_or(0))
    }

    async fn stream_append(
        &self,
        key: &str,
        max_len: usize,
        _approx: bool,
        fields: &[(String, String)],
    ) -> Result<StreamId, StoreError> {
        let id = {
            let mut state = self.state.lock().await;
            let now_ms = self.clock.now_millis().max(0) as u64;
            let stream = state.streams.entry(key.to_string()).or_default();

            // Ids must be strictly increasing even if the clock stalls.
            let id = if now_ms > stream.last.ms {
                StreamId::new(now_ms, 0)
            } else {
                stream.last.successor()
            };
            stream.last = id;
            stream.entries.push_back(StreamEntry {
                id,
                fields: fields.to_vec(),
            });

            // Trimming here is exact; the contract allows approximate.
            while stream.entries.len() > max_len {
                stream.entries.pop_front();
            }
            id
        };
        self.stream_notify.notify_waiters();
        Ok(id)
    }

    async fn stream_read(
        &self,
        key: &str,
        after: StreamId,
        count: usize,
        block: Block,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = match block {
            Block::None => {
                return Ok(self.read_after(key, after, count).await);
            }
            Block::For(duration) => Some(Instant::now() + duration),
            Block::Forever => None,
        };

        loop {
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.read_after(key, after, count).await;
            if !entries.is_empty() {
                return Ok(entries);
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(Vec::new());
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn stream_create_group(&self, key: &str, group: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stream = state.streams.entry(key.to_string()).or_default();
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn stream_read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Block,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = match block {
            Block::None => None,
            Block::For(duration) => Some(Instant::now() + duration),
            Block::Forever => None,
        };

        loop {
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let stream =
                    state
                        .streams
                        .get_mut(key)
                        .ok_or_else(|| StoreError::NotFound {
                            key: format!("{key}/{group}"),
                        })?;
                let group_state =
                    stream
                        .groups
                        .get_mut(group)
                        .ok_or_else(|| StoreError::NotFound {
                            key: format!("{key}/{group}"),
                        })?;

                let delivered: Vec<StreamEntry> = stream
                    .entries
                    .iter()
                    .filter(|e| e.id > group_state.last_delivered)
                    .take(count)
                    .cloned()
                    .collect();
                if !delivered.is_empty() {
                    for entry in &delivered {
                        group_state.last_delivered = entry.id;
                        group_state.pending.insert(entry.id, consumer.to_string());
                    }
                    return Ok(delivered);
                }
            }

            match (block, deadline) {
                (Block::None, _) => return Ok(Vec::new()),
                (_, Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Ok(Vec::new());
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                    }
                }
                (_, None) => notified.await,
            }
        }
    }

    async fn stream_ack(&self, key: &str, group: &str, id: StreamId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn eval(&self, script: Script) -> Result<ScriptReply, StoreError> {
        let reply = {
            let mut state = self.state.lock().await;
            match script {
                Script::PromoteDue {
                    delayed_key,
                    ready_key,
                    index_key,
                    now,
                } => {
                    let due = state.zset_range(&delayed_key, i64::MIN, now);
                    if let Some(entries) = state.zsets.get_mut(&delayed_key) {
                        entries.retain(|e| e.score > now);
                    }
                    let mut promotable = Vec::with_capacity(due.len());
                    for member in due {
                        match UnifiedTask::decode(&member) {
                            Ok(task) => promotable.push((task.task_id.to_string(), member)),
                            Err(err) => {
                                tracing::warn!(%err, "dropping corrupt delayed member");
                            }
                        }
                    }
                    ScriptReply::Promoted(state.promote_members(
                        promotable,
                        &ready_key,
                        &index_key,
                    ))
                }

                Script::PromoteRetries {
                    dead_key,
                    ready_key,
                    index_key,
                    now,
                    max_attempts,
                } => {
                    let due = state.zset_range(&dead_key, i64::MIN, now);
                    let mut promotable = Vec::new();
                    for member in due {
                        match UnifiedTask::decode(&member) {
                            Ok(task) if task.attempts < max_attempts => {
                                if let Some(entries) = state.zsets.get_mut(&dead_key) {
                                    entries.retain(|e| e.member != member);
                                }
                                promotable.push((task.task_id.to_string(), member));
                            }
                            // Exhausted retry budget: dead-lettered, stays.
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(%err, "dropping corrupt dead member");
                                if let Some(entries) = state.zsets.get_mut(&dead_key) {
                                    entries.retain(|e| e.member != member);
                                }
                            }
                        }
                    }
                    ScriptReply::Promoted(state.promote_members(
                        promotable,
                        &ready_key,
                        &index_key,
                    ))
                }

                Script::CancelTask {
                    ready_key,
                    delayed_key,
                    dead_key,
                    index_key,
                    task_id,
                } => {
                    let location = state
                        .hashes
                        .get(&index_key)
                        .and_then(|h| h.get(&task_id))
                        .cloned();

                    let removed = match location.as_deref() {
                        Some(queue) if queue == ready_key => {
                            let queue_ref = state.lists.entry(queue.to_string()).or_default();
                            let before = queue_ref.len();
                            queue_ref.retain(|member| {
                                UnifiedTask::decode(member)
                                    .map(|t| t.task_id.to_string() != task_id)
                                    .unwrap_or(true)
                            });
                            queue_ref.len() < before
                        }
                        Some(queue) if queue == delayed_key || queue == dead_key => {
                            let entries = state.zsets.entry(queue.to_string()).or_default();
                            let before = entries.len();
                            entries.retain(|e| {
                                UnifiedTask::decode(&e.member)
                                    .map(|t| t.task_id.to_string() != task_id)
                                    .unwrap_or(true)
                            });
                            entries.len() < before
                        }
                        _ => false,
                    };

                    if let Some(h) = state.hashes.get_mut(&index_key) {
                        h.remove(&task_id);
                    }

                    ScriptReply::Removed(if removed { location } else { None })
                }
            }
        };
        // Promotion may have made tasks poppable.
        self.queue_notify.notify_waiters();
        Ok(reply)
    }
}
