//! SSE endpoint driver: two-phase playback of a trace stream.
//!
//! The HTTP surface is out of scope; the driver renders frames onto any
//! `AsyncWrite` sink (the response body writer, a socket, a buffer in
//! tests). Back-pressure is the sink's own: each frame is written and
//! flushed before the next read, so a slow client simply slows the loop.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use super::bus::EventBus;
use super::processor::{SseMessage, TraceProcessor};
use crate::domain::{CoreError, TraceId};
use crate::ports::kv_store::Block;
use crate::store::stream_id::StreamId;

/// Historical replay batch size.
const REPLAY_BATCH: usize = 100;

/// Live tail batch size and block duration.
const TAIL_BATCH: usize = 10;
const TAIL_BLOCK: Duration = Duration::from_secs(1);

/// Stream a trace to `sink`, starting after `last_id` (`StreamId::ZERO`
/// replays everything).
///
/// Phase 1 replays history without blocking; phase 2 tails live events.
/// The driver returns when the trace completes (after writing the `end`
/// frame), when the client disconnects (write failure), or when `shutdown`
/// fires.
pub async fn stream_trace<W>(
    bus: &EventBus,
    trace_id: TraceId,
    last_id: StreamId,
    sink: &mut W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    let mut processor = TraceProcessor::new();
    let mut cursor = last_id;

    // Phase 1: historical replay. The full history is streamed even past a
    // terminal event, so a reconnecting client sees everything; the end
    // marker follows the last historical frame.
    loop {
        let batch = bus
            .read(trace_id, cursor, REPLAY_BATCH, Block::None)
            .await?;
        if batch.is_empty() {
            break;
        }
        for record in &batch {
            cursor = record.id;
            let message = processor.observe(record);
            if write_frame(sink, &message).await.is_err() {
                tracing::debug!(%trace_id, "client disconnected during replay");
                return Ok(());
            }
        }
    }
    if processor.is_completed() {
        let _ = write_frame(sink, &SseMessage::end()).await;
        return Ok(());
    }

    // Phase 2: live tail.
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let batch = tokio::select! {
            _ = shutdown.changed() => continue,
            batch = bus.read(trace_id, cursor, TAIL_BATCH, Block::For(TAIL_BLOCK)) => batch?,
        };

        // Empty reads are benign; chunked transfer keeps the connection
        // alive while we poll again.
        for record in &batch {
            cursor = record.id;
            let message = processor.observe(record);
            if write_frame(sink, &message).await.is_err() {
                tracing::debug!(%trace_id, "client disconnected during tail");
                return Ok(());
            }
        }
        if processor.is_completed() {
            let _ = write_frame(sink, &SseMessage::end()).await;
            return Ok(());
        }
    }
}

async fn write_frame<W>(sink: &mut W, message: &SseMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(message.to_frame().as_bytes()).await?;
    sink.flush().await
}
