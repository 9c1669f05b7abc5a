//! Chunk queue and buffer appender.
//!
//! Chunks land in a bounded FIFO and drain into the audio sink one at a
//! time. Draining never batches, so a single append's duration stays
//! bounded; the drain cadence adapts to queue depth instead (shorter delay
//! when backlogged, longer when shallow). A sink that reports itself busy
//! gets the chunk back at the front of the queue, preserving play order
//! across retries.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, warn};

use crate::config::QueueConfig;
use crate::error::SinkWriteError;
use crate::protocol::ChunkFrame;
use crate::sink::IncrementalAudioSink;

// ─── Chunk queue ─────────────────────────────────────────────────────────────

/// Bounded FIFO of undelivered chunks.
///
/// At capacity the oldest entry is dropped to make room; late audio is worth
/// less than fresh audio, and an unbounded queue would only convert a slow
/// sink into unbounded memory growth.
#[derive(Debug)]
pub struct ChunkQueue {
    entries: VecDeque<ChunkFrame>,
    cap: usize,
}

impl ChunkQueue {
    /// Creates a queue holding at most `cap` chunks.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Appends a chunk, dropping the oldest entry if the queue is full.
    pub fn push_back(&mut self, chunk: ChunkFrame) {
        if self.entries.len() >= self.cap {
            self.entries.pop_front();
            warn!("[ChunkQueue] at capacity ({}), dropped oldest chunk", self.cap);
        }
        self.entries.push_back(chunk);
    }

    /// Returns a chunk to the front of the queue after a failed append.
    ///
    /// To keep the retried chunk (the oldest audio we still hold), the
    /// newest entry is dropped instead when the queue is full.
    pub fn push_front(&mut self, chunk: ChunkFrame) {
        if self.entries.len() >= self.cap {
            self.entries.pop_back();
            warn!("[ChunkQueue] at capacity ({}), dropped newest chunk to retry", self.cap);
        }
        self.entries.push_front(chunk);
    }

    /// Removes and returns the oldest chunk.
    pub fn pop_front(&mut self) -> Option<ChunkFrame> {
        self.entries.pop_front()
    }

    /// Discards all queued chunks.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Buffer appender ─────────────────────────────────────────────────────────

/// Result of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// One chunk was appended; reschedule if the queue is non-empty.
    Appended,
    /// The sink was busy; the chunk is back at the front, retry after the delay.
    Retry(Duration),
    /// The final chunk was processed and the sink finalized.
    Finalized,
    /// Nothing queued.
    Empty,
}

/// Owns the sink and feeds it from the queue, one chunk per step.
///
/// The session task is the sole caller, so appends are serialized by
/// construction; the busy-retry path only exists for sinks whose own write
/// pipeline is momentarily occupied.
pub struct BufferAppender {
    sink: Box<dyn IncrementalAudioSink>,
    queue: ChunkQueue,
    config: QueueConfig,
    final_seen: bool,
    finalize_attempts: u8,
}

impl BufferAppender {
    /// Creates an appender around a freshly-created sink.
    #[must_use]
    pub fn new(sink: Box<dyn IncrementalAudioSink>, config: QueueConfig) -> Self {
        let queue = ChunkQueue::new(config.cap);
        Self {
            sink,
            queue,
            config,
            final_seen: false,
            finalize_attempts: 0,
        }
    }

    /// Queues a chunk for delivery. Returns the delay before the next drain
    /// step, or `None` if the chunk was discarded (arrival after the final
    /// chunk).
    pub fn enqueue(&mut self, chunk: ChunkFrame) -> Option<Duration> {
        if self.final_seen {
            debug!("[Appender] discarding chunk received after final");
            return None;
        }
        if chunk.data.is_empty() && !chunk.is_final {
            // Zero-length non-final chunks carry nothing worth scheduling for.
            return None;
        }
        self.queue.push_back(chunk);
        Some(self.config.drain_delay(self.queue.len()))
    }

    /// Pops and delivers at most one chunk.
    ///
    /// # Errors
    ///
    /// Propagates non-transient sink errors; the stream is unrecoverable
    /// once one occurs.
    pub async fn drain_one(&mut self) -> Result<DrainOutcome, SinkWriteError> {
        let Some(chunk) = self.queue.pop_front() else {
            return Ok(DrainOutcome::Empty);
        };

        if !chunk.data.is_empty() {
            match self.sink.append(&chunk.data).await {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    debug!("[Appender] sink busy, requeueing chunk at front");
                    self.queue.push_front(chunk);
                    return Ok(DrainOutcome::Retry(self.config.busy_retry_delay()));
                }
                Err(err) => return Err(err),
            }
        }

        if chunk.is_final {
            self.final_seen = true;
            return self.finalize().await;
        }

        Ok(DrainOutcome::Appended)
    }

    /// Closes out the sink once the final chunk has been appended.
    ///
    /// Finalization is best-effort: a busy sink gets one retry, and a sink
    /// that still will not close is logged and treated as finalized, since
    /// the audio itself has already been delivered.
    async fn finalize(&mut self) -> Result<DrainOutcome, SinkWriteError> {
        self.finalize_attempts += 1;
        match self.sink.finalize().await {
            Ok(()) => Ok(DrainOutcome::Finalized),
            Err(err) if err.is_transient() && self.finalize_attempts < 2 => {
                debug!("[Appender] sink busy during finalize, retrying once");
                self.queue.push_front(ChunkFrame::completion_signal());
                Ok(DrainOutcome::Retry(self.config.busy_retry_delay()))
            }
            Err(err) => {
                warn!("[Appender] finalize failed, treating stream as complete: {err}");
                Ok(DrainOutcome::Finalized)
            }
        }
    }

    /// Delay before the next drain step, based on current queue depth.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.config.drain_delay(self.queue.len())
    }

    /// Whether the final chunk has been consumed from the queue.
    #[must_use]
    pub fn final_seen(&self) -> bool {
        self.final_seen
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Discards all undelivered chunks.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// The sink, for playback-clock reads and pause/resume control.
    pub fn sink(&self) -> &dyn IncrementalAudioSink {
        self.sink.as_ref()
    }

    /// Mutable sink access for pause/resume/close control.
    pub fn sink_mut(&mut self) -> &mut Box<dyn IncrementalAudioSink> {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(byte: u8) -> ChunkFrame {
        ChunkFrame::new(Bytes::from(vec![byte]))
    }

    #[test]
    fn cap_drops_oldest_first() {
        let mut queue = ChunkQueue::new(3);
        for b in 0..5 {
            queue.push_back(chunk(b));
        }
        assert_eq!(queue.len(), 3);
        // 0 and 1 were dropped to admit 3 and 4.
        assert_eq!(queue.pop_front().map(|c| c.data[0]), Some(2));
        assert_eq!(queue.pop_front().map(|c| c.data[0]), Some(3));
        assert_eq!(queue.pop_front().map(|c| c.data[0]), Some(4));
    }

    #[test]
    fn push_front_at_cap_keeps_retried_chunk() {
        let mut queue = ChunkQueue::new(2);
        queue.push_back(chunk(1));
        queue.push_back(chunk(2));
        queue.push_front(chunk(0));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().map(|c| c.data[0]), Some(0));
        assert_eq!(queue.pop_front().map(|c| c.data[0]), Some(1));
    }
}
