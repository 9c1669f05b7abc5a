//! Trait abstraction over incremental audio output.
//!
//! The session appends compressed chunks to a sink as they arrive and reads
//! back two clocks: how much audio has been buffered and how far playback
//! has advanced. The difference between them is the buffered window that the
//! buffer-health monitor watches. Concrete sinks (a media-source bridge, a
//! decoder feeding a device, a pacing simulator) live outside this crate.

use async_trait::async_trait;

use crate::error::SinkWriteError;

/// Write side of an incrementally-fed audio output.
///
/// A sink accepts chunks in arrival order and exposes its playback clock.
/// All mutation goes through `&mut self`; the session task is the only
/// writer, so implementations do not need internal synchronization for the
/// append path.
#[async_trait]
pub trait IncrementalAudioSink: Send {
    /// Appends one compressed audio chunk.
    ///
    /// # Errors
    ///
    /// Returns [`SinkWriteError::Busy`] when the sink cannot accept data
    /// right now but will again shortly; the caller re-queues the chunk at
    /// the front and retries after a short delay. Any other error is fatal
    /// for the sink.
    async fn append(&mut self, data: &[u8]) -> Result<(), SinkWriteError>;

    /// Marks the stream complete. No chunks may be appended afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SinkWriteError::Busy`] if the sink is mid-append; the
    /// caller retries once after the current operation settles.
    async fn finalize(&mut self) -> Result<(), SinkWriteError>;

    /// Suspends playback without discarding buffered audio.
    async fn pause(&mut self);

    /// Resumes playback after [`pause`](Self::pause).
    async fn resume(&mut self);

    /// Releases the sink. Buffered audio is discarded.
    async fn close(&mut self);

    /// End timestamp of buffered audio, in seconds of media time.
    fn buffered_end_secs(&self) -> f64;

    /// Current playback position, in seconds of media time.
    fn position_secs(&self) -> f64;

    /// Whether [`finalize`](Self::finalize) has completed.
    fn is_finalized(&self) -> bool;

    /// Seconds of audio buffered ahead of the playback position.
    fn buffered_window_secs(&self) -> f64 {
        (self.buffered_end_secs() - self.position_secs()).max(0.0)
    }
}

/// Factory for sinks, one per playback session.
///
/// The controller holds a factory rather than a sink so each request gets a
/// fresh output with clean clocks.
pub trait SinkFactory: Send + Sync {
    /// Creates a sink for a new session.
    fn create_sink(&self) -> Box<dyn IncrementalAudioSink>;
}
