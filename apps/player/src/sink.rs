//! Pacing audio sink.
//!
//! The player has no audio device; it simulates playback by advancing a
//! position clock at a fixed byte rate over the received audio. That is
//! enough to exercise the buffer-health monitor against a real network feed
//! and to observe pause/resume behavior from the terminal.

use std::time::Instant;

use async_trait::async_trait;
use fablecast_core::error::SinkWriteError;
use fablecast_core::sink::{IncrementalAudioSink, SinkFactory};
use log::debug;

/// Sink whose playback clock runs in wall time at a configured byte rate.
pub struct PacingSink {
    bytes_per_sec: f64,
    buffered_secs: f64,
    /// Seconds played before the current playing stretch.
    played_accum: f64,
    /// Start of the current playing stretch; `None` while paused or closed.
    playing_since: Option<Instant>,
    finalized: bool,
    closed: bool,
}

impl PacingSink {
    fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec,
            buffered_secs: 0.0,
            played_accum: 0.0,
            playing_since: None,
            finalized: false,
            closed: false,
        }
    }

    fn position_now(&self) -> f64 {
        let running = self
            .playing_since
            .map_or(0.0, |since| since.elapsed().as_secs_f64());
        (self.played_accum + running).min(self.buffered_secs)
    }
}

#[async_trait]
impl IncrementalAudioSink for PacingSink {
    async fn append(&mut self, data: &[u8]) -> Result<(), SinkWriteError> {
        if self.closed || self.finalized {
            return Err(SinkWriteError::Failed("sink is closed".to_string()));
        }
        self.buffered_secs += data.len() as f64 / self.bytes_per_sec;
        // Playback starts with the first audio.
        if self.playing_since.is_none() && self.position_now() < self.buffered_secs {
            self.playing_since = Some(Instant::now());
        }
        debug!(
            "[PacingSink] appended {} bytes, buffered to {:.2}s",
            data.len(),
            self.buffered_secs
        );
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), SinkWriteError> {
        self.finalized = true;
        Ok(())
    }

    async fn pause(&mut self) {
        self.played_accum = self.position_now();
        self.playing_since = None;
    }

    async fn resume(&mut self) {
        if !self.closed && self.playing_since.is_none() {
            self.played_accum = self.position_now();
            self.playing_since = Some(Instant::now());
        }
    }

    async fn close(&mut self) {
        self.played_accum = self.position_now();
        self.playing_since = None;
        self.closed = true;
    }

    fn buffered_end_secs(&self) -> f64 {
        self.buffered_secs
    }

    fn position_secs(&self) -> f64 {
        self.position_now()
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Factory for [`PacingSink`]s at a fixed byte rate.
pub struct PacingSinkFactory {
    bytes_per_sec: f64,
}

impl PacingSinkFactory {
    #[must_use]
    pub fn new(bytes_per_sec: f64) -> Self {
        Self { bytes_per_sec }
    }
}

impl SinkFactory for PacingSinkFactory {
    fn create_sink(&self) -> Box<dyn IncrementalAudioSink> {
        Box::new(PacingSink::new(self.bytes_per_sec))
    }
}
