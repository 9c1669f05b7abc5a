//! Session configuration types.
//!
//! Groups the tunable parameters of the playback controller. All types have
//! sensible defaults from [`crate::protocol_constants`] and validate the
//! handful of values that would cause runtime misbehavior if zeroed or
//! inverted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    BASE_BUFFER_THRESHOLD_SECS, BUSY_RETRY_DELAY_MS, CHUNK_QUEUE_CAP, CONNECT_TIMEOUT_SECS,
    DEFAULT_CHUNK_SIZE_HINT, DEFAULT_SPEED, DEFAULT_VOICE, DRAIN_BACKLOG_WATERMARK,
    DRAIN_DELAY_DEEP_MS, DRAIN_DELAY_SHALLOW_MS, MAX_BUFFER_THRESHOLD_SECS, MONITOR_INTERVAL_MS,
    NEGOTIATION_TIMEOUT_MS, RESUME_HEADROOM_FACTOR, THRESHOLD_DECAY_FACTOR,
    THRESHOLD_GROWTH_FACTOR, UNDERRUN_COUNT_DECAY,
};

/// Configuration for the bounded chunk queue and its drain loop.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum queued chunks; oldest entries are dropped beyond this.
    pub cap: usize,

    /// Queue depth at which the drain switches to the short delay.
    pub backlog_watermark: usize,

    /// Drain delay while the queue is shallow (milliseconds).
    pub shallow_delay_ms: u64,

    /// Drain delay while the queue is backlogged (milliseconds).
    pub deep_delay_ms: u64,

    /// Retry delay after a transient buffer-busy error (milliseconds).
    pub busy_retry_delay_ms: u64,
}

impl QueueConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.cap == 0 {
            return Err("queue cap must be >= 1".to_string());
        }
        if self.backlog_watermark == 0 || self.backlog_watermark > self.cap {
            return Err("backlog_watermark must be in 1..=cap".to_string());
        }
        Ok(())
    }

    /// Drain delay for the current queue depth.
    #[must_use]
    pub fn drain_delay(&self, queue_len: usize) -> Duration {
        if queue_len >= self.backlog_watermark {
            Duration::from_millis(self.deep_delay_ms)
        } else {
            Duration::from_millis(self.shallow_delay_ms)
        }
    }

    /// Retry delay after a transient busy write.
    #[must_use]
    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_delay_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cap: CHUNK_QUEUE_CAP,
            backlog_watermark: DRAIN_BACKLOG_WATERMARK,
            shallow_delay_ms: DRAIN_DELAY_SHALLOW_MS,
            deep_delay_ms: DRAIN_DELAY_DEEP_MS,
            busy_retry_delay_ms: BUSY_RETRY_DELAY_MS,
        }
    }
}

/// Configuration for the buffer health monitor's adaptive threshold.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Monitor tick interval (milliseconds).
    pub interval_ms: u64,

    /// Baseline safe buffer window (seconds).
    pub base_threshold_secs: f64,

    /// Ceiling for the adaptive threshold (seconds).
    pub max_threshold_secs: f64,

    /// Multiplicative growth per accumulated underrun (> 1).
    pub growth_factor: f64,

    /// Multiplicative decay toward base per healthy tick (< 1).
    pub decay_factor: f64,

    /// Fractional decay of the underrun counter per healthy tick.
    pub underrun_count_decay: f64,

    /// Resume headroom above `current` after a recovery pause.
    pub resume_headroom: f64,
}

impl MonitorConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == 0 {
            return Err("monitor interval must be >= 1ms".to_string());
        }
        if self.base_threshold_secs <= 0.0 || self.max_threshold_secs < self.base_threshold_secs {
            return Err("thresholds must satisfy 0 < base <= max".to_string());
        }
        if self.growth_factor <= 1.0 {
            return Err("growth_factor must be > 1".to_string());
        }
        if !(0.0..1.0).contains(&self.decay_factor) {
            return Err("decay_factor must be in (0, 1)".to_string());
        }
        Ok(())
    }

    /// Monitor tick interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: MONITOR_INTERVAL_MS,
            base_threshold_secs: BASE_BUFFER_THRESHOLD_SECS,
            max_threshold_secs: MAX_BUFFER_THRESHOLD_SECS,
            growth_factor: THRESHOLD_GROWTH_FACTOR,
            decay_factor: THRESHOLD_DECAY_FACTOR,
            underrun_count_decay: UNDERRUN_COUNT_DECAY,
            resume_headroom: RESUME_HEADROOM_FACTOR,
        }
    }
}

/// Configuration for one speech session.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Voice requested from the generation server.
    pub voice: String,

    /// Speech speed multiplier.
    pub speed: f32,

    /// Chunk size hint sent with the speech request (bytes).
    pub chunk_size_hint: usize,

    /// Timeout for opening the control channel (seconds).
    pub connect_timeout_secs: u64,

    /// Peer-negotiation time budget (milliseconds).
    pub negotiation_timeout_ms: u64,

    /// Chunk queue tuning.
    pub queue: QueueConfig,

    /// Buffer health monitor tuning.
    pub monitor: MonitorConfig,
}

impl SessionConfig {
    /// Creates a validated `SessionConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would cause runtime issues.
    pub fn new(queue: QueueConfig, monitor: MonitorConfig) -> Result<Self, String> {
        let config = Self {
            queue,
            monitor,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.voice.is_empty() {
            return Err("voice must not be empty".to_string());
        }
        if !(0.25..=4.0).contains(&self.speed) {
            return Err("speed must be in 0.25..=4.0".to_string());
        }
        self.queue.validate()?;
        self.monitor.validate()?;
        Ok(())
    }

    /// Negotiation time budget as a [`Duration`].
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Control-channel connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            speed: DEFAULT_SPEED,
            chunk_size_hint: DEFAULT_CHUNK_SIZE_HINT,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            negotiation_timeout_ms: NEGOTIATION_TIMEOUT_MS,
            queue: QueueConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}
