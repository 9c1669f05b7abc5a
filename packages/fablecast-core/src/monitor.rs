//! Buffer health monitoring with an adaptive underrun threshold.
//!
//! The monitor watches the buffered window (seconds of received,
//! not-yet-played audio) on a fixed tick. The safety threshold adapts:
//! it grows multiplicatively after underruns and decays slowly during
//! stability, always clamped to `[base, max]`. Growth is fast and shrink is
//! slow, the usual congestion-control hysteresis, so one bad network patch
//! does not cause a pause/resume thrash loop.
//!
//! The monitor is a pure decision function over (window, playing); the
//! session task owns the timer and applies the returned action to the sink.

use std::time::Duration;

use log::{debug, info};

use crate::config::MonitorConfig;
use crate::protocol_constants::{CRITICAL_WINDOW_DIVISOR, UNDERRUN_COUNT_LOW_INCREMENT};

// ─── Adaptive thresholds ─────────────────────────────────────────────────────

/// Safety-threshold state for the buffered window.
#[derive(Debug, Clone)]
pub struct AdaptiveThresholds {
    base: f64,
    max: f64,
    current: f64,
    growth_factor: f64,
    decay_factor: f64,
    count_decay: f64,
    /// Fractional underrun pressure. Whole underruns add 1.0, shallow
    /// ticks add a fraction, healthy ticks drain it slowly toward zero.
    underrun_count: f64,
}

impl AdaptiveThresholds {
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            base: config.base_threshold_secs,
            max: config.max_threshold_secs,
            current: config.base_threshold_secs,
            growth_factor: config.growth_factor,
            decay_factor: config.decay_factor,
            count_decay: config.underrun_count_decay,
            underrun_count: 0.0,
        }
    }

    /// Minimum safe buffered window, in seconds. Always in `[base, max]`.
    #[must_use]
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Window below which playback is paused, `current / 2` by default.
    #[must_use]
    pub fn critical(&self) -> f64 {
        self.current / CRITICAL_WINDOW_DIVISOR
    }

    /// Window at which a recovery pause ends, capped at `max`.
    #[must_use]
    pub fn resume_target(&self, headroom: f64) -> f64 {
        (self.current * headroom).min(self.max)
    }

    /// Registers a full underrun and grows the threshold.
    pub fn record_underrun(&mut self) {
        self.underrun_count += 1.0;
        self.grow();
    }

    /// Registers a shallow-but-playing tick: a fractional nudge upward.
    pub fn record_low(&mut self) {
        self.underrun_count += UNDERRUN_COUNT_LOW_INCREMENT;
        self.grow();
    }

    /// Registers a healthy tick: drain the counter and shrink toward base.
    pub fn record_healthy(&mut self) {
        self.underrun_count = (self.underrun_count - self.count_decay).max(0.0);
        self.current = (self.current * self.decay_factor).max(self.base);
    }

    fn grow(&mut self) {
        // Exponential-backoff shape keyed off the fractional counter.
        self.current = (self.base * self.growth_factor.powf(self.underrun_count))
            .clamp(self.base, self.max);
    }

    #[cfg(test)]
    fn underrun_count(&self) -> f64 {
        self.underrun_count
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// What the session should do after a monitor tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorAction {
    /// Buffer is fine (or recovery is still in progress). Keep going.
    None,
    /// Critical underrun: pause the sink and poll until the window reaches
    /// `resume_target`.
    PauseAndRecover { resume_target: f64 },
    /// Recovery complete: resume the sink.
    Resume,
}

/// Tick-driven buffer health state machine.
pub struct BufferHealthMonitor {
    thresholds: AdaptiveThresholds,
    resume_headroom: f64,
    interval: Duration,
    consecutive_low: u32,
    /// Resume target while paused for recovery; `None` when playing normally.
    recovering: Option<f64>,
}

impl BufferHealthMonitor {
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            thresholds: AdaptiveThresholds::new(config),
            resume_headroom: config.resume_headroom,
            interval: config.interval(),
            consecutive_low: 0,
            recovering: None,
        }
    }

    /// Tick cadence for the owning timer loop.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current adaptive threshold, for logging and tests.
    #[must_use]
    pub fn thresholds(&self) -> &AdaptiveThresholds {
        &self.thresholds
    }

    /// Whether the monitor has paused playback and is polling for recovery.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering.is_some()
    }

    /// Ends an in-progress recovery without reaching the target.
    ///
    /// Once the stream is complete no further data can arrive, so a target
    /// above the remaining buffered window would never be met; the caller
    /// resumes playback with whatever is buffered.
    pub fn end_recovery(&mut self) {
        if self.recovering.take().is_some() {
            debug!("[Monitor] recovery cut short, no more data expected");
            self.consecutive_low = 0;
        }
    }

    /// Evaluates one tick against the buffered window.
    ///
    /// `playing` reflects whether the sink is actively rendering; a shallow
    /// window while paused (e.g. caller pause) is not an underrun.
    pub fn tick(&mut self, window_secs: f64, playing: bool) -> MonitorAction {
        if let Some(target) = self.recovering {
            if window_secs >= target {
                info!(
                    "[Monitor] buffer recovered ({window_secs:.2}s >= {target:.2}s), resuming"
                );
                self.recovering = None;
                self.consecutive_low = 0;
                return MonitorAction::Resume;
            }
            return MonitorAction::None;
        }

        if window_secs < self.thresholds.current() {
            self.consecutive_low += 1;
            if playing && window_secs < self.thresholds.critical() {
                self.thresholds.record_underrun();
                let resume_target = self.thresholds.resume_target(self.resume_headroom);
                info!(
                    "[Monitor] critical underrun ({window_secs:.2}s < {:.2}s), pausing until {resume_target:.2}s",
                    self.thresholds.critical()
                );
                self.recovering = Some(resume_target);
                return MonitorAction::PauseAndRecover { resume_target };
            }
            debug!(
                "[Monitor] buffer low ({window_secs:.2}s < {:.2}s), {} consecutive",
                self.thresholds.current(),
                self.consecutive_low
            );
            self.thresholds.record_low();
            return MonitorAction::None;
        }

        self.consecutive_low = 0;
        self.thresholds.record_healthy();
        MonitorAction::None
    }
}
