//! Tunable constants for the playback controller.
//!
//! The adaptive-threshold factors are empirically chosen defaults, not
//! contracts: only the clamping bounds (`base <= current <= max`) are
//! guaranteed. Everything here can be overridden through the config types
//! in [`crate::config`].

// ─────────────────────────────────────────────────────────────────────────────
// Control Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout for opening the control channel and receiving a session id (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Capacity of the queue between the control channel's reader task and the
/// session consuming its events.
///
/// Sized for a burst of chunk deliveries; a session that falls this far
/// behind is already unable to play the stream in real time, and the full
/// queue applies backpressure to the reader.
pub const SIGNALING_EVENT_CAPACITY: usize = 256;

/// Capacity of the state-transition broadcast channel.
pub const STATE_EVENT_CAPACITY: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Peer Transport Negotiation
// ─────────────────────────────────────────────────────────────────────────────

/// Total time budget for peer-channel negotiation (milliseconds).
///
/// If the handshake has not produced an open data channel within this
/// window, the session silently stays on the signaling delivery path.
pub const NEGOTIATION_TIMEOUT_MS: u64 = 3000;

/// Capacity of the peer data channel's chunk queue.
pub const PEER_CHANNEL_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Chunk Queue & Drain
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum chunks held while the sink is busy (oldest dropped beyond this).
pub const CHUNK_QUEUE_CAP: usize = 8;

/// Queue depth at or above which the drain runs on the short delay.
pub const DRAIN_BACKLOG_WATERMARK: usize = 4;

/// Drain delay when the queue is backlogged (milliseconds).
pub const DRAIN_DELAY_DEEP_MS: u64 = 10;

/// Drain delay when the queue is shallow (milliseconds).
///
/// The longer delay trades a little latency for write stability: the sink
/// gets room to settle between appends when there is no backlog pressure.
pub const DRAIN_DELAY_SHALLOW_MS: u64 = 40;

/// Retry delay after a transient buffer-busy write error (milliseconds).
pub const BUSY_RETRY_DELAY_MS: u64 = 25;

// ─────────────────────────────────────────────────────────────────────────────
// Buffer Health Monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Monitor tick interval (milliseconds).
pub const MONITOR_INTERVAL_MS: u64 = 50;

/// Baseline safe buffer window (seconds). The adaptive threshold never
/// decays below this.
pub const BASE_BUFFER_THRESHOLD_SECS: f64 = 1.5;

/// Ceiling for the adaptive threshold (seconds). Growth stops here no
/// matter how long the underrun history is.
pub const MAX_BUFFER_THRESHOLD_SECS: f64 = 8.0;

/// Multiplicative growth per accumulated underrun (> 1).
pub const THRESHOLD_GROWTH_FACTOR: f64 = 1.5;

/// Multiplicative decay toward base on each healthy tick (< 1).
pub const THRESHOLD_DECAY_FACTOR: f64 = 0.98;

/// Amount subtracted from the fractional underrun counter per healthy tick.
///
/// Underruns add 1.0 each; the slow fractional decay gives the
/// fast-growth / slow-shrink hysteresis shape.
pub const UNDERRUN_COUNT_DECAY: f64 = 0.05;

/// Fractional amount added to the underrun counter on a low-but-not-critical
/// tick. A sustained shallow buffer nudges the threshold up without waiting
/// for a full underrun.
pub const UNDERRUN_COUNT_LOW_INCREMENT: f64 = 0.25;

/// The critical sub-threshold is `current / CRITICAL_WINDOW_DIVISOR`.
pub const CRITICAL_WINDOW_DIVISOR: f64 = 2.0;

/// After a recovery pause, playback resumes once the window exceeds
/// `min(current * RESUME_HEADROOM_FACTOR, max)`.
pub const RESUME_HEADROOM_FACTOR: f64 = 1.2;

// ─────────────────────────────────────────────────────────────────────────────
// Speech Request Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default voice requested from the generation server.
pub const DEFAULT_VOICE: &str = "alloy";

/// Default speech speed multiplier.
pub const DEFAULT_SPEED: f32 = 1.0;

/// Default chunk size hint sent with a speech request (bytes).
pub const DEFAULT_CHUNK_SIZE_HINT: usize = 32 * 1024;
