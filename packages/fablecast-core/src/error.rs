//! Centralized error types for the Fablecast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Separates transient sink-write failures from fatal ones
//! - Maps errors to machine-readable codes for state-change payloads

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for event payloads.
    fn code(&self) -> &'static str;
}

/// Error raised by an [`IncrementalAudioSink`](crate::sink::IncrementalAudioSink)
/// when a write cannot be performed.
#[derive(Debug, Error)]
pub enum SinkWriteError {
    /// The sink is mid-write and cannot accept another append right now.
    /// The chunk should be requeued and retried shortly.
    #[error("sink busy")]
    Busy,

    /// The sink rejected the data itself (bad codec, corrupt payload).
    #[error("unsupported data: {0}")]
    Unsupported(String),

    /// The write failed for a reason that will not go away on retry.
    #[error("write failed: {0}")]
    Failed(String),
}

impl SinkWriteError {
    /// Whether the error is transient and the write should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl ErrorCode for SinkWriteError {
    fn code(&self) -> &'static str {
        match self {
            Self::Busy => "sink_busy",
            Self::Unsupported(_) => "sink_unsupported_data",
            Self::Failed(_) => "sink_write_failed",
        }
    }
}

/// Error raised during peer-channel negotiation.
///
/// These never reach the caller: negotiation failure degrades the session
/// to signaling-only delivery. The variants exist so connectors can report
/// what went wrong for logging.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The handshake itself failed (offer/answer/candidate rejected).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The data channel never opened after a completed handshake.
    #[error("data channel never opened")]
    ChannelNeverOpened,
}

/// Application-wide error type for the Fablecast client.
#[derive(Debug, Error)]
pub enum FablecastError {
    /// The control channel could not be opened or produced no session id.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The control channel closed abnormally mid-session.
    #[error("Control channel lost: {0}")]
    ChannelLost(String),

    /// A fatal streaming failure (non-transient sink write, bad stream).
    #[error("Stream error: {0}")]
    Stream(String),

    /// The playback sink itself failed (creation or mid-playback error).
    #[error("Playback sink error: {0}")]
    Sink(String),

    /// The local utterance engine failed.
    #[error("Speech engine error: {0}")]
    Engine(String),

    /// The server reported an error for this session.
    #[error("Server error: {0}")]
    Server(String),

    /// A configuration value would cause runtime issues.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorCode for FablecastError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect_failed",
            Self::ChannelLost(_) => "channel_lost",
            Self::Stream(_) => "stream_error",
            Self::Sink(_) => "sink_error",
            Self::Engine(_) => "engine_error",
            Self::Server(_) => "server_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type FablecastResult<T> = Result<T, FablecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_the_only_transient_write_error() {
        assert!(SinkWriteError::Busy.is_transient());
        assert!(!SinkWriteError::Unsupported("mp3".into()).is_transient());
        assert!(!SinkWriteError::Failed("closed".into()).is_transient());
    }

    #[test]
    fn errors_expose_stable_codes() {
        assert_eq!(FablecastError::Connect("refused".into()).code(), "connect_failed");
        assert_eq!(SinkWriteError::Busy.code(), "sink_busy");
    }
}
