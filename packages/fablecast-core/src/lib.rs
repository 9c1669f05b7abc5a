//! Fablecast Core - adaptive streaming speech playback.
//!
//! This crate drives playback of server-synthesized speech delivered as an
//! ordered stream of compressed audio chunks. A session bootstraps over a
//! WebSocket signaling channel, optionally negotiates a direct peer channel
//! for chunk delivery, feeds chunks through a bounded queue into an
//! incremental audio sink, and keeps an adaptive buffer-health threshold
//! that pauses and resumes playback around network underruns. When the
//! remote path fails, a local utterance engine takes over the remaining
//! text, at most once per session.
//!
//! # Architecture
//!
//! - [`session`]: per-request session task, caller handle, and controller
//! - [`signaling`]: control channel (WebSocket) and its trait seam
//! - [`transport`]: optional peer-channel negotiation
//! - [`queue`]: bounded chunk queue and sink appender
//! - [`monitor`]: adaptive buffer-health thresholds
//! - [`sink`] / [`fallback`]: platform capability traits for audio output
//!   and local speech synthesis
//! - [`events`]: state snapshots published to observers
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! Platform concerns live behind traits so the pipeline is testable with
//! simulated implementations:
//!
//! - [`IncrementalAudioSink`](sink::IncrementalAudioSink): append-driven
//!   audio output with buffered/position clocks
//! - [`LocalUtteranceEngine`](fallback::LocalUtteranceEngine): local speech
//!   synthesis with boundary events
//! - [`ControlChannel`](signaling::ControlChannel): the signaling transport
//! - [`PeerConnector`](transport::PeerConnector): the peer-channel handshake

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod monitor;
pub mod protocol;
pub mod protocol_constants;
pub mod queue;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod testing;
pub mod transport;

// Re-export commonly used types at the crate root
pub use config::{MonitorConfig, QueueConfig, SessionConfig};
pub use error::{ErrorCode, FablecastError, FablecastResult, NegotiationError, SinkWriteError};
pub use events::{PlaybackState, StateNotifier, StateSnapshot};
pub use fallback::{FallbackAdapter, LocalUtteranceEngine, UtteranceEngineFactory, UtteranceEvent};
pub use monitor::{AdaptiveThresholds, BufferHealthMonitor, MonitorAction};
pub use protocol::{ChunkFrame, ClientMessage, ServerMessage};
pub use session::{SessionHandle, SpeechController};
pub use signaling::{ChannelFactory, ControlChannel, SignalingEvent, WsChannelFactory};
pub use sink::{IncrementalAudioSink, SinkFactory};
pub use transport::{PeerConnector, PeerConnectorFactory, TransportMode};
