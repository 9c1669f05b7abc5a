//! Test doubles for exercising sessions without a server, a real audio
//! device, or a platform speech engine.
//!
//! Each double comes in a factory/handle pair: the factory plugs into
//! [`SpeechController`](crate::session::SpeechController), the handle stays
//! with the test to script inputs and observe effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{FablecastError, FablecastResult, NegotiationError, SinkWriteError};
use crate::fallback::{LocalUtteranceEngine, UtteranceEngineFactory, UtteranceEvent};
use crate::protocol::{ChunkFrame, ClientMessage};
use crate::signaling::{ChannelFactory, ControlChannel, SignalingEvent};
use crate::sink::{IncrementalAudioSink, SinkFactory};
use crate::transport::{PeerConnector, PeerConnectorFactory};

// ─── Control channel ─────────────────────────────────────────────────────────

/// Test side of a [`FakeChannel`]: feed events in, inspect messages out.
#[derive(Clone)]
pub struct FakeChannelHandle {
    events: mpsc::UnboundedSender<SignalingEvent>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicBool>,
}

impl FakeChannelHandle {
    /// Delivers one inbound event to the session.
    pub fn push(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    /// Delivers an inbound control message.
    pub fn push_message(&self, message: crate::protocol::ServerMessage) {
        self.push(SignalingEvent::Message(message));
    }

    /// Reports the channel as lost mid-session.
    pub fn drop_abnormally(&self, reason: &str) {
        self.push(SignalingEvent::Closed {
            clean: false,
            reason: reason.to_string(),
        });
    }

    /// Messages the session has sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Whether the session closed the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Scriptable [`ControlChannel`].
pub struct FakeChannel {
    events: mpsc::UnboundedReceiver<SignalingEvent>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn send(&mut self, message: ClientMessage) -> FablecastResult<()> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.close();
    }
}

/// Factory serving pre-armed [`FakeChannel`]s; connecting with none armed
/// fails, which doubles as the connect-failure script.
#[derive(Default)]
pub struct FakeChannelFactory {
    armed: Mutex<VecDeque<FakeChannel>>,
}

impl FakeChannelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares a channel for the next `connect` and returns its handle.
    pub fn arm(&self) -> FakeChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let handle = FakeChannelHandle {
            events: tx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        self.armed.lock().push_back(FakeChannel {
            events: rx,
            sent,
            closed,
        });
        handle
    }
}

#[async_trait]
impl ChannelFactory for FakeChannelFactory {
    async fn connect(&self) -> FablecastResult<Box<dyn ControlChannel>> {
        match self.armed.lock().pop_front() {
            Some(channel) => Ok(Box::new(channel)),
            None => Err(FablecastError::Connect("no channel armed".to_string())),
        }
    }
}

/// Factory whose connections always fail.
pub struct NullChannelFactory;

#[async_trait]
impl ChannelFactory for NullChannelFactory {
    async fn connect(&self) -> FablecastResult<Box<dyn ControlChannel>> {
        Err(FablecastError::Connect("unreachable".to_string()))
    }
}

// ─── Audio sink ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimSinkState {
    appended: Vec<Vec<u8>>,
    append_script: VecDeque<Result<(), SinkWriteError>>,
    finalize_script: VecDeque<Result<(), SinkWriteError>>,
    buffered_end: f64,
    position: f64,
    paused: bool,
    finalized: bool,
    closed: bool,
}

/// Test side of a [`SimulatedSink`]: drive the playback clock by hand.
#[derive(Clone)]
pub struct SimSinkHandle {
    state: Arc<Mutex<SimSinkState>>,
}

impl SimSinkHandle {
    /// Chunks appended so far, in append order.
    #[must_use]
    pub fn appended(&self) -> Vec<Vec<u8>> {
        self.state.lock().appended.clone()
    }

    /// Queues results for upcoming `append` calls; unscripted calls succeed.
    pub fn script_appends(&self, results: impl IntoIterator<Item = Result<(), SinkWriteError>>) {
        self.state.lock().append_script.extend(results);
    }

    /// Queues results for upcoming `finalize` calls.
    pub fn script_finalize(&self, results: impl IntoIterator<Item = Result<(), SinkWriteError>>) {
        self.state.lock().finalize_script.extend(results);
    }

    /// Moves the playback position, as if audio had rendered.
    pub fn set_position(&self, secs: f64) {
        self.state.lock().position = secs;
    }

    /// Plays out everything buffered.
    pub fn drain_to_end(&self) {
        let mut state = self.state.lock();
        state.position = state.buffered_end;
    }

    #[must_use]
    pub fn buffered_end(&self) -> f64 {
        self.state.lock().buffered_end
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// In-memory [`IncrementalAudioSink`] with a manually-driven clock. Every
/// appended chunk buffers a fixed number of seconds.
pub struct SimulatedSink {
    state: Arc<Mutex<SimSinkState>>,
    secs_per_chunk: f64,
}

#[async_trait]
impl IncrementalAudioSink for SimulatedSink {
    async fn append(&mut self, data: &[u8]) -> Result<(), SinkWriteError> {
        let mut state = self.state.lock();
        if let Some(result) = state.append_script.pop_front() {
            result?;
        }
        state.appended.push(data.to_vec());
        state.buffered_end += self.secs_per_chunk;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), SinkWriteError> {
        let mut state = self.state.lock();
        if let Some(result) = state.finalize_script.pop_front() {
            result?;
        }
        state.finalized = true;
        Ok(())
    }

    async fn pause(&mut self) {
        self.state.lock().paused = true;
    }

    async fn resume(&mut self) {
        self.state.lock().paused = false;
    }

    async fn close(&mut self) {
        self.state.lock().closed = true;
    }

    fn buffered_end_secs(&self) -> f64 {
        self.state.lock().buffered_end
    }

    fn position_secs(&self) -> f64 {
        self.state.lock().position
    }

    fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }
}

/// Factory producing [`SimulatedSink`]s and keeping a handle to each.
pub struct SimSinkFactory {
    secs_per_chunk: f64,
    handles: Mutex<Vec<SimSinkHandle>>,
}

impl SimSinkFactory {
    #[must_use]
    pub fn new(secs_per_chunk: f64) -> Self {
        Self {
            secs_per_chunk,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Handle to the most recently created sink.
    #[must_use]
    pub fn last_handle(&self) -> Option<SimSinkHandle> {
        self.handles.lock().last().cloned()
    }
}

impl SinkFactory for SimSinkFactory {
    fn create_sink(&self) -> Box<dyn IncrementalAudioSink> {
        let state = Arc::new(Mutex::new(SimSinkState::default()));
        self.handles.lock().push(SimSinkHandle {
            state: Arc::clone(&state),
        });
        Box::new(SimulatedSink {
            state,
            secs_per_chunk: self.secs_per_chunk,
        })
    }
}

// ─── Utterance engine ────────────────────────────────────────────────────────

/// Test side of a scripted engine: inspect spoken texts, emit events.
#[derive(Clone)]
pub struct ScriptedEngineHandle {
    spoken: Arc<Mutex<Vec<String>>>,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<UtteranceEvent>>>>,
    stops: Arc<AtomicUsize>,
}

impl ScriptedEngineHandle {
    /// Texts passed to `speak`, in call order.
    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }

    /// Emits an event from the in-flight utterance.
    pub fn emit(&self, event: UtteranceEvent) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct ScriptedEngine {
    handle: ScriptedEngineHandle,
}

#[async_trait]
impl LocalUtteranceEngine for ScriptedEngine {
    async fn speak(
        &mut self,
        text: &str,
        events: mpsc::UnboundedSender<UtteranceEvent>,
    ) -> FablecastResult<()> {
        self.handle.spoken.lock().push(text.to_string());
        *self.handle.sender.lock() = Some(events);
        Ok(())
    }

    async fn stop(&mut self) {
        self.handle.stops.fetch_add(1, Ordering::SeqCst);
        *self.handle.sender.lock() = None;
    }
}

/// Factory producing scripted engines and keeping a handle to each.
#[derive(Default)]
pub struct ScriptedEngineFactory {
    handles: Mutex<Vec<ScriptedEngineHandle>>,
}

impl ScriptedEngineFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the most recently created engine.
    #[must_use]
    pub fn last_handle(&self) -> Option<ScriptedEngineHandle> {
        self.handles.lock().last().cloned()
    }

    /// How many engines have been created (one per fallback engagement).
    #[must_use]
    pub fn created(&self) -> usize {
        self.handles.lock().len()
    }
}

impl UtteranceEngineFactory for ScriptedEngineFactory {
    fn create_engine(&self) -> Box<dyn LocalUtteranceEngine> {
        let handle = ScriptedEngineHandle {
            spoken: Arc::new(Mutex::new(Vec::new())),
            sender: Arc::new(Mutex::new(None)),
            stops: Arc::new(AtomicUsize::new(0)),
        };
        self.handles.lock().push(handle.clone());
        Box::new(ScriptedEngine { handle })
    }
}

// ─── Peer connector ──────────────────────────────────────────────────────────

/// Test side of a scripted peer connector.
#[derive(Clone)]
pub struct ScriptedPeerHandle {
    chunk_tx: Arc<Mutex<Option<mpsc::Sender<ChunkFrame>>>>,
    answers: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl ScriptedPeerHandle {
    /// Delivers a chunk over the peer channel, once open.
    pub async fn send_chunk(&self, chunk: ChunkFrame) {
        let tx = self.chunk_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(chunk).await;
        }
    }

    /// Answers the connector applied.
    #[must_use]
    pub fn answers(&self) -> Vec<serde_json::Value> {
        self.answers.lock().clone()
    }
}

/// Connector whose channel opens as soon as the remote answer is applied.
struct ScriptedPeerConnector {
    handle: ScriptedPeerHandle,
    opened: Arc<tokio::sync::Notify>,
    answered: Arc<AtomicBool>,
}

#[async_trait]
impl PeerConnector for ScriptedPeerConnector {
    async fn create_offer(&mut self) -> Result<serde_json::Value, NegotiationError> {
        Ok(json!({"type": "offer", "sdp": "scripted"}))
    }

    async fn accept_answer(&mut self, payload: serde_json::Value) -> Result<(), NegotiationError> {
        self.handle.answers.lock().push(payload);
        self.answered.store(true, Ordering::SeqCst);
        self.opened.notify_one();
        Ok(())
    }

    async fn add_candidate(&mut self, _payload: serde_json::Value) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn wait_channel(&mut self) -> Result<mpsc::Receiver<ChunkFrame>, NegotiationError> {
        if !self.answered.load(Ordering::SeqCst) {
            self.opened.notified().await;
        }
        let (tx, rx) = mpsc::channel(crate::protocol_constants::PEER_CHANNEL_CAPACITY);
        *self.handle.chunk_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn close(&mut self) {
        *self.handle.chunk_tx.lock() = None;
    }
}

/// Factory producing scripted connectors and keeping a handle to each.
#[derive(Default)]
pub struct ScriptedPeerFactory {
    handles: Mutex<Vec<ScriptedPeerHandle>>,
}

impl ScriptedPeerFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_handle(&self) -> Option<ScriptedPeerHandle> {
        self.handles.lock().last().cloned()
    }
}

impl PeerConnectorFactory for ScriptedPeerFactory {
    fn create_connector(&self) -> Box<dyn PeerConnector> {
        let handle = ScriptedPeerHandle {
            chunk_tx: Arc::new(Mutex::new(None)),
            answers: Arc::new(Mutex::new(Vec::new())),
        };
        self.handles.lock().push(handle.clone());
        Box::new(ScriptedPeerConnector {
            handle,
            opened: Arc::new(tokio::sync::Notify::new()),
            answered: Arc::new(AtomicBool::new(false)),
        })
    }
}
