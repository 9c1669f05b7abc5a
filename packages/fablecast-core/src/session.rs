//! Playback sessions and the speech controller.
//!
//! Each speech request gets its own [`Session`]: a spawned task that owns
//! the control channel, the chunk queue and sink, the buffer-health monitor
//! and the optional fallback adapter for its whole lifetime. Single
//! ownership makes the single-writer rule on the sink structural; nothing
//! outside the task touches playback state. Callers interact through a
//! [`SessionHandle`] (pause/resume/stop plus a state subscription) and the
//! [`SpeechController`] front door that starts sessions.

use std::ops::ControlFlow;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{ErrorCode, FablecastError, FablecastResult};
use crate::events::{PlaybackState, StateNotifier, StateSnapshot};
use crate::fallback::{FallbackAdapter, UtteranceEngineFactory, UtteranceEvent};
use crate::monitor::{BufferHealthMonitor, MonitorAction};
use crate::protocol::{ChunkFrame, ClientMessage, ServerMessage};
use crate::queue::{BufferAppender, DrainOutcome};
use crate::signaling::{ChannelFactory, ControlChannel, SignalingEvent};
use crate::sink::SinkFactory;
use crate::transport::{spawn_negotiation, TransportMode};

// ─── Handle ──────────────────────────────────────────────────────────────────

enum SessionCommand {
    Pause,
    Resume,
    Stop,
}

/// Caller-facing handle to a running session.
///
/// All methods are fire-and-forget against the session task; outcomes are
/// observed through [`subscribe`](Self::subscribe). Once the session reaches
/// a terminal state the handle's commands become no-ops.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    notifier: StateNotifier,
}

impl SessionHandle {
    /// Requests playback pause.
    pub fn pause(&self) {
        let _ = self.commands.send(SessionCommand::Pause);
    }

    /// Requests playback resume.
    pub fn resume(&self) {
        let _ = self.commands.send(SessionCommand::Resume);
    }

    /// Stops the session: queued chunks are released and timers canceled.
    /// Idempotent; repeated calls after the first are no-ops.
    pub fn stop(&self) {
        let _ = self.commands.send(SessionCommand::Stop);
        self.cancel.cancel();
    }

    /// Subscribes to state snapshots published by this session.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.notifier.subscribe()
    }

    /// Whether the session task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// Front door for speech requests.
///
/// A controller holds the factories shared across sessions and at most one
/// active session; starting a new request stops the previous one.
pub struct SpeechController {
    channels: Arc<dyn ChannelFactory>,
    sinks: Arc<dyn SinkFactory>,
    engines: Arc<dyn UtteranceEngineFactory>,
    transport: TransportMode,
    config: SessionConfig,
    active: Option<SessionHandle>,
}

impl SpeechController {
    /// Creates a controller.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid.
    pub fn new(
        channels: Arc<dyn ChannelFactory>,
        sinks: Arc<dyn SinkFactory>,
        engines: Arc<dyn UtteranceEngineFactory>,
        transport: TransportMode,
        config: SessionConfig,
    ) -> FablecastResult<Self> {
        config.validate().map_err(FablecastError::Configuration)?;
        Ok(Self {
            channels,
            sinks,
            engines,
            transport,
            config,
            active: None,
        })
    }

    /// Starts speaking `text`, stopping any session already in flight.
    ///
    /// Connection and playback failures are reported through the returned
    /// handle's subscription, not as a return value.
    pub fn speak(&mut self, text: impl Into<String>) -> SessionHandle {
        if let Some(previous) = self.active.take() {
            debug!("[Controller] stopping previous session");
            previous.stop();
        }

        let notifier = StateNotifier::new();
        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: cmd_tx,
            cancel: cancel.clone(),
            notifier: notifier.clone(),
        };

        let text = text.into();
        let channels = Arc::clone(&self.channels);
        let sinks = Arc::clone(&self.sinks);
        let engines = Arc::clone(&self.engines);
        let transport = self.transport.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let channel = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    notifier.publish(StateSnapshot::of(PlaybackState::Stopped));
                    return;
                }
                result = channels.connect() => match result {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("[Session] connect failed: {e}");
                        notifier.publish(
                            StateSnapshot::of(PlaybackState::Error)
                                .with_reason(e.to_string())
                                .with_code(e.code()),
                        );
                        return;
                    }
                },
            };

            let monitor = BufferHealthMonitor::new(&config.monitor);
            let appender = BufferAppender::new(sinks.create_sink(), config.queue.clone());
            let session = Session {
                text,
                config,
                notifier,
                channel,
                channel_ended: false,
                appender,
                monitor,
                engines,
                transport,
                session_id: None,
                negotiation_in: None,
                negotiation_out: None,
                negotiation_opened: None,
                peer_rx: None,
                fallback: None,
                fallback_engaged: false,
                started: false,
                stream_done: false,
                user_paused: false,
                auto_paused: false,
                drain_at: None,
                state: PlaybackState::Idle,
            };
            session.run(cancel, cmd_rx).await;
        });

        self.active = Some(handle.clone());
        handle
    }

    /// Pauses the active session, if any.
    pub fn pause(&self) {
        if let Some(active) = &self.active {
            active.pause();
        }
    }

    /// Resumes the active session, if any.
    pub fn resume(&self) {
        if let Some(active) = &self.active {
            active.resume();
        }
    }

    /// Stops the active session, if any.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop();
        }
    }

    /// Handle to the active session.
    #[must_use]
    pub fn active(&self) -> Option<&SessionHandle> {
        self.active.as_ref()
    }
}

// ─── Session task ────────────────────────────────────────────────────────────

struct Session {
    text: String,
    config: SessionConfig,
    notifier: StateNotifier,
    channel: Box<dyn ControlChannel>,
    /// Set once the channel's `Closed` event has been consumed; the channel
    /// is not polled afterwards.
    channel_ended: bool,
    appender: BufferAppender,
    monitor: BufferHealthMonitor,
    engines: Arc<dyn UtteranceEngineFactory>,
    transport: TransportMode,
    session_id: Option<String>,
    negotiation_in: Option<mpsc::UnboundedSender<serde_json::Value>>,
    negotiation_out: Option<mpsc::UnboundedReceiver<serde_json::Value>>,
    negotiation_opened: Option<oneshot::Receiver<mpsc::Receiver<ChunkFrame>>>,
    /// Peer chunk channel, once negotiation succeeds.
    peer_rx: Option<mpsc::Receiver<ChunkFrame>>,
    fallback: Option<FallbackAdapter>,
    fallback_engaged: bool,
    /// True once the first chunk has been appended.
    started: bool,
    /// True once the final chunk has been consumed and the sink finalized.
    stream_done: bool,
    user_paused: bool,
    /// Monitor-driven recovery pause, distinct from caller pause.
    auto_paused: bool,
    drain_at: Option<Instant>,
    state: PlaybackState,
}

impl Session {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let mut monitor_timer = time::interval(self.monitor.interval());
        monitor_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let channel_open = !self.channel_ended;
            let monitoring = self.monitoring();
            let drain_at = self.drain_at;

            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Pause) => {
                        self.handle_pause().await;
                        ControlFlow::Continue(())
                    }
                    Some(SessionCommand::Resume) => self.handle_resume().await,
                    Some(SessionCommand::Stop) | None => {
                        self.shutdown().await;
                        return;
                    }
                },
                event = self.channel.next_event(), if channel_open => {
                    self.handle_signaling(event).await
                }
                chunk = recv_opt(&mut self.peer_rx) => match chunk {
                    Some(chunk) => self.accept_chunk(chunk).await,
                    None => {
                        debug!("[Session] peer channel ended, continuing on signaling path");
                        self.peer_rx = None;
                        ControlFlow::Continue(())
                    }
                },
                payload = recv_unbounded_opt(&mut self.negotiation_out) => match payload {
                    Some(payload) => {
                        self.relay_handshake(payload).await;
                        ControlFlow::Continue(())
                    }
                    None => {
                        self.negotiation_out = None;
                        ControlFlow::Continue(())
                    }
                },
                opened = opened_opt(&mut self.negotiation_opened) => {
                    self.negotiation_opened = None;
                    match opened {
                        Ok(rx) => {
                            info!("[Session] peer channel active for chunk delivery");
                            self.peer_rx = Some(rx);
                        }
                        Err(_) => {
                            debug!("[Session] negotiation degraded to signaling-only");
                        }
                    }
                    ControlFlow::Continue(())
                }
                event = fallback_event_opt(&mut self.fallback) => {
                    self.handle_fallback_event(event)
                }
                () = sleep_opt(drain_at) => self.drain_step().await,
                _ = monitor_timer.tick(), if monitoring => self.monitor_step().await,
            };

            if step.is_break() {
                self.teardown().await;
                return;
            }
        }
    }

    fn monitoring(&self) -> bool {
        self.started && self.fallback.is_none() && !self.user_paused
    }

    // ── Signaling ──

    async fn handle_signaling(&mut self, event: Option<SignalingEvent>) -> ControlFlow<()> {
        match event {
            Some(SignalingEvent::Message(message)) => self.handle_message(message).await,
            Some(SignalingEvent::Closed { clean, reason }) => {
                self.channel_ended = true;
                if clean && self.stream_done {
                    debug!("[Session] channel closed after stream completion");
                    return ControlFlow::Continue(());
                }
                self.remote_failure(FablecastError::ChannelLost(reason)).await
            }
            None => {
                self.channel_ended = true;
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) -> ControlFlow<()> {
        match message {
            ServerMessage::SessionEstablished { session_id } => {
                info!("[Session] established: {session_id}");
                self.session_id = Some(session_id.clone());
                let request = ClientMessage::GenerateSpeech {
                    text: self.text.clone(),
                    voice: self.config.voice.clone(),
                    speed: self.config.speed,
                    chunk_size_hint: self.config.chunk_size_hint,
                    session_id,
                };
                if let Err(e) = self.channel.send(request).await {
                    return self.remote_failure(e).await;
                }
                if let TransportMode::SignalingWithPeer(factory) = &self.transport {
                    let channels = spawn_negotiation(
                        factory.create_connector(),
                        self.config.negotiation_timeout(),
                    );
                    self.negotiation_in = Some(channels.inbound);
                    self.negotiation_out = Some(channels.outbound);
                    self.negotiation_opened = Some(channels.opened);
                }
                ControlFlow::Continue(())
            }
            ServerMessage::NegotiationForward { payload } => {
                match &self.negotiation_in {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => debug!("[Session] discarding handshake payload, no negotiation"),
                }
                ControlFlow::Continue(())
            }
            ServerMessage::Chunk { data, is_final } | ServerMessage::TtsChunk { data, is_final } => {
                self.accept_chunk(ChunkFrame {
                    data,
                    is_final,
                })
                .await
            }
            ServerMessage::Status { message } => {
                info!("[Session] server status: {message}");
                ControlFlow::Continue(())
            }
            ServerMessage::Complete {} => self.accept_chunk(ChunkFrame::completion_signal()).await,
            ServerMessage::Error { message } => {
                self.remote_failure(FablecastError::Server(message)).await
            }
        }
    }

    async fn relay_handshake(&mut self, payload: serde_json::Value) {
        let target = self.session_id.clone().unwrap_or_default();
        let message = ClientMessage::NegotiationForward { target, payload };
        if let Err(e) = self.channel.send(message).await {
            // The reader side will surface the loss; negotiation stays silent.
            warn!("[Session] handshake relay failed: {e}");
        }
    }

    // ── Chunk pipeline ──

    async fn accept_chunk(&mut self, chunk: ChunkFrame) -> ControlFlow<()> {
        if self.appender.enqueue(chunk).is_none() {
            return ControlFlow::Continue(());
        }
        // Drain immediately when no write is pending; the delay cadence only
        // applies between successive queue drains.
        if self.drain_at.is_none() {
            return self.drain_step().await;
        }
        ControlFlow::Continue(())
    }

    async fn drain_step(&mut self) -> ControlFlow<()> {
        self.drain_at = None;
        match self.appender.drain_one().await {
            Ok(DrainOutcome::Appended) => {
                if !self.started {
                    self.started = true;
                    self.publish(PlaybackState::Speaking, None);
                }
                if self.appender.queue_len() > 0 {
                    self.drain_at = Some(Instant::now() + self.appender.next_delay());
                }
                ControlFlow::Continue(())
            }
            Ok(DrainOutcome::Retry(delay)) => {
                self.drain_at = Some(Instant::now() + delay);
                ControlFlow::Continue(())
            }
            Ok(DrainOutcome::Finalized) => {
                self.stream_done = true;
                if !self.started {
                    // Completion signal with no audio at all.
                    self.publish(PlaybackState::Idle, None);
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            Ok(DrainOutcome::Empty) => ControlFlow::Continue(()),
            Err(e) => self.remote_failure(FablecastError::Sink(e.to_string())).await,
        }
    }

    async fn monitor_step(&mut self) -> ControlFlow<()> {
        let window = self.appender.sink().buffered_window_secs();

        if self.stream_done {
            // No more data is coming. A recovery target above the remaining
            // window would never be met, so cut recovery short and play out
            // whatever is buffered.
            if self.auto_paused {
                self.monitor.end_recovery();
                self.appender.sink_mut().resume().await;
                self.auto_paused = false;
                self.publish(PlaybackState::Speaking, None);
                return ControlFlow::Continue(());
            }
            if self.appender.sink().is_finalized() && window <= f64::EPSILON {
                info!("[Session] stream played to completion");
                self.publish(PlaybackState::Idle, None);
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(());
        }

        let playing = self.state == PlaybackState::Speaking;
        match self.monitor.tick(window, playing) {
            MonitorAction::PauseAndRecover { resume_target } => {
                debug!("[Session] monitor pause, recovering to {resume_target:.2}s");
                self.appender.sink_mut().pause().await;
                self.auto_paused = true;
                self.publish(PlaybackState::Paused, None);
            }
            MonitorAction::Resume => {
                if self.auto_paused {
                    self.appender.sink_mut().resume().await;
                    self.auto_paused = false;
                    self.publish(PlaybackState::Speaking, None);
                }
            }
            MonitorAction::None => {}
        }
        ControlFlow::Continue(())
    }

    // ── Pause / resume ──

    async fn handle_pause(&mut self) {
        if self.state == PlaybackState::Paused && self.auto_paused {
            // Latch over the monitor's recovery pause so a later recovery
            // does not restart audio against the caller's wishes.
            self.user_paused = true;
            return;
        }
        if self.state != PlaybackState::Speaking {
            return;
        }
        self.user_paused = true;
        if let Some(fallback) = &mut self.fallback {
            fallback.pause().await;
        } else if !self.auto_paused {
            self.appender.sink_mut().pause().await;
        }
        self.publish(PlaybackState::Paused, None);
    }

    async fn handle_resume(&mut self) -> ControlFlow<()> {
        if !self.user_paused {
            return ControlFlow::Continue(());
        }
        self.user_paused = false;
        if let Some(fallback) = &mut self.fallback {
            if let Err(e) = fallback.resume().await {
                self.publish_error(&e);
                return ControlFlow::Break(());
            }
        } else if self.auto_paused {
            // The monitor paused underneath the caller; let recovery decide
            // when audio actually restarts.
            return ControlFlow::Continue(());
        } else {
            self.appender.sink_mut().resume().await;
        }
        self.publish(PlaybackState::Speaking, None);
        ControlFlow::Continue(())
    }

    // ── Failure and fallback ──

    async fn remote_failure(&mut self, error: FablecastError) -> ControlFlow<()> {
        if self.fallback_engaged {
            // The remote path is already abandoned; nothing more to do.
            debug!("[Session] ignoring remote failure after fallback: {error}");
            return ControlFlow::Continue(());
        }
        warn!("[Session] remote path failed: {error}");
        self.publish_error(&error);
        self.engage_fallback().await
    }

    async fn engage_fallback(&mut self) -> ControlFlow<()> {
        self.fallback_engaged = true;

        // Tear down the remote path before the local engine takes over.
        self.drain_at = None;
        self.appender.clear_queue();
        self.appender.sink_mut().close().await;
        self.channel.close().await;
        self.channel_ended = true;
        self.negotiation_in = None;
        self.negotiation_out = None;
        self.negotiation_opened = None;
        self.peer_rx = None;
        self.auto_paused = false;

        let mut adapter = FallbackAdapter::new(self.engines.create_engine());
        match adapter.speak(&self.text).await {
            Ok(()) => {
                info!("[Session] fallback engine engaged");
                self.fallback = Some(adapter);
                self.publish(PlaybackState::Speaking, None);
                ControlFlow::Continue(())
            }
            Err(e) => {
                warn!("[Session] fallback engine failed to start: {e}");
                self.publish_error(&e);
                ControlFlow::Break(())
            }
        }
    }

    fn handle_fallback_event(&mut self, event: Option<UtteranceEvent>) -> ControlFlow<()> {
        match event {
            Some(UtteranceEvent::Boundary { .. }) => {
                // char_index is already tracked by the adapter; re-publish so
                // observers see progress.
                self.publish(PlaybackState::Speaking, None);
                ControlFlow::Continue(())
            }
            Some(UtteranceEvent::Finished) => {
                info!("[Session] fallback utterance finished");
                self.publish(PlaybackState::Idle, None);
                ControlFlow::Break(())
            }
            Some(UtteranceEvent::Failed { message }) => {
                self.publish_error(&FablecastError::Engine(message));
                ControlFlow::Break(())
            }
            None => {
                warn!("[Session] fallback engine went away mid-utterance");
                self.publish_error(&FablecastError::Engine("engine stopped".to_string()));
                ControlFlow::Break(())
            }
        }
    }

    // ── Lifecycle ──

    /// Caller-initiated stop: release everything and publish `Stopped`.
    async fn shutdown(&mut self) {
        self.teardown().await;
        self.publish(PlaybackState::Stopped, None);
    }

    /// Releases channel, sink, queue and timers without publishing.
    async fn teardown(&mut self) {
        self.drain_at = None;
        self.appender.clear_queue();
        self.appender.sink_mut().close().await;
        self.channel.close().await;
        self.negotiation_in = None;
        self.negotiation_out = None;
        self.negotiation_opened = None;
        self.peer_rx = None;
        if let Some(fallback) = &mut self.fallback {
            fallback.stop().await;
        }
    }

    fn publish(&mut self, state: PlaybackState, reason: Option<String>) {
        let mut snapshot = StateSnapshot::of(state);
        snapshot.reason = reason;
        self.publish_snapshot(snapshot);
    }

    fn publish_error(&mut self, error: &FablecastError) {
        self.publish_snapshot(
            StateSnapshot::of(PlaybackState::Error)
                .with_reason(error.to_string())
                .with_code(error.code()),
        );
    }

    fn publish_snapshot(&mut self, mut snapshot: StateSnapshot) {
        self.state = snapshot.state;
        if let Some(fallback) = &self.fallback {
            snapshot.char_index = Some(fallback.char_index());
        } else if self.started {
            snapshot.position_secs = Some(self.appender.sink().position_secs());
        }
        self.notifier.publish(snapshot);
    }
}

// ─── Select helpers ──────────────────────────────────────────────────────────

/// Receives from an optional channel, pending forever when absent so it can
/// sit in a `select!` arm without a guard.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_unbounded_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn opened_opt<T>(rx: &mut Option<oneshot::Receiver<T>>) -> Result<T, oneshot::error::RecvError> {
    match rx {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Waits for the next fallback event while an utterance is in flight.
async fn fallback_event_opt(fallback: &mut Option<FallbackAdapter>) -> Option<UtteranceEvent> {
    match fallback {
        Some(adapter) if adapter.is_speaking() => adapter.next_event().await,
        _ => std::future::pending().await,
    }
}
