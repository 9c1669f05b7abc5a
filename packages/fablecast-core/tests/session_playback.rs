//! End-to-end session scenarios against scripted channel, sink and engine.
//!
//! All tests run with a paused clock; drain and monitor timers advance via
//! tokio's auto-advance whenever the test awaits, so the scenarios are
//! deterministic regardless of wall time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use fablecast_core::config::SessionConfig;
use fablecast_core::error::SinkWriteError;
use fablecast_core::events::{PlaybackState, StateSnapshot};
use fablecast_core::fallback::UtteranceEvent;
use fablecast_core::protocol::{ChunkFrame, ClientMessage, ServerMessage};
use fablecast_core::session::SpeechController;
use fablecast_core::testing::{
    FakeChannelFactory, FakeChannelHandle, ScriptedEngineFactory, ScriptedPeerFactory,
    SimSinkFactory,
};
use fablecast_core::transport::TransportMode;

struct Harness {
    controller: SpeechController,
    channels: Arc<FakeChannelFactory>,
    sinks: Arc<SimSinkFactory>,
    engines: Arc<ScriptedEngineFactory>,
}

fn harness_with_transport(transport: TransportMode) -> Harness {
    let channels = Arc::new(FakeChannelFactory::new());
    let sinks = Arc::new(SimSinkFactory::new(1.0));
    let engines = Arc::new(ScriptedEngineFactory::new());
    let controller = SpeechController::new(
        Arc::clone(&channels) as _,
        Arc::clone(&sinks) as _,
        Arc::clone(&engines) as _,
        transport,
        SessionConfig::default(),
    )
    .expect("valid config");
    Harness {
        controller,
        channels,
        sinks,
        engines,
    }
}

fn harness() -> Harness {
    harness_with_transport(TransportMode::SignalingOnly)
}

/// Lets the session task and its timers run (auto-advances the paused clock).
async fn settle() {
    time::sleep(Duration::from_millis(250)).await;
}

/// Waits for the next published snapshot.
async fn next_state(rx: &mut broadcast::Receiver<StateSnapshot>) -> StateSnapshot {
    time::timeout(Duration::from_secs(300), rx.recv())
        .await
        .expect("session published no state in time")
        .expect("state channel closed")
}

/// Waits for the next snapshot with the given state, skipping others.
async fn wait_for(
    rx: &mut broadcast::Receiver<StateSnapshot>,
    state: PlaybackState,
) -> StateSnapshot {
    loop {
        let snapshot = next_state(rx).await;
        if snapshot.state == state {
            return snapshot;
        }
    }
}

fn chunk_msg(data: &[u8], is_final: bool) -> ServerMessage {
    ServerMessage::TtsChunk {
        data: data.to_vec().into(),
        is_final,
    }
}

/// Boots a session up to the established state and returns its handle pair.
async fn established(
    h: &mut Harness,
    text: &str,
) -> (
    fablecast_core::session::SessionHandle,
    FakeChannelHandle,
    broadcast::Receiver<StateSnapshot>,
) {
    let channel = h.channels.arm();
    let handle = h.controller.speak(text);
    let rx = handle.subscribe();
    channel.push_message(ServerMessage::SessionEstablished {
        session_id: "s-1".to_string(),
    });
    settle().await;
    (handle, channel, rx)
}

// ─── Happy path ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn five_chunks_play_in_order_and_complete() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "a short story").await;

    // The generation request went out with the assigned session id.
    let sent = channel.sent();
    assert!(matches!(
        &sent[0],
        ClientMessage::GenerateSpeech { session_id, voice, .. }
            if session_id == "s-1" && voice == "alloy"
    ));

    for (i, data) in [b"c1", b"c2", b"c3", b"c4", b"c5"].iter().enumerate() {
        channel.push_message(chunk_msg(*data, i == 4));
    }

    let speaking = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert!(speaking.is_speaking);

    let sink = h.sinks.last_handle().expect("sink created");
    while sink.appended().len() < 5 {
        settle().await;
    }
    assert_eq!(
        sink.appended(),
        vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec(), b"c4".to_vec(), b"c5".to_vec()]
    );
    assert!(sink.is_finalized());

    // Play out the buffer; the monitor detects natural end.
    sink.drain_to_end();
    let idle = wait_for(&mut rx, PlaybackState::Idle).await;
    assert!(!idle.is_speaking);
    assert!(idle.state.is_terminal());
    assert_eq!(h.engines.created(), 0, "no fallback on the happy path");
}

#[tokio::test(start_paused = true)]
async fn happy_path_never_pauses_or_errors() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    for (i, data) in [b"c1", b"c2", b"c3", b"c4", b"c5"].iter().enumerate() {
        channel.push_message(chunk_msg(*data, i == 4));
    }
    let sink = loop {
        if let Some(sink) = h.sinks.last_handle() {
            break sink;
        }
        settle().await;
    };
    while sink.appended().len() < 5 {
        settle().await;
    }
    sink.drain_to_end();

    let mut seen = Vec::new();
    loop {
        let snapshot = next_state(&mut rx).await;
        seen.push(snapshot.state);
        if snapshot.state == PlaybackState::Idle {
            break;
        }
    }
    assert_eq!(seen, vec![PlaybackState::Speaking, PlaybackState::Idle]);
}

#[tokio::test(start_paused = true)]
async fn empty_final_chunk_is_a_valid_completion() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;

    channel.push_message(chunk_msg(b"", true));
    let sink = h.sinks.last_handle().expect("sink created");
    while !sink.is_finalized() {
        settle().await;
    }
    assert_eq!(sink.appended(), vec![b"c1".to_vec()], "empty final appends no audio");

    sink.drain_to_end();
    wait_for(&mut rx, PlaybackState::Idle).await;
}

// ─── Buffer health ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn critical_underrun_auto_pauses_then_resumes() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;
    let sink = h.sinks.last_handle().expect("sink created");

    // One 1.0s chunk buffered; playing into it past the critical line
    // (base 1.5s / 2) starves the buffer.
    sink.set_position(0.9);
    let paused = wait_for(&mut rx, PlaybackState::Paused).await;
    assert!(paused.is_paused);
    assert!(sink.is_paused());

    // Refill well past the recovery target.
    for data in [b"c2", b"c3", b"c4", b"c5", b"c6"] {
        channel.push_message(chunk_msg(data, false));
    }
    let resumed = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert!(resumed.is_speaking);
    while sink.is_paused() {
        settle().await;
    }
}

#[tokio::test(start_paused = true)]
async fn recovery_pause_before_final_chunk_still_completes() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;
    let sink = h.sinks.last_handle().expect("sink created");

    // Starve the buffer so the monitor pauses for recovery.
    sink.set_position(0.9);
    wait_for(&mut rx, PlaybackState::Paused).await;
    assert!(sink.is_paused());

    // Only one short chunk remains; the recovery target can never be
    // reached, so playback must play out the buffer and finish anyway.
    channel.push_message(chunk_msg(b"c2", true));
    let resumed = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert!(resumed.is_speaking);
    while sink.is_paused() {
        settle().await;
    }

    sink.drain_to_end();
    wait_for(&mut rx, PlaybackState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn user_pause_during_recovery_is_not_overridden() {
    let mut h = harness();
    let (handle, channel, mut rx) = established(&mut h, "story").await;

    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;
    let sink = h.sinks.last_handle().expect("sink created");

    sink.set_position(0.9);
    wait_for(&mut rx, PlaybackState::Paused).await;

    // Caller pauses while the monitor holds its recovery pause.
    handle.pause();
    settle().await;

    // Refill well past the recovery target; recovery must not restart
    // audio over the caller's pause.
    for data in [b"c2", b"c3", b"c4", b"c5", b"c6"] {
        channel.push_message(chunk_msg(data, false));
    }
    settle().await;
    assert!(sink.is_paused());
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    handle.resume();
    wait_for(&mut rx, PlaybackState::Speaking).await;
    while sink.is_paused() {
        settle().await;
    }
}

// ─── Caller pause / resume ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pause_resume_keeps_exact_position() {
    let mut h = harness();
    let (handle, channel, mut rx) = established(&mut h, "story").await;

    channel.push_message(chunk_msg(b"c1", false));
    channel.push_message(chunk_msg(b"c2", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;
    let sink = h.sinks.last_handle().expect("sink created");
    sink.set_position(0.4);

    handle.pause();
    let paused = wait_for(&mut rx, PlaybackState::Paused).await;
    assert_eq!(paused.position_secs, Some(0.4));
    assert!(sink.is_paused());

    handle.resume();
    let resumed = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert_eq!(resumed.position_secs, Some(0.4), "no audio skipped or replayed");
    assert!(!sink.is_paused());
}

// ─── Stop ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let mut h = harness();
    let (handle, channel, mut rx) = established(&mut h, "story").await;

    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;

    handle.stop();
    let stopped = wait_for(&mut rx, PlaybackState::Stopped).await;
    assert!(!stopped.is_speaking);
    settle().await;
    assert!(handle.is_finished());
    assert!(channel.is_closed());

    handle.stop();
    settle().await;
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

// ─── Transient sink errors ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn busy_sink_retries_without_reordering() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "story").await;
    let sink = h.sinks.last_handle().expect("sink created");
    sink.script_appends([Err(SinkWriteError::Busy), Ok(()), Err(SinkWriteError::Busy)]);

    for (i, data) in [b"c1", b"c2", b"c3"].iter().enumerate() {
        channel.push_message(chunk_msg(*data, i == 2));
    }

    wait_for(&mut rx, PlaybackState::Speaking).await;
    while sink.appended().len() < 3 {
        settle().await;
    }
    assert_eq!(
        sink.appended(),
        vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()],
        "retried chunks keep their place"
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_sink_error_engages_fallback() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "the story text").await;
    let sink = h.sinks.last_handle().expect("sink created");
    sink.script_appends([Err(SinkWriteError::Unsupported("bad codec".to_string()))]);

    channel.push_message(chunk_msg(b"c1", false));

    let error = wait_for(&mut rx, PlaybackState::Error).await;
    assert_eq!(error.code, Some("sink_error"));
    assert!(error.reason.as_deref().unwrap_or_default().contains("bad codec"));

    let speaking = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert_eq!(speaking.char_index, Some(0));
    let engine = h.engines.last_handle().expect("engine created");
    assert_eq!(engine.spoken(), vec!["the story text".to_string()]);
}

// ─── Fallback ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn abnormal_close_engages_fallback_and_speaks() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "once upon a time").await;

    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;

    channel.drop_abnormally("socket reset");

    let error = wait_for(&mut rx, PlaybackState::Error).await;
    assert_eq!(error.code, Some("channel_lost"));
    assert!(error
        .reason
        .as_deref()
        .unwrap_or_default()
        .contains("socket reset"));

    // Fallback takes over and the session speaks again.
    let speaking = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert_eq!(speaking.char_index, Some(0));
    assert_eq!(h.engines.created(), 1);

    let engine = h.engines.last_handle().expect("engine created");
    engine.emit(UtteranceEvent::Finished);
    wait_for(&mut rx, PlaybackState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn fallback_engages_at_most_once() {
    let mut h = harness();
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    // Two server failures back to back.
    channel.push_message(ServerMessage::Error {
        message: "generation failed".to_string(),
    });
    channel.push_message(ServerMessage::Error {
        message: "generation failed again".to_string(),
    });

    let error = wait_for(&mut rx, PlaybackState::Error).await;
    assert_eq!(error.code, Some("server_error"));
    wait_for(&mut rx, PlaybackState::Speaking).await;
    settle().await;
    assert_eq!(h.engines.created(), 1, "second failure must not re-engage");
}

#[tokio::test(start_paused = true)]
async fn fallback_pause_resume_respeaks_from_boundary() {
    let mut h = harness();
    let (handle, channel, mut rx) = established(&mut h, "once upon a time").await;

    channel.push_message(ServerMessage::Error {
        message: "generation failed".to_string(),
    });
    wait_for(&mut rx, PlaybackState::Error).await;
    wait_for(&mut rx, PlaybackState::Speaking).await;
    let engine = h.engines.last_handle().expect("engine created");

    engine.emit(UtteranceEvent::Boundary { char_index: 5 });
    let progressed = wait_for(&mut rx, PlaybackState::Speaking).await;
    assert_eq!(progressed.char_index, Some(5));

    handle.pause();
    let paused = wait_for(&mut rx, PlaybackState::Paused).await;
    assert_eq!(paused.char_index, Some(5));
    assert_eq!(engine.stop_count(), 1);

    handle.resume();
    wait_for(&mut rx, PlaybackState::Speaking).await;
    settle().await;
    assert_eq!(
        engine.spoken(),
        vec!["once upon a time".to_string(), "upon a time".to_string()]
    );
}

// ─── Connectivity ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_failure_surfaces_error_without_fallback() {
    let mut h = harness();
    // No channel armed: connect fails.
    let handle = h.controller.speak("story");
    let mut rx = handle.subscribe();

    let error = wait_for(&mut rx, PlaybackState::Error).await;
    assert!(error.reason.is_some());
    assert_eq!(error.code, Some("connect_failed"));
    settle().await;
    assert_eq!(h.engines.created(), 0, "no playback was in flight");
    assert!(handle.is_finished());
}

#[tokio::test(start_paused = true)]
async fn new_request_stops_previous_session() {
    let mut h = harness();
    let (first, channel, mut rx) = established(&mut h, "first").await;
    channel.push_message(chunk_msg(b"c1", false));
    wait_for(&mut rx, PlaybackState::Speaking).await;

    h.channels.arm();
    let _second = h.controller.speak("second");
    wait_for(&mut rx, PlaybackState::Stopped).await;
    settle().await;
    assert!(first.is_finished());
}

// ─── Peer transport ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn peer_channel_delivers_chunks_after_handshake() {
    let peers = Arc::new(ScriptedPeerFactory::new());
    let mut h = harness_with_transport(TransportMode::SignalingWithPeer(Arc::clone(&peers) as _));
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    // The session relayed its offer out through the signaling channel.
    let offer_relayed = channel.sent().iter().any(|m| {
        matches!(m, ClientMessage::NegotiationForward { payload, .. }
            if payload["type"] == "offer")
    });
    assert!(offer_relayed, "offer should be relayed after establishment");

    // Remote answers; the scripted connector opens its channel.
    channel.push_message(ServerMessage::NegotiationForward {
        payload: serde_json::json!({"type": "answer", "sdp": "remote"}),
    });
    settle().await;

    let peer = peers.last_handle().expect("connector created");
    assert_eq!(peer.answers().len(), 1);

    peer.send_chunk(ChunkFrame::new(&b"p1"[..])).await;
    peer.send_chunk(ChunkFrame::last(&b"p2"[..])).await;

    wait_for(&mut rx, PlaybackState::Speaking).await;
    let sink = h.sinks.last_handle().expect("sink created");
    while sink.appended().len() < 2 {
        settle().await;
    }
    assert_eq!(sink.appended(), vec![b"p1".to_vec(), b"p2".to_vec()]);

    sink.drain_to_end();
    wait_for(&mut rx, PlaybackState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn failed_negotiation_degrades_to_signaling_silently() {
    let peers = Arc::new(ScriptedPeerFactory::new());
    let mut h = harness_with_transport(TransportMode::SignalingWithPeer(Arc::clone(&peers) as _));
    let (_handle, channel, mut rx) = established(&mut h, "story").await;

    // Never answer; the handshake times out and chunks keep flowing over
    // the signaling channel.
    for (i, data) in [b"c1", b"c2"].iter().enumerate() {
        channel.push_message(chunk_msg(*data, i == 1));
    }
    wait_for(&mut rx, PlaybackState::Speaking).await;

    let sink = h.sinks.last_handle().expect("sink created");
    while sink.appended().len() < 2 {
        settle().await;
    }
    sink.drain_to_end();
    let idle = wait_for(&mut rx, PlaybackState::Idle).await;
    assert!(idle.reason.is_none(), "degradation is not surfaced");
}
