//! Fablecast Player - headless streaming speech playback client.
//!
//! Connects to a speech generation server, streams the synthesized audio for
//! a text through the adaptive playback pipeline, and reports state
//! transitions on the terminal. Without a reachable server the local console
//! fallback engine speaks the text instead, which makes the binary handy for
//! trying the session lifecycle end to end.

mod config;
mod sink;
mod speech;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fablecast_core::{SpeechController, TransportMode, WsChannelFactory};
use tokio::signal;

use crate::config::PlayerConfig;
use crate::sink::PacingSinkFactory;
use crate::speech::ConsoleEngineFactory;

/// Fablecast Player - stream synthesized speech for a text.
#[derive(Parser, Debug)]
#[command(name = "fablecast-player")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text to speak.
    text: String,

    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "FABLECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Server WebSocket URL (overrides config file).
    #[arg(short, long, env = "FABLECAST_SERVER_URL")]
    server_url: Option<String>,

    /// Voice to request (overrides config file).
    #[arg(long)]
    voice: Option<String>,

    /// Speed multiplier to request (overrides config file).
    #[arg(long)]
    speed: Option<f32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Fablecast Player v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        PlayerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(voice) = args.voice {
        config.voice = voice;
    }
    if let Some(speed) = args.speed {
        config.speed = speed;
    }

    log::info!(
        "Configuration: server={}, voice={}, speed={}",
        config.server_url,
        config.voice,
        config.speed
    );

    let session_config = config.to_session_config();
    let channels = Arc::new(WsChannelFactory::new(
        config.server_url.clone(),
        session_config.connect_timeout(),
    ));
    let sinks = Arc::new(PacingSinkFactory::new(config.playback_bytes_per_sec));
    let engines = Arc::new(ConsoleEngineFactory::new(config.fallback_words_per_min));

    let mut controller = SpeechController::new(
        channels,
        sinks,
        engines,
        TransportMode::SignalingOnly,
        session_config,
    )
    .context("Failed to create controller")?;

    let handle = controller.speak(args.text);
    let mut states = handle.subscribe();

    loop {
        tokio::select! {
            () = shutdown_signal() => {
                log::info!("Shutdown signal received, stopping playback");
                controller.stop();
            }
            state = states.recv() => match state {
                Ok(snapshot) => {
                    log::info!(
                        "state={:?} speaking={} paused={} position={} reason={}",
                        snapshot.state,
                        snapshot.is_speaking,
                        snapshot.is_paused,
                        snapshot
                            .position_secs
                            .map_or_else(|| "-".to_string(), |p| format!("{p:.2}s")),
                        snapshot.reason.as_deref().unwrap_or("-"),
                    );
                    // The notifier stays alive as long as we hold the handle,
                    // so the channel never closes on its own; a terminal
                    // state is the end of the session.
                    if snapshot.state.is_terminal() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {skipped} state updates");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            },
        }
    }

    log::info!("Session finished");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
