//! Player configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Player configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// WebSocket URL of the speech generation server.
    /// Override: `FABLECAST_SERVER_URL`
    pub server_url: String,

    /// Voice requested from the server.
    /// Override: `FABLECAST_VOICE`
    pub voice: String,

    /// Playback speed multiplier requested from the server.
    /// Override: `FABLECAST_SPEED`
    pub speed: f32,

    /// Preferred chunk size in bytes hinted to the server.
    pub chunk_size_hint: usize,

    /// Simulated playback rate of the pacing sink, in bytes per second of
    /// received audio.
    pub playback_bytes_per_sec: f64,

    /// Speaking rate of the console fallback engine, words per minute.
    pub fallback_words_per_min: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:49500/ws".to_string(),
            voice: fablecast_core::protocol_constants::DEFAULT_VOICE.to_string(),
            speed: fablecast_core::protocol_constants::DEFAULT_SPEED,
            chunk_size_hint: fablecast_core::protocol_constants::DEFAULT_CHUNK_SIZE_HINT,
            playback_bytes_per_sec: 16_000.0,
            fallback_words_per_min: 160,
        }
    }
}

impl PlayerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FABLECAST_SERVER_URL") {
            self.server_url = val;
        }

        if let Ok(val) = std::env::var("FABLECAST_VOICE") {
            self.voice = val;
        }

        if let Ok(val) = std::env::var("FABLECAST_SPEED") {
            if let Ok(speed) = val.parse() {
                self.speed = speed;
            }
        }
    }

    /// Converts to fablecast-core's session configuration.
    pub fn to_session_config(&self) -> fablecast_core::SessionConfig {
        fablecast_core::SessionConfig {
            voice: self.voice.clone(),
            speed: self.speed,
            chunk_size_hint: self.chunk_size_hint,
            ..Default::default()
        }
    }
}
