//! Control-channel wire protocol.
//!
//! Messages are JSON objects tagged by a `type` field. Audio chunk payloads
//! travel base64-encoded inside the JSON envelope; they are decoded to
//! [`Bytes`] at the protocol boundary so the rest of the pipeline deals in
//! opaque binary.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One audio fragment as delivered by a transport.
///
/// Chunks have no identity beyond arrival order. A zero-length chunk with
/// `is_final` set is a valid completion signal carrying no audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    /// Opaque compressed audio payload.
    pub data: Bytes,
    /// Whether this is the last chunk of the stream.
    pub is_final: bool,
}

impl ChunkFrame {
    /// Creates a non-final chunk.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_final: false,
        }
    }

    /// Creates a final chunk.
    #[must_use]
    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_final: true,
        }
    }

    /// An empty final chunk: pure completion signal, no audio payload.
    #[must_use]
    pub fn completion_signal() -> Self {
        Self::last(Bytes::new())
    }
}

/// Inbound control-channel message envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The server accepted the connection and assigned a session id.
    #[serde(rename_all = "camelCase")]
    SessionEstablished { session_id: String },

    /// Opaque peer-handshake payload relayed from the remote end.
    NegotiationForward { payload: serde_json::Value },

    /// Audio chunk delivery (generic variant).
    #[serde(rename_all = "camelCase")]
    Chunk {
        #[serde(default, with = "base64_bytes")]
        data: Bytes,
        #[serde(default)]
        is_final: bool,
    },

    /// Audio chunk delivery (speech-synthesis variant).
    #[serde(rename_all = "camelCase")]
    TtsChunk {
        #[serde(default, with = "base64_bytes")]
        data: Bytes,
        #[serde(default)]
        is_final: bool,
    },

    /// Human-readable progress note from the server.
    Status { message: String },

    /// The server finished producing the stream.
    Complete {},

    /// The server failed this session.
    Error { message: String },
}

/// Outbound control-channel message envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Request speech generation for a text.
    #[serde(rename_all = "camelCase")]
    GenerateSpeech {
        text: String,
        voice: String,
        speed: f32,
        chunk_size_hint: usize,
        session_id: String,
    },

    /// Relay an opaque peer-handshake payload to the remote end.
    NegotiationForward {
        target: String,
        payload: serde_json::Value,
    },
}

/// Base64 (de)serialization for binary chunk payloads inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tts_chunk_delivery() {
        // "abc" base64-encoded
        let json = r#"{"type":"ttsChunk","data":"YWJj","isFinal":true}"#;
        let msg: ServerMessage = serde_json::from_str(json).expect("valid message");
        match msg {
            ServerMessage::TtsChunk { data, is_final } => {
                assert_eq!(&data[..], b"abc");
                assert!(is_final);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn empty_final_tts_chunk_is_a_completion_signal() {
        let json = r#"{"type":"ttsChunk","data":"","isFinal":true}"#;
        let msg: ServerMessage = serde_json::from_str(json).expect("valid message");
        match msg {
            ServerMessage::TtsChunk { data, is_final } => {
                assert!(data.is_empty());
                assert!(is_final);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn generate_speech_uses_camel_case_fields() {
        let msg = ClientMessage::GenerateSpeech {
            text: "once upon a time".into(),
            voice: "alloy".into(),
            speed: 1.0,
            chunk_size_hint: 1024,
            session_id: "s-1".into(),
        };
        let json = serde_json::to_value(&msg).expect("serializable");
        assert_eq!(json["type"], "generateSpeech");
        assert_eq!(json["chunkSizeHint"], 1024);
        assert_eq!(json["sessionId"], "s-1");
    }

    #[test]
    fn session_established_carries_session_id() {
        let json = r#"{"type":"sessionEstablished","sessionId":"abc-123"}"#;
        let msg: ServerMessage = serde_json::from_str(json).expect("valid message");
        match msg {
            ServerMessage::SessionEstablished { session_id } => assert_eq!(session_id, "abc-123"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
