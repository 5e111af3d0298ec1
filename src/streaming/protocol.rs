//! FalconX live-conversation wire protocol
//!
//! This module defines the JSON message types exchanged with the FalconX
//! speech service over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the live endpoint
//! 2. Receive `session.created` event
//! 3. Send `session.setup` to agree audio formats and sample rates
//! 4. Stream microphone audio via `input_audio.append`
//! 5. Receive synthesized audio via `response.audio.delta` and incremental
//!    transcript text via `transcript.delta` for both roles

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::transcript::Role;

/// Default FalconX live endpoint
pub const LIVE_API_URL: &str = "wss://api.falconx.ai/v1/live";

/// Sample rate for outbound microphone audio (PCM16 mono)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate for inbound synthesized audio (PCM16 mono)
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Session configuration sent during setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Audio format for both directions - must be "pcm16"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<String>,

    /// Sample rate of audio the client will send
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_sample_rate_hz: Option<u32>,

    /// Sample rate of audio the service will send back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sample_rate_hz: Option<u32>,

    /// Output modalities requested from the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio_format: Some("pcm16".to_string()),
            input_sample_rate_hz: Some(INPUT_SAMPLE_RATE),
            output_sample_rate_hz: Some(OUTPUT_SAMPLE_RATE),
            modalities: Some(vec!["audio".to_string(), "text".to_string()]),
        }
    }
}

/// Session information returned by the service
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Unique session ID assigned by the service
    pub id: String,

    /// Model backing the conversation
    #[serde(default)]
    pub model: String,

    /// Active modalities
    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Error information from the service
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    /// Error type/code
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Audio payload that failed to decode into PCM16 samples
#[derive(Debug, Clone)]
pub struct AudioDecodeError(pub String);

impl std::fmt::Display for AudioDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to decode audio chunk: {}", self.0)
    }
}

impl std::error::Error for AudioDecodeError {}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the FalconX live API
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Configure the session after `session.created`
    #[serde(rename = "session.setup")]
    SessionSetup { session: SessionConfig },

    /// Append a frame of microphone audio
    #[serde(rename = "input_audio.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },
}

impl ClientMessage {
    /// Create a session setup message with the default audio configuration
    pub fn session_setup() -> Self {
        Self::SessionSetup {
            session: SessionConfig::default(),
        }
    }

    /// Create an audio append message from raw PCM16 samples
    pub fn audio_append(samples: &[i16]) -> Self {
        Self::AudioAppend {
            audio: encode_pcm16(samples),
        }
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// Messages received from the FalconX live API
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Session was created
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    /// Session setup was accepted
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    /// A chunk of synthesized speech
    #[serde(rename = "response.audio.delta")]
    AudioChunk {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },

    /// Incremental transcript text for one role
    #[serde(rename = "transcript.delta")]
    TranscriptDelta {
        role: Role,
        #[serde(default)]
        text: String,
        /// Set on the last delta of a turn
        #[serde(default)]
        turn_complete: bool,
    },

    /// An error occurred
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Catch-all for message types we don't handle.
    /// Prevents deserialization failures for unknown types.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Check if this is an error message
    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error { .. })
    }

    /// Extract session ID if this is a session created/updated message
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionCreated { session } => Some(&session.id),
            ServerMessage::SessionUpdated { session } => Some(&session.id),
            _ => None,
        }
    }
}

/// Encode PCM16 samples as base64 little-endian bytes
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(&bytes)
}

/// Decode a base64 audio payload into PCM16 samples
///
/// Fails on invalid base64 or an odd byte count. Callers are expected to
/// skip the offending chunk and continue.
pub fn decode_pcm16(audio: &str) -> Result<Vec<i16>, AudioDecodeError> {
    let bytes = STANDARD
        .decode(audio)
        .map_err(|e| AudioDecodeError(e.to_string()))?;

    if bytes.len() % 2 != 0 {
        return Err(AudioDecodeError(format!(
            "odd byte count: {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}
