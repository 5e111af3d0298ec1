//! Streaming session transport for the FalconX live API
//!
//! This module owns the WebSocket leg of a conversation: connecting,
//! the setup handshake, sending microphone audio, and surfacing inbound
//! envelopes to the connection manager in arrival order.
//!
//! # Session Flow
//!
//! ```text
//! FrameQueue ──▶ LiveSession::send_audio ──▶ WebSocket ──▶ service
//!                                              │
//!                                              ▼
//!                                    inbound envelope channel
//!                            (audio chunks, transcript deltas, errors)
//! ```

pub mod client;
pub mod protocol;

pub use client::LiveSession;
pub use protocol::{ClientMessage, ServerMessage, SessionConfig};

/// Errors that can occur on the streaming session
#[derive(Debug, Clone)]
pub enum StreamingError {
    /// FalconX API key not configured
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Authentication with the service failed
    AuthenticationFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send audio data
    SendFailed(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "FalconX API key not configured. Set FALCONX_API_KEY environment variable."
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to FalconX live API: {}", e)
            }
            StreamingError::AuthenticationFailed(e) => {
                write!(f, "Authentication failed: {}", e)
            }
            StreamingError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            StreamingError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            StreamingError::SendFailed(e) => {
                write!(f, "Failed to send audio: {}", e)
            }
        }
    }
}

impl std::error::Error for StreamingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("FALCONX_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::AuthenticationFailed("invalid key".to_string());
        assert!(err.to_string().contains("invalid key"));
    }
}
