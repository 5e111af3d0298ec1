//! FalconX live API WebSocket client
//!
//! Manages the WebSocket connection for one conversation session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, receive `session.created`, send setup
//! 2. `send_audio()` - Stream microphone frames (non-blocking)
//! 3. `take_incoming()` - Channel of inbound envelopes in arrival order
//! 4. `close()` - Clean shutdown
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s, 4s).
//! A session that drops mid-conversation is never reconnected silently; the
//! failure is surfaced and the caller decides whether to connect again.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage};
use super::StreamingError;

/// Connection timeout for the initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the session.created / session.updated handshake
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum retry attempts for the initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the inbound envelope channel
const INCOMING_CAPACITY: usize = 256;

/// Handle to an active live session
///
/// Owns the WebSocket write half and the background reader task; inbound
/// envelopes arrive on a single bounded channel in wire order.
pub struct LiveSession {
    write: futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    /// Channel receiver for inbound envelopes (fed by the reader task).
    /// Wrapped in Option so the manager can take it for its dispatch loop.
    incoming_rx: Option<mpsc::Receiver<ServerMessage>>,
    /// Session ID assigned by the service
    session_id: String,
    /// Reader task handle (aborted on close/drop)
    reader_task: tokio::task::JoinHandle<()>,
}

impl LiveSession {
    /// Connect to the FalconX live API
    ///
    /// Establishes the WebSocket (with retries), waits for
    /// `session.created`, sends the setup message, and waits for the
    /// `session.updated` acknowledgement.
    pub async fn connect(endpoint: &str, api_key: &str) -> Result<Self, StreamingError> {
        if api_key.is_empty() {
            return Err(StreamingError::MissingApiKey);
        }

        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying WebSocket connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(endpoint, api_key).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StreamingError::ConnectionFailed("Max retries exceeded".to_string())
        }))
    }

    /// Single connection attempt (no retries)
    async fn try_connect(endpoint: &str, api_key: &str) -> Result<Self, StreamingError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?,
        );

        log::info!("Connecting to FalconX live API...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, false, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, waiting for session.created...");

        let (write, mut read) = ws_stream.split();

        // Wait for session.created
        let session_id = timeout(SESSION_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::SessionCreated { session }) => {
                            log::info!("Session created: {}", session.id);
                            return Ok(session.id);
                        }
                        Ok(ServerMessage::Error { error }) => {
                            return Err(StreamingError::AuthenticationFailed(error.message));
                        }
                        Ok(_) => {
                            log::debug!("Ignoring message while waiting for session.created");
                        }
                        Err(e) => {
                            log::warn!("Failed to parse message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        return Err(StreamingError::Disconnected(
                            "Connection closed before session created".to_string(),
                        ));
                    }
                    Err(e) => {
                        return Err(StreamingError::ProtocolError(e.to_string()));
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            Err(StreamingError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Session creation timeout".to_string()))??;

        // Channel for inbound envelopes
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        // Background reader: forwards every parsed envelope in wire order
        let reader_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).await.is_err() {
                                log::debug!("Inbound channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            // One malformed message must not kill the stream
                            log::warn!("Failed to parse message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        log::warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            log::debug!("Reader task exiting");
        });

        let mut session = Self {
            write,
            incoming_rx: Some(incoming_rx),
            session_id,
            reader_task,
        };

        session.setup_session().await?;

        Ok(session)
    }

    /// Send the setup message and wait for acknowledgement
    async fn setup_session(&mut self) -> Result<(), StreamingError> {
        log::info!("Configuring session audio formats...");

        let setup_msg = ClientMessage::session_setup();
        self.send_message(&setup_msg).await?;

        let incoming_rx = self.incoming_rx.as_mut().ok_or_else(|| {
            StreamingError::ProtocolError("Inbound receiver already taken".to_string())
        })?;

        let deadline = tokio::time::Instant::now() + SESSION_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            match timeout(deadline - tokio::time::Instant::now(), incoming_rx.recv()).await {
                Ok(Some(ServerMessage::SessionUpdated { session })) => {
                    log::info!("Session configured: {:?}", session.modalities);
                    return Ok(());
                }
                Ok(Some(ServerMessage::Error { error })) => {
                    return Err(StreamingError::ProtocolError(error.message));
                }
                Ok(Some(_)) => {
                    // Other message, keep waiting
                }
                Ok(None) => {
                    return Err(StreamingError::Disconnected(
                        "Channel closed during setup".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(StreamingError::ConnectionFailed(
                        "Session setup timeout".to_string(),
                    ));
                }
            }
        }

        Err(StreamingError::ConnectionFailed(
            "Session setup timeout".to_string(),
        ))
    }

    /// Send a client message over the WebSocket
    async fn send_message(&mut self, msg: &ClientMessage) -> Result<(), StreamingError> {
        let json =
            serde_json::to_string(msg).map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))?;

        Ok(())
    }

    /// Send one frame of microphone audio (PCM16 mono at the agreed rate)
    pub async fn send_audio(&mut self, samples: &[i16]) -> Result<(), StreamingError> {
        let msg = ClientMessage::audio_append(samples);
        self.send_message(&msg).await
    }

    /// Take ownership of the inbound envelope receiver
    ///
    /// The connection manager consumes this from its single dispatch task
    /// so inbound events are processed strictly in arrival order.
    pub fn take_incoming(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.incoming_rx.take()
    }

    /// Session ID assigned by the service
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Gracefully close the session
    ///
    /// Sends a close frame and aborts the reader task.
    pub async fn close(mut self) {
        log::info!("Closing live session {}...", self.session_id);

        self.reader_task.abort();

        if let Err(e) = self.write.close().await {
            log::warn!("Error closing WebSocket: {}", e);
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        // Reader task must not outlive the session it belongs to
        self.reader_task.abort();
    }
}
