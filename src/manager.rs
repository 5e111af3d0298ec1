//! Connection manager for the live conversation
//!
//! Owns the session lifecycle end to end: device acquisition, the WebSocket
//! session, the outbound frame pump, inbound dispatch, transcript assembly,
//! and the analyser taps handed to the presentation layer.
//!
//! # Architecture
//!
//! ```text
//! microphone ─▶ capture thread ─▶ FrameQueue ─▶ outbound pump ─▶ session
//!                    │
//!                    ▼
//!               input AnalyserTap
//!
//! session ─▶ inbound dispatch (single consumer, arrival order)
//!                ├─▶ PlaybackHandle (audio chunks)     ─▶ output AnalyserTap
//!                └─▶ TranscriptAssembler (text deltas) ─▶ messages
//! ```
//!
//! Every task is tagged with the session's `Uuid`; events from a superseded
//! session are silently discarded, so a stale handler can never touch the
//! state of a newer session. Lifecycle transitions serialize behind one
//! async lock, which also makes a `connect()` racing an unfinished teardown
//! wait for it to complete.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    AnalyserTap, AudioCapture, AudioPlayback, CaptureHandle, FrameQueue, PlaybackHandle,
};
use crate::settings::{get_api_key, SessionSettings};
use crate::streaming::protocol::{decode_pcm16, ServerMessage};
use crate::streaming::LiveSession;
use crate::transcript::{ChatMessage, TranscriptAssembler};

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Sink for decoded inbound audio. The playback scheduler in production;
/// tests substitute a recorder.
pub(crate) trait PlaybackSink: Send + Sync {
    fn schedule(&self, samples: &[i16]);
}

impl PlaybackSink for PlaybackHandle {
    fn schedule(&self, samples: &[i16]) {
        self.enqueue(samples);
    }
}

/// Outcome of dispatching one inbound envelope
enum InboundOutcome {
    Continue,
    SessionFailed(String),
}

/// State visible to the presentation layer, shared with the session tasks.
struct Shared {
    state: Mutex<ConnectionState>,
    error: Mutex<Option<String>>,
    assembler: Mutex<TranscriptAssembler>,
    input_tap: Mutex<Option<Arc<AnalyserTap>>>,
    output_tap: Mutex<Option<Arc<AnalyserTap>>>,
    /// Identity of the live session; events tagged otherwise are stale
    current: Mutex<Option<Uuid>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            error: Mutex::new(None),
            assembler: Mutex::new(TranscriptAssembler::new()),
            input_tap: Mutex::new(None),
            output_tap: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn clear_error(&self) {
        *lock(&self.error) = None;
    }

    /// Transition to ERROR with a user-facing message.
    fn fail_with(&self, message: String) {
        *lock(&self.state) = ConnectionState::Error;
        *lock(&self.error) = Some(message);
    }

    fn set_current(&self, id: Option<Uuid>) {
        *lock(&self.current) = id;
    }

    fn is_current(&self, id: Uuid) -> bool {
        *lock(&self.current) == Some(id)
    }

    fn attach_taps(&self, input: Arc<AnalyserTap>, output: Arc<AnalyserTap>) {
        *lock(&self.input_tap) = Some(input);
        *lock(&self.output_tap) = Some(output);
    }

    fn detach_taps(&self) {
        *lock(&self.input_tap) = None;
        *lock(&self.output_tap) = None;
    }

    /// Apply one inbound envelope for `session`.
    ///
    /// Events from a superseded session are discarded without touching any
    /// state. Per-message faults (undecodable audio, unknown types) are
    /// logged and skipped; only a service error envelope ends the session.
    fn apply_inbound(
        &self,
        session: Uuid,
        playback: &dyn PlaybackSink,
        msg: ServerMessage,
    ) -> InboundOutcome {
        if !self.is_current(session) {
            log::debug!("Dropping event for superseded session {}", session);
            return InboundOutcome::Continue;
        }

        match msg {
            ServerMessage::AudioChunk { audio } => match decode_pcm16(&audio) {
                Ok(samples) => playback.schedule(&samples),
                Err(e) => {
                    // Skip the chunk; the cursor is untouched beyond its
                    // missing duration and playback continues
                    log::warn!("Skipping undecodable audio chunk: {}", e);
                }
            },
            ServerMessage::TranscriptDelta {
                role,
                text,
                turn_complete,
            } => {
                lock(&self.assembler).apply_delta(role, &text, turn_complete);
            }
            ServerMessage::Error { error } => {
                return InboundOutcome::SessionFailed(if error.message.is_empty() {
                    format!("Service error: {}", error.error_type)
                } else {
                    error.message
                });
            }
            ServerMessage::SessionCreated { .. } | ServerMessage::SessionUpdated { .. } => {
                log::debug!("Ignoring session acknowledgement mid-conversation");
            }
            ServerMessage::Unknown => {
                log::debug!("Ignoring unknown message type");
            }
        }

        InboundOutcome::Continue
    }
}

/// Everything owned by one live session.
struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
    capture: Arc<CaptureHandle>,
    playback: Arc<PlaybackHandle>,
    outbound_task: tokio::task::JoinHandle<()>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

/// Public contract of the voice-conversation core.
///
/// One manager instance owns at most one live session at a time. Everything
/// the presentation layer renders (connection state, messages, analyser
/// taps, the current error) is read through this type.
pub struct ConnectionManager {
    settings: SessionSettings,
    shared: Arc<Shared>,
    /// Serializes connect/disconnect so teardown always completes before a
    /// new session is established
    lifecycle: AsyncMutex<Option<ActiveSession>>,
}

impl ConnectionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared::new()),
            lifecycle: AsyncMutex::new(None),
        }
    }

    /// Open a session: acquire devices, connect, start streaming.
    ///
    /// No-op while already CONNECTING or CONNECTED. On failure the manager
    /// transitions to ERROR with a user-facing message and every partially
    /// acquired resource is released; failures never propagate as panics or
    /// return values.
    pub async fn connect(&self) {
        {
            let state = lock(&self.shared.state);
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                log::debug!("connect() ignored: already {:?}", *state);
                return;
            }
        }

        let mut slot = self.lifecycle.lock().await;

        // Re-check under the lifecycle lock: another caller may have won
        {
            let state = lock(&self.shared.state);
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                log::debug!("connect() ignored: already {:?}", *state);
                return;
            }
        }

        // A failed session may still hold resources; force-complete its
        // teardown before establishing a new one
        if let Some(stale) = slot.take() {
            self.shared.set_current(None);
            teardown(stale).await;
        }

        self.shared.set_state(ConnectionState::Connecting);
        self.shared.clear_error();
        lock(&self.shared.assembler).reset();

        let session_id = Uuid::new_v4();
        log::info!("Connecting session {}...", session_id);

        match self.establish(session_id).await {
            Ok(active) => {
                *slot = Some(active);
                self.shared.set_state(ConnectionState::Connected);
                log::info!("Session {} connected", session_id);
            }
            Err(message) => {
                log::error!("Connect failed: {}", message);
                self.shared.set_current(None);
                self.shared.detach_taps();
                self.shared.fail_with(message);
            }
        }
    }

    /// Close the session and release every resource.
    ///
    /// Safe to call from any state, any number of times, including while a
    /// `connect()` is still in flight; always ends in DISCONNECTED.
    pub async fn disconnect(&self) {
        let mut slot = self.lifecycle.lock().await;

        if let Some(active) = slot.take() {
            log::info!("Disconnecting session {}...", active.id);
            // Gate stragglers immediately: anything still in flight for
            // this session is stale from here on
            self.shared.set_current(None);
            teardown(active).await;
        }

        self.shared.detach_taps();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Current lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Snapshot of the conversation so far, in arrival order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.shared.assembler).messages().to_vec()
    }

    /// Volume tap over the microphone path, while connected.
    pub fn input_analyser(&self) -> Option<Arc<AnalyserTap>> {
        lock(&self.shared.input_tap).clone()
    }

    /// Volume tap over the playback path, while connected.
    pub fn output_analyser(&self) -> Option<Arc<AnalyserTap>> {
        lock(&self.shared.output_tap).clone()
    }

    /// User-facing message for the most recent failure, if any.
    /// Cleared at the start of every `connect()` attempt.
    pub fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }

    /// Acquire devices, open the session, and start both pipelines.
    ///
    /// Returns a user-facing message on failure; everything acquired before
    /// the failing step is released before returning.
    async fn establish(&self, session_id: Uuid) -> Result<ActiveSession, String> {
        let api_key = get_api_key().ok_or_else(|| {
            crate::streaming::StreamingError::MissingApiKey.to_string()
        })?;

        // Device acquisition first: permission problems should surface
        // before any network traffic
        let capture_dev = AudioCapture::new().map_err(|e| e.to_string())?;
        let playback_dev = AudioPlayback::new().map_err(|e| e.to_string())?;

        let mut session = LiveSession::connect(&self.settings.endpoint, &api_key)
            .await
            .map_err(|e| e.to_string())?;

        let incoming = session
            .take_incoming()
            .ok_or_else(|| "Inbound receiver unavailable".to_string())?;

        let input_tap = Arc::new(AnalyserTap::new());
        let output_tap = Arc::new(AnalyserTap::new());

        let queue = Arc::new(Mutex::new(FrameQueue::new(
            self.settings.max_queued_secs,
            self.settings.input_sample_rate,
            self.settings.frame_duration_ms,
        )));
        let notify = Arc::new(Notify::new());

        let capture = match capture_dev.start(
            self.settings.input_sample_rate,
            self.settings.frame_duration_ms,
            queue.clone(),
            notify.clone(),
            input_tap.clone(),
        ) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                session.close().await;
                return Err(e.to_string());
            }
        };

        let playback = match playback_dev.start(self.settings.output_sample_rate, output_tap.clone())
        {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                capture.stop();
                session.close().await;
                return Err(e.to_string());
            }
        };

        self.shared.set_current(Some(session_id));
        self.shared.attach_taps(input_tap, output_tap);

        let cancel = CancellationToken::new();

        let outbound_task = spawn_outbound(
            session,
            session_id,
            queue,
            notify,
            cancel.clone(),
            self.shared.clone(),
            capture.clone(),
            playback.clone(),
        );
        let dispatch_task = spawn_dispatch(
            incoming,
            session_id,
            cancel.clone(),
            self.shared.clone(),
            capture.clone(),
            playback.clone(),
        );

        Ok(ActiveSession {
            id: session_id,
            cancel,
            capture,
            playback,
            outbound_task,
            dispatch_task,
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

/// Cancel the session's tasks and wait for them to finish.
///
/// The outbound pump owns the socket and sends the close frame on its way
/// out; capture and playback release their devices when stopped.
async fn teardown(active: ActiveSession) {
    active.cancel.cancel();
    active.capture.stop();
    active.playback.stop();
    let _ = active.outbound_task.await;
    let _ = active.dispatch_task.await;
}

/// Mark the session failed and stop everything it owns.
///
/// Called from the session's own tasks on mid-stream failures. Superseded
/// sessions report nothing; their teardown already happened or is pending
/// under the lifecycle lock.
fn fail_session(
    shared: &Shared,
    session_id: Uuid,
    capture: &CaptureHandle,
    playback: &PlaybackHandle,
    cancel: &CancellationToken,
    message: String,
) {
    if !shared.is_current(session_id) {
        return;
    }

    log::error!("Session {} failed: {}", session_id, message);
    shared.set_current(None);
    shared.detach_taps();
    shared.fail_with(message);
    capture.stop();
    playback.stop();
    cancel.cancel();
}

/// Drains the frame queue into the session as frames become available.
#[allow(clippy::too_many_arguments)]
fn spawn_outbound(
    mut session: LiveSession,
    session_id: Uuid,
    queue: Arc<Mutex<FrameQueue>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    capture: Arc<CaptureHandle>,
    playback: Arc<PlaybackHandle>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sent: u64 = 0;

        'run: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'run,
                _ = notify.notified() => {
                    loop {
                        // Hold the queue lock only for the pop, never
                        // across the send
                        let frame = {
                            let mut q = lock(&queue);
                            q.pop()
                        };
                        let Some(frame) = frame else { break };

                        if let Err(e) = session.send_audio(&frame.samples).await {
                            fail_session(
                                &shared,
                                session_id,
                                &capture,
                                &playback,
                                &cancel,
                                e.to_string(),
                            );
                            break 'run;
                        }

                        sent += 1;
                        if sent % 50 == 0 {
                            log::debug!("Outbound: {} frames sent", sent);
                        }
                    }
                }
            }
        }

        session.close().await;
        log::debug!("Outbound pump exiting ({} frames sent)", sent);
    })
}

/// Processes inbound envelopes strictly in arrival order.
fn spawn_dispatch(
    mut incoming: mpsc::Receiver<ServerMessage>,
    session_id: Uuid,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    capture: Arc<CaptureHandle>,
    playback: Arc<PlaybackHandle>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = incoming.recv() => match msg {
                    Some(msg) => {
                        match shared.apply_inbound(session_id, playback.as_ref(), msg) {
                            InboundOutcome::Continue => {}
                            InboundOutcome::SessionFailed(message) => {
                                fail_session(
                                    &shared,
                                    session_id,
                                    &capture,
                                    &playback,
                                    &cancel,
                                    message,
                                );
                                break;
                            }
                        }
                    }
                    None => {
                        // Reader ended without us cancelling: the service
                        // dropped the connection
                        if !cancel.is_cancelled() {
                            fail_session(
                                &shared,
                                session_id,
                                &capture,
                                &playback,
                                &cancel,
                                "Connection closed unexpectedly".to_string(),
                            );
                        }
                        break;
                    }
                }
            }
        }

        log::debug!("Inbound dispatch exiting for session {}", session_id);
    })
}
