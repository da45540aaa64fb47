//! Live session transport over a WebSocket.
//!
//! [`SessionTransport::open`] spawns one Tokio task that owns the socket. It
//! connects, sends the setup message, then multiplexes three sources:
//!
//! ```text
//! socket reader ──► parse ──► CallEvent::Transport(..) ──► controller queue
//! outbound cmds ──► realtimeInput JSON ──► socket writer
//! close signal  ──► close frame, task exits
//! ```
//!
//! Inbound events are pushed onto the controller's queue in arrival order.
//! The returned [`TransportHandle`] is the [`Outbound`] side used by capture.

pub mod protocol;

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::{
    codec::WireChunk,
    error::{Result, VoiceError},
    events::CallEvent,
};

use protocol::{parse_server_message, RealtimeInputMessage, SetupMessage};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// Signals from the live session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Setup acknowledged; audio may flow.
    Ready,
    /// One chunk of synthesized speech.
    AudioChunk(WireChunk),
    /// The user barged in; drop queued speech.
    Interrupted,
    /// The assistant finished its turn.
    TurnComplete,
    /// The remote end closed the session.
    Closed,
    /// The session failed. Carries a human-readable description.
    Error(String),
}

/// Parameters of one live session.
#[derive(Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: String::new(),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("system_instruction_len", &self.system_instruction.len())
            .finish()
    }
}

impl SessionConfig {
    /// Endpoint with the key appended as a query parameter.
    pub fn url(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{sep}key={}", self.endpoint, self.api_key)
    }
}

/// Sending half of the session, as seen by capture and teardown.
pub trait Outbound: Send + Sync + 'static {
    /// Queue one encoded chunk. Never blocks. Chunks sent before the session
    /// is ready are held and flushed in order; after suspend or close they
    /// are dropped.
    fn send(&self, chunk: WireChunk);

    /// Stop transmitting without closing (after an error).
    fn suspend(&self);

    /// Close the session. Idempotent.
    fn close(&self);
}

#[derive(Debug, Default)]
struct LinkState {
    ready: AtomicBool,
    suspended: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicUsize,
}

impl LinkState {
    fn accepts(&self) -> bool {
        !self.suspended.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Cloneable handle to a session task.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::UnboundedSender<WireChunk>,
    state: Arc<LinkState>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.state.suspended.load(Ordering::Acquire)
    }

    /// Chunks discarded because the session could not take them.
    pub fn dropped_chunks(&self) -> usize {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl Outbound for TransportHandle {
    fn send(&self, chunk: WireChunk) {
        if !self.state.accepts() || self.cmd_tx.send(chunk).is_err() {
            self.state.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn suspend(&self) {
        if !self.state.suspended.swap(true, Ordering::AcqRel) {
            warn!("outbound audio suspended");
        }
    }

    fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing live session");
        let _ = self.close_tx.send(true);
    }
}

pub struct SessionTransport;

impl SessionTransport {
    /// Start connecting. Events arrive on `events`; the first one is either
    /// `Ready` or `Error`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: SessionConfig, events: mpsc::UnboundedSender<CallEvent>) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let state = Arc::new(LinkState::default());

        tokio::spawn(run_session(
            config,
            Arc::clone(&state),
            events,
            cmd_rx,
            close_rx,
        ));

        TransportHandle {
            cmd_tx,
            state,
            close_tx: Arc::new(close_tx),
        }
    }
}

fn fail(state: &LinkState, events: &mpsc::UnboundedSender<CallEvent>, err: VoiceError) {
    error!("live session failed: {err}");
    state.suspended.store(true, Ordering::Release);
    state.ready.store(false, Ordering::Release);
    let _ = events.send(TransportEvent::Error(err.to_string()).into());
}

async fn write_chunk<W>(writer: &mut W, chunk: &WireChunk) -> Result<()>
where
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(&RealtimeInputMessage::new(chunk))?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|e| VoiceError::Connection(e.to_string()))
}

fn dispatch(state: &LinkState, events: &mpsc::UnboundedSender<CallEvent>, text: &str) {
    let parsed = match parse_server_message(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("ignoring unparseable server message: {e}");
            return;
        }
    };
    for event in parsed {
        if event == TransportEvent::Ready {
            info!("live session ready");
            state.ready.store(true, Ordering::Release);
        }
        let _ = events.send(event.into());
    }
}

async fn run_session(
    config: SessionConfig,
    state: Arc<LinkState>,
    events: mpsc::UnboundedSender<CallEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<WireChunk>,
    mut close_rx: watch::Receiver<bool>,
) {
    info!(endpoint = config.endpoint.as_str(), model = config.model.as_str(), "connecting live session");

    let connected = tokio::select! {
        res = connect_async(config.url()) => res,
        _ = close_rx.changed() => {
            debug!("session closed before connecting");
            return;
        }
    };
    let socket = match connected {
        Ok((socket, _response)) => socket,
        Err(e) => {
            fail(&state, &events, VoiceError::Connection(e.to_string()));
            return;
        }
    };
    let (mut writer, mut reader) = socket.split();

    let setup = match serde_json::to_string(&SetupMessage::new(&config)) {
        Ok(text) => text,
        Err(e) => {
            fail(&state, &events, e.into());
            return;
        }
    };
    if let Err(e) = writer.send(Message::Text(setup)).await {
        fail(&state, &events, VoiceError::Connection(e.to_string()));
        return;
    }
    debug!("setup sent");

    // Chunks captured before setup completes, flushed in order once ready.
    let mut pending: VecDeque<WireChunk> = VecDeque::new();

    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch(&state, &events, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => dispatch(&state, &events, &text),
                    Err(_) => warn!("ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "live session closed by server");
                    state.ready.store(false, Ordering::Release);
                    let _ = events.send(TransportEvent::Closed.into());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    fail(&state, &events, VoiceError::Connection(e.to_string()));
                    break;
                }
                None => {
                    info!("live session stream ended");
                    state.ready.store(false, Ordering::Release);
                    let _ = events.send(TransportEvent::Closed.into());
                    break;
                }
            },
            cmd = cmd_rx.recv() => {
                let Some(chunk) = cmd else { break };
                if !state.accepts() {
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if !state.is_ready() {
                    pending.push_back(chunk);
                    continue;
                }
                if let Err(e) = write_chunk(&mut writer, &chunk).await {
                    fail(&state, &events, e);
                    break;
                }
            },
            _ = close_rx.changed() => {
                // Local close: the controller is tearing down and expects no events.
                let _ = writer.send(Message::Close(None)).await;
                let _ = writer.close().await;
                debug!("live session closed locally");
                break;
            }
        }

        if !pending.is_empty() && state.is_ready() && state.accepts() {
            debug!(held = pending.len(), "flushing audio held during setup");
            let mut failed = None;
            while let Some(chunk) = pending.pop_front() {
                if let Err(e) = write_chunk(&mut writer, &chunk).await {
                    failed = Some(e);
                    break;
                }
            }
            if let Some(e) = failed {
                fail(&state, &events, e);
                break;
            }
        }
    }

    state.ready.store(false, Ordering::Release);
    state
        .dropped
        .fetch_add(pending.len(), Ordering::Relaxed);
    debug!(dropped = state.dropped.load(Ordering::Relaxed), "session task exited");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Outbound that records chunks instead of sending them.
    #[derive(Debug, Default)]
    pub struct RecordingOutbound {
        sent: Mutex<Vec<WireChunk>>,
        pub suspended: AtomicBool,
        pub closed: AtomicBool,
        pub dropped: AtomicUsize,
    }

    impl RecordingOutbound {
        pub fn sent(&self) -> Vec<WireChunk> {
            self.sent.lock().clone()
        }
    }

    impl Outbound for RecordingOutbound {
        fn send(&self, chunk: WireChunk) {
            if self.suspended.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.sent.lock().push(chunk);
        }

        fn suspend(&self) {
            self.suspended.store(true, Ordering::Release);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }
}
