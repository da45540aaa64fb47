//! Events crossing the call boundary.
//!
//! `CallEvent` is the single ordered queue consumed by the
//! [`CallController`](crate::call::CallController). `CallStatusEvent` and
//! `AudioLevelEvent` are broadcast telemetry for the UI and serialize to
//! camelCase JSON.

use serde::{Deserialize, Serialize};

use crate::{playback::BufferId, transport::TransportEvent};

// ---------------------------------------------------------------------------
// Controller input
// ---------------------------------------------------------------------------

/// Everything the controller reacts to, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Inbound signal from the live session.
    Transport(TransportEvent),
    /// The output device finished playing a scheduled buffer.
    PlaybackEnded(BufferId),
    /// The user hung up.
    EndCall,
}

impl From<TransportEvent> for CallEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Current state of a voice call. Single source of truth for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Session opening, or the connection closed and awaits a manual reconnect.
    Connecting,
    /// Microphone live, waiting for the assistant.
    Listening,
    /// Synthesized speech is playing.
    Speaking,
    /// Unrecoverable failure. The call must be ended.
    Error,
}

impl CallStatus {
    /// Text shown by the UI for this state.
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Listening => "Listening...",
            Self::Speaking => "Speaking...",
            Self::Error => "Connection Error",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Broadcast whenever the status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusEvent {
    pub status: CallStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Level telemetry
// ---------------------------------------------------------------------------

/// Emitted once per captured frame, muted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelEvent {
    /// Capture frame sequence number.
    pub seq: u64,
    /// Root-mean-square level of the frame in [0.0, 1.0].
    pub rms: f32,
}
