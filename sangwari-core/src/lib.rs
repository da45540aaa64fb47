//! # sangwari-core
//!
//! Duplex voice-call pipeline and text chat for the Sangwari companion.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC RingBuffer → capture thread (resample, 4096-sample frames)
//!                                      │ PCM16 + base64
//!                                      ▼
//!                          SessionTransport (WebSocket task)
//!                                      │ TransportEvent
//!                                      ▼
//!                     mpsc<CallEvent> → CallController ── status / telemetry
//!                                      │ decoded buffers
//!                                      ▼
//!                 PlaybackScheduler → Mixer → output device callback
//! ```
//!
//! Device callbacks never allocate or wait. All state transitions happen on
//! the controller, in queue order.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod call;
pub mod capture;
pub mod chat;
pub mod codec;
pub mod error;
pub mod events;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use call::{CallConfig, CallController, CallHandle};
pub use chat::{ChatSession, ChatTurn, CompletionClient, GeminiChatClient, Role};
pub use codec::WireChunk;
pub use error::{Result, VoiceError};
pub use events::{AudioLevelEvent, CallEvent, CallStatus, CallStatusEvent};
pub use playback::{Mixer, OutputSink, PlaybackScheduler};
pub use transport::{Outbound, SessionConfig, SessionTransport, TransportEvent, TransportHandle};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalMicrophone;
