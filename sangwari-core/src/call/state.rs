//! Call status transitions.
//!
//! ```text
//!              Ready               AudioEnqueued
//! Connecting ───────► Listening ◄──────────────► Speaking
//!     ▲                  ▲  PlaybackDrained /       │
//!     │ Closed           │  Interrupted             │
//!     └──────────────────┴──────────────────────────┘
//!
//! Failed: any ──► Error (absorbing)
//! ```

use crate::events::CallStatus;

/// Something that can move the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTrigger {
    /// Session setup acknowledged.
    Ready,
    /// A decoded buffer was scheduled for playback.
    AudioEnqueued,
    /// The last active buffer finished.
    PlaybackDrained,
    /// Barge-in cleared the queue.
    Interrupted,
    /// The remote end closed the session.
    Closed,
    /// Device or transport failure.
    Failed,
}

/// Status after `trigger`, or `current` when the trigger does not apply.
pub fn next_status(current: CallStatus, trigger: StatusTrigger) -> CallStatus {
    use CallStatus::*;
    use StatusTrigger as T;

    match (current, trigger) {
        (Error, _) => Error,
        (_, T::Failed) => Error,
        (_, T::Closed) => Connecting,
        (Connecting, T::Ready) => Listening,
        (Listening | Speaking, T::AudioEnqueued) => Speaking,
        (Speaking, T::PlaybackDrained) => Listening,
        (Listening | Speaking, T::Interrupted) => Listening,
        (current, _) => current,
    }
}
