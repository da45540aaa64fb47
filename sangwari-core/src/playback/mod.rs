//! Gapless playback scheduling.
//!
//! ## Scheduling rule
//!
//! ```text
//! start(n)      = max(next_start, clock_now)
//! next_start    = start(n) + duration(n)
//! ```
//!
//! Buffers arriving early queue up back to back; a buffer arriving after the
//! backlog ran dry starts immediately. `interrupt()` stops everything active
//! and pulls `next_start` back to the clock so nothing from the cancelled
//! turn can play afterwards.
//!
//! The scheduler is driven by exactly one owner (the call controller) and
//! never locks. The [`OutputSink`] does the actual rendering and reports
//! finished buffers back through the controller's event queue.

pub mod mixer;

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::{buffering::frame::PlaybackBuffer, error::Result};

pub use mixer::Mixer;

/// Identifier the scheduler assigns to each enqueued buffer.
pub type BufferId = u64;

/// Destination for scheduled audio, with its own clock.
pub trait OutputSink: Send + 'static {
    /// Current output clock in seconds. Must never go backwards.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at output time `at`.
    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64);

    /// Stop a buffer early.
    ///
    /// # Errors
    /// `VoiceError::PlaybackStop` if the buffer already finished.
    fn stop(&mut self, id: BufferId) -> Result<()>;

    /// Release the output device. Further `start` calls may be ignored.
    fn close(&mut self) -> Result<()>;
}

/// Where a buffer landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Result of an end-of-playback notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackProgress {
    /// Other buffers are still active.
    Playing,
    /// The last active buffer finished.
    Drained,
    /// The buffer was not active (already stopped by an interruption).
    Stale,
}

pub struct PlaybackScheduler<S: OutputSink> {
    sink: S,
    next_start: f64,
    active: BTreeSet<BufferId>,
    next_id: BufferId,
}

impl<S: OutputSink> PlaybackScheduler<S> {
    pub fn new(sink: S) -> Self {
        let next_start = sink.current_time();
        Self {
            sink,
            next_start,
            active: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// Schedule `buffer` right after everything already queued.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> ScheduledBuffer {
        let id = self.next_id;
        self.next_id += 1;

        let now = self.sink.current_time();
        let start = self.next_start.max(now);
        let duration = buffer.duration_secs();

        self.sink.start(id, buffer, start);
        self.next_start = start + duration;
        self.active.insert(id);

        debug!(
            id,
            start = format_args!("{start:.3}"),
            duration = format_args!("{duration:.3}"),
            backlog = format_args!("{:.3}", self.next_start - now),
            "buffer scheduled"
        );

        ScheduledBuffer {
            id,
            start,
            duration,
        }
    }

    /// Book-keeping for a buffer the sink finished playing.
    pub fn on_buffer_ended(&mut self, id: BufferId) -> PlaybackProgress {
        if !self.active.remove(&id) {
            return PlaybackProgress::Stale;
        }
        if self.active.is_empty() {
            PlaybackProgress::Drained
        } else {
            PlaybackProgress::Playing
        }
    }

    /// Barge-in: stop every active buffer and drop the backlog.
    ///
    /// Returns how many buffers were active.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active) {
            if let Err(e) = self.sink.stop(id) {
                debug!(id, "ignoring stop failure: {e}");
            }
        }
        self.next_start = self.sink.current_time();
        if stopped > 0 {
            info!(stopped, "playback interrupted");
        }
        stopped
    }

    /// Stop playback and release the output.
    pub fn shutdown(&mut self) -> Result<()> {
        self.interrupt();
        self.sink.close()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: BufferId) -> bool {
        self.active.contains(&id)
    }

    /// Output time at which the next buffer would start if nothing else is queued.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
