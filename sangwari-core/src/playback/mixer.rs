//! Software mixer behind the output device callback.
//!
//! The mixer's clock is the number of frames it has rendered divided by the
//! device rate, so scheduling and rendering share one time base. Each
//! scheduled buffer becomes a voice that starts at a fixed frame; the device
//! callback sums all due voices, applies the fixed gain, and posts
//! `CallEvent::PlaybackEnded` for every voice that ran out.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BufferId, OutputSink};
use crate::{
    audio::{output::OutputStreamHandle, resample::convert_block},
    buffering::frame::PlaybackBuffer,
    error::{Result, VoiceError},
    events::CallEvent,
};

struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
    pos: usize,
}

impl Voice {
    fn finished(&self, rendered_until: u64) -> bool {
        self.pos >= self.samples.len() && rendered_until > self.start_frame
    }
}

struct MixerState {
    device_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    closed: bool,
}

/// Cloneable handle; one clone lives in the device callback, one in the scheduler.
#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    gain: f32,
    ended_tx: mpsc::UnboundedSender<CallEvent>,
    device: Arc<Mutex<Option<OutputStreamHandle>>>,
}

impl Mixer {
    /// `device_rate` is provisional until an output stream attaches and
    /// reports the rate it actually runs at.
    pub fn new(device_rate: u32, gain: f32, ended_tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                device_rate: device_rate.max(1),
                frames_rendered: 0,
                voices: Vec::new(),
                closed: false,
            })),
            gain,
            ended_tx,
            device: Arc::new(Mutex::new(None)),
        }
    }

    /// Switch to the rate the device runs at. Keeps the clock value in seconds.
    pub fn set_device_rate(&self, rate: u32) {
        let mut state = self.state.lock();
        let rate = rate.max(1);
        if rate == state.device_rate {
            return;
        }
        let seconds = state.frames_rendered as f64 / f64::from(state.device_rate);
        state.frames_rendered = (seconds * f64::from(rate)).round() as u64;
        state.device_rate = rate;
    }

    pub fn device_rate(&self) -> u32 {
        self.state.lock().device_rate
    }

    /// Hand over the output stream so `close()` can release it.
    pub fn attach(&self, handle: OutputStreamHandle) {
        *self.device.lock() = Some(handle);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn active_voices(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Fill an interleaved output block. Called from the device callback.
    ///
    /// Never waits: when the scheduler holds the lock the block is silent and
    /// the clock does not advance, which shifts pending voices later rather
    /// than tearing them.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let Some(mut guard) = self.state.try_lock() else {
            out.fill(0.0);
            return;
        };
        let state = &mut *guard;
        if state.closed {
            out.fill(0.0);
            return;
        }

        let base = state.frames_rendered;
        let mut frames = 0u64;
        for (offset, frame) in out.chunks_mut(channels).enumerate() {
            let clock = base + offset as u64;
            let mut acc = 0.0f32;
            for voice in state.voices.iter_mut() {
                if clock < voice.start_frame {
                    continue;
                }
                if let Some(sample) = voice.samples.get(voice.pos) {
                    acc += sample;
                    voice.pos += 1;
                }
            }
            frame.fill((acc * self.gain).clamp(-1.0, 1.0));
            frames += 1;
        }
        state.frames_rendered = base + frames;

        let rendered_until = state.frames_rendered;
        let ended_tx = &self.ended_tx;
        state.voices.retain(|voice| {
            if voice.finished(rendered_until) {
                let _ = ended_tx.send(CallEvent::PlaybackEnded(voice.id));
                false
            } else {
                true
            }
        });
    }
}

impl OutputSink for Mixer {
    fn current_time(&self) -> f64 {
        let state = self.state.lock();
        state.frames_rendered as f64 / f64::from(state.device_rate)
    }

    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64) {
        let device_rate = self.device_rate();
        let duration = buffer.duration_secs();
        let mono = buffer.to_mono();
        let mut samples = match convert_block(&mono, buffer.sample_rate(), device_rate) {
            Ok(converted) => converted,
            Err(e) => {
                warn!(id, "playing buffer unconverted: {e}");
                mono
            }
        };

        let mut state = self.state.lock();
        if state.closed {
            debug!(id, "mixer closed, dropping buffer");
            return;
        }
        let rate = f64::from(state.device_rate);
        let at = at.max(0.0);
        let start_frame = (at * rate).round() as u64;
        let end_frame = ((at + duration) * rate).round() as u64;

        // The voice covers exactly its reserved slot, so the next one starts
        // on the following frame.
        samples.resize(end_frame.saturating_sub(start_frame) as usize, 0.0);

        // Render already passed the slot start: skip what should have played.
        let late = state.frames_rendered.saturating_sub(start_frame) as usize;
        if late > 0 {
            debug!(id, late_frames = late, "buffer scheduled behind the clock");
        }
        state.voices.push(Voice {
            id,
            start_frame,
            pos: late.min(samples.len()),
            samples,
        });
    }

    fn stop(&mut self, id: BufferId) -> Result<()> {
        let mut state = self.state.lock();
        match state.voices.iter().position(|v| v.id == id) {
            Some(idx) => {
                state.voices.remove(idx);
                Ok(())
            }
            None => Err(VoiceError::PlaybackStop(id)),
        }
    }

    fn close(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.voices.clear();
        }
        if let Some(device) = self.device.lock().take() {
            device.stop();
        }
        Ok(())
    }
}
