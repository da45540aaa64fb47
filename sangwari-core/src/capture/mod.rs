//! Microphone capture for the live call.
//!
//! ## Flow
//!
//! ```text
//! Microphone callback → SPSC ring → pipeline thread
//!                                      │ resample to 16 kHz
//!                                      │ FrameSlicer (4096 samples)
//!                                      ├─► RMS level (telemetry, always)
//!                                      └─► encode → Outbound::send (unless muted)
//! ```
//!
//! ## Threading
//!
//! Device streams are bound to the thread that created them, so the
//! microphone is opened *inside* the blocking pipeline thread. A sync
//! handshake reports open success or failure back to [`start`], which
//! therefore returns a device error synchronously.

pub mod pipeline;

use std::any::Any;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    buffering::{create_audio_ring, frame::AudioFrame, AudioProducer},
    codec::INPUT_SAMPLE_RATE,
    error::{Result, VoiceError},
    events::AudioLevelEvent,
    transport::Outbound,
};

pub use pipeline::{CaptureDiagnostics, CaptureSnapshot};

/// Samples per outbound frame (≈ 256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;

const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// Source of microphone audio.
///
/// `open` runs on the capture thread. Implementations push mono f32 samples
/// into `producer` from their device callback, should stop pushing once
/// `running` is false, and release the device when the returned
/// [`ActiveMicrophone`] is dropped.
pub trait Microphone: Send + 'static {
    /// # Errors
    /// `VoiceError::DeviceAcquisition` when permission is denied or no
    /// device is available.
    fn open(&mut self, producer: AudioProducer, running: Arc<AtomicBool>)
        -> Result<ActiveMicrophone>;
}

/// An opened microphone. Dropping it releases the device.
pub struct ActiveMicrophone {
    /// Rate the device actually captures at (Hz).
    pub sample_rate: u32,
    _device: Box<dyn Any>,
}

impl ActiveMicrophone {
    pub fn new(sample_rate: u32, device: impl Any) -> Self {
        Self {
            sample_rate,
            _device: Box::new(device),
        }
    }
}

/// Latest frame loudness, readable from any thread.
#[derive(Debug, Default)]
pub struct VolumeLevel(AtomicU32);

impl VolumeLevel {
    pub fn store(&self, rms: f32) {
        self.0.store(rms.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Fixed parameters of a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub frame_samples: usize,
    /// Rate frames are resampled to before encoding.
    pub target_sample_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_samples: FRAME_SAMPLES,
            target_sample_rate: INPUT_SAMPLE_RATE,
        }
    }
}

/// Shared state the pipeline reports into.
#[derive(Clone)]
pub struct CaptureLinks {
    pub muted: Arc<AtomicBool>,
    pub level: Arc<VolumeLevel>,
    pub level_tx: broadcast::Sender<AudioLevelEvent>,
    pub outbound: Arc<dyn Outbound>,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

/// Splits a continuous sample stream into fixed-length frames.
///
/// Iterating yields every complete frame buffered so far; remaining samples
/// wait for the next `extend`.
#[derive(Debug)]
pub struct FrameSlicer {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_seq: u64,
}

impl FrameSlicer {
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            sample_rate,
            pending: Vec::with_capacity(frame_len * 2),
            next_seq: 0,
        }
    }

    pub fn extend(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Samples waiting for a full frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl Iterator for FrameSlicer {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<AudioFrame> {
        if self.pending.len() < self.frame_len {
            return None;
        }
        let rest = self.pending.split_off(self.frame_len);
        let samples = std::mem::replace(&mut self.pending, rest);
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(AudioFrame::new(seq, samples, self.sample_rate))
    }
}

/// Handle to a running capture pipeline. Not restartable: call [`start`] again.
#[derive(Debug)]
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    released: Receiver<()>,
    released_seen: AtomicBool,
    /// Rate reported by the device (Hz).
    pub device_sample_rate: u32,
}

impl CaptureHandle {
    /// Halt frame production. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("capture stop requested");
        }
    }

    /// Stop and wait for the microphone device to be dropped. Idempotent.
    ///
    /// # Errors
    /// `VoiceError::AudioStream` when the device thread does not exit in time.
    pub fn release(&self) -> Result<()> {
        self.stop();
        if self.released_seen.load(Ordering::Acquire) {
            return Ok(());
        }
        match crate::audio::wait_blocking(|| self.released.recv_timeout(RELEASE_TIMEOUT)) {
            Ok(()) => {
                self.released_seen.store(true, Ordering::Release);
                info!("microphone released");
                Ok(())
            }
            Err(_) => {
                warn!("microphone did not release within {RELEASE_TIMEOUT:?}");
                Err(VoiceError::AudioStream(
                    "microphone release timed out".into(),
                ))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Open `microphone` and start streaming frames to `links.outbound`.
///
/// Blocks until the device is confirmed open (or fails). Must be called from
/// within a Tokio runtime.
///
/// # Errors
/// Whatever `Microphone::open` reports, typically
/// `VoiceError::DeviceAcquisition`.
pub fn start(
    mut microphone: Box<dyn Microphone>,
    config: CaptureConfig,
    links: CaptureLinks,
) -> Result<CaptureHandle> {
    let (producer, consumer) = create_audio_ring();
    let running = Arc::new(AtomicBool::new(true));
    let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
    let (released_tx, released_rx) = crossbeam_channel::bounded::<()>(1);

    links.diagnostics.reset();
    let thread_running = Arc::clone(&running);

    tokio::task::spawn_blocking(move || {
        // ── Open device (must happen on THIS thread) ─────────────────────
        let active = match microphone.open(producer, Arc::clone(&thread_running)) {
            Ok(active) => active,
            Err(e) => {
                thread_running.store(false, Ordering::Release);
                let _ = open_tx.send(Err(e));
                let _ = released_tx.send(());
                return;
            }
        };

        let pipeline = match pipeline::CapturePipeline::new(pipeline::CaptureContext {
            consumer,
            running: Arc::clone(&thread_running),
            capture_sample_rate: active.sample_rate,
            config,
            links,
        }) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                thread_running.store(false, Ordering::Release);
                drop(active);
                drop(microphone);
                let _ = open_tx.send(Err(e));
                let _ = released_tx.send(());
                return;
            }
        };
        let _ = open_tx.send(Ok(active.sample_rate));

        pipeline.run();

        // Device drops here, on the thread that opened it.
        drop(active);
        drop(microphone);
        let _ = released_tx.send(());
    });

    match crate::audio::wait_blocking(|| open_rx.recv()) {
        Ok(Ok(device_sample_rate)) => {
            info!(device_sample_rate, "capture started");
            Ok(CaptureHandle {
                running,
                released: released_rx,
                released_seen: AtomicBool::new(false),
                device_sample_rate,
            })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(VoiceError::Other(anyhow::anyhow!(
            "capture thread died before opening the microphone"
        ))),
    }
}
