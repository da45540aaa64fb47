//! Audio devices via the cpal backend.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They must
//! not block on a mutex or perform I/O. The microphone callback writes into
//! the SPSC ring producer (`push_slice` is lock-free); the output callback
//! only ever `try_lock`s the mixer.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. Streams are therefore
//! created and dropped on one dedicated blocking thread each: the capture
//! pipeline thread for the microphone, and the thread behind
//! [`output::OutputStreamHandle`] for the speaker.

pub mod device;
pub mod output;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::{
    buffering::AudioProducer,
    capture::{ActiveMicrophone, Microphone},
    error::{Result, VoiceError},
};

/// System microphone, optionally selected by device name.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    preferred_device: Option<String>,
}

impl CpalMicrophone {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[cfg(feature = "audio-cpal")]
impl Microphone for CpalMicrophone {
    fn open(
        &mut self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<ActiveMicrophone> {
        let host = cpal::default_host();
        let device = device::pick_input(&host, self.preferred_device.as_deref())?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "input config selected");

        let config: StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_input::<f32>(&device, &config, producer, running),
            SampleFormat::I16 => build_mono_input::<i16>(&device, &config, producer, running),
            SampleFormat::U16 => build_mono_input::<u16>(&device, &config, producer, running),
            SampleFormat::U8 => build_mono_input::<u8>(&device, &config, producer, running),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))?;

        Ok(ActiveMicrophone::new(sample_rate, stream))
    }
}

/// Build an input stream that mixes every device frame down to one f32
/// sample and pushes it into the ring.
#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (slot, frame) in mono.iter_mut().zip(data.chunks_exact(channels)) {
                    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                    *slot = sum / channels as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("capture ring full: dropped {} samples", mono.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
impl Microphone for CpalMicrophone {
    fn open(
        &mut self,
        _producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<ActiveMicrophone> {
        running.store(false, Ordering::Release);
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Run a short blocking wait (device handshake or release) from code that may
/// sit on a Tokio worker.
///
/// On a multi-thread runtime the worker hands its queued tasks to another
/// thread first; elsewhere the wait runs in place.
pub(crate) fn wait_blocking<R>(wait: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(tokio::runtime::RuntimeFlavor::MultiThread) => tokio::task::block_in_place(wait),
        _ => wait(),
    }
}
