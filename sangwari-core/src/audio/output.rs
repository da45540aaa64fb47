//! Speaker output driving the [`Mixer`].
//!
//! The cpal stream is built on a blocking thread that keeps it alive until
//! [`OutputStreamHandle::stop`] is called. `open` blocks until the device is
//! confirmed playing (or fails), mirroring how the microphone is opened.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, VoiceError},
    playback::Mixer,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, StreamConfig,
};

/// How long `stop()` waits for the device thread to drop the stream.
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);
/// Poll interval of the keep-alive loop on the device thread.
const KEEPALIVE_POLL: Duration = Duration::from_millis(20);

/// Owner of a running output stream.
#[derive(Debug)]
pub struct OutputStreamHandle {
    running: Arc<AtomicBool>,
    released: Receiver<()>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputStreamHandle {
    /// Open the preferred (or default) speaker and start rendering `mixer`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `VoiceError::DeviceAcquisition` when no usable output device exists.
    pub fn open(mixer: Mixer, preferred_device: Option<String>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<(u32, u16)>>(1);
        let (released_tx, released_rx) = crossbeam_channel::bounded::<()>(1);

        let thread_running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            let (stream, rate, channels) =
                match build_output(&mixer, preferred_device.as_deref()) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
            let _ = open_tx.send(Ok((rate, channels)));

            while thread_running.load(Ordering::Acquire) {
                std::thread::sleep(KEEPALIVE_POLL);
            }
            // Stream drops here, releasing the device on this thread.
            drop(stream);
            let _ = released_tx.send(());
        });

        match super::wait_blocking(|| open_rx.recv()) {
            Ok(Ok((sample_rate, channels))) => {
                info!(sample_rate, channels, "output stream playing");
                Ok(Self {
                    running,
                    released: released_rx,
                    sample_rate,
                    channels,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Other(anyhow::anyhow!(
                "output device thread died unexpectedly"
            ))),
        }
    }

    /// Stop rendering and wait briefly for the device to be released. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if super::wait_blocking(|| self.released.recv_timeout(RELEASE_TIMEOUT)).is_err() {
                warn!("output device did not release within {RELEASE_TIMEOUT:?}");
            } else {
                debug!("output device released");
            }
        }
    }
}

impl Drop for OutputStreamHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Opaque keep-alive for the platform stream.
#[cfg(feature = "audio-cpal")]
type PlatformStream = cpal::Stream;
#[cfg(not(feature = "audio-cpal"))]
type PlatformStream = ();

#[cfg(feature = "audio-cpal")]
fn build_output(mixer: &Mixer, preferred: Option<&str>) -> Result<(PlatformStream, u32, u16)> {
    let host = cpal::default_host();
    let device = super::device::pick_output(&host, preferred)?;
    let wanted = SampleRate(mixer.device_rate());

    // Prefer a config that runs natively at the speech rate (mono, then
    // stereo) so buffers need no conversion; otherwise take the default.
    let native = device.supported_output_configs().ok().and_then(|configs| {
        let mut candidates: Vec<_> = configs
            .filter(|c| c.channels() <= 2)
            .filter(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
            .collect();
        candidates.sort_by_key(|c| c.channels());
        candidates.into_iter().next().map(|c| c.with_sample_rate(wanted))
    });
    let supported = match native {
        Some(config) => config,
        None => device
            .default_output_config()
            .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))?,
    };

    let config: StreamConfig = supported.config();
    let rate = config.sample_rate.0;
    let channels = config.channels;
    mixer.set_device_rate(rate);

    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate = rate,
        channels,
        "opening output device"
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer.clone()),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer.clone()),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer.clone()),
        fmt => {
            return Err(VoiceError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;
    stream
        .play()
        .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))?;

    Ok((stream, rate, channels))
}

#[cfg(feature = "audio-cpal")]
fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, mixer: Mixer) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                scratch.resize(data.len(), 0.0);
                mixer.render(&mut scratch, channels);
                for (out, sample) in data.iter_mut().zip(&scratch) {
                    *out = T::from_sample(*sample);
                }
            },
            |err| tracing::error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
fn build_output(_mixer: &Mixer, _preferred: Option<&str>) -> Result<(PlatformStream, u32, u16)> {
    Err(VoiceError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}
