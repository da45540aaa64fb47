//! Sample-rate conversion with rubato's `FastFixedIn`.
//!
//! Two call shapes:
//! - [`RateConverter`] for the capture stream: device rate (often 44.1 or
//!   48 kHz) down to the 16 kHz wire rate, fed in arbitrary slices.
//! - [`convert_block`] for playback: one decoded 24 kHz buffer converted in a
//!   single pass when the output device runs at another rate.
//!
//! Equal rates never build a rubato session.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{Result, VoiceError};

fn build(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        f64::from(to_rate) / f64::from(from_rate),
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| VoiceError::AudioStream(format!("resampler init {from_rate}->{to_rate}: {e}")))
}

/// Streaming mono converter between two fixed rates.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over until a full `chunk_size` block is available.
    pending: Vec<f32>,
    chunk_size: usize,
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `VoiceError::AudioStream` if rubato rejects the configuration.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                scratch: Vec::new(),
            });
        }

        let resampler = build(from_rate, to_rate, chunk_size)?;
        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];
        info!(from_rate, to_rate, chunk_size, "capture resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            scratch,
        })
    }

    /// Feed samples; returns whatever full blocks produced (possibly nothing).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_size {
            let block = &self.pending[consumed..consumed + self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("capture resampler error: {e}"),
            }
            consumed += self.chunk_size;
        }
        self.pending.drain(..consumed);
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert one complete mono buffer from `from_rate` to `to_rate`.
///
/// # Errors
/// `VoiceError::AudioStream` if rubato fails.
pub fn convert_block(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = build(from_rate, to_rate, samples.len())?;
    let out = resampler
        .process(&[samples], None)
        .map_err(|e| VoiceError::AudioStream(format!("playback resample: {e}")))?;
    Ok(out.into_iter().next().unwrap_or_default())
}
