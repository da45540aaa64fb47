//! Typed audio units flowing through the capture and playback paths.

use std::sync::Arc;

/// One fixed-length block of mono capture samples at the wire input rate.
///
/// Immutable once produced by [`FrameSlicer`](crate::capture::FrameSlicer).
#[derive(Debug, Clone)]
pub struct AudioFrame {
    seq: u64,
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(seq: u64, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            seq,
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Position of this frame in its capture session, starting at 0.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Mono f32 samples in [-1.0, 1.0].
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square loudness of the frame.
    pub fn rms(&self) -> f32 {
        compute_rms(&self.samples)
    }
}

/// Decoded synthesized speech, planar (one `Vec` per channel).
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    /// Build from planar channel data. Channels shorter than the first are
    /// treated as silent for the missing frames when mixed down.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Average all channels into a single mono track.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frames())
                .map(|i| {
                    let sum: f32 = self
                        .channels
                        .iter()
                        .map(|ch| ch.get(i).copied().unwrap_or(0.0))
                        .sum();
                    sum / n as f32
                })
                .collect(),
        }
    }
}

/// `sqrt(mean(sample²))`; 0.0 for an empty slice.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    (sum_sq / samples.len() as f32).sqrt()
}
