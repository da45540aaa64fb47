//! PCM16 wire codec.
//!
//! Outbound: f32 samples → i16 little-endian → base64 text.
//! Inbound: base64 text → i16 little-endian → f32, de-interleaved by channel.
//!
//! Scaling is by 32768 in both directions. The float→i16 conversion
//! truncates toward zero and saturates, so samples outside [-1.0, 1.0]
//! clamp to the i16 range instead of wrapping.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{
    buffering::frame::{AudioFrame, PlaybackBuffer},
    error::{Result, VoiceError},
};

/// Sample rate the remote service expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech returned by the remote service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Mime type attached to every outbound microphone chunk.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

const PCM16_SCALE: f32 = 32768.0;

/// One encoded transport unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChunk {
    /// Base64 (standard alphabet) of little-endian PCM16 bytes.
    pub data: String,
    pub mime_type: String,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl WireChunk {
    /// Build an inbound chunk from a server payload, reading the sample rate
    /// from the `rate=` mime parameter (falls back to 24 kHz).
    pub fn from_inline(data: String, mime_type: String) -> Self {
        let sample_rate = mime_rate(&mime_type).unwrap_or(OUTPUT_SAMPLE_RATE);
        Self {
            data,
            mime_type,
            sample_rate,
            channel_count: 1,
        }
    }
}

/// Extract `rate=NNNN` from a mime type like `audio/pcm;rate=24000`.
pub fn mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Whether a server payload carries raw PCM audio we can decode.
pub fn is_pcm_mime(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .is_some_and(|base| base.trim().eq_ignore_ascii_case("audio/pcm"))
}

/// Encode one captured frame for the wire.
pub fn encode_frame(frame: &AudioFrame) -> WireChunk {
    encode_pcm16(frame.samples(), frame.sample_rate(), 1)
}

/// Encode interleaved samples as base64 PCM16.
pub fn encode_pcm16(samples: &[f32], sample_rate: u32, channel_count: u16) -> WireChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // `as` saturates on overflow and maps NaN to 0.
        let value = (sample * PCM16_SCALE) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    WireChunk {
        data: STANDARD.encode(&bytes),
        mime_type: format!("audio/pcm;rate={sample_rate}"),
        sample_rate,
        channel_count,
    }
}

/// Decode a chunk into planar channels of normalized f32 samples.
///
/// # Errors
/// `VoiceError::MalformedAudioData` when the payload is not valid base64,
/// the channel count is zero, or the byte length is not a whole number of
/// 16-bit sample frames.
pub fn decode_chunk(chunk: &WireChunk) -> Result<Vec<Vec<f32>>> {
    let channels = usize::from(chunk.channel_count);
    if channels == 0 {
        return Err(VoiceError::MalformedAudioData(
            "channel count must be at least 1".into(),
        ));
    }

    let bytes = STANDARD
        .decode(chunk.data.as_bytes())
        .map_err(|e| VoiceError::MalformedAudioData(format!("invalid base64: {e}")))?;

    let frame_bytes = 2 * channels;
    if bytes.len() % frame_bytes != 0 {
        return Err(VoiceError::MalformedAudioData(format!(
            "{} bytes is not a multiple of {frame_bytes} ({channels} channel(s) of PCM16)",
            bytes.len()
        )));
    }

    let frames = bytes.len() / frame_bytes;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for (idx, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        planar[idx % channels].push(f32::from(value) / PCM16_SCALE);
    }
    Ok(planar)
}

/// Decode straight into a [`PlaybackBuffer`] at the chunk's sample rate.
pub fn decode_playback_buffer(chunk: &WireChunk) -> Result<PlaybackBuffer> {
    Ok(PlaybackBuffer::new(decode_chunk(chunk)?, chunk.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Deterministic spread of values across [-1, 1] including both edges.
    fn sweep(len: usize) -> Vec<f32> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|i| match i {
                0 => -1.0,
                1 => 1.0,
                2 => 0.0,
                _ => {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    (state as f32 / u32::MAX as f32) * 2.0 - 1.0
                }
            })
            .collect()
    }

    #[test]
    fn round_trip_stays_within_quantization_error() {
        let samples = sweep(4096);
        let chunk = encode_frame(&AudioFrame::new(0, samples.clone(), INPUT_SAMPLE_RATE));
        assert_eq!(chunk.mime_type, INPUT_MIME_TYPE);
        assert_eq!(chunk.sample_rate, INPUT_SAMPLE_RATE);

        let decoded = decode_chunk(&chunk).expect("decode round trip");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].len(), samples.len());
        for (orig, back) in samples.iter().zip(&decoded[0]) {
            assert_abs_diff_eq!(*orig, *back, epsilon = 1.0 / 32768.0 + 1e-7);
        }
    }

    #[test]
    fn encodes_little_endian_pcm16() {
        let chunk = encode_pcm16(&[0.5, -0.5, 0.0], INPUT_SAMPLE_RATE, 1);
        let bytes = STANDARD.decode(&chunk.data).unwrap();
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xC0, 0x00, 0x00]);
    }

    #[test]
    fn out_of_range_samples_saturate_instead_of_wrapping() {
        let chunk = encode_pcm16(&[1.0, 3.0, -4.0], INPUT_SAMPLE_RATE, 1);
        let decoded = decode_chunk(&chunk).unwrap();
        assert_eq!(decoded[0][0], 32767.0 / 32768.0);
        assert_eq!(decoded[0][1], 32767.0 / 32768.0);
        assert_eq!(decoded[0][2], -1.0);
    }

    #[test]
    fn decode_deinterleaves_stereo() {
        let chunk = encode_pcm16(&[0.25, -0.25, 0.5, -0.5], OUTPUT_SAMPLE_RATE, 2);
        let planar = decode_chunk(&chunk).unwrap();
        assert_eq!(planar, vec![vec![0.25, 0.5], vec![-0.25, -0.5]]);
    }

    #[test]
    fn odd_byte_length_is_malformed() {
        let chunk = WireChunk {
            data: STANDARD.encode([1u8, 2, 3]),
            mime_type: "audio/pcm;rate=24000".into(),
            sample_rate: OUTPUT_SAMPLE_RATE,
            channel_count: 1,
        };
        assert!(matches!(
            decode_chunk(&chunk),
            Err(VoiceError::MalformedAudioData(_))
        ));
    }

    #[test]
    fn stereo_requires_whole_frames() {
        let mut chunk = encode_pcm16(&[0.1, 0.2, 0.3], OUTPUT_SAMPLE_RATE, 1);
        chunk.channel_count = 2;
        assert!(matches!(
            decode_chunk(&chunk),
            Err(VoiceError::MalformedAudioData(_))
        ));
    }

    #[test]
    fn invalid_base64_and_zero_channels_are_malformed() {
        let bad = WireChunk::from_inline("not base64!!".into(), "audio/pcm;rate=24000".into());
        assert!(matches!(
            decode_chunk(&bad),
            Err(VoiceError::MalformedAudioData(_))
        ));

        let mut zero = encode_pcm16(&[0.1], OUTPUT_SAMPLE_RATE, 1);
        zero.channel_count = 0;
        assert!(decode_chunk(&zero).is_err());
    }

    #[test]
    fn inbound_rate_comes_from_mime_type() {
        let chunk = WireChunk::from_inline(String::new(), "audio/pcm;rate=22050".into());
        assert_eq!(chunk.sample_rate, 22_050);
        let fallback = WireChunk::from_inline(String::new(), "audio/pcm".into());
        assert_eq!(fallback.sample_rate, OUTPUT_SAMPLE_RATE);
        assert!(is_pcm_mime("audio/pcm;rate=24000"));
        assert!(!is_pcm_mime("audio/mpeg"));
    }

    #[test]
    fn empty_chunk_decodes_to_empty_buffer() {
        let chunk = WireChunk::from_inline(String::new(), "audio/pcm;rate=24000".into());
        let buffer = decode_playback_buffer(&chunk).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.sample_rate(), OUTPUT_SAMPLE_RATE);
    }
}
