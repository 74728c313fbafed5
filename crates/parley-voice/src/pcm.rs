//! PCM framing: float samples to 16-bit wire frames and back.
//!
//! Outbound microphone blocks are quantized to signed 16-bit little-endian
//! PCM and base64-encoded for text transports. Inbound frames are decoded
//! into per-channel float planes ready for the playback scheduler.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

/// Scale between normalized float samples and 16-bit integers.
pub const PCM_SCALE: f32 = 32768.0;

/// A block of interleaved 16-bit PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Quantize normalized float samples into a frame.
    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.iter().map(|&s| quantize(s)).collect(),
            sample_rate,
            channels,
        }
    }

    /// Little-endian byte representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    /// Base64 (standard alphabet, padded) of the little-endian bytes.
    pub fn to_base64(&self) -> String {
        B64.encode(self.to_bytes())
    }
}

/// Quantize one sample: scale by 32768, truncate toward zero, saturate to the
/// i16 range. Values beyond ±1.0 saturate instead of wrapping; NaN becomes 0.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    // `as` saturates and maps NaN to 0
    (sample * PCM_SCALE) as i16
}

/// A decoded, de-interleaved audio buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    planes: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl DecodedBuffer {
    /// Build from per-channel planes. All planes must have equal length.
    pub fn from_planes(planes: Vec<Vec<f32>>, sample_rate: u32) -> VoiceResult<Self> {
        if planes.is_empty() || sample_rate == 0 {
            return Err(VoiceError::MalformedFrame(
                "buffer needs at least one channel and a non-zero sample rate".to_string(),
            ));
        }
        let frames = planes[0].len();
        if planes.iter().any(|p| p.len() != frames) {
            return Err(VoiceError::MalformedFrame(
                "channel planes differ in length".to_string(),
            ));
        }
        Ok(Self { planes, sample_rate })
    }

    /// Mono buffer from a single plane.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> VoiceResult<Self> {
        Self::from_planes(vec![samples], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.planes.len() as u16
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.planes.get(index).map(Vec::as_slice)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Re-interleave the planes for devices that take interleaved input.
    pub fn interleaved(&self) -> Vec<f32> {
        let channels = self.planes.len();
        let mut out = Vec::with_capacity(self.frames() * channels);
        for i in 0..self.frames() {
            for plane in &self.planes {
                out.push(plane[i]);
            }
        }
        out
    }

    /// Root-mean-square level across all channels (0.0 for an empty buffer).
    pub fn rms(&self) -> f32 {
        rms(&self.interleaved())
    }
}

/// Decode a 16-bit little-endian PCM frame.
///
/// The frame length must be an exact multiple of `channels * 2` bytes.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<DecodedBuffer> {
    if channels == 0 {
        return Err(VoiceError::MalformedFrame("channel count is zero".to_string()));
    }
    if sample_rate == 0 {
        return Err(VoiceError::MalformedFrame("sample rate is zero".to_string()));
    }
    let stride = channels as usize * 2;
    if bytes.len() % stride != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "{} bytes is not a multiple of {} ({} channel(s) x 2 bytes)",
            bytes.len(),
            stride,
            channels
        )));
    }

    let frames = bytes.len() / stride;
    let mut planes = vec![Vec::with_capacity(frames); channels as usize];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        planes[i % channels as usize].push(sample as f32 / PCM_SCALE);
    }

    Ok(DecodedBuffer { planes, sample_rate })
}

/// Decode a base64 PCM16 payload.
pub fn decode_pcm16_base64(data: &str, sample_rate: u32, channels: u16) -> VoiceResult<DecodedBuffer> {
    let bytes = B64.decode(data.trim())?;
    decode_pcm16(&bytes, sample_rate, channels)
}

/// RMS level of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
