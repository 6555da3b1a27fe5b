//! Audio buffers passed between pipeline stages

use std::sync::Arc;
use std::time::Duration;

use crate::clock::frames_to_duration;

/// Fixed-length block of mono PCM samples
///
/// Samples are shared behind an `Arc` so a frame can be handed to the VAD,
/// the recognizer and diagnostics without copying. Frames are immutable
/// once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    #[must_use]
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Build a frame from signed 16-bit samples
    #[must_use]
    pub fn from_i16(samples: &[i16], sample_rate: u32) -> Self {
        let samples: Vec<f32> = samples.iter().map(|&s| f32::from(s) / 32768.0).collect();
        Self::new(samples, sample_rate)
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always mono
    #[must_use]
    pub const fn channels(&self) -> u16 {
        1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.samples.len() as u64, self.sample_rate)
    }

    /// Little-endian signed 16-bit encoding for recognition services
    #[must_use]
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        pcm16_le(&self.samples)
    }
}

/// Span of captured speech between a VAD start and end event
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Monotonic utterance number within the capture session
    pub id: u64,
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Utterance {
    #[must_use]
    pub const fn new(id: u64, sample_rate: u32) -> Self {
        Self {
            id,
            samples: Vec::new(),
            sample_rate,
        }
    }

    pub(crate) fn push(&mut self, frame: &AudioFrame) {
        self.samples.extend_from_slice(frame.samples());
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.samples.len() as u64, self.sample_rate)
    }

    /// Consume the utterance, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Decoded synthesis audio tagged with its position in a session
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Session the chunk belongs to
    pub session_id: String,
    /// Contiguous intra-session position, starting at zero
    pub sequence: u64,
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioChunk {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        sequence: u64,
        samples: impl Into<Arc<[f32]>>,
        sample_rate: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sequence,
            samples: samples.into(),
            sample_rate,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the samples for the output device
    #[must_use]
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.samples.len() as u64, self.sample_rate)
    }
}

/// Convert f32 samples in [-1.0, 1.0] to little-endian i16 bytes
#[must_use]
pub fn pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode little-endian i16 bytes into f32 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// Root-mean-square level of a block of samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
