//! Shared test utilities
#![allow(
    dead_code,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use std::time::Duration;

use beacon_voice::voice::capture::DEFAULT_FRAME_SIZE;
use beacon_voice::voice::frame::{AudioChunk, AudioFrame};
use beacon_voice::voice::playback::{AudioSink, PlaybackSlot};
use beacon_voice::voice::SAMPLE_RATE;

/// Generate sine wave audio samples
pub fn sine(frequency: f32, duration: Duration, amplitude: f32, sample_rate: u32) -> Vec<f32> {
    let num_samples = (sample_rate as f32 * duration.as_secs_f32()) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
pub fn silence(duration: Duration, sample_rate: u32) -> Vec<f32> {
    let num_samples = (sample_rate as f32 * duration.as_secs_f32()) as usize;
    vec![0.0; num_samples]
}

/// Split capture-rate samples into fixed-size frames, as the microphone would
pub fn frames(samples: &[f32]) -> Vec<AudioFrame> {
    samples
        .chunks(DEFAULT_FRAME_SIZE)
        .map(|chunk| AudioFrame::new(chunk.to_vec(), SAMPLE_RATE))
        .collect()
}

/// A synthesis chunk of constant level
pub fn chunk(session: &str, sequence: u64, duration: Duration, level: f32) -> AudioChunk {
    let rate = 24_000;
    let samples = vec![level; (rate as f32 * duration.as_secs_f32()) as usize];
    AudioChunk::new(session, sequence, samples, rate)
}

/// Sink that records every scheduling decision
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub slots: Vec<(u64, Duration, Duration)>,
    pub stops: usize,
}

impl RecordingSink {
    /// Start times in scheduling order
    pub fn starts(&self) -> Vec<Duration> {
        self.slots.iter().map(|(_, start, _)| *start).collect()
    }
}

impl AudioSink for RecordingSink {
    fn schedule(&mut self, slot: &PlaybackSlot) -> beacon_voice::Result<()> {
        self.slots
            .push((slot.chunk.sequence, slot.scheduled_start, slot.end()));
        Ok(())
    }

    fn stop_all(&mut self) {
        self.stops += 1;
        self.slots.clear();
    }
}
