//! Voice activity gate
//!
//! Classifies each captured frame as speech or silence and turns the
//! stream into utterances. Time is measured on the audio timeline (the
//! summed duration of fed frames), so the hold-off behaves identically
//! whether frames arrive live or from a test buffer.

use std::time::Duration;

use super::frame::{AudioFrame, Utterance};

/// Mean absolute deviation above which a frame counts as speech
pub const DEFAULT_THRESHOLD: f32 = 0.02;

/// Silence required after speech before the utterance is closed
pub const DEFAULT_HOLD_OFF: Duration = Duration::from_secs(2);

/// Tuning for the voice activity gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Speech threshold on per-frame mean absolute deviation
    pub threshold: f32,
    /// Silence hold-off before an utterance ends
    pub hold_off: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            hold_off: DEFAULT_HOLD_OFF,
        }
    }
}

/// State of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No utterance open
    Silent,
    /// Utterance open and the last frame was speech
    Speaking,
    /// Utterance open, counting down the silence hold-off
    Holding {
        /// Silence accumulated since the last speech frame
        silent_for: Duration,
    },
}

/// Event produced by feeding a frame
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// An utterance opened
    SpeechStart {
        /// Identifier of the new utterance
        utterance_id: u64,
    },
    /// The open utterance closed after the hold-off elapsed
    SpeechEnd(Utterance),
}

/// Splits a continuous frame stream into utterances
#[derive(Debug)]
pub struct VoiceActivityGate {
    config: VadConfig,
    state: VadState,
    utterance: Option<Utterance>,
    next_id: u64,
}

impl VoiceActivityGate {
    #[must_use]
    pub const fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Silent,
            utterance: None,
            next_id: 0,
        }
    }

    /// Classify one frame, returning an event when an utterance opens or closes
    pub fn feed(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let level = mean_absolute_deviation(frame.samples());
        let is_speech = level > self.config.threshold;

        match self.state {
            VadState::Silent => {
                if !is_speech {
                    return None;
                }

                let id = self.next_id;
                self.next_id += 1;

                let mut utterance = Utterance::new(id, frame.sample_rate());
                utterance.push(frame);
                self.utterance = Some(utterance);
                self.state = VadState::Speaking;

                tracing::debug!(utterance_id = id, level, "speech started");
                Some(VadEvent::SpeechStart { utterance_id: id })
            }
            VadState::Speaking | VadState::Holding { .. } => {
                if let Some(utterance) = self.utterance.as_mut() {
                    utterance.push(frame);
                }

                if is_speech {
                    // Speech resumed before the hold-off fired
                    self.state = VadState::Speaking;
                    return None;
                }

                let silent_for = match self.state {
                    VadState::Holding { silent_for } => silent_for + frame.duration(),
                    _ => frame.duration(),
                };

                if silent_for < self.config.hold_off {
                    self.state = VadState::Holding { silent_for };
                    return None;
                }

                self.state = VadState::Silent;
                let utterance = self.utterance.take()?;
                tracing::debug!(
                    utterance_id = utterance.id,
                    duration_ms = utterance.duration().as_millis(),
                    "speech ended"
                );
                Some(VadEvent::SpeechEnd(utterance))
            }
        }
    }

    /// Whether an utterance is open and frames should reach the recognizer
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self.state, VadState::Silent)
    }

    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }

    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Drop any open utterance and return to silence
    pub fn reset(&mut self) {
        self.state = VadState::Silent;
        self.utterance = None;
    }
}

/// Mean absolute deviation of sample amplitude around the frame mean
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn mean_absolute_deviation(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    samples.iter().map(|s| (s - mean).abs()).sum::<f32>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    fn frame(level: f32) -> AudioFrame {
        // Square wave so the deviation equals the level exactly
        let samples: Vec<f32> = (0..320)
            .map(|i| if i % 2 == 0 { level } else { -level })
            .collect();
        AudioFrame::new(samples, RATE)
    }

    #[test]
    fn deviation_ignores_dc_offset() {
        let offset = vec![0.4f32; 256];
        assert!(mean_absolute_deviation(&offset) < 1e-6);

        let square: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        assert!((mean_absolute_deviation(&square) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn speech_resuming_cancels_hold_off() {
        let mut gate = VoiceActivityGate::new(VadConfig::default());

        assert!(matches!(gate.feed(&frame(0.2)), Some(VadEvent::SpeechStart { .. })));

        // 1 second of silence, below the hold-off
        for _ in 0..50 {
            assert!(gate.feed(&frame(0.0)).is_none());
        }
        assert!(matches!(gate.state(), VadState::Holding { .. }));

        assert!(gate.feed(&frame(0.2)).is_none());
        assert_eq!(gate.state(), VadState::Speaking);

        // Another 1.5 seconds still does not close it
        for _ in 0..75 {
            assert!(gate.feed(&frame(0.0)).is_none());
        }
        assert!(gate.is_open());
    }

    #[test]
    fn utterance_ids_increase_and_buffers_are_released() {
        let mut gate = VoiceActivityGate::new(VadConfig {
            threshold: 0.05,
            hold_off: Duration::from_millis(100),
        });

        let mut ended = Vec::new();
        for _ in 0..2 {
            gate.feed(&frame(0.3));
            for _ in 0..5 {
                if let Some(VadEvent::SpeechEnd(u)) = gate.feed(&frame(0.0)) {
                    ended.push(u);
                }
            }
        }

        assert_eq!(ended.len(), 2);
        assert_eq!(ended[0].id, 0);
        assert_eq!(ended[1].id, 1);
        // Second utterance holds only its own audio: 1 speech + 5 silent frames
        assert_eq!(ended[1].samples().len(), 320 * 6);
    }

    #[test]
    fn reset_discards_open_utterance() {
        let mut gate = VoiceActivityGate::new(VadConfig::default());
        gate.feed(&frame(0.3));
        assert!(gate.is_open());

        gate.reset();
        assert!(!gate.is_open());
        assert_eq!(gate.state(), VadState::Silent);
    }
}
