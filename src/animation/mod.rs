//! Facial animation from playback amplitude and reply text
//!
//! [`FacialAnimationDriver::update`] runs once per render tick. Every
//! output moves toward its target by a smoothing factor; nothing is ever
//! assigned directly, so the renderer sees continuous motion.

pub mod laughter;
pub mod viseme;

pub use viseme::Viseme;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Emotional tone driving the resting expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Neutral,
    Happy,
    Sad,
    Surprised,
    Thinking,
}

/// Expression targets for a mood or for laughter
#[derive(Debug, Clone, Copy, PartialEq)]
struct Expression {
    smile: f32,
    brow_y: f32,
    brow_angle: f32,
    eye_squint: f32,
}

impl Mood {
    const fn expression(self) -> Expression {
        match self {
            Self::Neutral => Expression {
                smile: 0.1,
                brow_y: 0.0,
                brow_angle: 0.0,
                eye_squint: 0.0,
            },
            Self::Happy => Expression {
                smile: 0.7,
                brow_y: 0.15,
                brow_angle: 0.0,
                eye_squint: 0.2,
            },
            Self::Sad => Expression {
                smile: -0.4,
                brow_y: -0.1,
                brow_angle: 0.4,
                eye_squint: 0.1,
            },
            Self::Surprised => Expression {
                smile: 0.0,
                brow_y: 0.6,
                brow_angle: 0.0,
                eye_squint: -0.3,
            },
            Self::Thinking => Expression {
                smile: 0.0,
                brow_y: 0.2,
                brow_angle: -0.3,
                eye_squint: 0.25,
            },
        }
    }
}

const LAUGHTER: Expression = Expression {
    smile: 1.0,
    brow_y: 0.4,
    brow_angle: 0.0,
    eye_squint: 0.7,
};

/// Droopy, unfocused face shown while disconnected
const DISCONNECTED: Expression = Expression {
    smile: 0.0,
    brow_y: -0.15,
    brow_angle: 0.0,
    eye_squint: 0.35,
};

/// Tuning for the driver; the defaults are empirical
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationConfig {
    /// Amplitude multiplier for the jaw target
    pub jaw_gain: f32,
    /// Per-tick smoothing factor for the jaw
    pub jaw_smoothing: f32,
    /// Per-tick smoothing factor for expression targets
    pub expression_smoothing: f32,
    /// Jaw openness forced while laughing
    pub laughter_jaw: f32,
    /// Chance per tick that a blink starts
    pub blink_probability: f64,
    /// Eyelid travel per tick during a blink
    pub blink_speed: f32,
    /// Chance per tick that the gaze picks a new target
    pub gaze_shift_probability: f64,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            jaw_gain: 2.5,
            jaw_smoothing: 0.35,
            expression_smoothing: 0.12,
            laughter_jaw: 0.7,
            blink_probability: 0.006,
            blink_speed: 0.25,
            gaze_shift_probability: 0.01,
        }
    }
}

/// Position in the blink cycle
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(tag = "phase", content = "lid", rename_all = "snake_case")]
pub enum BlinkPhase {
    #[default]
    Open,
    /// Lid closing; value is closure in `[0, 1]`
    Closing(f32),
    /// Lid reopening; value is closure in `[0, 1]`
    Opening(f32),
}

impl BlinkPhase {
    /// Eyelid closure in `[0, 1]`
    #[must_use]
    pub const fn closure(self) -> f32 {
        match self {
            Self::Open => 0.0,
            Self::Closing(v) | Self::Opening(v) => v,
        }
    }
}

/// Face pose handed to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AnimationState {
    pub jaw_openness: f32,
    pub viseme: Viseme,
    pub mood: Mood,
    pub smile_intensity: f32,
    pub brow_y: f32,
    pub brow_angle: f32,
    pub eye_squint: f32,
    pub look_x: f32,
    pub look_y: f32,
    pub blink_phase: BlinkPhase,
    pub laughing: bool,
}

/// Smooth `current` toward `target` by `factor`
fn approach(current: f32, target: f32, factor: f32) -> f32 {
    current + (target - current) * factor.clamp(0.0, 1.0)
}

/// Turns amplitude and text into a continuously smoothed face
pub struct FacialAnimationDriver<R> {
    config: AnimationConfig,
    state: AnimationState,
    look_target: (f32, f32),
    rng: R,
}

impl<R: Rng> FacialAnimationDriver<R> {
    #[must_use]
    pub fn new(config: AnimationConfig, rng: R) -> Self {
        Self {
            config,
            state: AnimationState::default(),
            look_target: (0.0, 0.0),
            rng,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &AnimationState {
        &self.state
    }

    /// Advance one render tick
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn update(
        &mut self,
        mood: Mood,
        amplitude: f32,
        is_connected: bool,
        current_text: &str,
        speech_progress: f32,
    ) -> AnimationState {
        let amplitude = amplitude.clamp(0.0, 1.0);
        let speaking = amplitude > 0.0 && !current_text.is_empty();
        let char_count = current_text.chars().count();
        let index = ((speech_progress.clamp(0.0, 1.0) * char_count as f32).floor() as usize)
            .min(char_count.saturating_sub(1));

        let laughing = speaking && laughter::is_laughing_at(current_text, index);
        let viseme = if speaking {
            viseme::classify(current_text, speech_progress)
        } else {
            Viseme::Rest
        };

        // The viseme shapes the mouth separately; the jaw follows the envelope
        let mut jaw_target = (amplitude * self.config.jaw_gain).min(1.0);
        if laughing {
            jaw_target = jaw_target.max(self.config.laughter_jaw);
        }
        if !is_connected {
            jaw_target = 0.0;
        }

        let expression = if !is_connected {
            DISCONNECTED
        } else if laughing {
            LAUGHTER
        } else {
            mood.expression()
        };

        let s = self.config.expression_smoothing;
        let state = &mut self.state;
        state.jaw_openness = approach(state.jaw_openness, jaw_target.clamp(0.0, 1.0), self.config.jaw_smoothing);
        state.smile_intensity = approach(state.smile_intensity, expression.smile, s);
        state.brow_y = approach(state.brow_y, expression.brow_y, s);
        state.brow_angle = approach(state.brow_angle, expression.brow_angle, s);
        state.eye_squint = approach(state.eye_squint, expression.eye_squint, s);
        state.viseme = viseme;
        state.mood = mood;
        state.laughing = laughing;

        self.update_gaze(is_connected);
        self.update_blink();
        self.state
    }

    fn update_gaze(&mut self, is_connected: bool) {
        if !is_connected {
            self.look_target = (0.0, -0.4);
        } else if self.rng.gen_bool(self.config.gaze_shift_probability.clamp(0.0, 1.0)) {
            self.look_target = (self.rng.gen_range(-0.3..=0.3), self.rng.gen_range(-0.2..=0.2));
        }

        let s = self.config.expression_smoothing;
        self.state.look_x = approach(self.state.look_x, self.look_target.0, s);
        self.state.look_y = approach(self.state.look_y, self.look_target.1, s);
    }

    fn update_blink(&mut self) {
        let speed = self.config.blink_speed.max(f32::EPSILON);
        self.state.blink_phase = match self.state.blink_phase {
            BlinkPhase::Open => {
                if self.rng.gen_bool(self.config.blink_probability.clamp(0.0, 1.0)) {
                    BlinkPhase::Closing(speed.min(1.0))
                } else {
                    BlinkPhase::Open
                }
            }
            BlinkPhase::Closing(v) if v + speed >= 1.0 => BlinkPhase::Opening(1.0),
            BlinkPhase::Closing(v) => BlinkPhase::Closing(v + speed),
            BlinkPhase::Opening(v) if v - speed <= 0.0 => BlinkPhase::Open,
            BlinkPhase::Opening(v) => BlinkPhase::Opening(v - speed),
        };
    }
}
