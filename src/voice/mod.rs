//! Voice processing module
//!
//! Handles audio capture, voice activity detection, recognition, synthesis
//! and scheduled playback.

pub mod capture;
pub mod decode;
pub mod frame;
pub mod output;
pub mod playback;
pub mod stt;
pub mod tts;
pub mod vad;

pub use capture::{AudioCaptureSource, SAMPLE_RATE, samples_to_wav};
pub use frame::{AudioChunk, AudioFrame, Utterance};
pub use output::{DeviceOutput, PLAYBACK_SAMPLE_RATE};
pub use playback::{AudioSink, PlaybackConfig, PlaybackScheduler, PlaybackSlot, PlaybackState};
pub use stt::{SpeechRecognitionClient, Transcript};
pub use tts::{SpeechSynthesisClient, SynthesisSession};
pub use vad::{VadConfig, VadEvent, VoiceActivityGate};
