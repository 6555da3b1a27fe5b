//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/voice.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::animation::Mood;
use crate::voice::decode::AudioEncoding;
use crate::voice::stt::{BlobProvider, SttMode};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    #[serde(default)]
    pub vad: VadFileConfig,

    #[serde(default)]
    pub stt: SttFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub playback: PlaybackFileConfig,

    #[serde(default)]
    pub animation: AnimationFileConfig,

    #[serde(default)]
    pub api: ApiFileConfig,

    #[serde(default)]
    pub barge_in: BargeInFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Voice activity detection and capture
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub threshold: Option<f32>,
    pub hold_off_ms: Option<u64>,
    /// Samples per captured frame
    pub frame_size: Option<usize>,
}

/// Speech recognition
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub mode: Option<SttMode>,
    pub provider: Option<BlobProvider>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub finalize_timeout_ms: Option<u64>,
}

/// Language model
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub idle_timeout_ms: Option<u64>,
    pub history_turns: Option<usize>,
}

/// Fragment release rules
#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    pub min_chars: Option<usize>,
    pub inactivity_timeout_ms: Option<u64>,
}

/// Speech synthesis
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice_id: Option<String>,
    pub sample_rate: Option<u32>,
    pub encoding: Option<AudioEncoding>,
    pub connect_timeout_ms: Option<u64>,
}

/// Playback scheduling
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub lead_in_chunks: Option<usize>,
    pub minimum_queued_time_ms: Option<u64>,
    pub gap_recovery_time_ms: Option<u64>,
    pub amplitude_gain: Option<f32>,
    pub amplitude_window_ms: Option<u64>,
}

/// Facial animation
#[derive(Debug, Default, Deserialize)]
pub struct AnimationFileConfig {
    pub mood: Option<Mood>,
    pub tick_ms: Option<u64>,
    pub jaw_gain: Option<f32>,
    pub jaw_smoothing: Option<f32>,
    pub expression_smoothing: Option<f32>,
    pub laughter_jaw: Option<f32>,
    pub blink_probability: Option<f64>,
    pub blink_speed: Option<f32>,
    pub gaze_shift_probability: Option<f64>,
}

/// Event API server
#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

/// Interrupting the assistant by speaking
#[derive(Debug, Default, Deserialize)]
pub struct BargeInFileConfig {
    pub enabled: Option<bool>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub tts: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> VoiceConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    load_from_path(&path)
}

/// Load a config file from an explicit path, falling back to defaults
#[must_use]
pub fn load_from_path(path: &Path) -> VoiceConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon/voice.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("voice.toml")
    })
}
