//! Configuration management for the voice pipeline
//!
//! Values resolve as env > toml > default. Environment lookups go through
//! a function so tests can supply their own variables.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::animation::{AnimationConfig, Mood};
use crate::conversation::SegmenterConfig;
use crate::llm::LlmConfig;
use crate::voice::capture::DEFAULT_FRAME_SIZE;
use crate::voice::playback::PlaybackConfig;
use crate::voice::stt::{BlobProvider, SttConfig, SttMode};
use crate::voice::tts::TtsConfig;
use crate::voice::vad::VadConfig;
use crate::{Error, Result};

use self::file::VoiceConfigFile;

/// Default port for the event API
pub const DEFAULT_API_PORT: u16 = 18790;

/// Event API server configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiServerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_API_PORT,
        }
    }
}

/// Animation tuning plus the render tick that drives it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationSettings {
    pub driver: AnimationConfig,
    /// Resting mood of the face
    pub mood: Mood,
    /// Interval between render ticks
    pub tick: Duration,
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            driver: AnimationConfig::default(),
            mood: Mood::Neutral,
            tick: Duration::from_millis(33),
        }
    }
}

/// Voice pipeline configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub vad: VadConfig,
    /// Samples per captured frame
    pub frame_size: usize,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub segmenter: SegmenterConfig,
    pub tts: TtsConfig,
    pub playback: PlaybackConfig,
    pub animation: AnimationSettings,
    pub api: ApiServerConfig,
    /// Cancel the reply when the user starts speaking over it
    pub barge_in: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            frame_size: DEFAULT_FRAME_SIZE,
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            segmenter: SegmenterConfig::default(),
            tts: TtsConfig::default(),
            playback: PlaybackConfig::default(),
            animation: AnimationSettings::default(),
            api: ApiServerConfig::default(),
            barge_in: true,
        }
    }
}

fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        // API keys (env > toml > None)
        let openai_key = env("OPENAI_API_KEY").or(fc.api_keys.openai);
        let deepgram_key = env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram);
        let tts_key = env("BEACON_TTS_API_KEY").or(fc.api_keys.tts);

        let vad = VadConfig {
            threshold: parse_env(&env, "BEACON_VAD_THRESHOLD")
                .or(fc.vad.threshold)
                .unwrap_or(defaults.vad.threshold),
            hold_off: millis(parse_env(&env, "BEACON_VAD_HOLD_OFF_MS").or(fc.vad.hold_off_ms))
                .unwrap_or(defaults.vad.hold_off),
        };

        let stt_mode = parse_env::<SttModeName>(&env, "BEACON_STT_MODE")
            .map(|m| m.0)
            .or(fc.stt.mode)
            .unwrap_or(defaults.stt.mode);
        let stt_provider = parse_env::<BlobProviderName>(&env, "BEACON_STT_PROVIDER")
            .map(|p| p.0)
            .or(fc.stt.provider)
            .unwrap_or(defaults.stt.provider);
        let stt_key = match (stt_mode, stt_provider) {
            (SttMode::Blob, BlobProvider::Whisper) => openai_key.clone(),
            _ => deepgram_key,
        };
        let stt = SttConfig {
            mode: stt_mode,
            provider: stt_provider,
            url: env("BEACON_STT_URL").or(fc.stt.url),
            model: env("BEACON_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or_else(|| match (stt_mode, stt_provider) {
                    (SttMode::Blob, BlobProvider::Whisper) => "whisper-1".to_string(),
                    _ => defaults.stt.model.clone(),
                }),
            api_key: stt_key.map(SecretString::from),
            connect_timeout: millis(fc.stt.connect_timeout_ms)
                .unwrap_or(defaults.stt.connect_timeout),
            finalize_timeout: millis(fc.stt.finalize_timeout_ms)
                .unwrap_or(defaults.stt.finalize_timeout),
        };

        let llm = LlmConfig {
            url: env("BEACON_LLM_URL")
                .or(fc.llm.url)
                .unwrap_or_else(|| defaults.llm.url.clone()),
            model: env("BEACON_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| defaults.llm.model.clone()),
            api_key: env("BEACON_LLM_API_KEY")
                .or(openai_key)
                .map(SecretString::from),
            system_prompt: env("BEACON_SYSTEM_PROMPT")
                .or(fc.llm.system_prompt)
                .unwrap_or_else(|| defaults.llm.system_prompt.clone()),
            max_tokens: fc.llm.max_tokens.unwrap_or(defaults.llm.max_tokens),
            idle_timeout: millis(
                parse_env(&env, "BEACON_LLM_IDLE_TIMEOUT_MS").or(fc.llm.idle_timeout_ms),
            )
            .unwrap_or(defaults.llm.idle_timeout),
            history_turns: fc.llm.history_turns.unwrap_or(defaults.llm.history_turns),
        };

        let segmenter = SegmenterConfig {
            min_chars: fc.segmenter.min_chars.unwrap_or(defaults.segmenter.min_chars),
            inactivity_timeout: millis(fc.segmenter.inactivity_timeout_ms)
                .unwrap_or(defaults.segmenter.inactivity_timeout),
        };

        let tts = TtsConfig {
            url: env("BEACON_TTS_URL")
                .or(fc.tts.url)
                .unwrap_or_else(|| defaults.tts.url.clone()),
            model: env("BEACON_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or_else(|| defaults.tts.model.clone()),
            voice_id: env("BEACON_TTS_VOICE")
                .or(fc.tts.voice_id)
                .unwrap_or_else(|| defaults.tts.voice_id.clone()),
            api_key: tts_key.map(SecretString::from),
            sample_rate: parse_env(&env, "BEACON_TTS_SAMPLE_RATE")
                .or(fc.tts.sample_rate)
                .unwrap_or(defaults.tts.sample_rate),
            encoding: parse_env(&env, "BEACON_TTS_ENCODING")
                .or(fc.tts.encoding)
                .unwrap_or(defaults.tts.encoding),
            connect_timeout: millis(fc.tts.connect_timeout_ms)
                .unwrap_or(defaults.tts.connect_timeout),
        };

        let pb = &defaults.playback;
        let playback = PlaybackConfig {
            lead_in_chunks: fc.playback.lead_in_chunks.unwrap_or(pb.lead_in_chunks),
            minimum_queued_time: millis(fc.playback.minimum_queued_time_ms)
                .unwrap_or(pb.minimum_queued_time),
            gap_recovery_time: millis(fc.playback.gap_recovery_time_ms)
                .unwrap_or(pb.gap_recovery_time),
            amplitude_gain: fc.playback.amplitude_gain.unwrap_or(pb.amplitude_gain),
            amplitude_window: millis(fc.playback.amplitude_window_ms)
                .unwrap_or(pb.amplitude_window),
        };

        let an = &defaults.animation.driver;
        let animation = AnimationSettings {
            driver: AnimationConfig {
                jaw_gain: fc.animation.jaw_gain.unwrap_or(an.jaw_gain),
                jaw_smoothing: fc.animation.jaw_smoothing.unwrap_or(an.jaw_smoothing),
                expression_smoothing: fc
                    .animation
                    .expression_smoothing
                    .unwrap_or(an.expression_smoothing),
                laughter_jaw: fc.animation.laughter_jaw.unwrap_or(an.laughter_jaw),
                blink_probability: fc
                    .animation
                    .blink_probability
                    .unwrap_or(an.blink_probability),
                blink_speed: fc.animation.blink_speed.unwrap_or(an.blink_speed),
                gaze_shift_probability: fc
                    .animation
                    .gaze_shift_probability
                    .unwrap_or(an.gaze_shift_probability),
            },
            mood: fc.animation.mood.unwrap_or(defaults.animation.mood),
            tick: millis(fc.animation.tick_ms).unwrap_or(defaults.animation.tick),
        };

        let api = ApiServerConfig {
            enabled: parse_env(&env, "BEACON_API_ENABLED")
                .or(fc.api.enabled)
                .unwrap_or(defaults.api.enabled),
            port: parse_env(&env, "BEACON_API_PORT")
                .or(fc.api.port)
                .unwrap_or(defaults.api.port),
        };

        let config = Self {
            vad,
            frame_size: fc.vad.frame_size.unwrap_or(defaults.frame_size),
            stt,
            llm,
            segmenter,
            tts,
            playback,
            animation,
            api,
            barge_in: parse_env(&env, "BEACON_BARGE_IN")
                .or(fc.barge_in.enabled)
                .unwrap_or(defaults.barge_in),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that would break the pipeline at runtime
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, message: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(message.to_string()))
            }
        }

        let unit = |v: f32| v > 0.0 && v <= 1.0;
        let probability = |p: f64| (0.0..=1.0).contains(&p);

        check(self.vad.threshold > 0.0, "vad.threshold must be positive")?;
        check(!self.vad.hold_off.is_zero(), "vad.hold_off_ms must be positive")?;
        check(self.frame_size > 0, "vad.frame_size must be positive")?;
        check(!self.llm.idle_timeout.is_zero(), "llm.idle_timeout_ms must be positive")?;
        check(self.segmenter.min_chars > 0, "segmenter.min_chars must be positive")?;
        check(
            !self.segmenter.inactivity_timeout.is_zero(),
            "segmenter.inactivity_timeout_ms must be positive",
        )?;
        check(self.tts.sample_rate > 0, "tts.sample_rate must be positive")?;
        check(self.playback.lead_in_chunks >= 1, "playback.lead_in_chunks must be at least 1")?;
        check(self.playback.amplitude_gain > 0.0, "playback.amplitude_gain must be positive")?;
        check(
            !self.playback.amplitude_window.is_zero(),
            "playback.amplitude_window_ms must be positive",
        )?;
        check(!self.animation.tick.is_zero(), "animation.tick_ms must be positive")?;
        check(
            unit(self.animation.driver.jaw_smoothing),
            "animation.jaw_smoothing must be in (0, 1]",
        )?;
        check(
            unit(self.animation.driver.expression_smoothing),
            "animation.expression_smoothing must be in (0, 1]",
        )?;
        check(
            probability(self.animation.driver.blink_probability),
            "animation.blink_probability must be in [0, 1]",
        )?;
        check(
            probability(self.animation.driver.gaze_shift_probability),
            "animation.gaze_shift_probability must be in [0, 1]",
        )?;
        check(
            self.animation.driver.blink_speed > 0.0,
            "animation.blink_speed must be positive",
        )?;
        check(!self.api.enabled || self.api.port > 0, "api.port must be non-zero")?;
        Ok(())
    }
}

/// Parse an environment value, ignoring values that do not parse
fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|s| s.trim().parse().ok())
}

struct SttModeName(SttMode);

impl FromStr for SttModeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "streaming" | "stream" => Ok(Self(SttMode::Streaming)),
            "blob" => Ok(Self(SttMode::Blob)),
            other => Err(Error::Config(format!("unknown stt mode: {other}"))),
        }
    }
}

struct BlobProviderName(BlobProvider);

impl FromStr for BlobProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self(BlobProvider::Whisper)),
            "deepgram" => Ok(Self(BlobProvider::Deepgram)),
            other => Err(Error::Config(format!("unknown stt provider: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::voice::decode::AudioEncoding;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_sources(VoiceConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.playback.lead_in_chunks, 5);
        assert_eq!(config.segmenter.min_chars, 40);
        assert_eq!(config.api.port, DEFAULT_API_PORT);
        assert!(config.barge_in);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = VoiceConfigFile::default();
        fc.tts.voice_id = Some("from-file".to_string());
        fc.api.port = Some(9000);
        fc.api_keys.openai = Some("file-key".to_string());

        let config = Config::from_sources(
            fc,
            env_of(&[
                ("BEACON_TTS_VOICE", "from-env"),
                ("OPENAI_API_KEY", "env-key"),
                ("BEACON_TTS_ENCODING", "mp3"),
                ("BEACON_VAD_THRESHOLD", "0.1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.tts.voice_id, "from-env");
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.tts.encoding, AudioEncoding::Mp3);
        assert!((config.vad.threshold - 0.1).abs() < 1e-6);
        assert_eq!(
            config.llm.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("env-key".to_string())
        );
    }

    #[test]
    fn stt_key_follows_backend() {
        let env = env_of(&[
            ("OPENAI_API_KEY", "openai"),
            ("DEEPGRAM_API_KEY", "deepgram"),
            ("BEACON_STT_MODE", "blob"),
        ]);
        let config = Config::from_sources(VoiceConfigFile::default(), env).unwrap();
        assert_eq!(config.stt.mode, SttMode::Blob);
        assert_eq!(config.stt.model, "whisper-1");
        assert_eq!(
            config.stt.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("openai".to_string())
        );

        let config = Config::from_sources(
            VoiceConfigFile::default(),
            env_of(&[("DEEPGRAM_API_KEY", "deepgram")]),
        )
        .unwrap();
        assert_eq!(config.stt.mode, SttMode::Streaming);
        assert_eq!(
            config.stt.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("deepgram".to_string())
        );
    }

    #[test]
    fn unparsable_env_values_are_ignored() {
        let config = Config::from_sources(
            VoiceConfigFile::default(),
            env_of(&[("BEACON_API_PORT", "not-a-port")]),
        )
        .unwrap();
        assert_eq!(config.api.port, DEFAULT_API_PORT);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut fc = VoiceConfigFile::default();
        fc.playback.lead_in_chunks = Some(0);
        let err = Config::from_sources(fc, env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("lead_in_chunks"));

        let mut config = Config::default();
        config.vad.threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.animation.driver.blink_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let config = Config::from_sources(
            VoiceConfigFile::default(),
            env_of(&[("OPENAI_API_KEY", "sk-very-secret")]),
        )
        .unwrap();
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }
}
