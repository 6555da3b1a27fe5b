//! Beacon Voice - real-time voice conversation pipeline for AI assistants
//!
//! Turns continuous microphone audio into recognized speech, feeds final
//! transcripts to a streaming language model, synthesizes the reply as it
//! arrives and plays it back gaplessly while driving facial animation.
//!
//! # Architecture
//!
//! ```text
//! capture ─▶ vad ─▶ stt ─▶ conversation ─▶ llm
//!                              │            │
//!                              │      segmenter
//!                              ▼            ▼
//!          animation ◀─ playback ◀──────── tts
//! ```
//!
//! Components that decide (the gate, the controller, the segmenter, the
//! scheduler, the animation driver) perform no IO and read time through
//! [`clock::Clock`]; the [`daemon`] loop connects them to devices and
//! services.

pub mod animation;
pub mod api;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod daemon;
pub mod error;
pub mod events;
pub mod llm;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, PipelineEvent};
