//! Pipeline events exposed to the surrounding UI
//!
//! Every observable step of a conversation is published as a
//! [`PipelineEvent`] on an [`EventBus`]. Publishing is best-effort: an event
//! with no subscribers is dropped and never blocks the pipeline loop.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Events buffered per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// How a conversational turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The model reached its completion marker
    Completed,
    /// Barge-in or explicit stop
    Cancelled,
    /// The model stream failed; text holds whatever arrived before the failure
    Failed,
}

/// An observable step of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The user started speaking
    SpeechStart { utterance_id: u64 },
    /// The user stopped speaking and the utterance was handed to recognition
    SpeechEnd { utterance_id: u64, duration_ms: u64 },
    /// Recognition hypothesis that may still change
    PartialTranscript { utterance_id: u64, text: String },
    /// The one final transcript for an utterance
    FinalTranscript {
        utterance_id: u64,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    /// Model output for the active turn
    TextDelta { turn_id: u64, text: String },
    /// Loudness of the audio currently playing, in `[0, 1]`
    AudioLevel { level: f32 },
    /// Synthesis audio skipped sequence positions
    AudioGap {
        session_id: String,
        expected: u64,
        received: u64,
    },
    /// A turn ended
    TurnComplete {
        turn_id: u64,
        text: String,
        outcome: TurnOutcome,
    },
    /// A component reported a failure
    Error { kind: ErrorKind, detail: String },
}

impl PipelineEvent {
    /// Build an error event from a pipeline error
    #[must_use]
    pub fn error(error: &crate::Error) -> Self {
        Self::Error {
            kind: error.kind(),
            detail: error.to_string(),
        }
    }
}

/// Fan-out of pipeline events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event to current subscribers
    pub fn publish(&self, event: PipelineEvent) {
        tracing::trace!(?event, "pipeline event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// Receive events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
