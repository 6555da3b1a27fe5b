//! Turn-taking state machine
//!
//! The controller owns every conversational turn. It never performs IO;
//! each input returns the [`Action`]s the pipeline loop must carry out, in
//! order. Turns are identified by a monotonically increasing [`TurnId`] so
//! late output from a superseded model request can be recognized and
//! dropped.

pub mod segmenter;

pub use segmenter::{SegmenterConfig, SentenceSegmenter, TextFragment};

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::events::{PipelineEvent, TurnOutcome};
use crate::voice::stt::Transcript;
use crate::voice::tts::SynthesisSession;

/// Identifier of one user-utterance-to-reply cycle
pub type TurnId = u64;

/// Where the active turn is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// No turn in progress
    Idle,
    /// Prompt submitted, no model output yet
    AwaitingModelResponse,
    /// Model output is being segmented and sent to synthesis
    StreamingFragmentsToSpeech,
    /// Turn torn down; passes straight back to `Idle`
    Cancelled,
}

/// Why a turn is being cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The user started speaking over the reply
    BargeIn,
    /// Explicit stop request
    Stop,
    /// A new final transcript arrived while a turn was active
    Superseded,
    /// Synthesis for the reply failed
    SynthesisFailed,
}

impl CancelReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::BargeIn => "barge-in",
            Self::Stop => "stop",
            Self::Superseded => "superseded",
            Self::SynthesisFailed => "synthesis failed",
        }
    }
}

/// Side effect requested by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Start a model request for the turn
    SubmitPrompt { turn: TurnId, prompt: String },
    /// Open a synthesis session ahead of the first fragment
    OpenSynthesis {
        turn: TurnId,
        session: SynthesisSession,
    },
    /// Send a text fragment to synthesis
    SendFragment {
        session_id: String,
        fragment: TextFragment,
    },
    /// Abort the in-flight model request for the turn
    AbortModel { turn: TurnId },
    /// Halt all scheduled audio
    StopPlayback,
    /// Tell the synthesis service to drop the session
    CloseSynthesis { session_id: String },
    /// Publish an event
    Emit(PipelineEvent),
}

struct ActiveTurn {
    id: TurnId,
    session: SynthesisSession,
    text: String,
}

/// Drives turns from final transcripts to synthesized fragments
pub struct ConversationController<C> {
    state: TurnState,
    segmenter: SentenceSegmenter<C>,
    voice_id: String,
    next_turn: TurnId,
    turn: Option<ActiveTurn>,
    /// Session still playing after its turn completed
    speaking: Option<String>,
}

impl<C: Clock> ConversationController<C> {
    #[must_use]
    pub fn new(segmenter: SentenceSegmenter<C>, voice_id: impl Into<String>) -> Self {
        Self {
            state: TurnState::Idle,
            segmenter,
            voice_id: voice_id.into(),
            next_turn: 0,
            turn: None,
            speaking: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Whether a turn is waiting on or streaming model output
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(
            self.state,
            TurnState::AwaitingModelResponse | TurnState::StreamingFragmentsToSpeech
        )
    }

    /// Identifier of the active turn
    #[must_use]
    pub fn current_turn(&self) -> Option<TurnId> {
        self.turn.as_ref().map(|t| t.id)
    }

    /// Session of the active turn, or of the reply still playing
    #[must_use]
    pub fn current_session(&self) -> Option<&str> {
        self.turn
            .as_ref()
            .map(|t| t.session.session_id.as_str())
            .or(self.speaking.as_deref())
    }

    /// Text the model has produced for the active turn so far
    #[must_use]
    pub fn reply_text(&self) -> &str {
        self.turn.as_ref().map_or("", |t| t.text.as_str())
    }

    /// Start a turn from a final transcript
    ///
    /// A transcript that arrives while a turn is active cancels that turn
    /// first; the new one always wins.
    pub fn on_final_transcript(&mut self, transcript: &Transcript) -> Vec<Action> {
        let prompt = transcript.text.trim();
        if !transcript.is_final || prompt.is_empty() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.turn.is_some() || self.speaking.is_some() {
            actions.extend(self.cancel(CancelReason::Superseded));
        }

        let id = self.next_turn;
        self.next_turn += 1;
        let session = SynthesisSession::new(self.voice_id.clone());

        tracing::info!(
            turn = id,
            session_id = %session.session_id,
            utterance_id = transcript.utterance_id,
            "turn started"
        );

        self.segmenter.reset();
        self.turn = Some(ActiveTurn {
            id,
            session: session.clone(),
            text: String::new(),
        });
        self.state = TurnState::AwaitingModelResponse;

        actions.push(Action::OpenSynthesis { turn: id, session });
        actions.push(Action::SubmitPrompt {
            turn: id,
            prompt: prompt.to_string(),
        });
        actions
    }

    /// Feed a model delta for `turn`
    pub fn on_text_delta(&mut self, turn: TurnId, delta: &str) -> Vec<Action> {
        if !self.is_busy() || self.current_turn() != Some(turn) {
            tracing::debug!(turn, "dropping delta for inactive turn");
            return Vec::new();
        }
        let Some(active) = self.turn.as_mut() else {
            return Vec::new();
        };

        self.state = TurnState::StreamingFragmentsToSpeech;
        active.text.push_str(delta);

        let mut actions = vec![Action::Emit(PipelineEvent::TextDelta {
            turn_id: turn,
            text: delta.to_string(),
        })];
        let session_id = &active.session.session_id;
        actions.extend(
            self.segmenter
                .push(delta)
                .into_iter()
                .map(|fragment| Action::SendFragment {
                    session_id: session_id.clone(),
                    fragment,
                }),
        );
        actions
    }

    /// The model reached its completion marker for `turn`
    pub fn on_model_complete(&mut self, turn: TurnId) -> Vec<Action> {
        if !self.is_busy() || self.current_turn() != Some(turn) {
            return Vec::new();
        }
        let Some(active) = self.turn.take() else {
            return Vec::new();
        };

        tracing::info!(turn, chars = active.text.chars().count(), "turn complete");
        self.state = TurnState::Idle;
        self.speaking = Some(active.session.session_id.clone());

        vec![
            Action::SendFragment {
                session_id: active.session.session_id,
                fragment: self.segmenter.finish(),
            },
            Action::Emit(PipelineEvent::TurnComplete {
                turn_id: turn,
                text: active.text,
                outcome: TurnOutcome::Completed,
            }),
        ]
    }

    /// The model stream for `turn` failed
    ///
    /// If any text was produced it is still spoken and the turn ends with
    /// that partial reply; otherwise the synthesis session is closed unused.
    pub fn on_model_error(&mut self, turn: TurnId, error: &crate::Error) -> Vec<Action> {
        if !self.is_busy() || self.current_turn() != Some(turn) {
            return Vec::new();
        }
        let Some(active) = self.turn.take() else {
            return Vec::new();
        };

        tracing::warn!(turn, error = %error, "model stream failed");
        self.state = TurnState::Idle;

        let mut actions = vec![Action::Emit(PipelineEvent::Error {
            kind: error.kind(),
            detail: error.to_string(),
        })];

        if active.text.is_empty() {
            self.segmenter.reset();
            actions.push(Action::CloseSynthesis {
                session_id: active.session.session_id,
            });
        } else {
            self.speaking = Some(active.session.session_id.clone());
            actions.push(Action::SendFragment {
                session_id: active.session.session_id,
                fragment: self.segmenter.finish(),
            });
        }

        actions.push(Action::Emit(PipelineEvent::TurnComplete {
            turn_id: turn,
            text: active.text,
            outcome: TurnOutcome::Failed,
        }));
        actions
    }

    /// Synthesis for `session_id` failed; the rest of the turn is dropped
    pub fn on_synthesis_failed(&mut self, session_id: &str, error: &crate::Error) -> Vec<Action> {
        if self.current_session() != Some(session_id) {
            return Vec::new();
        }
        let mut actions = vec![Action::Emit(PipelineEvent::Error {
            kind: error.kind(),
            detail: error.to_string(),
        })];
        actions.extend(self.cancel(CancelReason::SynthesisFailed));
        actions
    }

    /// Release buffered text when the model has gone quiet
    pub fn tick(&mut self) -> Vec<Action> {
        if self.state != TurnState::StreamingFragmentsToSpeech {
            return Vec::new();
        }
        let Some(active) = self.turn.as_ref() else {
            return Vec::new();
        };

        self.segmenter
            .poll()
            .map(|fragment| Action::SendFragment {
                session_id: active.session.session_id.clone(),
                fragment,
            })
            .into_iter()
            .collect()
    }

    /// Playback of `session_id` has drained completely
    pub fn on_playback_finished(&mut self, session_id: &str) {
        if self.speaking.as_deref() == Some(session_id) {
            tracing::debug!(session_id, "reply finished playing");
            self.speaking = None;
        }
    }

    /// Tear down whatever is in progress and return to `Idle`
    ///
    /// Safe in every state; with nothing active it only stops playback.
    pub fn cancel(&mut self, reason: CancelReason) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(active) = self.turn.take() {
            self.state = TurnState::Cancelled;
            tracing::info!(turn = active.id, reason = reason.as_str(), "turn cancelled");

            actions.push(Action::AbortModel { turn: active.id });
            actions.push(Action::StopPlayback);
            actions.push(Action::CloseSynthesis {
                session_id: active.session.session_id,
            });
            actions.push(Action::Emit(PipelineEvent::TurnComplete {
                turn_id: active.id,
                text: active.text,
                outcome: TurnOutcome::Cancelled,
            }));
        } else {
            actions.push(Action::StopPlayback);
        }

        if let Some(session_id) = self.speaking.take() {
            tracing::info!(session_id = %session_id, reason = reason.as_str(), "reply interrupted");
            actions.push(Action::CloseSynthesis { session_id });
        }

        if matches!(reason, CancelReason::BargeIn | CancelReason::Stop) {
            actions.push(Action::Emit(PipelineEvent::Error {
                kind: ErrorKind::UserCancelled,
                detail: reason.as_str().to_string(),
            }));
        }

        self.segmenter.reset();
        self.state = TurnState::Idle;
        actions
    }
}
