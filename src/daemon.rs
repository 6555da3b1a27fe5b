//! Daemon - the voice conversation service
//!
//! Wires capture, recognition, the conversation controller, text
//! generation, synthesis and playback into one `tokio::select!` loop. The
//! audio device streams are not `Send`, so the loop runs on the task that
//! calls [`Daemon::run`] and every component is owned by it; background
//! tasks only ever talk to the loop through channels.

use std::collections::VecDeque;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::animation::{AnimationState, FacialAnimationDriver, Mood};
use crate::api::{ApiServer, ControlCommand};
use crate::clock::{Clock, MonotonicClock};
use crate::conversation::{
    Action, CancelReason, ConversationController, SentenceSegmenter, TurnId, TurnState,
};
use crate::events::{EventBus, PipelineEvent, TurnOutcome};
use crate::llm::{self, ChatHistory, ModelEvent, TextGenerator};
use crate::voice::capture::AudioCaptureSource;
use crate::voice::frame::AudioFrame;
use crate::voice::output::DeviceOutput;
use crate::voice::playback::{AudioSink, PlaybackScheduler};
use crate::voice::stt::{SpeechRecognitionClient, SttUpdate};
use crate::voice::tts::{Inbound, SpeechSynthesisClient, TtsEvent};
use crate::voice::vad::{VadEvent, VoiceActivityGate};
use crate::{Config, Error, Result};

/// Amplitude change below which no new level event is published
const LEVEL_EPSILON: f32 = 0.01;

/// Channels the pipeline reports into from background tasks
pub struct PipelineChannels {
    pub model_tx: mpsc::UnboundedSender<ModelEvent>,
    pub animation_tx: watch::Sender<AnimationState>,
}

/// Every component of a running conversation, driven by the daemon loop
pub struct Pipeline<C, S> {
    events: EventBus,
    vad: VoiceActivityGate,
    stt: SpeechRecognitionClient,
    controller: ConversationController<MonotonicClock>,
    generator: TextGenerator,
    history: ChatHistory,
    /// Prompt of the active turn, recorded into history on completion
    pending_prompt: Option<(TurnId, String)>,
    model_tx: mpsc::UnboundedSender<ModelEvent>,
    model_task: Option<(TurnId, JoinHandle<()>)>,
    tts: SpeechSynthesisClient,
    scheduler: PlaybackScheduler<C, S>,
    animation: FacialAnimationDriver<StdRng>,
    animation_tx: watch::Sender<AnimationState>,
    resting_mood: Mood,
    barge_in: bool,
    /// Reply text of the audio being spoken
    spoken_text: String,
    /// Cleared by connection failures, restored by any successful traffic
    connected: bool,
    last_level: f32,
}

impl<C: Clock, S: AudioSink> Pipeline<C, S> {
    /// Assemble a pipeline from configured components
    #[must_use]
    pub fn new(
        config: &Config,
        events: EventBus,
        stt: SpeechRecognitionClient,
        tts: SpeechSynthesisClient,
        scheduler: PlaybackScheduler<C, S>,
        channels: PipelineChannels,
    ) -> Self {
        let segmenter = SentenceSegmenter::new(config.segmenter, MonotonicClock::new());
        Self {
            events,
            vad: VoiceActivityGate::new(config.vad),
            stt,
            controller: ConversationController::new(segmenter, config.tts.voice_id.clone()),
            generator: TextGenerator::new(config.llm.clone()),
            history: ChatHistory::new(config.llm.history_turns),
            pending_prompt: None,
            model_tx: channels.model_tx,
            model_task: None,
            tts,
            scheduler,
            animation: FacialAnimationDriver::new(config.animation.driver, StdRng::from_entropy()),
            animation_tx: channels.animation_tx,
            resting_mood: config.animation.mood,
            barge_in: config.barge_in,
            spoken_text: String::new(),
            connected: true,
            last_level: 0.0,
        }
    }

    /// Feed a captured frame through the gate and on to recognition
    pub fn on_frame(&mut self, frame: AudioFrame) {
        match self.vad.feed(&frame) {
            Some(VadEvent::SpeechStart { utterance_id }) => {
                self.events.publish(PipelineEvent::SpeechStart { utterance_id });

                let replying =
                    self.controller.is_busy() || self.controller.current_session().is_some();
                if self.barge_in && replying {
                    tracing::info!(utterance_id, "barge-in");
                    let actions = self.controller.cancel(CancelReason::BargeIn);
                    self.execute(actions);
                }

                self.stt.begin(utterance_id);
                self.stt.send_audio(frame);
            }
            Some(VadEvent::SpeechEnd(utterance)) => {
                self.stt.send_audio(frame);
                let duration_ms =
                    u64::try_from(utterance.duration().as_millis()).unwrap_or(u64::MAX);
                self.events.publish(PipelineEvent::SpeechEnd {
                    utterance_id: utterance.id,
                    duration_ms,
                });
                self.stt.end(utterance);
            }
            None if self.vad.is_open() => self.stt.send_audio(frame),
            None => {}
        }
    }

    /// Route a recognition result
    pub fn on_transcript(&mut self, update: SttUpdate) {
        match update {
            SttUpdate::Transcript(transcript) if transcript.is_final => {
                self.connected = true;
                tracing::info!(
                    utterance_id = transcript.utterance_id,
                    text = %transcript.text,
                    "final transcript"
                );
                self.events.publish(PipelineEvent::FinalTranscript {
                    utterance_id: transcript.utterance_id,
                    text: transcript.text.clone(),
                    confidence: transcript.confidence,
                });
                let actions = self.controller.on_final_transcript(&transcript);
                self.execute(actions);
            }
            SttUpdate::Transcript(transcript) => {
                self.connected = true;
                self.events.publish(PipelineEvent::PartialTranscript {
                    utterance_id: transcript.utterance_id,
                    text: transcript.text,
                });
            }
            SttUpdate::Failed {
                utterance_id,
                error,
            } => {
                tracing::warn!(utterance_id, error = %error, "utterance dropped");
                self.note_failure(&error);
                self.events.publish(PipelineEvent::error(&error));
            }
        }
    }

    /// Route model output for a turn
    pub fn on_model_event(&mut self, event: ModelEvent) {
        let actions = match event {
            ModelEvent::Delta { turn, text } => {
                self.connected = true;
                self.controller.on_text_delta(turn, &text)
            }
            ModelEvent::Complete { turn } => {
                self.release_model_task(turn);
                self.controller.on_model_complete(turn)
            }
            ModelEvent::Failed { turn, error } => {
                self.release_model_task(turn);
                self.note_failure(&error);
                self.controller.on_model_error(turn, &error)
            }
        };
        self.execute(actions);
    }

    /// Route a message from the synthesis connection
    pub fn on_synthesis(&mut self, inbound: Inbound) {
        for event in self.tts.handle_inbound(inbound) {
            match event {
                TtsEvent::Audio(chunk) => {
                    self.connected = true;
                    self.scheduler.enqueue(chunk);
                }
                TtsEvent::Gap {
                    session_id,
                    expected,
                    received,
                } => self.events.publish(PipelineEvent::AudioGap {
                    session_id,
                    expected,
                    received,
                }),
                TtsEvent::Done { session_id } => {
                    self.scheduler.close_session(&session_id);
                    // A reply that produced no audio never plays, so it is already finished
                    if !self.scheduler.is_active() {
                        self.controller.on_playback_finished(&session_id);
                    }
                }
                TtsEvent::Failed { session_id, error } => {
                    self.note_failure(&error);
                    let actions = self.controller.on_synthesis_failed(&session_id, &error);
                    self.execute(actions);
                }
            }
        }
    }

    /// Apply a command from an API client
    pub fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Stop => {
                tracing::info!("stop requested");
                let actions = self.controller.cancel(CancelReason::Stop);
                self.execute(actions);
            }
        }
    }

    /// Advance timers, playback and animation by one render tick
    pub fn on_render_tick(&mut self) {
        let actions = self.controller.tick();
        self.execute(actions);

        let playing = self.scheduler.session_id().map(str::to_string);
        let outcome = self.scheduler.tick();
        if let Some(session_id) = playing.filter(|_| outcome.finished) {
            self.controller.on_playback_finished(&session_id);
        }

        if (outcome.amplitude - self.last_level).abs() >= LEVEL_EPSILON
            || (outcome.amplitude == 0.0 && self.last_level != 0.0)
        {
            self.last_level = outcome.amplitude;
            self.events.publish(PipelineEvent::AudioLevel {
                level: outcome.amplitude,
            });
        }

        let mood = if self.controller.state() == TurnState::AwaitingModelResponse {
            Mood::Thinking
        } else {
            self.resting_mood
        };
        let state = self.animation.update(
            mood,
            outcome.amplitude,
            self.connected,
            &self.spoken_text,
            self.scheduler.speech_progress(),
        );
        if outcome.finished {
            self.spoken_text.clear();
        }
        self.animation_tx.send_replace(state);
    }

    /// Tear everything down without reporting a cancellation
    pub fn shutdown(&mut self) {
        if let Some((turn, task)) = self.model_task.take() {
            tracing::debug!(turn, "aborting model request");
            task.abort();
        }
        self.scheduler.cancel();
        if let Some(session_id) = self.tts.current_session().map(|s| s.session_id.clone()) {
            self.tts.cancel_session(&session_id);
        }
    }

    #[must_use]
    pub const fn controller(&self) -> &ConversationController<MonotonicClock> {
        &self.controller
    }

    #[must_use]
    pub const fn scheduler(&self) -> &PlaybackScheduler<C, S> {
        &self.scheduler
    }

    /// Carry out controller actions in order
    ///
    /// Failures while executing feed back into the controller, and their
    /// follow-up actions run after the ones already queued.
    fn execute(&mut self, actions: Vec<Action>) {
        let mut pending: VecDeque<Action> = actions.into();

        while let Some(action) = pending.pop_front() {
            match action {
                Action::SubmitPrompt { turn, prompt } => self.submit(turn, prompt),
                Action::OpenSynthesis { turn, session } => {
                    let session_id = session.session_id.clone();
                    self.spoken_text.clear();
                    self.scheduler.begin_session(&session_id);
                    if let Err(error) = self.tts.bind_session(session) {
                        tracing::warn!(turn, error = %error, "failed to open synthesis session");
                        self.note_failure(&error);
                        pending.extend(self.controller.on_synthesis_failed(&session_id, &error));
                    }
                }
                Action::SendFragment {
                    session_id,
                    fragment,
                } => {
                    self.spoken_text.push_str(&fragment.text);
                    let sent = self
                        .tts
                        .send_fragment(&session_id, &fragment.text, fragment.is_final);
                    if let Err(error) = sent {
                        self.note_failure(&error);
                        pending.extend(self.controller.on_synthesis_failed(&session_id, &error));
                    }
                }
                Action::AbortModel { turn } => {
                    if let Some((_, task)) = self.model_task.take_if(|(t, _)| *t == turn) {
                        task.abort();
                    }
                    self.pending_prompt = None;
                }
                Action::StopPlayback => {
                    self.scheduler.cancel();
                    self.spoken_text.clear();
                }
                Action::CloseSynthesis { session_id } => {
                    self.tts.cancel_session(&session_id);
                    if self.scheduler.session_id() == Some(session_id.as_str()) {
                        self.scheduler.cancel();
                    }
                }
                Action::Emit(event) => {
                    if let PipelineEvent::TurnComplete {
                        turn_id,
                        text,
                        outcome: TurnOutcome::Completed,
                    } = &event
                    {
                        self.record_history(*turn_id, text);
                    }
                    self.events.publish(event);
                }
            }
        }
    }

    fn submit(&mut self, turn: TurnId, prompt: String) {
        let messages = self
            .history
            .messages(&self.generator.config().system_prompt, &prompt);
        tracing::debug!(turn, history = self.history.len(), "submitting prompt");

        let task = tokio::spawn(llm::run_turn(
            self.generator.clone(),
            turn,
            messages,
            self.model_tx.clone(),
        ));
        if let Some((previous, stale)) = self.model_task.replace((turn, task)) {
            tracing::debug!(turn = previous, "aborting stale model request");
            stale.abort();
        }
        self.pending_prompt = Some((turn, prompt));
    }

    fn release_model_task(&mut self, turn: TurnId) {
        if self.model_task.as_ref().is_some_and(|(t, _)| *t == turn) {
            self.model_task = None;
        }
    }

    fn record_history(&mut self, turn: TurnId, reply: &str) {
        if let Some((_, prompt)) = self.pending_prompt.take_if(|(t, _)| *t == turn) {
            self.history.record(prompt, reply);
        }
    }

    fn note_failure(&mut self, error: &Error) {
        if error.kind().is_connection_failure() {
            self.connected = false;
        }
    }
}

/// The voice daemon - owns the devices and runs the pipeline loop
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if an audio device cannot be opened or the
    /// microphone stream ends
    #[allow(clippy::future_not_send, clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let events = EventBus::new();
        let (animation_tx, animation_rx) = watch::channel(AnimationState::default());
        let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(16);

        if config.api.enabled {
            let server = ApiServer::new(config.api.port, events.clone(), animation_rx, control_tx);
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::error!(error = %e, "event api stopped");
                }
            });
        } else {
            drop(control_tx);
        }

        let mut capture = AudioCaptureSource::open(config.frame_size)?;
        let mut frames = capture.start()?;

        let output = DeviceOutput::open(config.tts.sample_rate)?;
        let scheduler = PlaybackScheduler::new(config.playback, output.clock(), output.sink());

        let (stt, mut transcripts) = SpeechRecognitionClient::spawn(config.stt.clone())?;
        let (tts, mut synthesis) = SpeechSynthesisClient::new(config.tts.clone());
        let (model_tx, mut model_rx) = mpsc::unbounded_channel();

        let mut pipeline = Pipeline::new(
            &config,
            events.clone(),
            stt,
            tts,
            scheduler,
            PipelineChannels {
                model_tx,
                animation_tx,
            },
        );

        let mut render = tokio::time::interval(config.animation.tick);
        render.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        tracing::info!(
            stt_mode = ?config.stt.mode,
            llm_model = %config.llm.model,
            voice = %config.tts.voice_id,
            barge_in = config.barge_in,
            "voice pipeline running"
        );

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                frame = frames.recv() => {
                    if let Some(frame) = frame {
                        pipeline.on_frame(frame);
                    } else {
                        let error = Error::DeviceUnavailable("microphone stream ended".to_string());
                        events.publish(PipelineEvent::error(&error));
                        break Err(error);
                    }
                }
                Some(update) = transcripts.recv() => pipeline.on_transcript(update),
                Some(event) = model_rx.recv() => pipeline.on_model_event(event),
                Some(inbound) = synthesis.recv() => pipeline.on_synthesis(inbound),
                Some(command) = control_rx.recv() => pipeline.on_control(command),
                _ = render.tick() => pipeline.on_render_tick(),
            }
        };

        pipeline.shutdown();
        capture.stop();
        // Let the device drain the cancelled timeline before it is dropped
        tokio::time::sleep(Duration::from_millis(50)).await;
        result
    }
}
