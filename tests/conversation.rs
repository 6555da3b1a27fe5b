//! Turn-taking and segmentation integration tests

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use beacon_voice::clock::ManualClock;
use beacon_voice::conversation::{
    Action, CancelReason, ConversationController, SegmenterConfig, SentenceSegmenter,
    TextFragment, TurnId, TurnState,
};
use beacon_voice::error::ErrorKind;
use beacon_voice::events::{PipelineEvent, TurnOutcome};
use beacon_voice::voice::stt::Transcript;

const REPLY: &str = "Sure! The forecast says rain until noon… then it clears up. \
    Bring an umbrella, or don't, if you like getting wet?  \"Really.\" \
    Temperatures stay between twelve and seventeen degrees all afternoon";

fn controller() -> (ManualClock, ConversationController<ManualClock>) {
    let clock = ManualClock::new();
    let segmenter = SentenceSegmenter::new(SegmenterConfig::default(), clock.clone());
    (clock, ConversationController::new(segmenter, "voice-a"))
}

fn transcript(utterance_id: u64, text: &str) -> Transcript {
    Transcript {
        utterance_id,
        text: text.to_string(),
        is_final: true,
        confidence: Some(0.9),
    }
}

fn begin(ctl: &mut ConversationController<ManualClock>, text: &str) -> (TurnId, String) {
    ctl.on_final_transcript(&transcript(0, text))
        .into_iter()
        .find_map(|action| match action {
            Action::OpenSynthesis { turn, session } => Some((turn, session.session_id)),
            _ => None,
        })
        .expect("a turn opens a synthesis session")
}

fn fragments(actions: &[Action]) -> Vec<(String, TextFragment)> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::SendFragment {
                session_id,
                fragment,
            } => Some((session_id.clone(), fragment.clone())),
            _ => None,
        })
        .collect()
}

/// Split text into random char-aligned deltas
fn random_deltas(text: &str, rng: &mut StdRng) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut deltas = Vec::new();
    let mut index = 0;
    while index < chars.len() {
        let len = rng.gen_range(1..=8).min(chars.len() - index);
        deltas.push(chars[index..index + len].iter().collect());
        index += len;
    }
    deltas
}

#[test]
fn test_fragments_reassemble_the_reply_for_any_delta_split() {
    for seed in 0..50 {
        let mut rng = StdRng::seed_from_u64(seed);
        let clock = ManualClock::new();
        let mut segmenter = SentenceSegmenter::new(SegmenterConfig::default(), clock.clone());

        let mut released = Vec::new();
        for delta in random_deltas(REPLY, &mut rng) {
            if rng.gen_bool(0.1) {
                clock.advance(Duration::from_millis(600));
                released.extend(segmenter.poll());
            }
            released.extend(segmenter.push(&delta));
        }
        released.push(segmenter.finish());

        let rebuilt: String = released.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(rebuilt, REPLY, "seed {seed}");
        assert_eq!(released.iter().filter(|f| f.is_final).count(), 1);
        assert!(released.last().is_some_and(|f| f.is_final));
    }
}

#[test]
fn test_short_reply_is_spoken_as_one_final_fragment() {
    let (_, mut ctl) = controller();
    let (turn, session) = begin(&mut ctl, "hi there");

    let mut actions = Vec::new();
    for delta in ["Hello", ", how", " are you?"] {
        actions.extend(ctl.on_text_delta(turn, delta));
    }
    assert!(fragments(&actions).is_empty());
    assert_eq!(ctl.state(), TurnState::StreamingFragmentsToSpeech);

    let actions = ctl.on_model_complete(turn);
    let sent = fragments(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, session);
    assert_eq!(sent[0].1.text, "Hello, how are you?");
    assert!(sent[0].1.is_final);
    assert!(actions.iter().any(|action| matches!(
        action,
        Action::Emit(PipelineEvent::TurnComplete {
            outcome: TurnOutcome::Completed,
            ..
        })
    )));
    assert_eq!(ctl.state(), TurnState::Idle);
}

#[test]
fn test_long_reply_streams_fragments_to_one_session() {
    let (clock, mut ctl) = controller();
    let (turn, session) = begin(&mut ctl, "what's the weather");

    let mut rng = StdRng::seed_from_u64(7);
    let mut sent = Vec::new();
    for delta in random_deltas(REPLY, &mut rng) {
        sent.extend(fragments(&ctl.on_text_delta(turn, &delta)));
        clock.advance(Duration::from_millis(20));
        sent.extend(fragments(&ctl.tick()));
    }
    sent.extend(fragments(&ctl.on_model_complete(turn)));

    assert!(sent.len() > 2);
    assert!(sent.iter().all(|(id, _)| *id == session));
    let (last, rest) = sent.split_last().unwrap();
    assert!(last.1.is_final);
    assert!(rest.iter().all(|(_, fragment)| !fragment.is_final));

    let rebuilt: String = sent.iter().map(|(_, f)| f.text.as_str()).collect();
    assert_eq!(rebuilt, REPLY);
}

#[test]
fn test_barge_in_mid_stream_returns_to_idle() {
    let (_, mut ctl) = controller();
    let (turn, session) = begin(&mut ctl, "tell me a story");
    ctl.on_text_delta(turn, "Once upon a time. There was");

    let actions = ctl.cancel(CancelReason::BargeIn);
    assert_eq!(ctl.state(), TurnState::Idle);
    assert!(!ctl.is_busy());
    assert!(actions.contains(&Action::AbortModel { turn }));
    assert!(actions.contains(&Action::StopPlayback));
    assert!(actions.contains(&Action::CloseSynthesis {
        session_id: session
    }));
    assert!(actions.iter().any(|action| matches!(
        action,
        Action::Emit(PipelineEvent::Error {
            kind: ErrorKind::UserCancelled,
            ..
        })
    )));

    // Output from the cancelled turn is ignored
    assert!(ctl.on_text_delta(turn, " a dragon.").is_empty());
    assert!(ctl.on_model_complete(turn).is_empty());

    // The next utterance starts a fresh turn
    let (next, _) = begin(&mut ctl, "never mind");
    assert!(next > turn);
    assert_eq!(ctl.state(), TurnState::AwaitingModelResponse);
}

#[test]
fn test_new_transcript_supersedes_active_turn() {
    let (_, mut ctl) = controller();
    let (first, first_session) = begin(&mut ctl, "first question");
    ctl.on_text_delta(first, "Let me think");

    let actions = ctl.on_final_transcript(&transcript(1, "second question"));
    assert!(actions.contains(&Action::AbortModel { turn: first }));
    assert!(actions.contains(&Action::CloseSynthesis {
        session_id: first_session
    }));
    assert!(!actions.iter().any(|action| matches!(
        action,
        Action::Emit(PipelineEvent::Error { .. })
    )));
    assert!(matches!(
        actions.last(),
        Some(Action::SubmitPrompt { prompt, .. }) if prompt == "second question"
    ));
}

#[test]
fn test_model_failure_speaks_partial_reply() {
    let (_, mut ctl) = controller();
    let (turn, session) = begin(&mut ctl, "explain rust");
    ctl.on_text_delta(turn, "Rust is a systems");

    let error = beacon_voice::Error::Connection("stream reset".to_string());
    let actions = ctl.on_model_error(turn, &error);
    let sent = fragments(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, session);
    assert_eq!(sent[0].1.text, "Rust is a systems");
    assert!(sent[0].1.is_final);
    assert!(actions.iter().any(|action| matches!(
        action,
        Action::Emit(PipelineEvent::TurnComplete {
            outcome: TurnOutcome::Failed,
            ..
        })
    )));
    assert_eq!(ctl.state(), TurnState::Idle);
}
