//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_voice::voice::stt::{BlobTranscriber, SpeechRecognitionClient, SttUpdate};
use beacon_voice::voice::vad::{VadConfig, VadEvent, VoiceActivityGate};
use beacon_voice::voice::{SAMPLE_RATE, samples_to_wav};

mod common;
use common::{frames, silence, sine};

fn feed_all(gate: &mut VoiceActivityGate, samples: &[f32]) -> Vec<VadEvent> {
    frames(samples)
        .iter()
        .filter_map(|frame| gate.feed(frame))
        .collect()
}

#[test]
fn test_silence_never_starts_speech() {
    let mut gate = VoiceActivityGate::new(VadConfig::default());
    let events = feed_all(&mut gate, &silence(Duration::from_secs(3), SAMPLE_RATE));

    assert!(events.is_empty());
    assert!(!gate.is_open());
}

#[test]
fn test_quiet_noise_below_threshold_is_ignored() {
    let mut gate = VoiceActivityGate::new(VadConfig::default());
    let hum = sine(60.0, Duration::from_secs(2), 0.01, SAMPLE_RATE);

    assert!(feed_all(&mut gate, &hum).is_empty());
}

#[test]
fn test_short_speech_then_hold_off_yields_one_utterance() {
    let mut gate = VoiceActivityGate::new(VadConfig::default());

    let mut audio = sine(440.0, Duration::from_millis(200), 0.3, SAMPLE_RATE);
    audio.extend(silence(Duration::from_millis(2100), SAMPLE_RATE));

    let events = feed_all(&mut gate, &audio);
    assert_eq!(events.len(), 2, "expected exactly one start and one end");
    assert!(matches!(events[0], VadEvent::SpeechStart { utterance_id: 0 }));

    let VadEvent::SpeechEnd(utterance) = &events[1] else {
        panic!("second event should end the utterance");
    };
    assert_eq!(utterance.id, 0);
    let secs = utterance.duration().as_secs_f32();
    assert!((2.2..=2.4).contains(&secs), "utterance lasted {secs}s");
}

#[test]
fn test_pause_shorter_than_hold_off_keeps_utterance_open() {
    let mut gate = VoiceActivityGate::new(VadConfig::default());

    let mut audio = sine(300.0, Duration::from_millis(300), 0.3, SAMPLE_RATE);
    audio.extend(silence(Duration::from_millis(1500), SAMPLE_RATE));
    audio.extend(sine(300.0, Duration::from_millis(300), 0.3, SAMPLE_RATE));
    audio.extend(silence(Duration::from_millis(2100), SAMPLE_RATE));

    let events = feed_all(&mut gate, &audio);
    assert_eq!(events.len(), 2);
    let VadEvent::SpeechEnd(utterance) = &events[1] else {
        panic!("second event should end the utterance");
    };
    assert!(utterance.duration() > Duration::from_secs(4));
}

#[test]
fn test_consecutive_utterances_do_not_share_audio() {
    let mut gate = VoiceActivityGate::new(VadConfig {
        hold_off: Duration::from_millis(500),
        ..VadConfig::default()
    });

    let mut audio = Vec::new();
    for _ in 0..3 {
        audio.extend(sine(440.0, Duration::from_millis(200), 0.3, SAMPLE_RATE));
        audio.extend(silence(Duration::from_millis(700), SAMPLE_RATE));
    }

    let utterances: Vec<_> = feed_all(&mut gate, &audio)
        .into_iter()
        .filter_map(|event| match event {
            VadEvent::SpeechEnd(utterance) => Some(utterance),
            VadEvent::SpeechStart { .. } => None,
        })
        .collect();

    assert_eq!(utterances.len(), 3);
    for (expected_id, utterance) in utterances.iter().enumerate() {
        assert_eq!(utterance.id, expected_id as u64);
        assert!(utterance.duration() < Duration::from_millis(800));
    }
}

#[test]
fn test_wav_encoding() {
    let samples = sine(440.0, Duration::from_millis(100), 0.5, SAMPLE_RATE);
    let wav = tokio_test::assert_ok!(samples_to_wav(&samples, SAMPLE_RATE));

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len() as usize, samples.len());
}

struct FixedTranscriber(&'static str);

#[async_trait]
impl BlobTranscriber for FixedTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> beacon_voice::Result<String> {
        assert!(wav.starts_with(b"RIFF"));
        Ok(self.0.to_string())
    }
}

struct FailingTranscriber;

#[async_trait]
impl BlobTranscriber for FailingTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> beacon_voice::Result<String> {
        Err(beacon_voice::Error::Connection("reset by peer".to_string()))
    }
}

fn utterance_events(samples: &[f32]) -> (u64, beacon_voice::voice::Utterance) {
    let mut gate = VoiceActivityGate::new(VadConfig::default());
    let mut started = None;
    for event in feed_all(&mut gate, samples) {
        match event {
            VadEvent::SpeechStart { utterance_id } => started = Some(utterance_id),
            VadEvent::SpeechEnd(utterance) => {
                return (started.expect("start precedes end"), utterance);
            }
        }
    }
    panic!("audio should contain a complete utterance");
}

fn spoken_audio() -> Vec<f32> {
    let mut audio = sine(440.0, Duration::from_millis(300), 0.3, SAMPLE_RATE);
    audio.extend(silence(Duration::from_millis(2100), SAMPLE_RATE));
    audio
}

#[tokio::test]
async fn test_blob_recognition_emits_one_final_after_speech_end() {
    let (client, mut updates) =
        SpeechRecognitionClient::with_transcriber(Arc::new(FixedTranscriber(" hello there ")));
    let (id, utterance) = utterance_events(&spoken_audio());

    client.begin(id);
    // Nothing is recognized before the utterance ends
    assert!(
        tokio::time::timeout(Duration::from_millis(50), updates.recv())
            .await
            .is_err()
    );

    client.end(utterance);
    let Some(SttUpdate::Transcript(transcript)) = updates.recv().await else {
        panic!("expected a transcript");
    };
    assert!(transcript.is_final);
    assert_eq!(transcript.text, "hello there");
    assert_eq!(transcript.utterance_id, id);

    assert!(
        tokio::time::timeout(Duration::from_millis(50), updates.recv())
            .await
            .is_err(),
        "only one final per utterance"
    );
}

#[tokio::test]
async fn test_blob_recognition_of_nothing_is_not_an_error() {
    let (client, mut updates) =
        SpeechRecognitionClient::with_transcriber(Arc::new(FixedTranscriber("   ")));
    let (id, utterance) = utterance_events(&spoken_audio());
    client.begin(id);
    client.end(utterance);

    assert!(
        tokio::time::timeout(Duration::from_millis(100), updates.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_blob_recognition_failure_yields_no_final() {
    let (client, mut updates) =
        SpeechRecognitionClient::with_transcriber(Arc::new(FailingTranscriber));
    let (id, utterance) = utterance_events(&spoken_audio());
    client.begin(id);
    client.end(utterance);

    match updates.recv().await {
        Some(SttUpdate::Failed {
            utterance_id,
            error,
        }) => {
            assert_eq!(utterance_id, id);
            assert!(error.kind().is_connection_failure());
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
