//! Speech-to-text (STT) client
//!
//! Recognition runs on a worker task fed by an ordered command channel.
//! Each utterance gets its own streaming connection, and the worker only
//! reads the next utterance's commands after the previous connection has
//! closed, so results from two utterances can never interleave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::capture::{SAMPLE_RATE, samples_to_wav};
use super::frame::{AudioFrame, Utterance};
use crate::{Error, Result};

const DEFAULT_STREAMING_URL: &str = "wss://api.deepgram.com/v1/listen";
const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";

/// Recognition result for an utterance
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub utterance_id: u64,
    pub text: String,
    /// Exactly one final transcript exists per recognized utterance
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// How utterance audio reaches the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttMode {
    /// Frames streamed over a websocket while the user speaks
    #[default]
    Streaming,
    /// Whole utterance posted as a WAV file after it closes
    Blob,
}

/// REST backend for blob mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobProvider {
    #[default]
    Whisper,
    Deepgram,
}

/// Recognition service settings
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub mode: SttMode,
    pub provider: BlobProvider,
    /// Overrides the default endpoint for the mode
    pub url: Option<String>,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub connect_timeout: Duration,
    /// How long to wait for the service to close after end of audio
    pub finalize_timeout: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            mode: SttMode::Streaming,
            provider: BlobProvider::Whisper,
            url: None,
            model: "nova-2".to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(5),
            finalize_timeout: Duration::from_secs(5),
        }
    }
}

impl SttConfig {
    /// Endpoint for the configured mode
    #[must_use]
    pub fn endpoint(&self) -> &str {
        if let Some(url) = &self.url {
            return url;
        }
        match (self.mode, self.provider) {
            (SttMode::Streaming, _) => DEFAULT_STREAMING_URL,
            (SttMode::Blob, BlobProvider::Whisper) => WHISPER_URL,
            (SttMode::Blob, BlobProvider::Deepgram) => DEEPGRAM_URL,
        }
    }
}

/// One recognition hypothesis from the streaming service
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServiceMessage {
    Flat {
        transcript: String,
        #[serde(rename = "isFinal", alias = "is_final", default)]
        is_final: bool,
        #[serde(default)]
        confidence: Option<f32>,
    },
    Channel {
        channel: ServiceChannel,
        #[serde(default)]
        is_final: bool,
    },
    Other(serde_json::Value),
}

#[derive(Deserialize)]
struct ServiceChannel {
    alternatives: Vec<ServiceAlternative>,
}

#[derive(Deserialize)]
struct ServiceAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse a text message from the streaming service
///
/// Returns `None` for metadata and other messages that carry no transcript.
///
/// # Errors
///
/// Returns error if the message is not JSON
pub fn parse_service_message(text: &str) -> Result<Option<Hypothesis>> {
    let message: ServiceMessage = serde_json::from_str(text)?;
    Ok(match message {
        ServiceMessage::Flat {
            transcript,
            is_final,
            confidence,
        } => Some(Hypothesis {
            text: transcript,
            is_final,
            confidence,
        }),
        ServiceMessage::Channel { channel, is_final } => {
            channel.alternatives.into_iter().next().map(|alt| Hypothesis {
                text: alt.transcript,
                is_final,
                confidence: alt.confidence,
            })
        }
        ServiceMessage::Other(_) => None,
    })
}

/// Accumulates hypotheses for one utterance
///
/// Finalized segments are joined into the single final transcript, which
/// is only produced by [`Self::finish`] after the service closed cleanly.
#[derive(Debug)]
pub struct UtteranceRecognition {
    utterance_id: u64,
    finalized: Vec<String>,
    interim: String,
    confidence: Option<f32>,
}

impl UtteranceRecognition {
    #[must_use]
    pub const fn new(utterance_id: u64) -> Self {
        Self {
            utterance_id,
            finalized: Vec::new(),
            interim: String::new(),
            confidence: None,
        }
    }

    /// Apply a hypothesis, returning the partial transcript to surface
    pub fn on_hypothesis(&mut self, hypothesis: Hypothesis) -> Option<Transcript> {
        let text = hypothesis.text.trim().to_string();
        if hypothesis.is_final {
            self.interim.clear();
            if !text.is_empty() {
                self.finalized.push(text);
                self.confidence = match (self.confidence, hypothesis.confidence) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        } else {
            self.interim = text;
        }

        let mut partial = self.finalized.join(" ");
        if !self.interim.is_empty() {
            if !partial.is_empty() {
                partial.push(' ');
            }
            partial.push_str(&self.interim);
        }
        if partial.is_empty() {
            return None;
        }

        Some(Transcript {
            utterance_id: self.utterance_id,
            text: partial,
            is_final: false,
            confidence: None,
        })
    }

    /// Final transcript once the service has closed cleanly
    ///
    /// Interim text is never promoted; no finalized speech means no final.
    #[must_use]
    pub fn finish(self) -> Option<Transcript> {
        if self.finalized.is_empty() {
            return None;
        }
        Some(Transcript {
            utterance_id: self.utterance_id,
            text: self.finalized.join(" "),
            is_final: true,
            confidence: self.confidence,
        })
    }
}

/// Output of the recognition worker
#[derive(Debug)]
pub enum SttUpdate {
    Transcript(Transcript),
    /// Recognition for the utterance was abandoned; no final will follow
    Failed { utterance_id: u64, error: Error },
}

/// Recognizes a complete WAV recording
#[async_trait]
pub trait BlobTranscriber: Send + Sync {
    /// Transcribe WAV bytes into text
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Deserialize)]
struct DeepgramResults {
    channels: Vec<ServiceChannel>,
}

/// OpenAI Whisper compatible transcription endpoint
pub struct WhisperTranscriber {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: SecretString,
}

impl WhisperTranscriber {
    /// # Errors
    ///
    /// Returns error if no API key is configured
    pub fn new(config: &SttConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("OpenAI API key required for Whisper".to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url: config.endpoint().to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl BlobTranscriber for WhisperTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "whisper api error");
            return Err(Error::Connection(format!("whisper api error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }
}

/// Deepgram compatible prerecorded transcription endpoint
pub struct DeepgramTranscriber {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: SecretString,
}

impl DeepgramTranscriber {
    /// # Errors
    ///
    /// Returns error if no API key is configured
    pub fn new(config: &SttConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url: config.endpoint().to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl BlobTranscriber for DeepgramTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting deepgram transcription");

        let response = self
            .client
            .post(&self.url)
            .query(&[("model", self.model.as_str()), ("punctuate", "true")])
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(wav.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "deepgram api error");
            return Err(Error::Connection(format!("deepgram api error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        Ok(result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default())
    }
}

enum Command {
    Begin(u64),
    Audio(AudioFrame),
    End(Utterance),
}

enum Backend {
    Streaming(SttConfig),
    Blob(Arc<dyn BlobTranscriber>),
}

/// Handle to the recognition worker
pub struct SpeechRecognitionClient {
    commands: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl SpeechRecognitionClient {
    /// Spawn a worker for the configured mode
    ///
    /// # Errors
    ///
    /// Returns error if blob mode is selected without an API key
    pub fn spawn(config: SttConfig) -> Result<(Self, mpsc::UnboundedReceiver<SttUpdate>)> {
        let backend = match config.mode {
            SttMode::Streaming => Backend::Streaming(config),
            SttMode::Blob => {
                let transcriber: Arc<dyn BlobTranscriber> = match config.provider {
                    BlobProvider::Whisper => Arc::new(WhisperTranscriber::new(&config)?),
                    BlobProvider::Deepgram => Arc::new(DeepgramTranscriber::new(&config)?),
                };
                Backend::Blob(transcriber)
            }
        };
        Ok(Self::start(backend))
    }

    /// Spawn a blob-mode worker around any transcriber
    #[must_use]
    pub fn with_transcriber(
        transcriber: Arc<dyn BlobTranscriber>,
    ) -> (Self, mpsc::UnboundedReceiver<SttUpdate>) {
        Self::start(Backend::Blob(transcriber))
    }

    fn start(backend: Backend) -> (Self, mpsc::UnboundedReceiver<SttUpdate>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(backend, rx, updates));
        (Self { commands, worker }, updates_rx)
    }

    /// A new utterance opened
    pub fn begin(&self, utterance_id: u64) {
        let _ = self.commands.send(Command::Begin(utterance_id));
    }

    /// Audio for the open utterance
    pub fn send_audio(&self, frame: AudioFrame) {
        let _ = self.commands.send(Command::Audio(frame));
    }

    /// The open utterance closed
    pub fn end(&self, utterance: Utterance) {
        let _ = self.commands.send(Command::End(utterance));
    }
}

impl Drop for SpeechRecognitionClient {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    backend: Backend,
    mut commands: mpsc::UnboundedReceiver<Command>,
    updates: mpsc::UnboundedSender<SttUpdate>,
) {
    while let Some(command) = commands.recv().await {
        match (&backend, command) {
            (Backend::Streaming(config), Command::Begin(id)) => {
                stream_utterance(config, id, &mut commands, &updates).await;
            }
            (Backend::Blob(transcriber), Command::End(utterance)) => {
                transcribe_blob(transcriber.as_ref(), utterance, &updates).await;
            }
            // Audio is only consumed inside an utterance
            _ => {}
        }
    }
    tracing::debug!("recognition worker stopped");
}

async fn transcribe_blob(
    transcriber: &dyn BlobTranscriber,
    utterance: Utterance,
    updates: &mpsc::UnboundedSender<SttUpdate>,
) {
    let utterance_id = utterance.id;
    let result = async {
        let wav = samples_to_wav(utterance.samples(), utterance.sample_rate())?;
        transcriber.transcribe(&wav).await
    }
    .await;

    match result {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() {
                tracing::debug!(utterance_id, "no speech recognized");
                return;
            }
            tracing::info!(utterance_id, transcript = %text, "transcription complete");
            let _ = updates.send(SttUpdate::Transcript(Transcript {
                utterance_id,
                text: text.to_string(),
                is_final: true,
                confidence: None,
            }));
        }
        Err(error) => {
            tracing::warn!(utterance_id, error = %error, "blob transcription failed");
            let _ = updates.send(SttUpdate::Failed {
                utterance_id,
                error,
            });
        }
    }
}

/// Build the websocket request for a streaming session
fn streaming_request(
    config: &SttConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut url = url::Url::parse(config.endpoint())
        .map_err(|e| Error::Config(format!("invalid stt url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("encoding", "linear16")
        .append_pair("sample_rate", &SAMPLE_RATE.to_string())
        .append_pair("channels", "1")
        .append_pair("interim_results", "true")
        .append_pair("punctuate", "true");

    let mut request = url.as_str().into_client_request()?;
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Token {}", key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid stt api key: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }
    Ok(request)
}

/// Drop commands until the utterance that failed has ended
async fn discard_until_end(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, Command::End(_)) {
            break;
        }
    }
}

fn fail(updates: &mpsc::UnboundedSender<SttUpdate>, utterance_id: u64, error: Error) {
    tracing::warn!(utterance_id, error = %error, "recognition failed, discarding utterance");
    let _ = updates.send(SttUpdate::Failed {
        utterance_id,
        error,
    });
}

async fn stream_utterance(
    config: &SttConfig,
    utterance_id: u64,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    updates: &mpsc::UnboundedSender<SttUpdate>,
) {
    let connection = async {
        let request = streaming_request(config)?;
        let (ws, _) = tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::Timeout("stt connect".to_string()))??;
        Ok::<_, Error>(ws)
    }
    .await;

    let ws = match connection {
        Ok(ws) => ws,
        Err(error) => {
            fail(updates, utterance_id, error);
            discard_until_end(commands).await;
            return;
        }
    };
    tracing::debug!(utterance_id, "stt stream opened");

    let (mut sink, mut stream) = ws.split();
    let mut recognition = UtteranceRecognition::new(utterance_id);
    let mut ended = false;
    let mut finalize_at = tokio::time::Instant::now();

    loop {
        tokio::select! {
            command = commands.recv(), if !ended => {
                let sent = match command {
                    Some(Command::Audio(frame)) => {
                        sink.send(Message::Binary(frame.to_pcm16_le().into())).await
                    }
                    Some(Command::End(_)) => {
                        ended = true;
                        finalize_at = tokio::time::Instant::now() + config.finalize_timeout;
                        sink.send(Message::Text(r#"{"type":"CloseStream"}"#.into())).await
                    }
                    Some(Command::Begin(next)) => {
                        tracing::warn!(utterance_id, next, "utterance began before previous ended");
                        Ok(())
                    }
                    None => return,
                };
                if let Err(e) = sent {
                    fail(updates, utterance_id, e.into());
                    if !ended {
                        discard_until_end(commands).await;
                    }
                    return;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match parse_service_message(&text) {
                        Ok(Some(hypothesis)) => {
                            if let Some(partial) = recognition.on_hypothesis(hypothesis) {
                                let _ = updates.send(SttUpdate::Transcript(partial));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            fail(updates, utterance_id, Error::Protocol(e.to_string()));
                            if !ended {
                                discard_until_end(commands).await;
                            }
                            return;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        if ended {
                            tracing::debug!(utterance_id, "stt stream closed");
                            if let Some(transcript) = recognition.finish() {
                                tracing::info!(utterance_id, transcript = %transcript.text, "final transcript");
                                let _ = updates.send(SttUpdate::Transcript(transcript));
                            }
                        } else {
                            fail(
                                updates,
                                utterance_id,
                                Error::Connection("stt stream closed mid-utterance".to_string()),
                            );
                            discard_until_end(commands).await;
                        }
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        fail(updates, utterance_id, e.into());
                        if !ended {
                            discard_until_end(commands).await;
                        }
                        return;
                    }
                }
            }
            () = tokio::time::sleep_until(finalize_at), if ended => {
                fail(updates, utterance_id, Error::Timeout("stt finalization".to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hypothesis(text: &str, is_final: bool) -> Hypothesis {
        Hypothesis {
            text: text.to_string(),
            is_final,
            confidence: Some(0.9),
        }
    }

    #[test]
    fn parses_flat_and_channel_messages() {
        let flat = parse_service_message(r#"{"transcript":"hi","isFinal":true,"confidence":0.8}"#)
            .unwrap()
            .unwrap();
        assert!(flat.is_final);
        assert_eq!(flat.text, "hi");

        let nested = parse_service_message(
            r#"{"type":"Results","channel":{"alternatives":[{"transcript":"yo","confidence":0.7}]},"is_final":false}"#,
        )
        .unwrap()
        .unwrap();
        assert!(!nested.is_final);
        assert_eq!(nested.text, "yo");

        assert!(parse_service_message(r#"{"type":"Metadata"}"#).unwrap().is_none());
        assert!(parse_service_message("not json").is_err());
    }

    #[test]
    fn partials_combine_finalized_and_interim_text() {
        let mut rec = UtteranceRecognition::new(4);
        let p = rec.on_hypothesis(hypothesis("hello", false)).unwrap();
        assert_eq!(p.text, "hello");
        assert!(!p.is_final);

        rec.on_hypothesis(hypothesis("hello there", true));
        let p = rec.on_hypothesis(hypothesis("how", false)).unwrap();
        assert_eq!(p.text, "hello there how");

        let fin = rec.finish().unwrap();
        assert_eq!(fin.text, "hello there");
        assert!(fin.is_final);
        assert_eq!(fin.utterance_id, 4);
    }

    #[test]
    fn interim_only_yields_no_final() {
        let mut rec = UtteranceRecognition::new(0);
        rec.on_hypothesis(hypothesis("maybe", false));
        assert!(rec.finish().is_none());
    }

    #[test]
    fn empty_hypotheses_surface_nothing() {
        let mut rec = UtteranceRecognition::new(0);
        assert!(rec.on_hypothesis(hypothesis("  ", false)).is_none());
        assert!(rec.on_hypothesis(hypothesis("", true)).is_none());
        assert!(rec.finish().is_none());
    }

    #[test]
    fn endpoint_defaults_follow_mode() {
        let mut config = SttConfig::default();
        assert_eq!(config.endpoint(), DEFAULT_STREAMING_URL);
        config.mode = SttMode::Blob;
        assert_eq!(config.endpoint(), WHISPER_URL);
        config.url = Some("http://localhost:9000".to_string());
        assert_eq!(config.endpoint(), "http://localhost:9000");
    }

    #[test]
    fn streaming_request_carries_audio_format() {
        let request = streaming_request(&SttConfig::default()).unwrap();
        let query = request.uri().query().unwrap_or_default();
        assert!(query.contains("encoding=linear16"));
        assert!(query.contains("sample_rate=16000"));
        assert!(request.headers().get("Authorization").is_none());
    }

    struct FixedTranscriber(&'static str);

    #[async_trait]
    impl BlobTranscriber for FixedTranscriber {
        async fn transcribe(&self, wav: &[u8]) -> Result<String> {
            assert!(wav.starts_with(b"RIFF"));
            Ok(self.0.to_string())
        }
    }

    fn utterance(id: u64) -> Utterance {
        let mut utterance = Utterance::new(id, SAMPLE_RATE);
        utterance.push(&AudioFrame::new(vec![0.1; 160], SAMPLE_RATE));
        utterance
    }

    #[tokio::test]
    async fn blob_mode_emits_one_final_per_utterance() {
        let (client, mut updates) =
            SpeechRecognitionClient::with_transcriber(Arc::new(FixedTranscriber(" hi there ")));
        client.begin(7);
        client.send_audio(AudioFrame::new(vec![0.1; 160], SAMPLE_RATE));
        client.end(utterance(7));

        let Some(SttUpdate::Transcript(t)) = updates.recv().await else {
            panic!("expected transcript");
        };
        assert_eq!(t.text, "hi there");
        assert!(t.is_final);
        assert_eq!(t.utterance_id, 7);
    }

    /// Records how many recordings it was asked to transcribe
    #[derive(Default)]
    struct CountingTranscriber(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl BlobTranscriber for CountingTranscriber {
        async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok("   ".to_string())
        }
    }

    #[tokio::test]
    async fn blob_mode_without_speech_emits_nothing() {
        let transcriber = Arc::new(CountingTranscriber::default());
        let (client, mut updates) = SpeechRecognitionClient::with_transcriber(transcriber.clone());

        client.begin(1);
        client.send_audio(AudioFrame::new(vec![0.0; 160], SAMPLE_RATE));
        let mut silent = Utterance::new(1, SAMPLE_RATE);
        silent.push(&AudioFrame::new(vec![0.0; 160], SAMPLE_RATE));
        client.end(silent);

        assert!(
            tokio::time::timeout(Duration::from_millis(200), updates.recv())
                .await
                .is_err()
        );
        // The worker did handle the utterance; it just heard nothing
        assert_eq!(transcriber.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        drop(client);
    }
}
