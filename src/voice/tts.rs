//! Text-to-speech (TTS) session client
//!
//! One persistent websocket carries every synthesis session. Fragments
//! are tagged with the session id so the service keeps prosody across
//! fragment boundaries, and anything the service sends for a session
//! other than the current one is dropped.

use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::decode::{AudioEncoding, decode};
use super::frame::AudioChunk;
use super::output::PLAYBACK_SAMPLE_RATE;
use crate::{Error, Result};

/// Synthesis service settings
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub model: String,
    pub voice_id: String,
    pub api_key: Option<SecretString>,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    pub connect_timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8880/v1/tts/stream".to_string(),
            model: "default".to_string(),
            voice_id: "default".to_string(),
            api_key: None,
            sample_rate: PLAYBACK_SAMPLE_RATE,
            encoding: AudioEncoding::PcmS16le,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Unit of synthesis context continuity, one per turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisSession {
    pub session_id: String,
    pub voice_id: String,
}

impl SynthesisSession {
    /// New session with a fresh id
    #[must_use]
    pub fn new(voice_id: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            voice_id: voice_id.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputFormat {
    encoding: &'static str,
    sample_rate: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FragmentRequest<'a> {
    session_id: &'a str,
    voice_id: &'a str,
    model: &'a str,
    text: &'a str,
    #[serde(rename = "continue")]
    more: bool,
    output_format: OutputFormat,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest<'a> {
    session_id: &'a str,
    cancel: bool,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServiceMessage {
    Chunk {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
        #[serde(default)]
        sequence: Option<u64>,
    },
    Done {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
        #[serde(default)]
        message: String,
    },
}

/// What the service produced for the current session
#[derive(Debug)]
pub enum TtsEvent {
    Audio(AudioChunk),
    /// Chunks were skipped; the next chunk is still delivered
    Gap {
        session_id: String,
        expected: u64,
        received: u64,
    },
    /// The service finished the session
    Done { session_id: String },
    /// The session cannot complete
    Failed { session_id: String, error: Error },
}

struct Tracked {
    session: SynthesisSession,
    next_sequence: u64,
}

/// Holds the one current session and filters service messages against it
pub struct SessionTracker {
    current: Option<Tracked>,
    encoding: AudioEncoding,
    sample_rate: u32,
}

impl SessionTracker {
    #[must_use]
    pub const fn new(encoding: AudioEncoding, sample_rate: u32) -> Self {
        Self {
            current: None,
            encoding,
            sample_rate,
        }
    }

    /// Make `session` current, returning the session it displaced
    pub fn bind(&mut self, session: SynthesisSession) -> Option<SynthesisSession> {
        let previous = self.current.replace(Tracked {
            session,
            next_sequence: 0,
        });
        previous.map(|t| t.session)
    }

    #[must_use]
    pub fn current(&self) -> Option<&SynthesisSession> {
        self.current.as_ref().map(|t| &t.session)
    }

    #[must_use]
    pub fn is_current(&self, session_id: &str) -> bool {
        self.current().is_some_and(|s| s.session_id == session_id)
    }

    /// Forget `session_id` if it is current
    pub fn release(&mut self, session_id: &str) -> bool {
        if self.is_current(session_id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Handle one text message from the service
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the message or its audio payload is malformed
    pub fn accept(&mut self, text: &str) -> Result<Vec<TtsEvent>> {
        let message: ServiceMessage = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("bad tts message: {e}")))?;

        match message {
            ServiceMessage::Chunk {
                session_id,
                data,
                sequence,
            } => self.accept_chunk(session_id, &data, sequence),
            ServiceMessage::Done { session_id } => {
                if !self.release(&session_id) {
                    tracing::debug!(session_id = %session_id, "ignoring done for stale session");
                    return Ok(Vec::new());
                }
                Ok(vec![TtsEvent::Done { session_id }])
            }
            ServiceMessage::Error {
                session_id,
                message,
            } => {
                let Some(session_id) = session_id.or_else(|| self.current().map(|s| s.session_id.clone()))
                else {
                    return Ok(Vec::new());
                };
                if !self.release(&session_id) {
                    tracing::debug!(session_id = %session_id, "ignoring error for stale session");
                    return Ok(Vec::new());
                }
                Ok(vec![TtsEvent::Failed {
                    session_id,
                    error: Error::Protocol(format!("synthesis failed: {message}")),
                }])
            }
        }
    }

    fn accept_chunk(
        &mut self,
        session_id: String,
        data: &str,
        sequence: Option<u64>,
    ) -> Result<Vec<TtsEvent>> {
        let encoding = self.encoding;
        let sample_rate = self.sample_rate;
        let Some(tracked) = self
            .current
            .as_mut()
            .filter(|t| t.session.session_id == session_id)
        else {
            tracing::debug!(session_id = %session_id, "dropping chunk for stale session");
            return Ok(Vec::new());
        };

        let expected = tracked.next_sequence;
        let received = sequence.unwrap_or(expected);
        if received < expected {
            tracing::warn!(session_id = %session_id, received, expected, "dropping out-of-order chunk");
            return Ok(Vec::new());
        }

        let payload = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::Protocol(format!("bad audio payload: {e}")))?;
        let samples = decode(&payload, encoding)?;
        tracked.next_sequence = received + 1;

        let mut events = Vec::with_capacity(2);
        if received > expected {
            tracing::warn!(session_id = %session_id, received, expected, "synthesis audio gap");
            events.push(TtsEvent::Gap {
                session_id: session_id.clone(),
                expected,
                received,
            });
        }
        events.push(TtsEvent::Audio(AudioChunk::new(
            session_id,
            received,
            samples,
            sample_rate,
        )));
        Ok(events)
    }
}

/// Message from a connection task, tagged with the connection it came from
#[derive(Debug)]
pub struct Inbound {
    generation: u64,
    frame: InboundFrame,
}

#[derive(Debug)]
enum InboundFrame {
    /// The handshake finished and queued messages are flowing
    Opened,
    Text(String),
    Closed(Option<Error>),
}

struct Connection {
    /// Buffers messages while the handshake is still in flight
    outbound: mpsc::UnboundedSender<Message>,
    open: bool,
}

/// Streaming synthesis client
pub struct SpeechSynthesisClient {
    config: TtsConfig,
    tracker: SessionTracker,
    connection: Option<Connection>,
    generation: u64,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl SpeechSynthesisClient {
    /// Create a client and the receiver its connections report into
    #[must_use]
    pub fn new(config: TtsConfig) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let tracker = SessionTracker::new(config.encoding, config.sample_rate);
        (
            Self {
                config,
                tracker,
                connection: None,
                generation: 0,
                inbound,
            },
            rx,
        )
    }

    /// Open a new session for `voice_id` and make it current
    ///
    /// # Errors
    ///
    /// Returns error if the connection request cannot be built
    pub fn open_session(&mut self, voice_id: &str) -> Result<SynthesisSession> {
        let session = SynthesisSession::new(voice_id);
        self.bind_session(session.clone())?;
        Ok(session)
    }

    /// Make a caller-created session current, connecting if needed
    ///
    /// Never waits for the network. Fragments sent before the handshake
    /// completes are queued; a failed handshake arrives on the inbound
    /// channel and fails the session there.
    ///
    /// # Errors
    ///
    /// Returns error if the connection request cannot be built
    pub fn bind_session(&mut self, session: SynthesisSession) -> Result<()> {
        tracing::debug!(session_id = %session.session_id, voice_id = %session.voice_id, "synthesis session opened");
        if let Some(previous) = self.tracker.bind(session) {
            self.send_cancel(&previous.session_id);
        }
        self.ensure_connected()
    }

    /// Send text for the current session
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    pub fn send_fragment(&mut self, session_id: &str, text: &str, is_final: bool) -> Result<()> {
        let Some(session) = self.tracker.current().filter(|s| s.session_id == session_id) else {
            tracing::debug!(session_id, "dropping fragment for stale session");
            return Ok(());
        };

        let request = FragmentRequest {
            session_id,
            voice_id: &session.voice_id,
            model: &self.config.model,
            text,
            more: !is_final,
            output_format: OutputFormat {
                encoding: self.config.encoding.as_str(),
                sample_rate: self.config.sample_rate,
            },
        };
        let json = serde_json::to_string(&request)?;

        tracing::debug!(session_id, chars = text.chars().count(), is_final, "sending fragment");
        self.send(Message::Text(json.into()))
    }

    /// Drop the session locally and ask the service to stop it
    pub fn cancel_session(&mut self, session_id: &str) {
        if self.tracker.release(session_id) {
            tracing::debug!(session_id, "synthesis session cancelled");
            self.send_cancel(session_id);
        }
    }

    /// Process a message from a connection task
    pub fn handle_inbound(&mut self, inbound: Inbound) -> Vec<TtsEvent> {
        if inbound.generation != self.generation {
            return Vec::new();
        }

        match inbound.frame {
            InboundFrame::Opened => {
                tracing::info!(url = %self.config.url, "tts connected");
                if let Some(connection) = self.connection.as_mut() {
                    connection.open = true;
                }
                Vec::new()
            }
            InboundFrame::Text(text) => match self.tracker.accept(&text) {
                Ok(events) => events,
                Err(error) => {
                    tracing::warn!(error = %error, "tts protocol error, dropping connection");
                    self.disconnect();
                    self.fail_current(error)
                }
            },
            InboundFrame::Closed(reason) => {
                tracing::debug!(reason = ?reason, "tts connection closed");
                self.disconnect();
                self.fail_current(
                    reason.unwrap_or_else(|| Error::Connection("tts connection closed".to_string())),
                )
            }
        }
    }

    #[must_use]
    pub fn current_session(&self) -> Option<&SynthesisSession> {
        self.tracker.current()
    }

    /// Whether the handshake has completed on the live connection
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.open)
    }

    fn fail_current(&mut self, error: Error) -> Vec<TtsEvent> {
        let Some(session_id) = self.tracker.current().map(|s| s.session_id.clone()) else {
            return Vec::new();
        };
        self.tracker.release(&session_id);
        vec![TtsEvent::Failed { session_id, error }]
    }

    fn send_cancel(&mut self, session_id: &str) {
        let request = CancelRequest {
            session_id,
            cancel: true,
        };
        match serde_json::to_string(&request) {
            Ok(json) => {
                if let Err(e) = self.send(Message::Text(json.into())) {
                    tracing::debug!(error = %e, session_id, "cancel not delivered");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode cancel"),
        }
    }

    fn send(&mut self, message: Message) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Err(Error::Connection("tts not connected".to_string()));
        };
        if connection.outbound.send(message).is_err() {
            self.disconnect();
            return Err(Error::Connection("tts connection closed".to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            // Anything still in flight from the old socket is ignored
            self.generation += 1;
        }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| Error::Config(format!("invalid tts api key: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        tracing::debug!(url = %self.config.url, generation = self.generation, "tts connecting");
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            request,
            self.config.connect_timeout,
            outbound_rx,
            self.inbound.clone(),
            self.generation,
        ));
        self.connection = Some(Connection {
            outbound,
            open: false,
        });
        Ok(())
    }
}

async fn run_connection(
    request: Request,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    inbound: mpsc::UnboundedSender<Inbound>,
    generation: u64,
) {
    let connected = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| Error::Timeout("tts connect".to_string()))
        .and_then(|result| result.map_err(Error::from));

    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(error) => {
            tracing::warn!(error = %error, "tts connect failed");
            let _ = inbound.send(Inbound {
                generation,
                frame: InboundFrame::Closed(Some(error)),
            });
            return;
        }
    };

    if inbound
        .send(Inbound {
            generation,
            frame: InboundFrame::Opened,
        })
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        break Some(Error::from(e));
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break None;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let frame = InboundFrame::Text(text.to_string());
                    if inbound.send(Inbound { generation, frame }).is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(Error::from(e)),
            },
        }
    };

    let _ = inbound.send(Inbound {
        generation,
        frame: InboundFrame::Closed(reason),
    });
}
