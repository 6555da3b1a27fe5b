//! Streaming text generation
//!
//! Talks to an OpenAI compatible chat completions endpoint with
//! `stream: true` and exposes the server-sent events as an ordered sequence
//! of text deltas ending in [`StreamItem::Done`]. A stream that goes quiet
//! for longer than the idle timeout fails instead of hanging.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::conversation::TurnId;
use crate::{Error, Result};

/// Language model settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub system_prompt: String,
    pub max_tokens: u32,
    /// Longest gap between stream reads before the request is abandoned
    pub idle_timeout: Duration,
    /// Completed exchanges kept as context for the next prompt
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            system_prompt: "You are a friendly voice assistant. Reply in short, natural spoken \
                            sentences without markdown or lists."
                .to_string(),
            max_tokens: 512,
            idle_timeout: Duration::from_secs(15),
            history_turns: 8,
        }
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Bounded record of completed exchanges
#[derive(Debug, Default)]
pub struct ChatHistory {
    exchanges: VecDeque<(String, String)>,
    max_turns: usize,
}

impl ChatHistory {
    #[must_use]
    pub const fn new(max_turns: usize) -> Self {
        Self {
            exchanges: VecDeque::new(),
            max_turns,
        }
    }

    /// Record a finished exchange, evicting the oldest past the bound
    pub fn record(&mut self, prompt: impl Into<String>, reply: impl Into<String>) {
        if self.max_turns == 0 {
            return;
        }
        self.exchanges.push_back((prompt.into(), reply.into()));
        while self.exchanges.len() > self.max_turns {
            self.exchanges.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Messages for a request: system prompt, history, then `prompt`
    #[must_use]
    pub fn messages(&self, system_prompt: &str, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.exchanges.len() * 2 + 2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        for (user, assistant) in &self.exchanges {
            messages.push(ChatMessage::user(user.as_str()));
            messages.push(ChatMessage::assistant(assistant.as_str()));
        }
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

/// Element of a generation stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Delta(String),
    /// Completion marker; nothing follows it
    Done,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Longest unterminated line the decoder will hold
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental parser for `data:` lines of a server-sent event stream
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}


impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning items from every completed line
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for an event payload that is not a valid chunk
    /// or a line longer than [`MAX_LINE_BYTES`], and `Connection` for an
    /// error reported inside the stream
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamItem>> {
        self.buffer.extend_from_slice(bytes);

        let mut items = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(item) = parse_line(line.trim())? {
                items.push(item);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let held = self.buffer.len();
            self.buffer.clear();
            return Err(Error::Protocol(format!(
                "model stream line exceeds {MAX_LINE_BYTES} bytes ({held} buffered)"
            )));
        }
        Ok(items)
    }
}

fn parse_line(line: &str) -> Result<Option<StreamItem>> {
    let Some(data) = line.strip_prefix("data:") else {
        // Blank separators, comments, `event:` and `id:` fields
        return Ok(None);
    };
    let data = data.trim_start();

    if data == "[DONE]" {
        return Ok(Some(StreamItem::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| Error::Protocol(format!("bad model stream chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(Error::Connection(format!("model error: {}", error.message)));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(StreamItem::Delta))
}

/// Ordered deltas of one model response
pub struct TextGenerationStream {
    body: BoxStream<'static, Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<StreamItem>,
    idle_timeout: Duration,
    finished: bool,
}

impl TextGenerationStream {
    /// Wrap a raw byte stream of server-sent events
    pub fn from_byte_stream<S>(body: S, idle_timeout: Duration) -> Self
    where
        S: futures::Stream<Item = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            body: body.boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            idle_timeout,
            finished: false,
        }
    }

    /// Next delta or the completion marker
    ///
    /// Returns `None` once the stream has completed or failed.
    pub async fn next_item(&mut self) -> Option<Result<StreamItem>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                if item == StreamItem::Done {
                    self.finished = true;
                    self.pending.clear();
                }
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }

            let read = tokio::time::timeout(self.idle_timeout, self.body.next()).await;
            match read {
                Err(_) => {
                    self.finished = true;
                    return Some(Err(Error::Timeout(format!(
                        "no model output for {}ms",
                        self.idle_timeout.as_millis()
                    ))));
                }
                Ok(None) => {
                    self.finished = true;
                    return Some(Err(Error::Connection(
                        "model stream ended before completion".to_string(),
                    )));
                }
                Ok(Some(Err(e))) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Ok(Some(Ok(bytes))) => match self.decoder.push(&bytes) {
                    Ok(items) => self.pending.extend(items),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                },
            }
        }
    }
}

/// Chat completions client
#[derive(Clone)]
pub struct TextGenerator {
    client: reqwest::Client,
    config: Arc<LlmConfig>,
}

impl TextGenerator {
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Start a streaming completion
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the service rejects it
    pub async fn stream(&self, messages: &[ChatMessage]) -> Result<TextGenerationStream> {
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            max_tokens: self.config.max_tokens,
        };

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = tokio::time::timeout(self.config.idle_timeout, request.send())
            .await
            .map_err(|_| Error::Timeout("model request".to_string()))??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "model api error");
            return Err(Error::Connection(format!("model api error {status}: {body}")));
        }

        tracing::debug!(model = %self.config.model, "model stream established");
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from));
        Ok(TextGenerationStream::from_byte_stream(
            bytes,
            self.config.idle_timeout,
        ))
    }
}

/// Model output routed back to the pipeline loop
#[derive(Debug)]
pub enum ModelEvent {
    Delta { turn: TurnId, text: String },
    Complete { turn: TurnId },
    Failed { turn: TurnId, error: Error },
}

/// Run one turn's request, forwarding every item tagged with `turn`
///
/// Cancellation is done by aborting the task running this future.
pub async fn run_turn(
    generator: TextGenerator,
    turn: TurnId,
    messages: Vec<ChatMessage>,
    events: mpsc::UnboundedSender<ModelEvent>,
) {
    let mut stream = match generator.stream(&messages).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = events.send(ModelEvent::Failed { turn, error });
            return;
        }
    };

    while let Some(item) = stream.next_item().await {
        let event = match item {
            Ok(StreamItem::Delta(text)) => ModelEvent::Delta { turn, text },
            Ok(StreamItem::Done) => ModelEvent::Complete { turn },
            Err(error) => ModelEvent::Failed { turn, error },
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(lines: &[&str]) -> Vec<Result<Vec<u8>>> {
        lines.iter().map(|l| Ok(l.as_bytes().to_vec())).collect()
    }

    fn delta(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    #[test]
    fn decoder_handles_lines_split_across_reads() {
        let mut decoder = SseDecoder::new();
        let line = delta("Hello");
        let (a, b) = line.split_at(10);

        assert!(decoder.push(a.as_bytes()).unwrap().is_empty());
        assert_eq!(
            decoder.push(b.as_bytes()).unwrap(),
            vec![StreamItem::Delta("Hello".to_string())]
        );
        assert_eq!(
            decoder.push(b": keepalive\ndata: [DONE]\n").unwrap(),
            vec![StreamItem::Done]
        );
    }

    #[test]
    fn decoder_skips_role_only_chunks() {
        let mut decoder = SseDecoder::new();
        let items = decoder
            .push(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n")
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn decoder_rejects_unterminated_flood() {
        let mut decoder = SseDecoder::new();
        let block = vec![b'x'; 64 * 1024];
        for _ in 0..16 {
            assert!(decoder.push(&block).unwrap().is_empty());
        }
        assert!(matches!(decoder.push(b"x"), Err(Error::Protocol(_))));

        // The decoder starts over after rejecting the line
        assert_eq!(decoder.push(b"data: [DONE]\n").unwrap(), vec![StreamItem::Done]);
    }

    #[test]
    fn decoder_rejects_garbage_payload() {
        let mut decoder = SseDecoder::new();
        assert!(matches!(decoder.push(b"data: {oops\n"), Err(Error::Protocol(_))));
        assert!(matches!(
            decoder.push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n"),
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn stream_yields_deltas_then_done() {
        let body = futures::stream::iter(sse(&[
            &delta("Hi"),
            &delta(" there"),
            "data: [DONE]\n",
            &delta("ignored"),
        ]));
        let mut stream = TextGenerationStream::from_byte_stream(body, Duration::from_secs(1));

        assert_eq!(
            stream.next_item().await.unwrap().unwrap(),
            StreamItem::Delta("Hi".to_string())
        );
        assert_eq!(
            stream.next_item().await.unwrap().unwrap(),
            StreamItem::Delta(" there".to_string())
        );
        assert_eq!(stream.next_item().await.unwrap().unwrap(), StreamItem::Done);
        assert!(stream.next_item().await.is_none());
    }

    #[tokio::test]
    async fn stream_without_marker_is_connection_error() {
        let body = futures::stream::iter(sse(&[&delta("Hi")]));
        let mut stream = TextGenerationStream::from_byte_stream(body, Duration::from_secs(1));

        stream.next_item().await.unwrap().unwrap();
        let err = stream.next_item().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(stream.next_item().await.is_none());
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let body = futures::stream::pending::<Result<Vec<u8>>>();
        let mut stream = TextGenerationStream::from_byte_stream(body, Duration::from_millis(20));

        let err = stream.next_item().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let mut history = ChatHistory::new(2);
        history.record("one", "1");
        history.record("two", "2");
        history.record("three", "3");
        assert_eq!(history.len(), 2);

        let messages = history.messages("be brief", "four");
        assert_eq!(messages[0], ChatMessage::system("be brief"));
        assert_eq!(messages[1], ChatMessage::user("two"));
        assert_eq!(messages[4], ChatMessage::assistant("3"));
        assert_eq!(messages.last(), Some(&ChatMessage::user("four")));
    }

    #[test]
    fn request_body_asks_for_streaming() {
        let messages = [ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            stream: true,
            max_tokens: 10,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
