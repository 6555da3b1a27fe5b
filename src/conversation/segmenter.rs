//! Splitting streamed model text into speakable fragments
//!
//! Deltas accumulate in a buffer that is released as a fragment when it
//! holds a complete sentence, when it grows past a size bound, or when the
//! model goes quiet for the inactivity timeout. Concatenating every
//! released fragment in order always reproduces the deltas exactly.

use std::time::Duration;

use crate::clock::Clock;

/// Tuning for fragment release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Buffer length in characters that forces a release
    pub min_chars: usize,
    /// Quiet period after the last delta that flushes the buffer
    pub inactivity_timeout: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_chars: 40,
            inactivity_timeout: Duration::from_millis(500),
        }
    }
}

/// A piece of reply text ready for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    pub text: String,
    /// Set on exactly one fragment per turn, the last
    pub is_final: bool,
}

impl TextFragment {
    fn partial(text: String) -> Self {
        Self {
            text,
            is_final: false,
        }
    }
}

/// Buffers model deltas and releases sentence-sized fragments
pub struct SentenceSegmenter<C> {
    config: SegmenterConfig,
    clock: C,
    buffer: String,
    last_delta_at: Option<Duration>,
}

impl<C: Clock> SentenceSegmenter<C> {
    #[must_use]
    pub const fn new(config: SegmenterConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            buffer: String::new(),
            last_delta_at: None,
        }
    }

    /// Append a delta and return every fragment it completes
    pub fn push(&mut self, delta: &str) -> Vec<TextFragment> {
        self.buffer.push_str(delta);
        self.last_delta_at = Some(self.clock.now());

        let mut released = Vec::new();
        while let Some(end) = self.release_point() {
            let rest = self.buffer.split_off(end);
            let text = std::mem::replace(&mut self.buffer, rest);
            released.push(TextFragment::partial(text));
        }
        released
    }

    /// Flush the buffer if the model has been quiet for the timeout
    pub fn poll(&mut self) -> Option<TextFragment> {
        let last = self.last_delta_at?;
        if self.buffer.is_empty() {
            return None;
        }
        if self.clock.now().saturating_sub(last) < self.config.inactivity_timeout {
            return None;
        }

        tracing::trace!(chars = self.buffer.chars().count(), "segmenter timeout flush");
        Some(TextFragment::partial(std::mem::take(&mut self.buffer)))
    }

    /// Release whatever remains as the final fragment, possibly empty
    pub fn finish(&mut self) -> TextFragment {
        self.last_delta_at = None;
        TextFragment {
            text: std::mem::take(&mut self.buffer),
            is_final: true,
        }
    }

    /// Drop buffered text without releasing it
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_delta_at = None;
    }

    /// Text held back waiting for a boundary
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    #[must_use]
    pub const fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Byte offset the buffer should be split at, if any
    fn release_point(&self) -> Option<usize> {
        if let Some(end) = sentence_end(&self.buffer) {
            return Some(end);
        }
        let min_chars = self.config.min_chars.max(1);
        if self.buffer.chars().count() >= min_chars {
            return size_split(&self.buffer, min_chars);
        }
        None
    }
}

const fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

const fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’')
}

/// End of the first complete sentence: terminal punctuation, optional
/// closing quotes, then whitespace which stays with the sentence
fn sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !is_terminal(c) {
            continue;
        }

        while chars.next_if(|&(_, c)| is_terminal(c) || is_closer(c)).is_some() {}

        let mut end = None;
        while let Some((i, c)) = chars.next_if(|&(_, c)| c.is_whitespace()) {
            end = Some(i + c.len_utf8());
        }
        if end.is_some() {
            return end;
        }
    }
    None
}

/// Split after the last whitespace that leaves at least half of
/// `min_chars` in the fragment, so words stay whole and no fragment is a
/// lone word. Without such whitespace the buffer is held until it reaches
/// twice `min_chars` and then goes out in full.
fn size_split(text: &str, min_chars: usize) -> Option<usize> {
    let floor = (min_chars / 2).max(1);
    let split = text
        .char_indices()
        .enumerate()
        .filter(|&(n, (_, c))| n + 1 >= floor && c.is_whitespace())
        .last()
        .map(|(_, (i, c))| i + c.len_utf8());

    split.or_else(|| (text.chars().count() >= min_chars * 2).then_some(text.len()))
}
