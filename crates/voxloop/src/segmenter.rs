//! Sentence segmentation of the streamed reply.
//!
//! Generated text accumulates in a chunk until it reaches a speakable
//! boundary. Flushed chunks have the anti-prompt removed and double quotes
//! turned into single quotes.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentPolicy {
    /// Flush at sentence punctuation, a dash after a space, or a comma after enough tokens.
    Punctuation,
    /// Flush as soon as the token and character minimums are met. A flush that
    /// would end in the first part of the anti-prompt holds that part back.
    Eager,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub policy: SegmentPolicy,
    pub min_tokens: usize,
    pub min_chars: usize,
    /// Tokens since the last flush before a comma counts as a boundary.
    pub comma_min_tokens: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            policy: SegmentPolicy::Punctuation,
            min_tokens: 2,
            min_chars: 2,
            comma_min_tokens: 5,
        }
    }
}

pub struct SentenceSegmenter {
    config: SegmenterConfig,
    antiprompt: String,
    chunk: String,
    tokens_since_flush: usize,
}

impl SentenceSegmenter {
    pub fn new(config: SegmenterConfig, antiprompt: impl Into<String>) -> Self {
        Self {
            config,
            antiprompt: antiprompt.into(),
            chunk: String::new(),
            tokens_since_flush: 0,
        }
    }

    pub fn pending(&self) -> &str {
        &self.chunk
    }

    /// Add one generated piece. Returns the finished chunk when a boundary is
    /// reached and something speakable is left after cleanup.
    pub fn push(&mut self, piece: &str) -> Option<String> {
        self.chunk.push_str(piece);
        self.tokens_since_flush += 1;
        if !self.should_flush() {
            return None;
        }
        // Keep a possible start of the anti-prompt until it completes or diverges
        let held = self.partial_antiprompt_len();
        let carry = self.chunk.split_off(self.chunk.len() - held);
        let out = self.take();
        self.chunk = carry;
        out
    }

    /// Byte length of the longest proper prefix of the anti-prompt that ends the chunk.
    fn partial_antiprompt_len(&self) -> usize {
        self.antiprompt
            .char_indices()
            .skip(1)
            .map(|(i, _)| i)
            .filter(|&i| self.chunk.ends_with(&self.antiprompt[..i]))
            .max()
            .unwrap_or(0)
    }

    pub fn should_flush(&self) -> bool {
        let text = self.chunk.as_str();
        if self.tokens_since_flush < self.config.min_tokens
            || text.chars().count() < self.config.min_chars
        {
            return false;
        }
        match self.config.policy {
            SegmentPolicy::Eager => true,
            SegmentPolicy::Punctuation => {
                text.ends_with(['.', '?', '!', ';', ':', '(', ')', '\n'])
                    || text.ends_with(" -")
                    || (text.ends_with(',')
                        && self.tokens_since_flush >= self.config.comma_min_tokens)
            }
        }
    }

    /// Remove the anti-prompt from the pending chunk once it has been generated.
    pub fn strip_antiprompt(&mut self) {
        if !self.antiprompt.is_empty() {
            self.chunk = self.chunk.replace(&self.antiprompt, "");
        }
    }

    /// Flush whatever is pending at the end of a turn.
    pub fn finish(&mut self) -> Option<String> {
        if self.chunk.is_empty() {
            self.tokens_since_flush = 0;
            return None;
        }
        self.take()
    }

    /// Drop pending text without speaking it.
    pub fn reset(&mut self) {
        self.chunk.clear();
        self.tokens_since_flush = 0;
    }

    fn take(&mut self) -> Option<String> {
        let mut text = std::mem::take(&mut self.chunk).replace('"', "'");
        if !self.antiprompt.is_empty() {
            text = text.replace(&self.antiprompt, "");
        }
        self.tokens_since_flush = 0;
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
