//! The language-model seam.
//!
//! The conversation loop drives generation one batch at a time: evaluate the
//! pending tokens at position `n_past`, read the logits of the last one, sample,
//! repeat. Any engine that can do that (llama.cpp bindings, a remote server
//! with KV reuse, the scripted model used in tests) plugs in here.

use crate::session::{self, SessionError};
use std::path::Path;
use thiserror::Error;

pub type Token = i32;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to evaluate {n_tokens} tokens at position {n_past}: {reason}")]
    Eval {
        n_tokens: usize,
        n_past: usize,
        reason: String,
    },

    #[error("model load failed: {0}")]
    Load(String),
}

pub trait LanguageModel: Send {
    /// Text to tokens, optionally with the beginning-of-sequence token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token>;

    /// Text of a single token.
    fn token_to_piece(&self, token: Token) -> String;

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()`.
    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), ModelError>;

    /// Logits for the last evaluated position, `n_vocab()` long.
    fn logits(&mut self) -> &[f32];

    fn n_vocab(&self) -> usize;

    fn token_eos(&self) -> Token;

    fn token_nl(&self) -> Token;

    /// Restore a saved session, returning its token history. Engines that keep
    /// evaluation state override this to restore that state as well.
    fn load_session(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, SessionError> {
        session::read_token_file(path, capacity)
    }

    /// Persist the session token history (and any engine state).
    fn save_session(&mut self, path: &Path, tokens: &[Token]) -> Result<(), SessionError> {
        session::write_token_file(path, tokens)
    }

    fn detokenize(&self, tokens: &[Token]) -> String {
        tokens.iter().map(|&t| self.token_to_piece(t)).collect()
    }
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token> {
        (**self).tokenize(text, add_bos)
    }

    fn token_to_piece(&self, token: Token) -> String {
        (**self).token_to_piece(token)
    }

    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), ModelError> {
        (**self).evaluate(tokens, n_past)
    }

    fn logits(&mut self) -> &[f32] {
        (**self).logits()
    }

    fn n_vocab(&self) -> usize {
        (**self).n_vocab()
    }

    fn token_eos(&self) -> Token {
        (**self).token_eos()
    }

    fn token_nl(&self) -> Token {
        (**self).token_nl()
    }

    fn load_session(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, SessionError> {
        (**self).load_session(path, capacity)
    }

    fn save_session(&mut self, path: &Path, tokens: &[Token]) -> Result<(), SessionError> {
        (**self).save_session(path, tokens)
    }
}
