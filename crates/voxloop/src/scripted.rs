//! A scripted stand-in for a real language model.
//!
//! Byte-level vocabulary (256 byte tokens plus BOS and EOS). The model replays
//! queued replies: once a batch has been evaluated, the next reply in the queue
//! becomes the target and each step puts an overwhelming logit on its next
//! token, so any sensible sampler follows it. Evaluating anything other than
//! the expected continuation abandons the reply. With nothing queued the
//! model predicts EOS.
//!
//! Used by the tests and as the binary's engine when no real one is wired in.

use crate::model::{LanguageModel, ModelError, Token};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const BOS: Token = 256;
pub const EOS: Token = 257;
pub const N_VOCAB: usize = 258;

const TARGET_LOGIT: f32 = 30.0;

/// One call to [`LanguageModel::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRecord {
    pub n_past: usize,
    pub tokens: Vec<Token>,
}

/// Shared view of every evaluation the model has performed.
#[derive(Debug, Clone, Default)]
pub struct EvalLog(Arc<Mutex<Vec<EvalRecord>>>);

impl EvalLog {
    pub fn records(&self) -> Vec<EvalRecord> {
        self.0.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Total tokens pushed through `evaluate`.
    pub fn evaluated_tokens(&self) -> usize {
        self.records().iter().map(|r| r.tokens.len()).sum()
    }

    fn push(&self, record: EvalRecord) {
        if let Ok(mut g) = self.0.lock() {
            g.push(record);
        }
    }
}

struct ActiveReply {
    tokens: Vec<Token>,
    cursor: usize,
}

pub struct ScriptedModel {
    replies: VecDeque<Vec<Token>>,
    fallback: Option<Vec<Token>>,
    active: Option<ActiveReply>,
    logits: Vec<f32>,
    n_ctx: usize,
    fail_after: Option<usize>,
    log: EvalLog,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            fallback: None,
            active: None,
            logits: vec![0.0; N_VOCAB],
            n_ctx: usize::MAX,
            fail_after: None,
            log: EvalLog::default(),
        }
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut model = Self::new();
        for r in replies {
            model.push_reply(r.as_ref());
        }
        model
    }

    pub fn push_reply(&mut self, text: &str) {
        let tokens = self.tokenize(text, false);
        self.replies.push_back(tokens);
    }

    /// Reply used whenever the queue is empty.
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(self.tokenize(text, false));
        self
    }

    /// Reject evaluations that would run past `n_ctx` positions, like a real engine.
    pub fn with_context_size(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Make the evaluation after the first `n` fail.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn eval_log(&self) -> EvalLog {
        self.log.clone()
    }

    fn expected(&self) -> Option<Token> {
        self.active
            .as_ref()
            .and_then(|a| a.tokens.get(a.cursor).copied())
    }
}

impl LanguageModel for ScriptedModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(Token::from));
        tokens
    }

    fn token_to_piece(&self, token: Token) -> String {
        match u8::try_from(token) {
            Ok(b) => String::from_utf8_lossy(&[b]).into_owned(),
            Err(_) => String::new(),
        }
    }

    fn detokenize(&self, tokens: &[Token]) -> String {
        let bytes: Vec<u8> = tokens.iter().filter_map(|&t| u8::try_from(t).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), ModelError> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(ModelError::Eval {
                    n_tokens: tokens.len(),
                    n_past,
                    reason: "scripted failure".to_string(),
                });
            }
            *remaining -= 1;
        }
        if n_past + tokens.len() > self.n_ctx {
            return Err(ModelError::Eval {
                n_tokens: tokens.len(),
                n_past,
                reason: format!("context of {} exceeded", self.n_ctx),
            });
        }
        self.log.push(EvalRecord {
            n_past,
            tokens: tokens.to_vec(),
        });

        let expected = self.expected();
        let follows = expected.is_some() && tokens.last() == expected.as_ref();
        if follows {
            if let Some(active) = self.active.as_mut() {
                active.cursor += 1;
            }
        } else {
            self.active = None;
        }
        Ok(())
    }

    fn logits(&mut self) -> &[f32] {
        if self.active.is_none() {
            let next = self.replies.pop_front().or_else(|| self.fallback.clone());
            self.active = next.map(|tokens| ActiveReply { tokens, cursor: 0 });
        }
        let target = self.expected().unwrap_or(EOS);

        self.logits.iter_mut().for_each(|l| *l = 0.0);
        if let Some(l) = usize::try_from(target).ok().and_then(|i| self.logits.get_mut(i)) {
            *l = TARGET_LOGIT;
        }
        &self.logits
    }

    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn token_eos(&self) -> Token {
        EOS
    }

    fn token_nl(&self) -> Token {
        Token::from(b'\n')
    }
}
