//! Session cache: the persisted token history of a conversation.
//!
//! On startup the stored tokens are matched against the freshly assembled
//! prompt. Every token of the matching prefix is reused without evaluation;
//! the stored tail after the first divergence is discarded. While the cache is
//! active, every evaluated batch is appended to it so the next run can resume.
//! A context rollover disables the cache for the rest of the run.

use crate::context::GenerationState;
use crate::model::{LanguageModel, Token};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"VXSN";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session file {0} does not exist")]
    NotFound(PathBuf),

    #[error("session file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("session IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read a token file written by [`write_token_file`], rejecting more than `capacity` tokens.
pub fn read_token_file(path: &Path, capacity: usize) -> Result<Vec<Token>, SessionError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SessionError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let corrupt = |reason: String| SessionError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if count > capacity {
        return Err(corrupt(format!(
            "{} tokens exceed the context capacity of {}",
            count, capacity
        )));
    }
    let body = &bytes[HEADER_LEN..];
    if body.len() != count * 4 {
        return Err(corrupt(format!(
            "expected {} token bytes, found {}",
            count * 4,
            body.len()
        )));
    }

    Ok(body
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn write_token_file(path: &Path, tokens: &[Token]) -> Result<(), SessionError> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + tokens.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(tokens.len() as u32).to_le_bytes());
    for t in tokens {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// How much of the prompt a loaded session covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub matched: usize,
    pub prompt_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentQuality {
    /// No stored tokens to compare.
    Empty,
    Exact,
    Partial,
    /// Under half the prompt matches; most of it will be evaluated again.
    Low,
}

impl Alignment {
    pub fn quality(&self) -> AlignmentQuality {
        if self.matched == 0 && self.prompt_len > 0 {
            AlignmentQuality::Low
        } else if self.matched >= self.prompt_len {
            AlignmentQuality::Exact
        } else if self.matched < self.prompt_len / 2 {
            AlignmentQuality::Low
        } else {
            AlignmentQuality::Partial
        }
    }

    /// At least three quarters of the prompt is covered: skip re-saving.
    pub fn close_enough(&self) -> bool {
        self.matched >= self.prompt_len * 3 / 4
    }
}

pub struct SessionCache {
    /// `None` once persistence is disabled.
    path: Option<PathBuf>,
    tokens: Vec<Token>,
    dirty: bool,
}

impl SessionCache {
    /// A cache that never persists anything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            tokens: Vec::new(),
            dirty: false,
        }
    }

    /// Load the session at `path` through the model. A missing file starts an
    /// empty session that will be created on the first save.
    pub fn open(
        path: impl Into<PathBuf>,
        model: &mut dyn LanguageModel,
        capacity: usize,
    ) -> Result<Self, SessionError> {
        let path = path.into();
        info!("attempting to load saved session from {}", path.display());
        let tokens = match model.load_session(&path, capacity) {
            Ok(tokens) => {
                info!("loaded a session with prompt size of {} tokens", tokens.len());
                tokens
            }
            Err(SessionError::NotFound(_)) => {
                info!("session file does not exist, will create");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            path: Some(path),
            tokens,
            dirty: false,
        })
    }

    pub fn is_active(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Compare the stored tokens against the prompt, report, and decide
    /// whether the session needs saving.
    pub fn align(&mut self, prompt: &[Token]) -> Alignment {
        let matched = self
            .tokens
            .iter()
            .zip(prompt)
            .take_while(|(a, b)| a == b)
            .count();
        let alignment = Alignment {
            matched,
            prompt_len: prompt.len(),
        };

        if !self.tokens.is_empty() {
            match alignment.quality() {
                AlignmentQuality::Exact => info!("session file has exact match for prompt!"),
                AlignmentQuality::Low => warn!(
                    "session file has low similarity to prompt ({} / {} tokens); will mostly be reevaluated",
                    matched,
                    prompt.len()
                ),
                _ => info!("session file matches {} / {} tokens of prompt", matched, prompt.len()),
            }
        }

        self.dirty = self.is_active() && !alignment.close_enough();
        alignment
    }

    /// Reuse the leading tokens of `batch` that match the stored history at
    /// `state.n_session_consumed`. Matched tokens advance `n_past` and the
    /// consumed count and are removed from `batch` and returned. On the first
    /// mismatch the stored history is cut back to the consumed length.
    pub fn reconcile(&mut self, batch: &mut Vec<Token>, state: &mut GenerationState) -> Vec<Token> {
        if state.n_session_consumed >= self.tokens.len() {
            return Vec::new();
        }

        let mut i = 0;
        while i < batch.len() {
            if batch[i] != self.tokens[state.n_session_consumed] {
                debug!(
                    "session diverges at token {}; dropping {} stored tokens",
                    state.n_session_consumed,
                    self.tokens.len() - state.n_session_consumed
                );
                self.tokens.truncate(state.n_session_consumed);
                break;
            }
            state.n_past += 1;
            state.n_session_consumed += 1;
            i += 1;
            if state.n_session_consumed >= self.tokens.len() {
                break;
            }
        }

        batch.drain(..i).collect()
    }

    /// Append freshly evaluated tokens to the stored history.
    pub fn record(&mut self, evaluated: &[Token], state: &mut GenerationState) {
        if !self.is_active() || evaluated.is_empty() {
            return;
        }
        self.tokens.extend_from_slice(evaluated);
        state.n_session_consumed = self.tokens.len();
    }

    /// Request a save before the next sampling step.
    pub fn mark_dirty(&mut self) {
        if self.is_active() {
            self.dirty = true;
        }
    }

    /// Save through the model when dirty. Returns whether a save happened.
    pub fn save_if_needed(&mut self, model: &mut dyn LanguageModel) -> Result<bool, SessionError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        self.dirty = false;
        model.save_session(path, &self.tokens)?;
        debug!("session saved: {} tokens -> {}", self.tokens.len(), path.display());
        Ok(true)
    }

    /// Stop persisting for the rest of the run.
    pub fn invalidate(&mut self) {
        if let Some(path) = self.path.take() {
            info!("context rolled over; no longer saving session {}", path.display());
        }
        self.tokens.clear();
        self.dirty = false;
    }
}
