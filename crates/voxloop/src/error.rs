//! Error types for the conversation loop

use crate::model::ModelError;
use crate::session::SessionError;
use std::path::PathBuf;
use thiserror::Error;
use voxloop_voice::VoiceError;

/// Result type alias for conversation operations
pub type TalkResult<T> = Result<T, TalkError>;

#[derive(Error, Debug)]
pub enum TalkError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read prompt file {path}: {source}")]
    Prompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Batch evaluation failed; the conversation cannot continue.
    #[error("Generation engine failure: {0}")]
    Model(#[from] ModelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Voice error: {0}")]
    Voice(#[from] VoiceError),
}
