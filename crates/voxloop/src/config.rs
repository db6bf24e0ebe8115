//! Runtime configuration.
//!
//! Precedence: environment (`VOXLOOP__SECTION__KEY`) > config file > defaults.
//! The file is `--config <path>`, else `VOXLOOP_CONFIG`, else `voxloop.toml`
//! when it exists.

use crate::error::{TalkError, TalkResult};
use crate::sampling::SamplingConfig;
use crate::segmenter::SegmenterConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use voxloop_voice::{TranscriberConfig, TtsConfig, VadConfig};

pub const DEFAULT_CONFIG_FILE: &str = "voxloop.toml";
pub const ENV_PREFIX: &str = "VOXLOOP";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TalkConfig {
    pub conversation: ConversationConfig,
    pub vad: VadConfig,
    pub transcriber: TranscriberConfig,
    pub sampling: SamplingConfig,
    pub segmenter: SegmenterConfig,
    pub tts: TtsConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub person: String,
    pub bot_name: String,
    /// Phrase every command must start with (empty = always listen).
    pub wake_command: String,
    /// Spoken as soon as a command is accepted (empty = silent).
    pub heard_ok: String,
    /// Custom dialog template replacing the built-in one.
    pub prompt_file: Option<PathBuf>,
    /// Audio handed to the transcriber per turn.
    pub voice_ms: u32,
    /// Idle polling interval while listening.
    pub tick_ms: u64,
    pub n_predict: usize,
    pub n_prev: usize,
    pub n_ctx: usize,
    pub session_path: Option<PathBuf>,
    pub verbose_prompt: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            person: "Georgi".to_string(),
            bot_name: "LLaMA".to_string(),
            wake_command: String::new(),
            heard_ok: String::new(),
            prompt_file: None,
            voice_ms: 10_000,
            tick_ms: 100,
            n_predict: 64,
            n_prev: 64,
            n_ctx: 2048,
            session_path: None,
            verbose_prompt: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture ring buffer length.
    pub buffer_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { buffer_ms: 30_000 }
    }
}

impl TalkConfig {
    /// Load from an explicit file (which must exist), or from the default
    /// locations, then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> TalkResult<Self> {
        let builder = config::Config::builder()
            .set_default("conversation.person", "Georgi")?
            .set_default("conversation.bot_name", "LLaMA")?;

        let builder = match explicit {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => {
                let path = std::env::var("VOXLOOP_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
                if path.exists() {
                    tracing::info!("Loading config from {}", path.display());
                    builder.add_source(config::File::from(path.as_path()))
                } else {
                    builder
                }
            }
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: TalkConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> TalkResult<()> {
        let c = &self.conversation;
        if c.person.trim().is_empty() || c.bot_name.trim().is_empty() {
            return Err(TalkError::Invalid(
                "conversation.person and conversation.bot_name must not be empty".to_string(),
            ));
        }
        if c.n_ctx == 0 || c.n_predict == 0 {
            return Err(TalkError::Invalid(
                "conversation.n_ctx and conversation.n_predict must be positive".to_string(),
            ));
        }
        if c.tick_ms == 0 {
            return Err(TalkError::Invalid("conversation.tick_ms must be positive".to_string()));
        }
        for (site, params) in [("gate", &self.vad.gate), ("barge_in", &self.vad.barge_in)] {
            if params.last_ms >= self.vad.window_ms {
                return Err(TalkError::Invalid(format!(
                    "vad.{}.last_ms ({}) must be shorter than vad.window_ms ({})",
                    site, params.last_ms, self.vad.window_ms
                )));
            }
        }
        if self.audio.buffer_ms < c.voice_ms.max(self.vad.window_ms) {
            return Err(TalkError::Invalid(format!(
                "audio.buffer_ms ({}) must hold conversation.voice_ms and vad.window_ms",
                self.audio.buffer_ms
            )));
        }
        Ok(())
    }
}
