//! **Speech-to-Text** - turn the last few seconds of microphone audio into an [`Utterance`].
//!
//! The orchestrator only sees the [`Transcriber`] trait. A failed transcription
//! is not an error for the conversation: callers treat it as "heard nothing".

use crate::error::VoiceResult;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Raw recognized text for one user turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// Mean token probability reported by the engine (0.0 when unknown).
    pub confidence: f32,
    /// Wall-clock cost of the transcription call.
    pub elapsed: Duration,
}

impl Utterance {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Backend for converting 16 kHz mono f32 PCM to text.
pub trait Transcriber: Send + Sync {
    /// Transcribe `pcm`, biasing the decoder with `prompt`.
    fn transcribe(&self, pcm: &[f32], prompt: &str) -> VoiceResult<Utterance>;
}

/// Transcribe and fold any failure into an empty utterance.
pub fn transcribe_soft(backend: &dyn Transcriber, pcm: &[f32], prompt: &str) -> Utterance {
    match backend.transcribe(pcm, prompt) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!("transcription failed, treating as silence: {}", e);
            Utterance::empty()
        }
    }
}

/// Transcriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Path to a ggml Whisper model. Falls back to `WHISPER_MODEL_PATH`.
    pub model_path: Option<String>,
    pub language: String,
    pub translate: bool,
    /// Decoding budget per utterance.
    pub max_tokens: u32,
    pub n_threads: u32,
    /// Encoder context size (0 = full).
    pub audio_ctx: u32,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self {
            model_path: None,
            language: "en".to_string(),
            translate: false,
            max_tokens: 32,
            n_threads: cores.min(4),
            audio_ctx: 0,
        }
    }
}

impl TranscriberConfig {
    /// Configured model path, or the `WHISPER_MODEL_PATH` environment variable.
    pub fn resolved_model_path(&self) -> Option<String> {
        self.model_path
            .clone()
            .or_else(|| std::env::var("WHISPER_MODEL_PATH").ok())
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
    }
}

/// Placeholder transcriber: returns a fixed response, or nothing.
/// Use for testing the loop without a Whisper model.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    /// If set, return this for every call.
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl Transcriber for PlaceholderTranscriber {
    fn transcribe(&self, pcm: &[f32], _prompt: &str) -> VoiceResult<Utterance> {
        let start = Instant::now();
        let text = match &self.response {
            Some(r) => r.clone(),
            None => {
                tracing::debug!("placeholder transcriber ignored {} samples", pcm.len());
                String::new()
            }
        };
        Ok(Utterance {
            text,
            confidence: 1.0,
            elapsed: start.elapsed(),
        })
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use crate::error::VoiceError;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper transcriber tuned for short commands: greedy, single
    /// segment, no carried context, capped token budget.
    pub struct WhisperTranscriber {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
        config: TranscriberConfig,
    }

    impl WhisperTranscriber {
        pub fn new(model_path: &str, config: TranscriberConfig) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            tracing::info!("🧠 Whisper model loaded from {}", model_path);
            Ok(Self {
                context,
                state: Mutex::new(state),
                config,
            })
        }
    }

    impl Transcriber for WhisperTranscriber {
        fn transcribe(&self, pcm: &[f32], prompt: &str) -> VoiceResult<Utterance> {
            let start = Instant::now();
            if pcm.is_empty() {
                return Ok(Utterance::empty());
            }

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_special(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);
            params.set_no_timestamps(true);
            params.set_translate(self.config.translate);
            params.set_single_segment(true);
            params.set_no_context(true);
            params.set_max_tokens(self.config.max_tokens as i32);
            params.set_language(Some(self.config.language.as_str()));
            params.set_n_threads(self.config.n_threads as i32);
            params.set_audio_ctx(self.config.audio_ctx as i32);
            params.set_initial_prompt(prompt);

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(params, pcm)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;

            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                .collect::<Vec<_>>()
                .join("");

            Ok(Utterance {
                text,
                confidence: 0.0,
                elapsed: start.elapsed(),
            })
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperTranscriber;

/// Create the best available transcriber: Whisper when the `whisper` feature is
/// enabled and a model loads, otherwise the placeholder.
pub fn create_best_transcriber(config: &TranscriberConfig) -> VoiceResult<Box<dyn Transcriber>> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = config.resolved_model_path() {
            match whisper_stt::WhisperTranscriber::new(&path, config.clone()) {
                Ok(w) => return Ok(Box::new(w)),
                Err(e) => tracing::warn!("{}; falling back to placeholder transcriber", e),
            }
        }
    }
    #[cfg(not(feature = "whisper"))]
    {
        if let Some(path) = config.resolved_model_path() {
            tracing::warn!(
                "Whisper model {} configured but the `whisper` feature is disabled",
                path
            );
        }
    }
    tracing::warn!("No speech model available; using placeholder transcriber");
    Ok(Box::new(PlaceholderTranscriber::new()))
}
