//! # voxloop - a spoken conversation loop
//!
//! Listens on the microphone, waits for a finished utterance, transcribes it,
//! feeds it to a language model and streams the reply sentence by sentence to
//! a TTS server. The user can talk over the reply at any time; generation
//! stops and the new speech becomes the next turn.
//!
//! ```text
//! RingBuffer ─▶ BargeInMonitor ─▶ Transcriber ─▶ ConversationOrchestrator
//!                     ▲                                 │ tokens
//!                     │ every 2 tokens / every chunk    ▼
//!                     └──────────────────────── LanguageModel + Sampler
//!                                                       │ pieces
//!                                                       ▼
//!                         SpeechDispatcher ◀── SentenceSegmenter
//! ```
//!
//! The model's token history is persisted through [`SessionCache`] so a
//! restart skips re-evaluating the prompt, and the context window rolls over
//! to the fixed prompt plus recent history when it fills up.

pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod sampling;
pub mod scripted;
pub mod segmenter;
pub mod session;

pub use config::{AudioConfig, ConversationConfig, TalkConfig};
pub use context::{ContextWindow, GenerationState};
pub use error::{TalkError, TalkResult};
pub use model::{LanguageModel, ModelError, Token};
pub use orchestrator::{
    ConversationOrchestrator, ConversationState, IgnoreReason, TickOutcome, TurnReport,
};
pub use prompt::PromptTemplate;
pub use sampling::{Sampler, SamplingConfig};
pub use scripted::ScriptedModel;
pub use segmenter::{SegmentPolicy, SegmenterConfig, SentenceSegmenter};
pub use session::{SessionCache, SessionError};
