//! # voxloop-voice - the audio side of a spoken conversation
//!
//! Microphone capture, energy VAD and barge-in detection, speech-to-text, and
//! the fire-and-forget TTS dispatch path. The conversation loop itself lives in
//! the `voxloop` crate and drives everything here through the [`AudioSource`],
//! [`Transcriber`] and [`SpeechSink`] seams.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  MicCapture  │ → │  RingBuffer  │ → │BargeInMonitor│  (gate + barge-in)
//! │    (cpal)    │   │ (16 kHz mono)│   └──────────────┘
//! └──────────────┘   └──────┬───────┘
//!                           ↓
//!                    ┌──────────────┐
//!                    │ Transcriber  │ → text::normalize_heard
//!                    └──────────────┘
//!
//! reply text → SpeechDispatcher (queue) → tts::encode → TtsClient → 127.0.0.1:10200
//! ```

pub mod audio;
pub mod error;
pub mod stt;
pub mod text;
pub mod tts;
pub mod tts_client;
pub mod vad;
pub mod voice_output;

pub use audio::{AudioSource, MicCapture, RingBuffer, SAMPLE_RATE};
pub use error::{TtsError, VoiceError, VoiceResult};
pub use stt::{
    create_best_transcriber, transcribe_soft, PlaceholderTranscriber, Transcriber,
    TranscriberConfig, Utterance,
};
#[cfg(feature = "whisper")]
pub use stt::WhisperTranscriber;
pub use text::{contains_stop, normalize_heard, similarity, WakeGate};
pub use tts::{decode, encode, RequestHeader, SynthesizePayload, PROTOCOL_VERSION};
pub use tts_client::{TtsClient, TtsConfig, TtsConnection};
pub use vad::{BargeInMonitor, VadConfig, VadParams, VoiceActivity};
pub use voice_output::{sanitize_speech, SpeechChunk, SpeechDispatcher, SpeechSink};
