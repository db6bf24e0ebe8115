//! **VoiceOutput** - hands reply text to the TTS server without stalling generation.
//!
//! The conversation loop pushes [`SpeechChunk`]s into an unbounded queue. A
//! single worker thread drains it, encoding and sending one request at a time,
//! so chunks reach the server in the order they were generated. Encode and
//! socket failures are logged by the worker and the chunk is dropped.

use crate::error::TtsError;
use crate::tts::SynthesizePayload;
use crate::tts_client::{TtsClient, TtsConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

/// Destination for text that should be spoken.
pub trait SpeechSink: Send {
    fn speak(&self, text: &str);
}

/// Prepare generated text for speech. `None` when there is nothing worth saying.
pub fn sanitize_speech(text: &str) -> Option<String> {
    if matches!(text, "." | "," | "!" | "\n") || !text.chars().any(char::is_alphabetic) {
        return None;
    }
    let mut out = text.trim().replace('\r', "").replace('\n', " ").replace('"', "");
    while out.contains("..") {
        out = out.replace("..", ".");
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// One queued speak request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechChunk {
    pub text: String,
}

/// Counters kept by the dispatch worker.
#[derive(Debug, Default)]
pub struct DispatchStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single-consumer speech queue in front of a [`TtsClient`].
pub struct SpeechDispatcher {
    tx: Option<UnboundedSender<SpeechChunk>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
}

impl SpeechDispatcher {
    pub fn new(config: &TtsConfig) -> std::io::Result<Self> {
        Self::with_client(TtsClient::from_config(config), config.voice.clone())
    }

    pub fn with_client(client: TtsClient, voice: Option<String>) -> std::io::Result<Self> {
        let (tx, mut rx) = unbounded_channel::<SpeechChunk>();
        let stats = Arc::new(DispatchStats::default());
        let worker_stats = Arc::clone(&stats);

        info!("🔊 TTS dispatch → {}", client.address());
        let worker = std::thread::Builder::new()
            .name("tts-dispatch".to_string())
            .spawn(move || {
                while let Some(chunk) = rx.blocking_recv() {
                    match deliver(&client, voice.as_deref(), &chunk) {
                        Ok(n) => {
                            debug!("TTS sent {} bytes: {:?}", n, chunk.text);
                            worker_stats.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("TTS request dropped: {}", e);
                            worker_stats.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                debug!("TTS dispatch worker exiting");
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            stats,
        })
    }

    /// Queue a chunk. Returns false when it was sanitized away or the worker is gone.
    pub fn dispatch(&self, text: &str) -> bool {
        let Some(text) = sanitize_speech(text) else {
            debug!("skipping unspeakable chunk {:?}", text);
            return false;
        };
        match &self.tx {
            Some(tx) => tx.send(SpeechChunk { text }).is_ok(),
            None => false,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Deliver everything already queued, then stop the worker.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("TTS dispatch worker panicked");
            }
        }
    }
}

impl SpeechSink for SpeechDispatcher {
    fn speak(&self, text: &str) {
        self.dispatch(text);
    }
}

impl Drop for SpeechDispatcher {
    fn drop(&mut self) {
        self.finish();
    }
}

fn deliver(client: &TtsClient, voice: Option<&str>, chunk: &SpeechChunk) -> Result<usize, TtsError> {
    let frame = SynthesizePayload::new(chunk.text.as_str())
        .with_voice(voice)
        .encode()?;
    client.speak(&frame)
}
