//! voxloop CLI: talk to a language model through the microphone.
//!
//! Usage:
//!   cargo run -p voxloop -- [--config voxloop.toml] [--say "Hello"]
//!   cargo run -p voxloop --features whisper -- --config voxloop.toml
//!
//! Replies are spoken by a Wyoming-style TTS server (default 127.0.0.1:10200).

use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voxloop::{ConversationOrchestrator, ScriptedModel, TalkConfig};
use voxloop_voice::{create_best_transcriber, MicCapture, SpeechDispatcher};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut say: Option<String> = None;
    let mut list_devices = false;

    while let Some(a) = args.next() {
        match a.as_str() {
            "--config" | "-c" => config_path = args.next().map(PathBuf::from),
            "--say" => say = args.next(),
            "--list-devices" => list_devices = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => warn!("ignoring unknown argument {}", other),
        }
    }

    if list_devices {
        for name in MicCapture::list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let cfg = TalkConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let capture = MicCapture::start(cfg.audio.buffer_ms).context("failed to open microphone")?;
    let transcriber = create_best_transcriber(&cfg.transcriber)?;
    let speech = SpeechDispatcher::new(&cfg.tts).context("failed to start TTS dispatch")?;

    // No inference engine is linked into the binary; the scripted model keeps
    // the loop usable end to end and hands the turn back after every reply.
    let model = ScriptedModel::new().with_fallback(&format!(
        "I heard you, but no language model is connected.\n{}:",
        cfg.conversation.person
    ));
    warn!("no language model engine configured, using the scripted placeholder");

    let stop = Arc::new(AtomicBool::new(false));
    let mut orchestrator = ConversationOrchestrator::new(
        &cfg,
        Box::new(model),
        transcriber,
        capture.buffer(),
        Box::new(speech),
    )?
    .with_stop_flag(Arc::clone(&stop));
    if let Some(text) = say {
        orchestrator.force_speak(text);
    }

    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = thread::Builder::new()
        .name("conversation".to_string())
        .spawn(move || {
            let result = orchestrator.run();
            let _ = done_tx.send(());
            result
        })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("failed to listen for Ctrl+C: {}", e);
                }
                info!("stopping...");
                stop.store(true, Ordering::Relaxed);
            }
            _ = &mut done_rx => {}
        }
    });

    worker
        .join()
        .map_err(|_| anyhow!("conversation thread panicked"))??;
    drop(capture);
    info!("bye");
    Ok(())
}

fn print_usage() {
    eprintln!("voxloop - spoken conversation with a language model");
    eprintln!("  --config PATH      TOML config (default: $VOXLOOP_CONFIG or ./voxloop.toml)");
    eprintln!("  --say \"TEXT\"       Answer TEXT first, without waiting for speech");
    eprintln!("  --list-devices     List audio input devices and exit");
    eprintln!();
    eprintln!("Every setting can be overridden with VOXLOOP__<SECTION>__<KEY>,");
    eprintln!("e.g. VOXLOOP__CONVERSATION__PERSON=Ada. Logging follows RUST_LOG.");
    eprintln!("Build with --features whisper and set WHISPER_MODEL_PATH for real transcription.");
}
