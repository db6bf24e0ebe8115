//! **ConversationOrchestrator** - the listen / transcribe / generate loop.
//!
//! One thread drives everything on a fixed tick:
//!
//! ```text
//! Listening ──VAD gate or force_speak──▶ Transcribing ──accepted──▶ Generating
//!     ▲                                       │                    │        │
//!     │◀──────────── ignored ─────────────────┘          barge-in│        │anti-prompt / EOS / step cap
//!     │                                                          ▼        ▼
//!     └───────────────────────────────────────────── Interrupted   Completed
//! ```
//!
//! While generating, the microphone is re-checked every two tokens and after
//! every spoken chunk; user speech ends the reply at once and the audio that
//! triggered it is kept for the next turn.

use crate::config::{ConversationConfig, TalkConfig};
use crate::context::{ContextWindow, GenerationState};
use crate::error::{TalkError, TalkResult};
use crate::model::{LanguageModel, Token};
use crate::prompt::{self, PromptTemplate};
use crate::sampling::Sampler;
use crate::segmenter::{SegmenterConfig, SentenceSegmenter};
use crate::session::SessionCache;
use chrono::Local;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use voxloop_voice::text::{contains_stop, has_alpha, normalize_heard};
use voxloop_voice::{transcribe_soft, AudioSource, BargeInMonitor, SpeechSink, Transcriber, WakeGate};

/// Tokens of decoded history checked for the anti-prompt, plus the new token.
const ANTIPROMPT_WINDOW: usize = 16;
/// Barge-in is checked every this many generation steps.
const BARGE_IN_INTERVAL: usize = 2;
/// Step at which stale microphone audio is dropped if nobody interrupted.
const STALE_AUDIO_STEP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Listening,
    Transcribing,
    Generating,
    Interrupted,
    Completed,
}

/// Why a detected utterance did not start a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Empty, or nothing but symbols after cleanup.
    HeardNothing,
    /// The wake phrase was missing or nothing followed it.
    NoWakePhrase,
    StopCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Normalized user text that was answered.
    pub heard: String,
    /// Reply text with the anti-prompt removed.
    pub reply: String,
    /// Tokens sampled for the reply.
    pub tokens: usize,
    /// Chunks handed to the speech sink.
    pub chunks: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No speech yet.
    Idle,
    Ignored(IgnoreReason),
    Turn(TurnReport),
}

pub struct ConversationOrchestrator {
    config: ConversationConfig,
    model: Box<dyn LanguageModel>,
    transcriber: Box<dyn Transcriber>,
    audio: Arc<dyn AudioSource>,
    speech: Box<dyn SpeechSink>,
    monitor: BargeInMonitor,
    sampler: Sampler,
    segmenter: SegmenterConfig,
    session: SessionCache,
    window: ContextWindow,
    state: GenerationState,
    history: Vec<Token>,
    wake: Option<WakeGate>,
    antiprompt: String,
    transcriber_prompt: String,
    forced: Option<String>,
    phase: ConversationState,
    stop: Arc<AtomicBool>,
}

impl ConversationOrchestrator {
    /// Assemble the prompt, restore the session and evaluate the prompt.
    pub fn new(
        config: &TalkConfig,
        mut model: Box<dyn LanguageModel>,
        transcriber: Box<dyn Transcriber>,
        audio: Arc<dyn AudioSource>,
        speech: Box<dyn SpeechSink>,
    ) -> TalkResult<Self> {
        config.validate()?;
        let conv = config.conversation.clone();

        let template = match &conv.prompt_file {
            Some(path) => PromptTemplate::from_file(path).map_err(|source| TalkError::Prompt {
                path: path.clone(),
                source,
            })?,
            None => PromptTemplate::default(),
        };
        let prompt_text = template.render(&conv.person, &conv.bot_name, Local::now());
        let prompt_tokens = model.tokenize(&prompt_text, true);
        if prompt_tokens.len() + conv.n_prev >= conv.n_ctx {
            return Err(TalkError::Invalid(format!(
                "prompt of {} tokens plus n_prev {} does not fit n_ctx {}",
                prompt_tokens.len(),
                conv.n_prev,
                conv.n_ctx
            )));
        }

        let mut session = match &conv.session_path {
            Some(path) => SessionCache::open(path, model.as_mut(), conv.n_ctx)?,
            None => SessionCache::disabled(),
        };
        session.align(&prompt_tokens);

        let window = ContextWindow {
            n_ctx: conv.n_ctx,
            n_keep: prompt_tokens.len(),
            n_prev: conv.n_prev,
        };

        let mut orchestrator = Self {
            wake: WakeGate::new(&conv.wake_command),
            antiprompt: prompt::antiprompt(&conv.person),
            transcriber_prompt: prompt::transcriber_prompt(&conv.bot_name),
            config: conv,
            model,
            transcriber,
            audio,
            speech,
            monitor: BargeInMonitor::new(config.vad.clone()),
            sampler: Sampler::new(config.sampling.clone()),
            segmenter: config.segmenter.clone(),
            session,
            window,
            state: GenerationState::default(),
            history: Vec::with_capacity(config.conversation.n_ctx),
            forced: None,
            phase: ConversationState::Listening,
            stop: Arc::new(AtomicBool::new(false)),
        };

        info!("initializing - please wait ...");
        let mut batch = prompt_tokens;
        orchestrator.evaluate_pending(&mut batch)?;

        if orchestrator.config.verbose_prompt {
            echo(&format!("\n{}", prompt_text));
        }
        if let Some(gate) = &orchestrator.wake {
            info!("the wake-up command is: '\x1b[1m{}\x1b[0m'", gate.phrase());
        }
        info!("done! start speaking in the microphone");
        echo(&format!("\n{}{}", orchestrator.config.person, prompt::CHAT_SYMBOL));

        orchestrator.audio.clear();
        Ok(orchestrator)
    }

    /// Share an external stop flag (e.g. flipped by a Ctrl+C handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Answer `text` on the next tick without waiting for speech or transcribing.
    pub fn force_speak(&mut self, text: impl Into<String>) {
        self.forced = Some(text.into());
    }

    pub fn phase(&self) -> ConversationState {
        self.phase
    }

    pub fn generation_state(&self) -> GenerationState {
        self.state
    }

    /// Evaluated tokens of the active context window.
    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn n_keep(&self) -> usize {
        self.window.n_keep
    }

    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    /// Poll on a fixed tick until the stop flag is raised. Returns early only
    /// on a generation engine failure.
    pub fn run(&mut self) -> TalkResult<()> {
        let tick = Duration::from_millis(self.config.tick_ms);
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(tick);
            match self.tick()? {
                TickOutcome::Idle => {}
                TickOutcome::Ignored(reason) => debug!("utterance ignored: {:?}", reason),
                TickOutcome::Turn(report) => info!(
                    "turn done: {} tokens, {} chunks{}",
                    report.tokens,
                    report.chunks,
                    if report.interrupted { ", interrupted" } else { "" }
                ),
            }
        }
        info!("conversation stopped");
        Ok(())
    }

    /// One pass of the loop: check for a finished utterance and answer it.
    pub fn tick(&mut self) -> TalkResult<TickOutcome> {
        self.phase = ConversationState::Listening;

        let forced = self.forced.take();
        if forced.is_none() && !self.monitor.utterance_ready(self.audio.as_ref()) {
            return Ok(TickOutcome::Idle);
        }

        self.phase = ConversationState::Transcribing;
        let from_user = forced.is_none();
        let raw = match forced {
            Some(text) => text,
            None => {
                let pcm = self.audio.samples(self.config.voice_ms);
                let utterance =
                    transcribe_soft(self.transcriber.as_ref(), &pcm, &self.transcriber_prompt);
                debug!(
                    "transcribed {} samples in {:?} (p={:.2}): {:?}",
                    pcm.len(),
                    utterance.elapsed,
                    utterance.confidence,
                    utterance.text
                );
                utterance.text
            }
        };

        let heard = match self.accept(raw.trim(), from_user) {
            Ok(heard) => heard,
            Err(reason) => {
                self.audio.clear();
                self.phase = ConversationState::Listening;
                return Ok(TickOutcome::Ignored(reason));
            }
        };

        let report = self.respond(&heard)?;
        self.phase = ConversationState::Listening;
        Ok(TickOutcome::Turn(report))
    }

    /// Cleanup, wake phrase and stop checks on a raw transcript. Forced text
    /// skips the wake phrase.
    fn accept(&mut self, raw: &str, from_user: bool) -> Result<String, IgnoreReason> {
        let mut heard = normalize_heard(raw);
        if let Some(gate) = self.wake.as_ref().filter(|_| from_user) {
            heard = gate.accept(&heard).ok_or(IgnoreReason::NoWakePhrase)?;
        }

        if contains_stop(&heard) {
            echo(" [Stopped!]\n");
            return Err(IgnoreReason::StopCommand);
        }
        if heard.is_empty() || !has_alpha(&heard) || self.model.tokenize(&heard, false).is_empty() {
            return Err(IgnoreReason::HeardNothing);
        }

        if !self.config.heard_ok.is_empty() {
            self.speech.speak(&self.config.heard_ok);
        }
        Ok(heard)
    }

    /// Generate and speak the reply to one accepted utterance.
    fn respond(&mut self, heard: &str) -> TalkResult<TurnReport> {
        let turn_text = prompt::user_turn(heard, &self.config.bot_name);
        echo(&format!("\x1b[1m{}\x1b[0m", turn_text));

        self.phase = ConversationState::Generating;
        let mut batch = self.model.tokenize(&turn_text, false);
        let mut segmenter = SentenceSegmenter::new(self.segmenter.clone(), self.antiprompt.clone());
        let eos = self.model.token_eos();
        let nl = self.model.token_nl();

        let mut reply = String::new();
        let mut tokens = 0;
        let mut chunks = 0;
        let mut done = false;
        let mut interrupted = false;
        let mut step = 0;

        loop {
            if step > self.config.n_predict {
                break;
            }
            step += 1;

            if !batch.is_empty() {
                self.evaluate_pending(&mut batch)?;
            }
            if done {
                break;
            }

            if let Err(e) = self.session.save_if_needed(self.model.as_mut()) {
                warn!("failed to save session: {}", e);
            }

            let logits = self.model.logits();
            let Some(id) = self.sampler.sample(logits, &self.history, eos, nl) else {
                warn!("sampler produced no candidate");
                break;
            };
            if id == eos {
                debug!("end of sequence after {} tokens", tokens);
                break;
            }

            batch.push(id);
            let piece = self.model.token_to_piece(id);
            reply.push_str(&piece);
            tokens += 1;
            echo(&piece);

            if step % BARGE_IN_INTERVAL == 0 && self.user_is_speaking() {
                interrupted = true;
                echo(" [Speech/Stop!]\n");
                break;
            }
            if step == STALE_AUDIO_STEP {
                self.audio.clear();
            }

            if let Some(chunk) = segmenter.push(&piece) {
                self.speech.speak(&chunk);
                chunks += 1;
                if self.user_is_speaking() {
                    interrupted = true;
                    echo(" [Speech!]\n");
                    break;
                }
            }

            if self.ends_with_antiprompt(&piece) {
                done = true;
                segmenter.strip_antiprompt();
                self.session.mark_dirty();
            }

            if self.stop.load(Ordering::Relaxed) {
                break;
            }
        }

        if let Some(chunk) = segmenter.finish() {
            self.speech.speak(&chunk);
            chunks += 1;
        }

        if interrupted {
            self.phase = ConversationState::Interrupted;
        } else {
            self.audio.clear();
            self.phase = ConversationState::Completed;
        }

        Ok(TurnReport {
            heard: heard.to_string(),
            reply: reply.replace(&self.antiprompt, "").trim().to_string(),
            tokens,
            chunks,
            interrupted,
        })
    }

    /// Make room in the window, reuse what the session already holds, then
    /// evaluate the rest. A failed evaluation is fatal.
    fn evaluate_pending(&mut self, batch: &mut Vec<Token>) -> TalkResult<()> {
        if self.window.needs_rollover(&self.state, batch.len()) {
            self.window
                .roll_over(&mut self.state, &mut self.history, batch);
            self.session.invalidate();
        }

        let reused = self.session.reconcile(batch, &mut self.state);
        self.history.extend_from_slice(&reused);

        self.session.record(batch, &mut self.state);
        if !batch.is_empty() {
            self.model.evaluate(batch, self.state.n_past)?;
            self.history.extend_from_slice(batch);
            self.state.n_past += batch.len();
        }
        batch.clear();
        Ok(())
    }

    fn user_is_speaking(&self) -> bool {
        self.monitor.speech_started(self.audio.as_ref())
    }

    /// Decode the tail of the history plus the newest piece and look for the anti-prompt.
    fn ends_with_antiprompt(&self, newest: &str) -> bool {
        let tail = &self.history[self.history.len().saturating_sub(ANTIPROMPT_WINDOW)..];
        let mut last_output = self.model.detokenize(tail);
        last_output.push_str(newest);
        last_output.ends_with(&self.antiprompt)
    }
}

/// Transcript output, kept apart from the logs.
fn echo(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedModel;
    use std::sync::Mutex;
    use voxloop_voice::{sanitize_speech, PlaceholderTranscriber, RingBuffer, SAMPLE_RATE};

    /// Collects what would have been spoken, after the dispatcher's cleanup.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl RecordingSink {
        fn spoken(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl SpeechSink for RecordingSink {
        fn speak(&self, text: &str) {
            if let Some(text) = sanitize_speech(text) {
                self.0.lock().unwrap().push(text);
            }
        }
    }

    fn tone(ms: u32) -> Vec<f32> {
        let n = (SAMPLE_RATE * ms / 1000) as usize;
        (0..n)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    fn silence(ms: u32) -> Vec<f32> {
        vec![0.0; (SAMPLE_RATE * ms / 1000) as usize]
    }

    fn short_prompt_config(dir: &std::path::Path) -> TalkConfig {
        let path = dir.join("prompt.txt");
        std::fs::write(&path, "{1} answers {0}.\n{0}{4}").unwrap();
        let mut cfg = TalkConfig::default();
        cfg.conversation.prompt_file = Some(path);
        cfg.sampling.seed = Some(7);
        cfg
    }

    struct Harness {
        orchestrator: ConversationOrchestrator,
        audio: Arc<RingBuffer>,
        sink: RecordingSink,
    }

    fn harness(cfg: &TalkConfig, model: ScriptedModel, heard: &str) -> Harness {
        let audio = Arc::new(RingBuffer::new(cfg.audio.buffer_ms, SAMPLE_RATE));
        let sink = RecordingSink::default();
        let transcriber = if heard.is_empty() {
            PlaceholderTranscriber::new()
        } else {
            PlaceholderTranscriber::with_response(heard)
        };
        let orchestrator = ConversationOrchestrator::new(
            cfg,
            Box::new(model),
            Box::new(transcriber),
            audio.clone(),
            Box::new(sink.clone()),
        )
        .unwrap();
        Harness {
            orchestrator,
            audio,
            sink,
        }
    }

    /// A finished burst of speech: voice, then a trailing pause.
    fn finished_utterance(audio: &RingBuffer) {
        audio.push(&tone(750));
        audio.push(&silence(1250));
    }

    #[test]
    fn quiet_room_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let mut h = harness(&cfg, ScriptedModel::new(), "hello");
        h.audio.push(&silence(2000));
        assert_eq!(h.orchestrator.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(h.orchestrator.phase(), ConversationState::Listening);
    }

    #[test]
    fn answers_and_speaks_one_sentence() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let model = ScriptedModel::with_replies(["It is 3 PM.\nGeorgi:"]);
        let log = model.eval_log();
        let mut h = harness(&cfg, model, "[BLANK_AUDIO] What time is it?");

        finished_utterance(&h.audio);
        let TickOutcome::Turn(report) = h.orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };

        assert_eq!(report.heard, "What time is it?");
        assert_eq!(report.reply, "It is 3 PM.");
        assert!(!report.interrupted);
        assert_eq!(h.sink.spoken(), vec!["It is 3 PM."]);
        assert!(h.audio.is_empty());
        assert_eq!(h.orchestrator.phase(), ConversationState::Listening);

        // Every sampled token was evaluated, including the anti-prompt
        let state = h.orchestrator.generation_state();
        assert_eq!(state.n_past, h.orchestrator.history().len());
        let text: String = h
            .orchestrator
            .history()
            .iter()
            .filter_map(|&t| u8::try_from(t).ok().map(char::from))
            .collect();
        assert!(text.ends_with(" What time is it?\nLLaMA:It is 3 PM.\nGeorgi:"));
        assert_eq!(log.records()[1].n_past, h.orchestrator.n_keep());
    }

    #[test]
    fn barge_in_stops_generation_and_keeps_audio() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let model = ScriptedModel::with_replies(["It is a long story about many things.\nGeorgi:"]);
        let mut h = harness(&cfg, model, "");

        // The user starts talking as the reply begins
        h.audio.push(&silence(750));
        h.audio.push(&tone(1250));
        h.orchestrator.force_speak("Tell me a story");

        let TickOutcome::Turn(report) = h.orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert!(report.interrupted);
        assert_eq!(report.tokens, 2);
        assert_eq!(report.reply, "It");
        // The unfinished chunk is still spoken
        assert_eq!(h.sink.spoken(), vec!["It"]);
        assert!(!h.audio.is_empty());
    }

    /// Speech sink and microphone sharing one event log, so a clear can be
    /// placed relative to the chunks spoken around it.
    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn push(&self, event: String) {
            self.0.lock().unwrap().push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        fn has_spoken(&self) -> bool {
            self.0.lock().unwrap().iter().any(|e| e.starts_with("say:"))
        }
    }

    impl SpeechSink for EventLog {
        fn speak(&self, text: &str) {
            self.push(format!("say:{}", text));
        }
    }

    /// Background noise that never reads as speech, or, with `talks_back`,
    /// a speech onset as soon as anything has been spoken.
    struct LoggedMic {
        log: EventLog,
        talks_back: bool,
    }

    impl AudioSource for LoggedMic {
        fn samples(&self, duration_ms: u32) -> Vec<f32> {
            let mut pcm = if self.talks_back && self.log.has_spoken() {
                let mut onset = silence(750);
                onset.extend(tone(1250));
                onset
            } else {
                silence(2000)
            };
            let n = (SAMPLE_RATE * duration_ms / 1000) as usize;
            pcm.split_off(pcm.len().saturating_sub(n))
        }

        fn clear(&self) {
            self.log.push("clear".to_string());
        }

        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
        }
    }

    fn logged_orchestrator(
        cfg: &TalkConfig,
        reply: &str,
        talks_back: bool,
    ) -> (ConversationOrchestrator, EventLog) {
        let log = EventLog::default();
        let mic = LoggedMic {
            log: log.clone(),
            talks_back,
        };
        let orchestrator = ConversationOrchestrator::new(
            cfg,
            Box::new(ScriptedModel::with_replies([reply])),
            Box::new(PlaceholderTranscriber::new()),
            Arc::new(mic),
            Box::new(log.clone()),
        )
        .unwrap();
        // Startup clears the microphone once
        assert_eq!(log.take(), vec!["clear"]);
        (orchestrator, log)
    }

    #[test]
    fn stale_audio_is_dropped_at_step_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        // Chunks end at tokens 11 and 23, either side of the stale-audio step
        let (mut orchestrator, log) =
            logged_orchestrator(&cfg, "Sure thing, let me see. Yes, that is right.\nGeorgi:", false);

        orchestrator.force_speak("Check it");
        let TickOutcome::Turn(report) = orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert!(!report.interrupted);
        assert!(report.tokens > STALE_AUDIO_STEP);

        let events = log.take();
        assert_eq!(events[..3], ["say:Sure thing,", "clear", "say: let me see."]);
        // A completed turn clears once more at the end
        assert_eq!(events.last().map(String::as_str), Some("clear"));
        assert_eq!(events.iter().filter(|e| *e == "clear").count(), 2);
    }

    #[test]
    fn speech_after_a_spoken_chunk_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        // "Okay." flushes on step 5, between the every-other-step checks
        let (mut orchestrator, log) =
            logged_orchestrator(&cfg, "Okay. Let me think about it.\nGeorgi:", true);

        orchestrator.force_speak("Think");
        let TickOutcome::Turn(report) = orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert!(report.interrupted);
        assert_eq!(report.tokens, 5);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.reply, "Okay.");
        // Interrupted turns keep the audio that caused them
        assert_eq!(log.take(), vec!["say:Okay."]);
        assert_eq!(orchestrator.phase(), ConversationState::Listening);
    }

    #[test]
    fn end_of_sequence_ends_the_turn() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let mut h = harness(&cfg, ScriptedModel::with_replies(["Okay."]), "");
        h.orchestrator.force_speak("Say okay");
        let TickOutcome::Turn(report) = h.orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert_eq!(report.tokens, 5);
        assert_eq!(h.sink.spoken(), vec!["Okay."]);
    }

    fn wake_config(dir: &std::path::Path) -> TalkConfig {
        let mut cfg = short_prompt_config(dir);
        cfg.conversation.wake_command = "computer".to_string();
        cfg.conversation.heard_ok = "Yes?".to_string();
        cfg
    }

    #[test]
    fn wake_phrase_gates_commands() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = wake_config(dir.path());
        let model = ScriptedModel::with_replies(["Done.\nGeorgi:"]);
        let log = model.eval_log();
        let mut h = harness(&cfg, model, "coffee turn on the lights");

        finished_utterance(&h.audio);
        assert_eq!(
            h.orchestrator.tick().unwrap(),
            TickOutcome::Ignored(IgnoreReason::NoWakePhrase)
        );
        assert!(h.audio.is_empty());
        assert_eq!(log.records().len(), 1);
        assert!(h.sink.spoken().is_empty());
    }

    #[test]
    fn wake_phrase_is_matched_after_annotations_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = wake_config(dir.path());
        let model = ScriptedModel::with_replies(["Done.\nGeorgi:"]);
        let mut h = harness(&cfg, model, "[BLANK_AUDIO] computer turn on the lights");

        finished_utterance(&h.audio);
        let TickOutcome::Turn(report) = h.orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert_eq!(report.heard, "turn on the lights");
        assert_eq!(h.sink.spoken(), vec!["Yes?", "Done."]);
    }

    #[test]
    fn forced_text_skips_the_wake_phrase() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = wake_config(dir.path());
        let model = ScriptedModel::with_replies(["Hi.\nGeorgi:"]);
        let mut h = harness(&cfg, model, "");

        h.orchestrator.force_speak("Hello");
        let TickOutcome::Turn(report) = h.orchestrator.tick().unwrap() else {
            panic!("greeting was gated");
        };
        assert_eq!(report.heard, "Hello");
        assert_eq!(report.reply, "Hi.");

        // Cleanup and the stop command still apply
        h.orchestrator.force_speak("[Music] stop");
        assert_eq!(
            h.orchestrator.tick().unwrap(),
            TickOutcome::Ignored(IgnoreReason::StopCommand)
        );
    }

    #[test]
    fn stop_command_discards_audio() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let mut h = harness(&cfg, ScriptedModel::with_replies(["Never said."]), "Please stop.");
        finished_utterance(&h.audio);
        assert_eq!(
            h.orchestrator.tick().unwrap(),
            TickOutcome::Ignored(IgnoreReason::StopCommand)
        );
        assert!(h.audio.is_empty());

        h.orchestrator.force_speak("(coughs) ...");
        assert_eq!(
            h.orchestrator.tick().unwrap(),
            TickOutcome::Ignored(IgnoreReason::HeardNothing)
        );
    }

    #[test]
    fn rollover_resets_window_and_drops_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = short_prompt_config(dir.path());
        cfg.conversation.n_ctx = 64;
        cfg.conversation.n_prev = 8;
        cfg.conversation.n_predict = 128;
        cfg.conversation.session_path = Some(dir.path().join("session.bin"));

        let reply = "Sure, this reply runs long enough to overflow the window.\nGeorgi:";
        let model = ScriptedModel::with_replies([reply]).with_context_size(64);
        let log = model.eval_log();
        let mut h = harness(&cfg, model, "");
        let n_keep = h.orchestrator.n_keep();
        assert!(h.orchestrator.session().is_active());

        h.orchestrator.force_speak("Talk");
        let TickOutcome::Turn(report) = h.orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert_eq!(report.reply, reply.trim_end_matches("\nGeorgi:"));

        let rolled = log
            .records()
            .into_iter()
            .find(|r| r.n_past == n_keep && r.tokens.len() == 9)
            .expect("no rollover evaluation");
        assert_eq!(rolled.tokens.len(), cfg.conversation.n_prev + 1);

        assert!(!h.orchestrator.session().is_active());
        let state = h.orchestrator.generation_state();
        assert!(state.n_past <= 64);
        assert_eq!(state.n_past, h.orchestrator.history().len());
    }

    #[test]
    fn session_is_reused_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = short_prompt_config(dir.path());
        let session_path = dir.path().join("talk.session");
        cfg.conversation.session_path = Some(session_path.clone());

        // First run: nothing stored, the prompt and the first turn get saved
        let mut first = harness(&cfg, ScriptedModel::with_replies(["Hi.\nGeorgi:"]), "");
        let n_keep = first.orchestrator.n_keep();
        first.orchestrator.force_speak("Hello");
        first.orchestrator.tick().unwrap();
        let stored = crate::session::read_token_file(&session_path, 2048).unwrap();
        let turn_len = " Hello\nLLaMA:".len();
        assert_eq!(stored.len(), n_keep + turn_len);

        // Second run: prompt and the repeated turn come from the session
        let model = ScriptedModel::with_replies(["Hi again.\nGeorgi:"]);
        let log = model.eval_log();
        let mut second = harness(&cfg, model, "");
        assert!(log.records().is_empty());
        assert_eq!(second.orchestrator.generation_state().n_past, n_keep);

        second.orchestrator.force_speak("Hello");
        let TickOutcome::Turn(report) = second.orchestrator.tick().unwrap() else {
            panic!("expected a turn");
        };
        assert_eq!(report.reply, "Hi again.");
        let records = log.records();
        assert_eq!(records[0].n_past, n_keep + turn_len);
        assert_eq!(records[0].tokens.len(), 1);
    }

    #[test]
    fn evaluation_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let mut h = harness(&cfg, ScriptedModel::with_replies(["x"]).fail_after(1), "");
        h.orchestrator.force_speak("Hello");
        assert!(matches!(h.orchestrator.tick(), Err(TalkError::Model(_))));
    }

    #[test]
    fn run_returns_once_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = short_prompt_config(dir.path());
        let h = harness(&cfg, ScriptedModel::new(), "");
        let stop = Arc::new(AtomicBool::new(true));
        let mut orchestrator = h.orchestrator.with_stop_flag(stop);
        assert!(orchestrator.run().is_ok());
    }

    #[test]
    fn prompt_too_large_for_context_is_rejected() {
        let mut cfg = TalkConfig::default();
        cfg.conversation.n_ctx = 128;
        let audio = Arc::new(RingBuffer::new(30_000, SAMPLE_RATE));
        let result = ConversationOrchestrator::new(
            &cfg,
            Box::new(ScriptedModel::new()),
            Box::new(PlaceholderTranscriber::new()),
            audio,
            Box::new(RecordingSink::default()),
        );
        assert!(matches!(result, Err(TalkError::Invalid(_))));
    }
}
