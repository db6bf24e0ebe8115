//! Energy-based voice activity detection.
//!
//! One measurement drives both turn-taking decisions: the coarse gate that
//! decides a user utterance is ready to transcribe, and the barge-in monitor
//! that watches the microphone while a reply is being generated. Both compare
//! the mean absolute amplitude of a trailing span against the whole window,
//! after a first-order high-pass filter removes hum and DC offset.
//!
//! Every check works on a snapshot that is already buffered and runs in time
//! proportional to the window length. Nothing here waits for audio.

use crate::audio::{ms_to_samples, AudioSource};
use serde::Deserialize;
use tracing::{debug, info};

/// Outcome of classifying one audio window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    /// Nothing worth reacting to.
    Quiet,
    /// The trailing span is loud relative to the window and above the absolute floor.
    SpeechStart,
    /// Activity earlier in the window has been followed by a quieter trailing span.
    SpeechEnd,
}

/// Thresholds for one call site of the energy VAD.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadParams {
    /// Trailing span compared against the whole window, in milliseconds.
    pub last_ms: u32,
    /// Ratio of trailing energy to window energy separating "still loud" from "went quiet".
    pub vad_thold: f32,
    /// High-pass cutoff in Hz (0 disables the filter).
    pub freq_thold: f32,
    /// Absolute trailing energy needed to call speech start (0 disables the floor).
    /// Only the barge-in check looks at speech start.
    pub start_thold: f32,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            last_ms: 1250,
            vad_thold: 0.6,
            freq_thold: 100.0,
            start_thold: 0.000270,
        }
    }
}

/// Energies measured over a window, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Energy {
    pub all: f32,
    pub last: f32,
}

/// In-place first-order high-pass filter.
pub fn high_pass_filter(data: &mut [f32], cutoff: f32, sample_rate: f32) {
    if data.is_empty() {
        return;
    }
    let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff);
    let dt = 1.0 / sample_rate;
    let alpha = dt / (rc + dt);

    let mut y = data[0];
    for i in 1..data.len() {
        y = alpha * (y + data[i] - data[i - 1]);
        data[i] = y;
    }
}

/// Measure window and trailing energy. `None` when the window is not longer than the trailing span.
pub fn measure(samples: &[f32], sample_rate: u32, params: &VadParams) -> Option<Energy> {
    let n_samples = samples.len();
    let n_last = ms_to_samples(params.last_ms, sample_rate);
    if n_last == 0 || n_last >= n_samples {
        return None;
    }

    let mut filtered = samples.to_vec();
    if params.freq_thold > 0.0 {
        high_pass_filter(&mut filtered, params.freq_thold, sample_rate as f32);
    }

    let all: f32 = filtered.iter().map(|s| s.abs()).sum();
    let last: f32 = filtered[n_samples - n_last..].iter().map(|s| s.abs()).sum();

    Some(Energy {
        all: all / n_samples as f32,
        last: last / n_last as f32,
    })
}

/// Classify a window into the tri-state result shared by both call sites.
pub fn classify(samples: &[f32], sample_rate: u32, params: &VadParams) -> VoiceActivity {
    let Some(energy) = measure(samples, sample_rate, params) else {
        return VoiceActivity::Quiet;
    };
    classify_energy(energy, params)
}

fn classify_energy(energy: Energy, params: &VadParams) -> VoiceActivity {
    // Digital silence carries no decision
    if energy.all <= f32::EPSILON {
        return VoiceActivity::Quiet;
    }
    let relative = params.vad_thold * energy.all;
    if energy.last > relative {
        if params.start_thold <= 0.0 || energy.last > params.start_thold {
            VoiceActivity::SpeechStart
        } else {
            VoiceActivity::Quiet
        }
    } else {
        VoiceActivity::SpeechEnd
    }
}

/// Boolean view of the same computation: did a burst of speech just finish?
pub fn contains_speech(samples: &[f32], sample_rate: u32, params: &VadParams) -> bool {
    classify(samples, sample_rate, params) == VoiceActivity::SpeechEnd
}

/// Configuration for both VAD call sites.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Length of the window sampled on every check, in milliseconds.
    pub window_ms: u32,
    /// Coarse turn-taking gate.
    pub gate: VadParams,
    /// Fine-grained barge-in detection during generation.
    pub barge_in: VadParams,
    /// Log energies at info level on every check.
    pub print_energy: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            window_ms: 2000,
            gate: VadParams::default(),
            barge_in: VadParams::default(),
            print_energy: false,
        }
    }
}

/// Samples the microphone and applies the two VAD policies.
#[derive(Debug, Clone)]
pub struct BargeInMonitor {
    config: VadConfig,
}

impl BargeInMonitor {
    pub fn new(config: VadConfig) -> Self {
        info!(
            "🎙️ VAD: window={}ms gate(last={}ms thold={}) barge-in(last={}ms thold={} start={})",
            config.window_ms,
            config.gate.last_ms,
            config.gate.vad_thold,
            config.barge_in.last_ms,
            config.barge_in.vad_thold,
            config.barge_in.start_thold
        );
        Self { config }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Coarse gate: true when the latest window holds a finished utterance.
    pub fn utterance_ready(&self, audio: &dyn AudioSource) -> bool {
        self.check(audio, &self.config.gate, "gate") == VoiceActivity::SpeechEnd
    }

    /// Barge-in check: classify the latest window with the fine-grained thresholds.
    pub fn poll(&self, audio: &dyn AudioSource) -> VoiceActivity {
        self.check(audio, &self.config.barge_in, "barge-in")
    }

    /// True when the user started talking over the reply.
    pub fn speech_started(&self, audio: &dyn AudioSource) -> bool {
        self.poll(audio) == VoiceActivity::SpeechStart
    }

    /// Measure at the buffer's own rate so `last_ms` spans the right number of samples.
    fn check(&self, audio: &dyn AudioSource, params: &VadParams, site: &str) -> VoiceActivity {
        let window = audio.samples(self.config.window_ms);
        let Some(energy) = measure(&window, audio.sample_rate(), params) else {
            return VoiceActivity::Quiet;
        };
        let activity = classify_energy(energy, params);
        if self.config.print_energy {
            info!(
                "{}: energy_all={:.6} energy_last={:.6} thold={} -> {:?}",
                site, energy.all, energy.last, params.vad_thold, activity
            );
        } else {
            debug!(
                "{}: energy_all={:.6} energy_last={:.6} -> {:?}",
                site, energy.all, energy.last, activity
            );
        }
        activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{RingBuffer, SAMPLE_RATE};

    /// 440 Hz tone, clear of the 100 Hz high-pass cutoff.
    fn tone(ms: u32, amplitude: f32) -> Vec<f32> {
        let n = ms_to_samples(ms, SAMPLE_RATE);
        (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            })
            .collect()
    }

    fn silence(ms: u32) -> Vec<f32> {
        vec![0.0; ms_to_samples(ms, SAMPLE_RATE)]
    }

    #[test]
    fn short_window_is_quiet() {
        let params = VadParams::default();
        let window = tone(1000, 0.5);
        assert_eq!(classify(&window, SAMPLE_RATE, &params), VoiceActivity::Quiet);
        assert!(!contains_speech(&window, SAMPLE_RATE, &params));
    }

    #[test]
    fn speech_followed_by_silence_ends_utterance() {
        let params = VadParams::default();
        let mut window = tone(750, 0.5);
        window.extend(silence(1250));
        assert_eq!(classify(&window, SAMPLE_RATE, &params), VoiceActivity::SpeechEnd);
        assert!(contains_speech(&window, SAMPLE_RATE, &params));
    }

    #[test]
    fn digital_silence_is_quiet() {
        let params = VadParams::default();
        assert_eq!(classify(&silence(2000), SAMPLE_RATE, &params), VoiceActivity::Quiet);
    }

    #[test]
    fn onset_at_end_of_window_starts_speech() {
        let params = VadParams {
            start_thold: 0.000270,
            ..VadParams::default()
        };
        let mut window = silence(750);
        window.extend(tone(1250, 0.3));
        assert_eq!(classify(&window, SAMPLE_RATE, &params), VoiceActivity::SpeechStart);
    }

    #[test]
    fn steady_hiss_below_floor_is_quiet() {
        let params = VadParams {
            start_thold: 0.01,
            ..VadParams::default()
        };
        let window = tone(2000, 0.001);
        assert_eq!(classify(&window, SAMPLE_RATE, &params), VoiceActivity::Quiet);
    }

    #[test]
    fn high_pass_removes_dc_offset() {
        let mut dc = vec![0.5f32; 16000];
        high_pass_filter(&mut dc, 100.0, SAMPLE_RATE as f32);
        let tail: f32 = dc[8000..].iter().map(|s| s.abs()).sum::<f32>() / 8000.0;
        assert!(tail < 1e-3, "tail energy {}", tail);
    }

    #[test]
    fn monitor_gate_and_barge_in_views() {
        let buf = RingBuffer::new(30_000, SAMPLE_RATE);
        let monitor = BargeInMonitor::new(VadConfig::default());

        buf.push(&silence(750));
        buf.push(&tone(1250, 0.3));
        assert!(monitor.speech_started(&buf));
        assert!(!monitor.utterance_ready(&buf));

        buf.push(&silence(1250));
        assert!(monitor.utterance_ready(&buf));
        assert_eq!(monitor.poll(&buf), VoiceActivity::SpeechEnd);
    }

    #[test]
    fn monitor_follows_buffer_sample_rate() {
        // 8 kHz capture: 750 ms of tone then 1250 ms of silence is still a finished utterance
        let rate = 8000;
        let buf = RingBuffer::new(30_000, rate);
        let samples = |ms: u32| ms_to_samples(ms, rate);
        let tone_8k: Vec<f32> = (0..samples(750))
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
            .collect();
        buf.push(&tone_8k);
        buf.push(&vec![0.0; samples(1250)]);

        let monitor = BargeInMonitor::new(VadConfig::default());
        assert!(monitor.utterance_ready(&buf));
    }
}
