//! Audio capture: cpal microphone → bounded mono 16 kHz ring buffer.
//!
//! The conversation loop never blocks on audio. It takes snapshot reads of the
//! most recent samples and occasionally clears the buffer; the capture callback
//! is the only writer.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Sample rate expected by the transcriber and the VAD.
pub const SAMPLE_RATE: u32 = 16000;

/// Source of recent microphone audio for the orchestrator.
pub trait AudioSource: Send + Sync {
    /// The most recent `duration_ms` of audio, or fewer samples if less is buffered.
    fn samples(&self, duration_ms: u32) -> Vec<f32>;

    /// Drop everything buffered so far.
    fn clear(&self);

    fn sample_rate(&self) -> u32;
}

/// Bounded PCM buffer. Capture threads append; the oldest samples fall off the front.
pub struct RingBuffer {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
    sample_rate: u32,
}

impl RingBuffer {
    /// Buffer holding at most `capacity_ms` of mono audio at `sample_rate`.
    pub fn new(capacity_ms: u32, sample_rate: u32) -> Self {
        let capacity = ms_to_samples(capacity_ms, sample_rate).max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sample_rate,
        }
    }

    /// Append mono f32 samples (already at `sample_rate`).
    pub fn push(&self, samples: &[f32]) {
        let mut g = self.lock();
        g.extend(samples.iter().copied());
        let len = g.len();
        if len > self.capacity {
            g.drain(..len - self.capacity);
        }
    }

    /// Total samples currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        // A panicking writer leaves plain samples behind; keep reading them.
        self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AudioSource for RingBuffer {
    fn samples(&self, duration_ms: u32) -> Vec<f32> {
        let g = self.lock();
        let n = ms_to_samples(duration_ms, self.sample_rate).min(g.len());
        g.iter().skip(g.len() - n).copied().collect()
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl<T: AudioSource + ?Sized> AudioSource for Arc<T> {
    fn samples(&self, duration_ms: u32) -> Vec<f32> {
        (**self).samples(duration_ms)
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }
}

/// Number of samples covering `ms` milliseconds at `sample_rate`.
pub fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}

/// Microphone capture feeding a shared [`RingBuffer`]. Drop to stop capturing.
pub struct MicCapture {
    buffer: Arc<RingBuffer>,
    _stream: Stream,
}

impl MicCapture {
    /// Start capturing from the default input device into a ring buffer of `buffer_ms`.
    pub fn start(buffer_ms: u32) -> VoiceResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "🎤 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let buffer = Arc::new(RingBuffer::new(buffer_ms, SAMPLE_RATE));
        let stream = Self::build_input_stream(Arc::clone(&buffer), &device)?;
        stream.play()?;

        info!("✅ Audio capture started ({}ms ring, mono {} Hz)", buffer_ms, SAMPLE_RATE);

        Ok(Self {
            buffer,
            _stream: stream,
        })
    }

    /// Shared handle to the capture buffer (the orchestrator's [`AudioSource`]).
    pub fn buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.buffer)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn build_input_stream(buffer: Arc<RingBuffer>, device: &cpal::Device) -> VoiceResult<Stream> {
        let config = device.default_input_config()?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let stream_config: StreamConfig = config.clone().into();

        let stream = match config.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    buffer.push(&to_mono_16k(data, channels, sample_rate));
                },
                move |err| warn!("Audio stream error: {}", err),
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    buffer.push(&to_mono_16k(&samples, channels, sample_rate));
                },
                move |err| warn!("Audio stream error: {}", err),
                None,
            )?,
            other => {
                return Err(VoiceError::AudioDevice(format!(
                    "Unsupported sample format {:?} (need F32 or I16)",
                    other
                )))
            }
        };

        Ok(stream)
    }
}

/// Down-mix interleaved audio to mono and resample to 16 kHz (nearest sample).
pub fn to_mono_16k(samples: &[f32], channels: usize, from_rate: u32) -> Vec<f32> {
    if channels == 0 || samples.is_empty() || from_rate == 0 {
        return Vec::new();
    }
    let mono: Vec<f32> = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    if from_rate == SAMPLE_RATE {
        return mono;
    }
    let out_len = (mono.len() as u64 * SAMPLE_RATE as u64 / from_rate as u64) as usize;
    (0..out_len)
        .map(|i| (i as f64 * from_rate as f64 / SAMPLE_RATE as f64) as usize)
        .take_while(|&src| src < mono.len())
        .map(|src| mono[src])
        .collect()
}
