//! Integration tests for the voice side of the loop
//!
//! The TTS server is a loopback listener; the microphone test needs real
//! hardware and is ignored by default.

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;
use voxloop_voice::{
    decode, AudioSource, BargeInMonitor, MicCapture, RingBuffer, SpeechDispatcher, TtsClient,
    VadConfig, VoiceActivity, PROTOCOL_VERSION, SAMPLE_RATE,
};

async fn accept_frame(listener: &TcpListener) -> Vec<u8> {
    let (mut sock, _) = listener.accept().await.expect("accept");
    let mut buf = Vec::new();
    sock.read_to_end(&mut buf).await.expect("read frame");
    buf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_reaches_tts_server() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let dispatcher = SpeechDispatcher::with_client(
        TtsClient::new(addr, Duration::from_secs(5)),
        Some("en_US-lessac-medium".to_string()),
    )
    .unwrap();

    assert!(dispatcher.dispatch("It is 3 PM."));
    assert!(dispatcher.dispatch("Anything \"else\"?"));

    let frames = timeout(Duration::from_secs(5), async {
        vec![accept_frame(&listener).await, accept_frame(&listener).await]
    })
    .await
    .expect("TTS frames not received in time");

    let (header, payload) = decode(&frames[0]).unwrap();
    assert_eq!(header.message_type, "synthesize");
    assert_eq!(header.version, PROTOCOL_VERSION);
    assert_eq!(payload.text, "It is 3 PM.");
    assert_eq!(payload.voice.unwrap().name, "en_US-lessac-medium");

    let newline = frames[0].iter().position(|&b| b == b'\n').unwrap();
    assert_eq!(header.data_length, frames[0].len() - newline - 1);

    // Quotes are stripped before encoding
    assert_eq!(decode(&frames[1]).unwrap().1.text, "Anything else?");

    tokio::task::spawn_blocking(move || dispatcher.shutdown())
        .await
        .unwrap();
}

#[test]
fn test_barge_in_on_shared_buffer() {
    let buffer = std::sync::Arc::new(RingBuffer::new(10_000, SAMPLE_RATE));
    let monitor = BargeInMonitor::new(VadConfig::default());

    // Quiet room, then the user starts talking over the reply
    buffer.push(&vec![0.0; SAMPLE_RATE as usize]);
    assert_eq!(monitor.poll(&buffer), VoiceActivity::Quiet);

    let voice: Vec<f32> = (0..SAMPLE_RATE as usize * 3 / 2)
        .map(|i| 0.4 * (i as f32 * 2.0 * std::f32::consts::PI * 300.0 / SAMPLE_RATE as f32).sin())
        .collect();
    buffer.push(&voice);
    assert_eq!(monitor.poll(&buffer), VoiceActivity::SpeechStart);

    buffer.clear();
    assert!(buffer.samples(2000).is_empty());
}

#[test]
#[ignore] // Requires audio hardware
fn test_mic_capture_fills_buffer() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let capture = MicCapture::start(5_000).expect("Failed to start capture");
    std::thread::sleep(Duration::from_millis(500));
    let buffer = capture.buffer();
    assert!(!buffer.is_empty());
    assert_eq!(buffer.sample_rate(), SAMPLE_RATE);
}
