//! Fire-and-forget TCP client for the TTS server.
//!
//! One connection per request: open, write the encoded frame, shut the socket
//! down in both directions. Nothing is read back.

use crate::error::TtsError;
use serde::Deserialize;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:10200";
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub address: String,
    pub send_timeout_ms: u64,
    /// Voice name forwarded in every request.
    pub voice: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            send_timeout_ms: DEFAULT_SEND_TIMEOUT.as_millis() as u64,
            voice: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtsClient {
    address: String,
    send_timeout: Duration,
}

impl Default for TtsClient {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_SEND_TIMEOUT)
    }
}

impl TtsClient {
    pub fn new(address: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            send_timeout,
        }
    }

    pub fn from_config(config: &TtsConfig) -> Self {
        Self::new(
            config.address.clone(),
            Duration::from_millis(config.send_timeout_ms),
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the server.
    pub fn open(&self) -> Result<TtsConnection, TtsError> {
        let stream = TcpStream::connect(&self.address).map_err(|source| TtsError::Connect {
            addr: self.address.clone(),
            source,
        })?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(TtsError::Send)?;
        debug!("TTS connection open to {}", self.address);
        Ok(TtsConnection { stream })
    }

    /// Open, send and close. The socket is torn down even when the write fails.
    pub fn speak(&self, frame: &[u8]) -> Result<usize, TtsError> {
        let mut conn = self.open()?;
        let sent = conn.send(frame);
        conn.close();
        sent
    }
}

/// An open request socket. Dropping it shuts the socket down.
#[derive(Debug)]
pub struct TtsConnection {
    stream: TcpStream,
}

impl TtsConnection {
    /// Write the whole frame, returning the number of bytes sent.
    pub fn send(&mut self, frame: &[u8]) -> Result<usize, TtsError> {
        self.stream.write_all(frame).map_err(TtsError::Send)?;
        self.stream.flush().map_err(TtsError::Send)?;
        Ok(frame.len())
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for TtsConnection {
    fn drop(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            // Already reset by the peer; the descriptor is released either way
            debug!("TTS socket shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn sends_frame_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            // Returns once the client shuts down its write half
            sock.read_to_end(&mut buf).unwrap();
            buf
        });

        let client = TtsClient::new(addr, Duration::from_secs(2));
        let frame = crate::tts::encode("hello").unwrap();
        assert_eq!(client.speak(&frame).unwrap(), frame.len());
        assert_eq!(server.join().unwrap(), frame);
    }

    #[test]
    fn connect_failure_is_reported() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = TtsClient::new(format!("127.0.0.1:{}", port), Duration::from_secs(1));
        assert!(matches!(client.open(), Err(TtsError::Connect { .. })));
    }

    #[test]
    fn default_target_is_loopback() {
        let client = TtsClient::default();
        assert_eq!(client.address(), "127.0.0.1:10200");
        assert_eq!(TtsConfig::default().send_timeout_ms, 20_000);
    }
}
