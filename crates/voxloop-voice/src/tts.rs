//! Wire format for speak requests sent to the TTS server.
//!
//! A request is two compact JSON documents separated by a single newline:
//!
//! ```text
//! {"type":"synthesize","version":"1.5.3","data_length":22}
//! {"text":"It is 3 PM."}
//! ```
//!
//! `data_length` is the byte length of the payload line. The payload may carry
//! an optional `voice` object; it is omitted entirely when no voice is chosen.

use crate::error::TtsError;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.5.3";
pub const REQUEST_TYPE: &str = "synthesize";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    #[serde(rename = "type")]
    pub message_type: String,
    pub version: String,
    pub data_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSelection {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceSelection>,
}

impl SynthesizePayload {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, name: Option<&str>) -> Self {
        self.voice = name.map(|n| VoiceSelection {
            name: n.to_string(),
        });
        self
    }

    /// Serialize as header line, newline, payload line.
    pub fn encode(&self) -> Result<Vec<u8>, TtsError> {
        let payload = serde_json::to_vec(self).map_err(TtsError::Encode)?;
        let header = RequestHeader {
            message_type: REQUEST_TYPE.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            data_length: payload.len(),
        };
        let mut out = serde_json::to_vec(&header).map_err(TtsError::Encode)?;
        out.reserve(payload.len() + 1);
        out.push(b'\n');
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

/// Encode a plain speak request for `text`.
pub fn encode(text: &str) -> Result<Vec<u8>, TtsError> {
    SynthesizePayload::new(text).encode()
}

/// Parse a frame produced by [`encode`], checking the header against the payload.
pub fn decode(frame: &[u8]) -> Result<(RequestHeader, SynthesizePayload), TtsError> {
    let split = frame
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| TtsError::Decode("missing header terminator".to_string()))?;
    let (header_bytes, rest) = frame.split_at(split);
    let payload_bytes = &rest[1..];

    let header: RequestHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| TtsError::Decode(format!("bad header: {}", e)))?;
    if header.message_type != REQUEST_TYPE {
        return Err(TtsError::Decode(format!(
            "unexpected request type '{}'",
            header.message_type
        )));
    }
    if header.data_length != payload_bytes.len() {
        return Err(TtsError::Decode(format!(
            "data_length {} does not match payload of {} bytes",
            header.data_length,
            payload_bytes.len()
        )));
    }

    let payload: SynthesizePayload = serde_json::from_slice(payload_bytes)
        .map_err(|e| TtsError::Decode(format!("bad payload: {}", e)))?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_wire_layout() {
        let frame = encode("It is 3 PM.").unwrap();
        let expected = "{\"type\":\"synthesize\",\"version\":\"1.5.3\",\"data_length\":22}\n{\"text\":\"It is 3 PM.\"}";
        assert_eq!(String::from_utf8(frame).unwrap(), expected);
    }

    #[test]
    fn data_length_counts_bytes_not_chars() {
        let frame = encode("café ☕").unwrap();
        let (header, payload) = decode(&frame).unwrap();
        let payload_line = serde_json::to_vec(&payload).unwrap();
        assert_eq!(header.data_length, payload_line.len());
        assert_eq!(payload.text, "café ☕");
        assert_eq!(header.version, PROTOCOL_VERSION);
    }

    #[test]
    fn escapes_survive_decoding() {
        let text = "line one\nshe said \"hi\"\t\\ done";
        let (_, payload) = decode(&encode(text).unwrap()).unwrap();
        assert_eq!(payload.text, text);
    }

    #[test]
    fn voice_is_optional() {
        let plain = SynthesizePayload::new("hi").with_voice(None).encode().unwrap();
        assert!(!String::from_utf8_lossy(&plain).contains("voice"));

        let voiced = SynthesizePayload::new("hi")
            .with_voice(Some("en_US-amy-low"))
            .encode()
            .unwrap();
        let (_, payload) = decode(&voiced).unwrap();
        assert_eq!(payload.voice.unwrap().name, "en_US-amy-low");
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut frame = encode("hello").unwrap();
        frame.push(b' ');
        assert!(matches!(decode(&frame), Err(TtsError::Decode(_))));
        assert!(matches!(decode(b"{\"type\":\"synthesize\"}"), Err(TtsError::Decode(_))));
    }
}
