//! Frame codec for the terminal WebSocket.
//!
//! # Frame Format
//!
//! Each WebSocket message carries exactly one frame: a JSON object whose
//! `type` field selects the message kind. There is no fragmentation or
//! reassembly above what the transport already provides.
//!
//! # Decoding rules
//!
//! - valid `input`/`resize` frames decode to `Some(ClientMessage)`
//! - frames with an unrecognized `type` decode to `None` and are ignored
//! - anything else (bad JSON, missing fields, non-positive resize) is an error
//!
//! PTY output is raw bytes; [`OutputDecoder`] turns it into frame text without
//! splitting multi-byte characters that straddle two reads.

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::messages::{ClientMessage, InputFields, ResizeFields, ServerMessage, TerminalSize};

/// Maximum frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encoder and decoder for terminal frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    /// Largest frame accepted or produced, in bytes.
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the configured size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a server message into frame text.
    pub fn encode(&self, message: &ServerMessage) -> Result<String> {
        let text = serde_json::to_string(message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.check_size(text.len())?;
        Ok(text)
    }

    /// Decode a client frame received as text.
    pub fn decode_client(&self, text: &str) -> Result<Option<ClientMessage>> {
        self.check_size(text.len())?;

        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Deserialization("frame missing `type`".to_string()))?;

        match kind {
            "input" => {
                let fields: InputFields = serde_json::from_value(value)?;
                Ok(Some(ClientMessage::Input { data: fields.data }))
            }
            "resize" => {
                let fields: ResizeFields = serde_json::from_value(value)?;
                let size = TerminalSize::try_new(fields.cols, fields.rows)?;
                Ok(Some(ClientMessage::Resize(size)))
            }
            _ => Ok(None),
        }
    }

    /// Decode a client frame received as a binary message.
    ///
    /// The payload must be UTF-8 JSON, same as a text frame.
    pub fn decode_client_bytes(&self, bytes: &[u8]) -> Result<Option<ClientMessage>> {
        self.check_size(bytes.len())?;
        let text = std::str::from_utf8(bytes)?;
        self.decode_client(text)
    }

    /// Decode a server frame. Used by clients of the daemon.
    pub fn decode_server(&self, text: &str) -> Result<ServerMessage> {
        self.check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

/// Incremental UTF-8 decoder for PTY output.
///
/// Holds back an incomplete trailing sequence until the next chunk arrives.
/// Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return all text that is complete so far.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // incomplete sequence at the end, wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered, replacing it if incomplete.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_input() {
        let codec = FrameCodec::new();
        let msg = codec
            .decode_client(r#"{"type":"input","data":"ls\n"}"#)
            .unwrap();
        assert_eq!(msg, Some(ClientMessage::input("ls\n")));
    }

    #[test]
    fn test_decode_resize() {
        let codec = FrameCodec::new();
        let msg = codec
            .decode_client(r#"{"type":"resize","cols":120,"rows":40}"#)
            .unwrap();
        assert_eq!(msg, Some(ClientMessage::resize(120, 40)));
    }

    #[test]
    fn test_decode_unknown_type_is_ignored() {
        let codec = FrameCodec::new();
        assert_eq!(codec.decode_client(r#"{"type":"ping"}"#).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_zero_resize() {
        let codec = FrameCodec::new();
        let result = codec.decode_client(r#"{"type":"resize","cols":0,"rows":24}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidDimensions { cols: 0, rows: 24 })
        ));
    }

    #[test]
    fn test_decode_rejects_negative_resize() {
        let codec = FrameCodec::new();
        let result = codec.decode_client(r#"{"type":"resize","cols":80,"rows":-3}"#);
        assert!(matches!(result, Err(ProtocolError::InvalidDimensions { .. })));
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let codec = FrameCodec::new();
        let result = codec.decode_client("{\"type\":\"input\"");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        let codec = FrameCodec::new();
        let result = codec.decode_client(r#"{"data":"ls"}"#);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_field_type() {
        let codec = FrameCodec::new();
        assert!(codec.decode_client(r#"{"type":"input","data":5}"#).is_err());
        assert!(codec
            .decode_client(r#"{"type":"resize","cols":"wide","rows":24}"#)
            .is_err());
    }

    #[test]
    fn test_decode_binary_frame() {
        let codec = FrameCodec::new();
        let msg = codec
            .decode_client_bytes(br#"{"type":"input","data":"pwd\n"}"#)
            .unwrap();
        assert_eq!(msg, Some(ClientMessage::input("pwd\n")));
    }

    #[test]
    fn test_decode_binary_frame_invalid_utf8() {
        let codec = FrameCodec::new();
        let result = codec.decode_client_bytes(&[0x7b, 0xff, 0x7d]);
        assert!(matches!(result, Err(ProtocolError::InvalidUtf8(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(16);
        let result = codec.decode_client(r#"{"type":"input","data":"0123456789"}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { max: 16, .. })
        ));

        let result = codec.encode(&ServerMessage::output("0123456789abcdef"));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_encode_then_decode_server() {
        let codec = FrameCodec::new();
        let text = codec.encode(&ServerMessage::exit(42)).unwrap();
        assert_eq!(codec.decode_server(&text).unwrap(), ServerMessage::exit(42));
    }

    #[test]
    fn test_output_decoder_ascii() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.push(b"hello"), "hello");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_output_decoder_split_multibyte() {
        // "é" is 0xC3 0xA9
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.push(&[b'a', 0xC3]), "a");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.push(&[0xA9, b'b']), "éb");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_output_decoder_invalid_byte() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_output_decoder_finish_flushes_incomplete() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.push(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.pending_len(), 0);
    }
}
