//! Protocol message definitions for the Nexus terminal.
//!
//! Every message is a single JSON object carrying a `type` discriminator.
//! Clients send `input` and `resize`; the daemon answers with `output`,
//! `exit`, and (only when a session cannot start) `error`.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default terminal width for a new session.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height for a new session.
pub const DEFAULT_ROWS: u16 = 24;

/// Validated terminal dimensions. Both values are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Column count.
    pub cols: u16,
    /// Row count.
    pub rows: u16,
}

impl TerminalSize {
    /// Builds a size from raw client-supplied values.
    ///
    /// Zero, negative, and values above `u16::MAX` are rejected.
    pub fn try_new(cols: i64, rows: i64) -> Result<Self> {
        let valid = |v: i64| v > 0 && v <= i64::from(u16::MAX);
        if !valid(cols) || !valid(rows) {
            return Err(ProtocolError::InvalidDimensions { cols, rows });
        }
        Ok(Self {
            cols: cols as u16,
            rows: rows as u16,
        })
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Messages sent from the client to the daemon.
///
/// Decoding goes through [`crate::FrameCodec::decode_client`], which ignores
/// unknown `type` values and validates resize dimensions. `Serialize` is
/// provided so clients can build frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Keystrokes to write verbatim to the terminal.
    Input {
        /// Raw input text.
        data: String,
    },
    /// New terminal window size.
    Resize(TerminalSize),
}

impl ClientMessage {
    /// Creates an input message.
    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }

    /// Creates a resize message.
    pub fn resize(cols: u16, rows: u16) -> Self {
        Self::Resize(TerminalSize { cols, rows })
    }
}

/// Messages sent from the daemon to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Terminal output produced by the shell process.
    Output {
        /// Output text, including raw escape sequences.
        data: String,
    },
    /// The shell process terminated.
    Exit {
        /// Exit code reported by the operating system.
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    /// The session could not be started.
    Error {
        /// Human readable description.
        message: String,
    },
}

impl ServerMessage {
    /// Creates an output message.
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    /// Creates an exit message.
    pub fn exit(exit_code: i32) -> Self {
        Self::Exit { exit_code }
    }

    /// Creates an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

// Wire shapes used while decoding client frames.

#[derive(Debug, Deserialize)]
pub(crate) struct InputFields {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResizeFields {
    pub cols: i64,
    pub rows: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
        assert_eq!(size.to_string(), "80x24");
    }

    #[test]
    fn test_terminal_size_rejects_zero() {
        assert!(matches!(
            TerminalSize::try_new(0, 24),
            Err(ProtocolError::InvalidDimensions { cols: 0, rows: 24 })
        ));
        assert!(TerminalSize::try_new(80, 0).is_err());
    }

    #[test]
    fn test_terminal_size_rejects_negative_and_overflow() {
        assert!(TerminalSize::try_new(-1, 24).is_err());
        assert!(TerminalSize::try_new(80, 70_000).is_err());
    }

    #[test]
    fn test_terminal_size_accepts_bounds() {
        let size = TerminalSize::try_new(1, i64::from(u16::MAX)).unwrap();
        assert_eq!(size.cols, 1);
        assert_eq!(size.rows, u16::MAX);
    }

    #[test]
    fn test_client_input_wire_shape() {
        let json = serde_json::to_value(ClientMessage::input("ls\n")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "input", "data": "ls\n"}));
    }

    #[test]
    fn test_client_resize_wire_shape() {
        let json = serde_json::to_value(ClientMessage::resize(120, 40)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "resize", "cols": 120, "rows": 40})
        );
    }

    #[test]
    fn test_server_exit_uses_camel_case_field() {
        let json = serde_json::to_value(ServerMessage::exit(0)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "exit", "exitCode": 0}));
    }

    #[test]
    fn test_server_output_wire_shape() {
        let json = serde_json::to_string(&ServerMessage::output("hi\r\n")).unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi\r\n"}"#);
    }

    #[test]
    fn test_server_error_wire_shape() {
        let json = serde_json::to_value(ServerMessage::error("spawn failed")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "error", "message": "spawn failed"})
        );
    }
}
