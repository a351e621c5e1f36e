//! # Nexus Protocol Library
//!
//! This crate provides the wire protocol spoken between the browser terminal
//! and the Nexus daemon over a WebSocket.
//!
//! ## Overview
//!
//! - **Message Definitions**: client frames (`input`, `resize`) and server
//!   frames (`output`, `exit`, `error`)
//! - **Frame Codec**: JSON encoding, tolerant decoding of client frames, and an
//!   incremental UTF-8 decoder for PTY output
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Terminal Messages              │  JSON, `type`-tagged
//! ├─────────────────────────────────────────┤
//! │           Frame Codec                   │  size limit, validation
//! ├─────────────────────────────────────────┤
//! │        Transport (WebSocket)            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use nexus_protocol::{ClientMessage, FrameCodec, ServerMessage};
//!
//! let codec = FrameCodec::new();
//!
//! let decoded = codec
//!     .decode_client(r#"{"type":"resize","cols":100,"rows":30}"#)
//!     .unwrap();
//! assert_eq!(decoded, Some(ClientMessage::resize(100, 30)));
//!
//! // Unknown frame types are ignored rather than rejected
//! assert_eq!(codec.decode_client(r#"{"type":"ping"}"#).unwrap(), None);
//!
//! let text = codec.encode(&ServerMessage::exit(0)).unwrap();
//! assert_eq!(text, r#"{"type":"exit","exitCode":0}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`framing`]: Frame codec and output decoder
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, OutputDecoder, MAX_FRAME_SIZE};
pub use messages::{ClientMessage, ServerMessage, TerminalSize, DEFAULT_COLS, DEFAULT_ROWS};
