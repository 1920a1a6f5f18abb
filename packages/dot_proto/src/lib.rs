//! Wire catalog for the dotshare protocol.
//!
//! Every message on the wire is a fixed 8-byte header followed by a bounded
//! payload:
//!
//! ```text
//! [u32 BE payload length] [u32 BE packet type] [payload]
//! ```
//!
//! This crate knows nothing about sessions or devices. It turns bytes into
//! [`Packet`]s, packets into typed [`Request`]s, and [`Response`]s back into
//! packets. Both directions are implemented so client libraries and tests
//! can speak the protocol with the same code the server uses.
//!
//! # Example
//!
//! ```
//! use dot_proto::{Request, Response, PacketType};
//!
//! let packet = Request::SetFocus { tty: 7 }.to_packet();
//! assert_eq!(packet.packet_type(), Some(PacketType::SetFocus));
//! assert_eq!(Request::decode(&packet).unwrap(), Request::SetFocus { tty: 7 });
//!
//! let ack = Response::Ack.to_packet();
//! assert_eq!(Response::decode(&ack).unwrap(), Response::Ack);
//! ```

mod error;
pub mod keys;
mod message;
mod packet;
pub mod param;

pub use error::{DecodeError, ErrorCode, FrameError};
pub use keys::{KeyCode, KeyRange};
pub use message::{AuthMethod, Request, Response, WriteRequest};
pub use packet::{Frame, HEADER_SIZE, Packet, PacketType, read_frame, write_packet};
pub use param::{ParamFlags, ParamId};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 8;

/// Oldest client protocol version the server still accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 8;

/// Upper bound on the depth of an `EnterTtyMode` path.
pub const MAX_TTY_DEPTH: usize = 16;
