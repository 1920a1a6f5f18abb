//! Wire error codes and codec errors.

use crate::packet::PacketType;

/// Error codes carried by `Error` and `Exception` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(u32)]
pub enum ErrorCode {
    #[error("not enough memory")]
    NoMem = 1,
    #[error("tty already in use")]
    TtyBusy = 2,
    #[error("device already in use")]
    DeviceBusy = 3,
    #[error("unknown instruction")]
    UnknownInstruction = 4,
    #[error("illegal instruction")]
    IllegalInstruction = 5,
    #[error("invalid parameter")]
    InvalidParameter = 6,
    #[error("invalid packet")]
    InvalidPacket = 7,
    #[error("connection refused")]
    ConnRefused = 8,
    #[error("operation not supported")]
    OpNotSupp = 9,
    #[error("unknown tty")]
    UnknownTty = 10,
    #[error("bad protocol version")]
    ProtocolVersion = 11,
    #[error("unexpected end of file")]
    Eof = 12,
    #[error("driver error")]
    DriverError = 13,
    #[error("authentication failed")]
    Authentication = 14,
    #[error("parameter is read-only")]
    ReadOnlyParameter = 15,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::NoMem,
            2 => Self::TtyBusy,
            3 => Self::DeviceBusy,
            4 => Self::UnknownInstruction,
            5 => Self::IllegalInstruction,
            6 => Self::InvalidParameter,
            7 => Self::InvalidPacket,
            8 => Self::ConnRefused,
            9 => Self::OpNotSupp,
            10 => Self::UnknownTty,
            11 => Self::ProtocolVersion,
            12 => Self::Eof,
            13 => Self::DriverError,
            14 => Self::Authentication,
            15 => Self::ReadOnlyParameter,
            _ => return None,
        })
    }
}

/// Transport-level framing failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("stream ended inside a packet header ({0} of 8 bytes)")]
    TruncatedHeader(usize),

    #[error("stream ended inside a packet payload")]
    TruncatedPayload,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A packet that arrived intact but could not be turned into a typed message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown packet type {0:#x}")]
    UnknownType(u32),

    #[error("{ptype:?} cannot travel in this direction")]
    WrongDirection { ptype: PacketType },

    #[error("malformed {ptype:?} packet: {reason}")]
    Malformed {
        ptype: PacketType,
        reason: &'static str,
    },
}

impl DecodeError {
    /// Code reported back to the peer in the `Exception` reply.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownType(_) => ErrorCode::UnknownInstruction,
            Self::WrongDirection { .. } => ErrorCode::IllegalInstruction,
            Self::Malformed { .. } => ErrorCode::InvalidPacket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_roundtrip() {
        for code in 1..=15 {
            let parsed = ErrorCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(16), None);
    }

    #[test]
    fn decode_errors_map_to_wire_codes() {
        assert_eq!(
            DecodeError::UnknownType(0x99).error_code(),
            ErrorCode::UnknownInstruction
        );
        assert_eq!(
            DecodeError::Malformed {
                ptype: PacketType::Write,
                reason: "short",
            }
            .error_code(),
            ErrorCode::InvalidPacket
        );
    }
}
