use std::path::PathBuf;

use dot_proto::{ErrorCode, FrameError};

/// Errors that can stop the server from starting
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A listen address could not be parsed
    #[error("invalid listen address {0:?} (expected tcp:HOST:PORT or unix:PATH)")]
    InvalidAddress(String),

    /// Binding one address failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// None of the configured addresses could be bound
    #[error("no listen address could be bound")]
    NoListeners,

    /// The key file for key authentication could not be read
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {0} is empty")]
    EmptyKey(PathBuf),
}

/// Tty tree mutations that were refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("connection is not registered")]
    UnknownConnection,

    #[error("connection already holds a different tty")]
    AlreadyInTty,

    #[error("connection is not in tty mode")]
    NotInTty,
}

impl TreeError {
    pub fn error_code(self) -> ErrorCode {
        match self {
            Self::UnknownConnection => ErrorCode::UnknownTty,
            Self::AlreadyInTty => ErrorCode::InvalidParameter,
            Self::NotInTty => ErrorCode::IllegalInstruction,
        }
    }
}

/// Why a handshake ended without authenticating the client
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error("peer closed the connection")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("unexpected packet during handshake: {0}")]
    Protocol(&'static str),

    #[error("client protocol version {0} is too old")]
    Version(u32),

    #[error("credentials rejected")]
    Rejected,
}

impl HandshakeError {
    /// Error reply owed to the client before the transport is closed.
    pub fn reply(&self) -> Option<ErrorCode> {
        match self {
            Self::Timeout | Self::Closed | Self::Frame(_) => None,
            Self::Protocol(_) => Some(ErrorCode::IllegalInstruction),
            Self::Version(_) => Some(ErrorCode::ProtocolVersion),
            Self::Rejected => Some(ErrorCode::Authentication),
        }
    }
}
