//! Error types for the layered streaming library.

use std::fmt;

/// Errors that can occur in the streaming library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Wire**: [`ProtocolViolation`](Self::ProtocolViolation): malformed or
///   out-of-bounds chunk headers and datagrams.
/// - **Transport**: [`Io`](Self::Io), [`TransportFailure`](Self::TransportFailure)
///   for socket failures on an established session.
/// - **Negotiation**: [`NegotiationFailure`](Self::NegotiationFailure),
///   [`Parse`](Self::Parse): malformed signaling or session descriptions.
/// - **Hardening**: [`ResourceExhaustion`](Self::ResourceExhaustion): a peer
///   asked for more memory than the configured bounds allow.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`InvalidState`](Self::InvalidState).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`InvalidConfig`](Self::InvalidConfig).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk or datagram broke the wire contract and was rejected before use.
    #[error("protocol violation: {0}")]
    ProtocolViolation(ViolationKind),

    /// Sending or receiving failed on an established viewer transport.
    #[error("transport failure on session {session_id}: {reason}")]
    TransportFailure { session_id: u64, reason: String },

    /// A session description or candidate could not be applied.
    #[error("negotiation failure: {0}")]
    NegotiationFailure(String),

    /// A peer requested more memory than the configured bounds allow.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Failed to parse a signaling message.
    #[error("signaling parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No session with the given id exists in the [`SessionRegistry`](crate::session::SessionRegistry).
    #[error("session not found: {0}")]
    SessionNotFound(u64),

    /// The requested session state transition is not allowed.
    #[error("invalid state transition for session {session_id}: {from:?} -> {to:?}")]
    InvalidState {
        session_id: u64,
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of wire protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Datagram shorter than its fixed header.
    Truncated { needed: usize, got: usize },
    /// Declared chunk length disagrees with the bytes that followed the header.
    LengthMismatch { declared: u32, actual: usize },
    /// `offset + length` lies outside the declared frame.
    OutOfBounds { offset: u32, length: u32, frame_length: u32 },
    /// A later chunk declared a different total length for an in-flight frame.
    FrameLengthChanged { frame_number: u32, expected: u32, got: u32 },
    /// Chunk overlaps bytes already received for the frame (duplicate or overlap).
    Overflow { frame_number: u32 },
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, got } => {
                write!(f, "truncated datagram (need {needed} bytes, got {got})")
            }
            Self::LengthMismatch { declared, actual } => {
                write!(f, "chunk declares {declared} bytes but carries {actual}")
            }
            Self::OutOfBounds {
                offset,
                length,
                frame_length,
            } => write!(
                f,
                "chunk [{offset}, +{length}) outside frame of {frame_length} bytes"
            ),
            Self::FrameLengthChanged {
                frame_number,
                expected,
                got,
            } => write!(
                f,
                "frame {frame_number} length changed from {expected} to {got}"
            ),
            Self::Overflow { frame_number } => {
                write!(f, "frame {frame_number} chunk overlaps bytes already received")
            }
        }
    }
}

/// Specific kind of signaling parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty.
    EmptyMessage,
    /// Message did not have the `clientId@messageType@payload` shape.
    InvalidFraming,
    /// Client id was not an unsigned integer.
    InvalidClientId,
    /// Message type was not one of 1–4.
    UnknownMessageType,
    /// Offer/answer payload was not valid base64 UTF-8.
    InvalidPayload,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidFraming => write!(f, "invalid message framing"),
            Self::InvalidClientId => write!(f, "invalid client id"),
            Self::UnknownMessageType => write!(f, "unknown message type"),
            Self::InvalidPayload => write!(f, "invalid payload encoding"),
        }
    }
}

impl StreamError {
    /// Shorthand for a [`ProtocolViolation`](Self::ProtocolViolation).
    pub fn violation(kind: ViolationKind) -> Self {
        Self::ProtocolViolation(kind)
    }

    /// Shorthand for a [`TransportFailure`](Self::TransportFailure).
    pub fn transport(session_id: u64, reason: impl fmt::Display) -> Self {
        Self::TransportFailure {
            session_id,
            reason: reason.to_string(),
        }
    }

    /// Whether the error should end the affected session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure { .. } | Self::NegotiationFailure(_) | Self::Io(_)
        )
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
