//! Text signaling between viewers and the server.
//!
//! Every message is one line on the signaling TCP connection:
//!
//! ```text
//! clientId@messageType@payload\n
//! ```
//!
//! | type | meaning       | payload                          |
//! |------|---------------|----------------------------------|
//! | 1    | hello         | empty                            |
//! | 2    | offer         | base64 session description       |
//! | 3    | answer        | base64 session description       |
//! | 4    | ice-candidate | candidate string                 |
//! | 5    | pan-zoom      | `x,y,z,rot_x,rot_y,rot_z`        |
//!
//! Descriptions span several lines, so they travel base64-encoded.

pub mod handler;
pub mod sdp;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{ParseErrorKind, Result, StreamError};

pub use handler::SignalingHandler;

/// Signaling message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    Offer,
    Answer,
    Candidate,
    PanZoom,
}

impl MessageKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Hello),
            2 => Some(Self::Offer),
            3 => Some(Self::Answer),
            4 => Some(Self::Candidate),
            5 => Some(Self::PanZoom),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Hello => 1,
            Self::Offer => 2,
            Self::Answer => 3,
            Self::Candidate => 4,
            Self::PanZoom => 5,
        }
    }
}

/// Encode a session description as a single-line payload.
pub fn encode_description(description: &str) -> String {
    BASE64_STANDARD.encode(description)
}

/// One parsed signaling line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    /// Id the sender claims; informational only, the connection decides
    /// which session a message belongs to.
    pub client_id: u64,
    pub kind: MessageKind,
    pub payload: String,
}

impl SignalMessage {
    pub fn new(client_id: u64, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            client_id,
            kind,
            payload: payload.into(),
        }
    }

    /// Offer or answer carrying `description`, base64-encoded.
    pub fn description(client_id: u64, kind: MessageKind, description: &str) -> Self {
        Self::new(client_id, kind, encode_description(description))
    }

    /// Parse one line. Trailing `\r`/`\n` is ignored.
    ///
    /// The payload is everything after the second `@`, so it may itself
    /// contain `@`. A missing payload is read as empty.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(StreamError::Parse {
                kind: ParseErrorKind::EmptyMessage,
            });
        }

        let mut parts = line.splitn(3, '@');
        let (Some(id), Some(kind)) = (parts.next(), parts.next()) else {
            return Err(StreamError::Parse {
                kind: ParseErrorKind::InvalidFraming,
            });
        };
        let payload = parts.next().unwrap_or_default();

        let client_id = id.trim().parse::<u64>().map_err(|_| StreamError::Parse {
            kind: ParseErrorKind::InvalidClientId,
        })?;
        let kind = kind
            .trim()
            .parse::<u32>()
            .ok()
            .and_then(MessageKind::from_code)
            .ok_or(StreamError::Parse {
                kind: ParseErrorKind::UnknownMessageType,
            })?;

        Ok(Self::new(client_id, kind, payload))
    }

    /// Decode a base64 description payload (offer/answer).
    pub fn decode_description(&self) -> Result<String> {
        let invalid = || StreamError::Parse {
            kind: ParseErrorKind::InvalidPayload,
        };
        let bytes = BASE64_STANDARD.decode(self.payload.trim()).map_err(|_| invalid())?;
        String::from_utf8(bytes).map_err(|_| invalid())
    }

    /// Wire form, without the line terminator.
    pub fn serialize(&self) -> String {
        format!("{}@{}@{}", self.client_id, self.kind.code(), self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hello() {
        let msg = SignalMessage::parse("7@1@\n").unwrap();
        assert_eq!(msg.client_id, 7);
        assert_eq!(msg.kind, MessageKind::Hello);
        assert_eq!(msg.payload, "");
        assert_eq!(SignalMessage::parse("7@1").unwrap().kind, MessageKind::Hello);
    }

    #[test]
    fn payload_may_contain_separator() {
        let msg = SignalMessage::parse("3@4@candidate:1 a@b\r\n").unwrap();
        assert_eq!(msg.kind, MessageKind::Candidate);
        assert_eq!(msg.payload, "candidate:1 a@b");
    }

    #[test]
    fn description_roundtrip_is_single_line() {
        let msg = SignalMessage::description(2, MessageKind::Offer, "v=0\r\ns=x\r\n");
        let line = msg.serialize();
        assert!(!line.contains('\n'));
        let parsed = SignalMessage::parse(&line).unwrap();
        assert_eq!(parsed.decode_description().unwrap(), "v=0\r\ns=x\r\n");
    }

    #[test]
    fn parse_errors() {
        let kind = |line: &str| match SignalMessage::parse(line) {
            Err(StreamError::Parse { kind }) => kind,
            other => panic!("expected parse error, got {other:?}"),
        };
        assert_eq!(kind(""), ParseErrorKind::EmptyMessage);
        assert_eq!(kind("\r\n"), ParseErrorKind::EmptyMessage);
        assert_eq!(kind("hello"), ParseErrorKind::InvalidFraming);
        assert_eq!(kind("x@1@"), ParseErrorKind::InvalidClientId);
        assert_eq!(kind("1@9@"), ParseErrorKind::UnknownMessageType);
        assert_eq!(SignalMessage::parse("1@5@0,0,1,0,0,0").unwrap().kind, MessageKind::PanZoom);
        assert_eq!(kind("1@two@"), ParseErrorKind::UnknownMessageType);
    }

    #[test]
    fn bad_description_payload() {
        let msg = SignalMessage::new(1, MessageKind::Answer, "not base64!");
        assert!(matches!(
            msg.decode_description(),
            Err(StreamError::Parse {
                kind: ParseErrorKind::InvalidPayload
            })
        ));
    }
}
