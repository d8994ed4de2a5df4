//! Signaling wire messages
//!
//! The protocol is four text messages long:
//!
//! 1. client sends the source identifier (a URL, plain text)
//! 2. server sends its offer as `{"sdp": "...", "type": "offer"}`
//! 3. client sends its answer in the same shape with `"type": "answer"`
//! 4. client may send `CLOSE` at any point after that

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{InvalidSourceId, SourceId};

/// Control message ending an active session
pub const CLOSE: &str = "CLOSE";

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// An offer or answer as exchanged with the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Answer,
        }
    }

    /// Encode as the JSON text message
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedDescription(e.to_string()))
    }

    /// Decode a JSON text message
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedDescription(e.to_string()))
    }
}

/// Signaling protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    InvalidSource(#[from] InvalidSourceId),

    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    #[error("expected {expected} description, got {actual}")]
    UnexpectedDescriptionType { expected: SdpType, actual: SdpType },

    #[error("session description has no sdp")]
    EmptySdp,

    #[error("unexpected message while {state}: {detail}")]
    UnexpectedMessage { state: String, detail: String },

    #[error("binary messages are not supported")]
    BinaryMessage,
}

impl ProtocolError {
    /// Build an out-of-sequence error, quoting a bounded prefix of the message
    pub fn unexpected(state: impl std::fmt::Display, message: &str) -> Self {
        const MAX_QUOTE: usize = 32;
        let mut detail: String = message.chars().take(MAX_QUOTE).collect();
        if message.chars().count() > MAX_QUOTE {
            detail.push_str("...");
        }
        ProtocolError::UnexpectedMessage {
            state: state.to_string(),
            detail: format!("{detail:?}"),
        }
    }
}

/// Parse step 1: the upstream source identifier
pub fn parse_source(text: &str) -> Result<SourceId, ProtocolError> {
    Ok(SourceId::parse(text)?)
}

/// Parse step 3: the viewer's answer
pub fn parse_answer(text: &str) -> Result<SessionDescription, ProtocolError> {
    let desc = SessionDescription::from_json(text)?;

    if desc.kind != SdpType::Answer {
        return Err(ProtocolError::UnexpectedDescriptionType {
            expected: SdpType::Answer,
            actual: desc.kind,
        });
    }
    if desc.sdp.trim().is_empty() {
        return Err(ProtocolError::EmptySdp);
    }

    Ok(desc)
}

/// Check for the close control message
pub fn is_close(text: &str) -> bool {
    text == CLOSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_json_shape() {
        let json = SessionDescription::offer("v=0\r\n").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["sdp"], "v=0\r\n");
        assert_eq!(value["type"], "offer");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_answer() {
        let desc = parse_answer(r#"{"sdp":"v=0","type":"answer"}"#).unwrap();
        assert_eq!(desc, SessionDescription::answer("v=0"));
    }

    #[test]
    fn test_parse_answer_wrong_type() {
        let err = parse_answer(r#"{"sdp":"v=0","type":"offer"}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedDescriptionType {
                expected: SdpType::Answer,
                actual: SdpType::Offer
            }
        );
    }

    #[test]
    fn test_parse_answer_rejects_malformed() {
        assert!(matches!(
            parse_answer("not json"),
            Err(ProtocolError::MalformedDescription(_))
        ));
        assert!(matches!(
            parse_answer(r#"{"sdp":"v=0"}"#),
            Err(ProtocolError::MalformedDescription(_))
        ));
        assert!(matches!(
            parse_answer(r#"{"sdp":"v=0","type":"bogus"}"#),
            Err(ProtocolError::MalformedDescription(_))
        ));
        assert_eq!(
            parse_answer(r#"{"sdp":"","type":"answer"}"#),
            Err(ProtocolError::EmptySdp)
        );
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(parse_source("rtsp://cam1").unwrap().as_str(), "rtsp://cam1");
        assert!(matches!(
            parse_source(r#"{"sdp":"v=0","type":"answer"}"#),
            Err(ProtocolError::InvalidSource(_))
        ));
        assert!(parse_source("").is_err());
    }

    #[test]
    fn test_close_is_exact() {
        assert!(is_close("CLOSE"));
        assert!(!is_close("close"));
        assert!(!is_close("CLOSE\n"));
    }

    #[test]
    fn test_unexpected_message_is_bounded() {
        let err = ProtocolError::unexpected("active", &"x".repeat(500));
        assert!(err.to_string().len() < 100);
    }
}
