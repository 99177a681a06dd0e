//! Wire message and user identity types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::RelayError;

/// Opaque user identity used as the registry key.
///
/// Message bodies carry integer ids, and the ingress route only accepts a
/// path segment that parses as one, so every key is the canonical decimal
/// form of an `i64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A direct message between two users.
///
/// Transient: the relay holds it only for the duration of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: i64,
    pub recipient_id: i64,
    pub text: String,
}

impl Message {
    /// Create a new message.
    pub fn new(sender_id: i64, recipient_id: i64, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id,
            text: text.into(),
        }
    }

    /// Registry key of the sender.
    pub fn sender(&self) -> UserId {
        UserId::from(self.sender_id)
    }

    /// Registry key of the recipient.
    pub fn recipient(&self) -> UserId {
        UserId::from(self.recipient_id)
    }

    /// Decode a message from a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, RelayError> {
        serde_json::from_str(frame).map_err(|e| RelayError::decode(e.to_string()))
    }

    /// Encode the message as a JSON text frame.
    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_format() {
        let msg = Message::decode(r#"{"sender_id":1,"recipient_id":2,"text":"hi"}"#).unwrap();
        assert_eq!(msg, Message::new(1, 2, "hi"));
        assert_eq!(msg.sender(), UserId::from("1"));
        assert_eq!(msg.recipient(), UserId::from(2));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(
            Message::decode("not json"),
            Err(RelayError::Decode(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"sender_id":"one","recipient_id":2,"text":"hi"}"#),
            Err(RelayError::Decode(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"sender_id":1,"text":"hi"}"#),
            Err(RelayError::Decode(_))
        ));
    }

    #[test]
    fn test_user_id_display_matches_integer_form() {
        assert_eq!(UserId::from(42).to_string(), "42");
        assert_eq!(UserId::new("42"), UserId::from(42));
    }
}
