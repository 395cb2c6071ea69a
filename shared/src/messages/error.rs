use thiserror::Error;

/// Errors raised while encoding or decoding wire messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// A message batch or document could not be encoded
    #[error("Failed to encode messages: {reason}")]
    Encode { reason: String },

    /// A message batch, document or agent payload could not be decoded
    #[error("Failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

impl MessageError {
    pub fn decode(what: &'static str, error: serde_json::Error) -> Self {
        MessageError::Decode {
            what,
            reason: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(error: serde_json::Error) -> Self {
        MessageError::Encode {
            reason: error.to_string(),
        }
    }
}
