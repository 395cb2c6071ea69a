mod error;
mod message;

pub use error::MessageError;
pub use message::{Message, MessageKind, SerializedDocument, SerializedValue};
