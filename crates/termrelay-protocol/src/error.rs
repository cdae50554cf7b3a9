use thiserror::Error;

use crate::wire::MessageType;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{message:?}: missing field `{field}`")]
    Truncated {
        message: MessageType,
        field: &'static str,
    },

    #[error("unknown message type tag: {0}")]
    UnknownMessageType(u8),

    #[error("{message:?}: field `{field}` is not valid UTF-8")]
    InvalidUtf8 {
        message: MessageType,
        field: &'static str,
    },

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
