use std::error::Error;

#[derive(Debug, Clone)]
pub enum KermitError {
    CheckMismatch,
    InvalidPacketType(u8),
    MarkExpected(u8),
    PacketOutOfOrder(char),
    /// The remote sent an E packet; the payload is its message.
    RemoteError(String),
    TooManyRetries(usize),
}

impl std::fmt::Display for KermitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KermitError::CheckMismatch => write!(f, "block check mismatch"),
            KermitError::InvalidPacketType(t) => {
                write!(f, "invalid packet type {} (0x{t:X})", *t as char)
            }
            KermitError::MarkExpected(b) => write!(f, "packet mark expected, got 0x{b:X}"),
            KermitError::PacketOutOfOrder(t) => {
                write!(f, "'{t}' packet arrived out of order")
            }
            KermitError::RemoteError(msg) => write!(f, "remote error: {msg}"),
            KermitError::TooManyRetries(n) => {
                write!(f, "too many consecutive errors ({n}), giving up")
            }
        }
    }
}

impl Error for KermitError {}
