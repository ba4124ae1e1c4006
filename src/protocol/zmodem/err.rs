use std::error::Error;

use super::ZFrameType;

#[derive(Debug, Clone)]
pub enum TransmissionError {
    InvalidSubpacket(u8),
    InvalidFrameType(u8),
    ZPADExpected(u8),
    ZDLEExpected(u8),
    UnknownHeaderType(u8),
    CRC16Mismatch(u16, u16),
    CRC32Mismatch(u32, u32),
    ZDataBeforeZFILE,
    UnsupportedFrame(ZFrameType),
    HexNumberExpected,
    /// Five consecutive Ctrl-X bytes: the remote killed the session.
    SessionAbort,
    TooManyErrors(usize),
}

impl std::fmt::Display for TransmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransmissionError::InvalidSubpacket(m) => {
                write!(f, "invalid byte in subpacket got {m}/x{m:X} after ZDLE")
            }
            TransmissionError::InvalidFrameType(ft) => write!(f, "invalid frame type {ft}"),
            TransmissionError::ZPADExpected(b) => {
                write!(f, "ZPAD expected got {} (0x{:X})", *b as char, b)
            }
            TransmissionError::ZDLEExpected(b) => {
                write!(f, "ZDLE expected got {} (0x{:X})", *b as char, b)
            }
            TransmissionError::UnknownHeaderType(ht) => write!(f, "unknown header type {ht}"),
            TransmissionError::CRC16Mismatch(crc, check_crc) => {
                write!(f, "crc16 mismatch got 0x{crc:04X} expected 0x{check_crc:04X}")
            }
            TransmissionError::CRC32Mismatch(crc, check_crc) => {
                write!(f, "crc32 mismatch got 0x{crc:08X} expected 0x{check_crc:08X}")
            }
            TransmissionError::ZDataBeforeZFILE => write!(f, "got ZDATA before ZFILE"),
            TransmissionError::UnsupportedFrame(ft) => write!(f, "unsupported frame {ft:?}"),
            TransmissionError::HexNumberExpected => write!(f, "hex number expected"),
            TransmissionError::SessionAbort => write!(f, "session aborted by remote (5x Ctrl-X)"),
            TransmissionError::TooManyErrors(n) => {
                write!(f, "too many consecutive errors ({n}), giving up")
            }
        }
    }
}

impl Error for TransmissionError {}
