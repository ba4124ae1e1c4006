/// Default packet mark.
pub const SOH: u8 = 0x01;
pub const CR: u8 = 0x0D;

/// Default control prefix.
pub const DEFAULT_QCTL: u8 = b'#';
/// Default repeat prefix.
pub const DEFAULT_REPT: u8 = b'~';
/// Default eighth bit prefix when binary quoting is active.
pub const DEFAULT_QBIN: u8 = b'&';

/// Largest length a short packet's LEN field can carry.
pub const MAX_SHORT_PACKET_LEN: usize = 94;
/// Our extended packet limit. Large enough that a megabyte moves in ~117
/// packets, small enough for unambitious peers.
pub const DEFAULT_MAX_LONG_PACKET_LEN: usize = 9024;

pub const DEFAULT_TIMEOUT_SECS: u8 = 10;

/// Runs shorter than this are cheaper to send plain than repeat-prefixed.
pub const MIN_REPEAT_RUN: usize = 4;

/// Capability bits of the CAPAS field.
pub mod capas {
    pub const LONG_PACKETS: u8 = 0x02;
    pub const SLIDING_WINDOW: u8 = 0x04;
    pub const ATTRIBUTES: u8 = 0x08;
    pub const STREAMING: u8 = 0x10;
}
