// Constants from:
//
//   Z M O D E M . H     Manifest constants for ZMODEM
//    application to application file transfer protocol
//    04-17-89  Chuck Forsberg Omen Technology Inc

/// Padding character, begins frames.
pub const ZPAD: u8 = b'*';
/// Zmodem escape, doubles as Ctrl-X/CAN.
pub const ZDLE: u8 = 0x18;
/// Escaped ZDLE as transmitted.
pub const ZDLEE: u8 = 0x58;
/// Binary frame indicator (CRC-16).
pub const ZBIN: u8 = b'A';
/// HEX frame indicator.
pub const ZHEX: u8 = b'B';
/// Binary frame with 32 bit FCS.
pub const ZBIN32: u8 = b'C';

pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const CAN: u8 = 0x18;

/* ZDLE sequences */
/// CRC next, frame ends, header packet follows.
pub const ZCRCE: u8 = b'h';
/// CRC next, frame continues nonstop.
pub const ZCRCG: u8 = b'i';
/// CRC next, frame continues, ZACK expected.
pub const ZCRCQ: u8 = b'j';
/// CRC next, ZACK expected, end of frame.
pub const ZCRCW: u8 = b'k';
/// Translate to rubout 0x7F.
pub const ZRUB0: u8 = b'l';
/// Translate to rubout 0xFF.
pub const ZRUB1: u8 = b'm';

/// Max subpacket length, never change.
pub const ZMAXSPLEN: usize = 1024;

/// Number of consecutive CAN bytes that abort a session.
pub const SESSION_ABORT_LEN: usize = 5;

/// The canonical abort sequence: a run of CANs, then backspaces to wipe
/// them from the remote's command line.
pub const ABORT_SEQ: [u8; 18] = [
    0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, /* 8 CAN */
    0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, /* 10 BS */
];

pub mod zrinit_flag {
    /// Rx can send and receive true full duplex.
    pub const CANFDX: u8 = 0x01;
    /// Rx can receive data during disk I/O.
    pub const CANOVIO: u8 = 0x02;
    /// Rx can send a break signal.
    pub const CANBRK: u8 = 0x04;
    /// Receiver can decrypt.
    pub const CANCRY: u8 = 0x08;
    /// Receiver can uncompress.
    pub const CANLZW: u8 = 0x10;
    /// Receiver can use 32 bit frame check.
    pub const CANFC32: u8 = 0x20;
    /// Receiver expects ctl chars to be escaped.
    pub const ESCCTL: u8 = 0x40;
    /// Receiver expects 8th bit to be escaped.
    pub const ESC8: u8 = 0x80;
}

pub mod zsinit_flag {
    /// Transmitter expects ctl chars to be escaped.
    pub const TESCCTL: u8 = 0x40;
    /// Transmitter expects 8th bit to be escaped.
    pub const TESC8: u8 = 0x80;
}

pub mod zfile_flag {
    /// Binary transfer - inhibit conversion.
    pub const ZCBIN: u8 = 1;
    /// Convert NL to local end of line convention.
    pub const ZCNL: u8 = 2;
    /// Resume interrupted file transfer.
    pub const ZCRESUM: u8 = 3;

    /// Transfer if source newer or longer.
    pub const ZMNEWL: u8 = 1;
    /// Transfer if different file CRC or length.
    pub const ZMCRC: u8 = 2;
    /// Append contents to existing file (if any).
    pub const ZMAPND: u8 = 3;
    /// Replace existing file.
    pub const ZMCLOB: u8 = 4;
    /// Transfer if source newer.
    pub const ZMNEW: u8 = 5;
}
