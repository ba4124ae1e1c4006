//! Zmodem.
//!
//! specification: <http://cristal.inria.fr/~doligez/zmodem/zmodem.txt>
//!
//! Headers travel in one of three encodings (hex, binary with CRC16, binary
//! with CRC32); ZSINIT/ZFILE/ZDATA/ZCOMMAND headers are followed by escaped
//! data subpackets whose CRC covers the payload plus the terminator byte.
//! Everything byte level lives here and in [`header`]; the send and receive
//! state machines are in [`sz`] and [`rz`].

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

pub mod constants;
pub use constants::*;

mod err;
pub use err::TransmissionError;

mod header;
pub use header::{Header, HeaderType, ZFrameType};

mod rz;
pub use rz::Rz;

mod sz;
pub use sz::Sz;

#[cfg(test)]
mod tests;

use crate::{
    com::{Com, ComError},
    options::ZmodemOptions,
    protocol::{CancelRequest, FileStorageHandler, TransferState},
    TransferResult,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Counts consecutive Ctrl-X bytes on one inbound stream. Five in a row are
/// the Session Abort sequence. Owned by the state machine so concurrent
/// sessions never share counts.
#[derive(Default)]
pub struct CanCounter {
    count: usize,
}

impl CanCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&mut self, byte: u8) -> TransferResult<()> {
        if byte == CAN {
            self.count += 1;
            if self.count >= SESSION_ABORT_LEN {
                return Err(TransmissionError::SessionAbort.into());
            }
        } else {
            self.count = 0;
        }
        Ok(())
    }
}

/// Read one raw byte inside Zmodem framing, feeding the Ctrl-X counter.
pub(crate) fn read_byte(
    com: &mut Box<dyn Com>,
    timeout: Duration,
    can: &mut CanCounter,
) -> TransferResult<u8> {
    let byte = com.read_char(timeout)?;
    can.track(byte)?;
    Ok(byte)
}

pub(crate) fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ComError>(), Some(ComError::Timeout))
}

pub(crate) fn is_session_abort(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TransmissionError>(),
        Some(TransmissionError::SessionAbort)
    )
}

/// The 256 entry byte substitution Zmodem uses for binary frames.
///
/// An entry different from its index is transmitted as ZDLE followed by the
/// entry. The table and the escape flags always change together, never
/// independently.
pub struct EncodeByteMap {
    map: [u8; 256],
    escape_ctrl: bool,
    escape_8bit: bool,
}

impl EncodeByteMap {
    pub fn new(escape_ctrl: bool, escape_8bit: bool) -> Self {
        let mut res = Self {
            map: [0; 256],
            escape_ctrl,
            escape_8bit,
        };
        res.rebuild();
        res
    }

    pub fn set_escaping(&mut self, escape_ctrl: bool, escape_8bit: bool) {
        self.escape_ctrl = escape_ctrl;
        self.escape_8bit = escape_8bit;
        self.rebuild();
    }

    pub fn escape_ctrl(&self) -> bool {
        self.escape_ctrl
    }

    fn rebuild(&mut self) {
        for ch in 0..=255u8 {
            let escape = match ch {
                // CAN, XON, XOFF and their high bit twins break the link
                // itself, they can never travel bare.
                CAN | XON | XOFF | 0x91 | 0x93 => true,
                // 8 bit control chars upset some terminal servers.
                0x80..=0x9F => true,
                _ => {
                    (ch < 0x20 && self.escape_ctrl) || (ch & 0x80 != 0 && self.escape_8bit)
                }
            };
            self.map[ch as usize] = if ch == 0x7F {
                ZRUB0
            } else if ch == 0xFF {
                ZRUB1
            } else if escape {
                ch | 0x40
            } else {
                ch
            };
        }
    }

    /// Append `data` to `out` with ZDLE escaping applied.
    pub fn encode_into(&self, out: &mut Vec<u8>, data: &[u8]) {
        for &b in data {
            let mapped = self.map[b as usize];
            if mapped == b {
                out.push(b);
            } else {
                out.push(ZDLE);
                out.push(mapped);
            }
        }
    }
}

pub(crate) fn get_hex(n: u8) -> u8 {
    if n < 10 {
        b'0' + n
    } else {
        b'a' + (n - 10)
    }
}

pub(crate) fn from_hex(n: u8) -> TransferResult<u8> {
    match n {
        b'0'..=b'9' => Ok(n - b'0'),
        b'A'..=b'F' => Ok(10 + n - b'A'),
        b'a'..=b'f' => Ok(10 + n - b'a'),
        _ => Err(TransmissionError::HexNumberExpected.into()),
    }
}

/// Decode `length` ZDLE escaped bytes (no terminators allowed here).
pub(crate) fn read_zdle_bytes(
    com: &mut Box<dyn Com>,
    length: usize,
    can: &mut CanCounter,
) -> TransferResult<Vec<u8>> {
    let mut data = Vec::with_capacity(length);
    while data.len() < length {
        let c = read_byte(com, TIMEOUT, can)?;
        match c {
            ZDLE => {
                let c2 = read_byte(com, TIMEOUT, can)?;
                match c2 {
                    ZRUB0 => data.push(0x7F),
                    ZRUB1 => data.push(0xFF),
                    _ if c2 & 0x40 != 0 => data.push(c2 & 0xBF),
                    _ => return Err(TransmissionError::InvalidSubpacket(c2).into()),
                }
            }
            XON | XOFF | 0x91 | 0x93 => {
                // Bare flow control bytes are line noise, skip them.
            }
            _ => data.push(c),
        }
    }
    Ok(data)
}

/// Build one data subpacket: escaped payload, ZDLE + terminator, escaped
/// CRC. The CRC includes the terminator byte; CRC16 travels big endian,
/// CRC32 little endian. ZCRCW is trailed by a literal XON.
pub fn encode_subpacket(
    zcrc_byte: u8,
    data: &[u8],
    use_crc32: bool,
    map: &EncodeByteMap,
) -> Vec<u8> {
    let mut v = Vec::with_capacity(data.len() + 8);
    map.encode_into(&mut v, data);
    v.extend_from_slice(&[ZDLE, zcrc_byte]);
    if use_crc32 {
        let crc = crate::crc::get_crc32_with(data, zcrc_byte);
        map.encode_into(&mut v, &crc.to_le_bytes());
    } else {
        let crc = crate::crc::get_crc16_with(data, zcrc_byte);
        map.encode_into(&mut v, &crc.to_be_bytes());
    }
    if zcrc_byte == ZCRCW {
        v.push(XON);
    }
    v
}

/// Read one data subpacket. Returns `(payload, frame_ends, ack_expected)`
/// per the ZCRCE/ZCRCG/ZCRCQ/ZCRCW terminator.
pub fn read_subpacket(
    com: &mut Box<dyn Com>,
    max_length: usize,
    use_crc32: bool,
    can: &mut CanCounter,
) -> TransferResult<(Vec<u8>, bool, bool)> {
    let mut data = Vec::with_capacity(max_length);
    loop {
        let c = read_byte(com, TIMEOUT, can)?;
        match c {
            ZDLE => {
                let c2 = read_byte(com, TIMEOUT, can)?;
                match c2 {
                    ZCRCE => {
                        check_crc(com, use_crc32, &data, c2, can)?;
                        return Ok((data, true, false));
                    }
                    ZCRCG => {
                        check_crc(com, use_crc32, &data, c2, can)?;
                        return Ok((data, false, false));
                    }
                    ZCRCQ => {
                        check_crc(com, use_crc32, &data, c2, can)?;
                        return Ok((data, false, true));
                    }
                    ZCRCW => {
                        check_crc(com, use_crc32, &data, c2, can)?;
                        // The XON that trails every ZCRCW subpacket.
                        let _ = read_byte(com, TIMEOUT, can)?;
                        return Ok((data, true, true));
                    }
                    ZRUB0 => data.push(0x7F),
                    ZRUB1 => data.push(0xFF),
                    _ if c2 & 0x40 != 0 => data.push(c2 & 0xBF),
                    _ => return Err(TransmissionError::InvalidSubpacket(c2).into()),
                }
            }
            XON | XOFF | 0x91 | 0x93 => {
                // Ignored per the specification, not errors.
            }
            _ => data.push(c),
        }
        if data.len() > max_length {
            return Err(TransmissionError::InvalidSubpacket(c).into());
        }
    }
}

fn check_crc(
    com: &mut Box<dyn Com>,
    use_crc32: bool,
    data: &[u8],
    zcrc_byte: u8,
    can: &mut CanCounter,
) -> TransferResult<()> {
    if use_crc32 {
        let expected = crate::crc::get_crc32_with(data, zcrc_byte);
        let crc_bytes = read_zdle_bytes(com, 4, can)?;
        let given = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if expected == given {
            Ok(())
        } else {
            Err(TransmissionError::CRC32Mismatch(given, expected).into())
        }
    } else {
        let expected = crate::crc::get_crc16_with(data, zcrc_byte);
        let crc_bytes = read_zdle_bytes(com, 2, can)?;
        let given = u16::from_be_bytes(crc_bytes.try_into().unwrap());
        if expected == given {
            Ok(())
        } else {
            Err(TransmissionError::CRC16Mismatch(given, expected).into())
        }
    }
}

/// Zmodem, 1k blocks. 8k blocks turn it into the ZedZap variant.
pub struct Zmodem {
    block_length: usize,
    sz: Sz,
    rz: Rz,
}

impl Zmodem {
    pub fn new(block_length: usize, options: ZmodemOptions) -> Self {
        Self {
            block_length,
            sz: Sz::new(block_length, options),
            rz: Rz::new(block_length, options),
        }
    }

    fn get_name(&self) -> &str {
        if self.block_length == 1024 {
            "Zmodem"
        } else {
            "ZedZap (Zmodem 8k)"
        }
    }

    pub fn cancel(com: &mut Box<dyn Com>) -> TransferResult<()> {
        com.write(&ABORT_SEQ)?;
        com.flush()?;
        Ok(())
    }
}

impl crate::protocol::Protocol for Zmodem {
    fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
        storage_handler: &mut dyn FileStorageHandler,
    ) -> TransferResult<bool> {
        let cancel_request = transfer_state.lock().unwrap().cancel_request();
        if cancel_request != CancelRequest::None {
            Zmodem::cancel(com)?;
            if cancel_request == CancelRequest::DeletePartial {
                storage_handler.delete_current_file();
            } else {
                storage_handler.close();
            }
            let mut state = transfer_state.lock().unwrap();
            if self.sz.is_active() {
                state.send_state.log_error("CANCELLED BY USER");
            } else {
                state.receive_state.log_error("CANCELLED BY USER");
            }
            state.is_finished = true;
            self.sz.finish();
            self.rz.finish();
            return Ok(false);
        }

        if self.sz.is_active() {
            self.sz.update(com, transfer_state)?;
            if !self.sz.is_active() {
                transfer_state.lock().unwrap().is_finished = true;
                return Ok(false);
            }
        } else if self.rz.is_active() {
            self.rz.update(com, transfer_state, storage_handler)?;
            if !self.rz.is_active() {
                transfer_state.lock().unwrap().is_finished = true;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn initiate_send(
        &mut self,
        _com: &mut Box<dyn Com>,
        files: Vec<crate::protocol::FileDescriptor>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        transfer_state.lock().unwrap().protocol_name = self.get_name().to_string();
        self.sz.send(files);
        Ok(())
    }

    fn initiate_recv(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        transfer_state.lock().unwrap().protocol_name = self.get_name().to_string();
        self.rz.recv(com)?;
        Ok(())
    }

    fn get_received_files(&mut self) -> Vec<crate::protocol::FileDescriptor> {
        std::mem::take(&mut self.rz.files)
    }

    fn cancel(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        self.sz.finish();
        self.rz.finish();
        Zmodem::cancel(com)
    }
}
