//! Kermit.
//!
//! Packet framing with negotiated block checks, control and eighth bit
//! prefixing and run length encoding lives in [`packet`]; the S/Y parameter
//! negotiation in [`transfer_params`]; the receive and send machines in
//! [`rk`] and [`sk`].
//!
//! specification: "Kermit, A File Transfer Protocol" (da Cruz), and the
//! C-Kermit implementation this has to interoperate with.

use std::sync::{Arc, Mutex};

pub mod constants;

mod err;
pub use err::KermitError;

pub mod packet;
pub use packet::{CheckType, Encoding, Packet, PacketType};

pub mod transfer_params;
pub use transfer_params::{ActiveParameters, KermitParameters, TransferParameters};

mod rk;
pub use rk::Rk;

mod sk;
pub use sk::Sk;

#[cfg(test)]
mod tests;

use crate::{
    com::Com,
    options::KermitOptions,
    protocol::{CancelRequest, FileStorageHandler, TransferState},
    TransferResult,
};

/// Kermit, batch capable, with long packets and streaming when the peer
/// agrees.
pub struct Kermit {
    options: KermitOptions,
    rk: Option<Rk>,
    sk: Option<Sk>,
}

impl Kermit {
    pub fn new(options: KermitOptions) -> Self {
        Self {
            options,
            rk: None,
            sk: None,
        }
    }
}

impl crate::protocol::Protocol for Kermit {
    fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
        storage_handler: &mut dyn FileStorageHandler,
    ) -> TransferResult<bool> {
        let cancel_request = transfer_state.lock().unwrap().cancel_request();
        if cancel_request != CancelRequest::None {
            self.cancel(com)?;
            if cancel_request == CancelRequest::DeletePartial {
                storage_handler.delete_current_file();
            } else {
                storage_handler.close();
            }
            let mut state = transfer_state.lock().unwrap();
            if self.sk.is_some() {
                state.send_state.log_error("CANCELLED BY USER");
            } else {
                state.receive_state.log_error("CANCELLED BY USER");
            }
            state.is_finished = true;
            return Ok(false);
        }

        if let Some(rk) = &mut self.rk {
            rk.update(com, transfer_state, storage_handler)?;
            if rk.is_finished() {
                transfer_state.lock().unwrap().is_finished = true;
                return Ok(false);
            }
        } else if let Some(sk) = &mut self.sk {
            sk.update(com, transfer_state)?;
            if sk.is_finished() {
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
        let mut sk = Sk::new(self.options);
        sk.send(files);
        self.sk = Some(sk);
        transfer_state.lock().unwrap().protocol_name = "Kermit".to_string();
        Ok(())
    }

    fn initiate_recv(
        &mut self,
        _com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        let mut rk = Rk::new(self.options);
        rk.recv();
        self.rk = Some(rk);
        transfer_state.lock().unwrap().protocol_name = "Kermit".to_string();
        Ok(())
    }

    fn get_received_files(&mut self) -> Vec<crate::protocol::FileDescriptor> {
        if let Some(rk) = &mut self.rk {
            std::mem::take(&mut rk.files)
        } else {
            Vec::new()
        }
    }

    fn cancel(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        if let Some(rk) = &mut self.rk {
            rk.send_error(com, "transfer cancelled")?;
            rk.finish();
        }
        if let Some(sk) = &mut self.sk {
            sk.send_error(com, "transfer cancelled")?;
            sk.finish();
        }
        Ok(())
    }
}

// Attribute packets carry the modification time as "yyyymmdd hh:mm:ss".
// The civil date conversions below are the usual era based algorithms.

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = y - i64::from(m <= 2);
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (y + i64::from(m <= 2), m, d)
}

pub(crate) fn format_attr_date(unix_secs: u64) -> String {
    let days = (unix_secs / 86_400) as i64;
    let rem = unix_secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{y:04}{m:02}{d:02} {:02}:{:02}:{:02}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Parse "[yy]yymmdd[ hh:mm[:ss]]" into unix seconds.
pub(crate) fn parse_attr_date(text: &str) -> Option<u64> {
    let mut parts = text.splitn(2, ' ');
    let date = parts.next()?;
    let (y, rest) = match date.len() {
        8 => (date[0..4].parse::<i64>().ok()?, &date[4..]),
        6 => (1900 + date[0..2].parse::<i64>().ok()?, &date[2..]),
        _ => return None,
    };
    let m: u32 = rest[0..2].parse().ok()?;
    let d: u32 = rest[2..4].parse().ok()?;
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    let mut secs = 0u64;
    if let Some(time) = parts.next() {
        let mut fields = time.split(':');
        let h: u64 = fields.next()?.parse().ok()?;
        let min: u64 = fields.next()?.parse().ok()?;
        let s: u64 = fields.next().map(|s| s.parse().ok()).unwrap_or(Some(0))?;
        secs = h * 3600 + min * 60 + s;
    }
    let days = days_from_civil(y, m, d);
    if days < 0 {
        return None;
    }
    Some(days as u64 * 86_400 + secs)
}
