//! Xmodem and Ymodem.
//!
//! Both share the same block framing (SOH/STX, sequence byte and its
//! complement, checksum or CRC16), so a single pair of state machines covers
//! the whole family. Ymodem adds the block 0 metadata header and batch
//! transfers.
//!
//! specification: <http://pauillac.inria.fr/~doligez/zmodem/ymodem.txt>

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    com::Com,
    protocol::{CancelRequest, FileStorageHandler, TransferState},
    TransferResult,
};

mod constants;
mod err;
mod ry;
mod sy;
#[cfg(test)]
mod tests;

use self::constants::CAN;
pub use self::err::TransmissionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Default,
    CRC16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XYModemVariant {
    XModem,
    XModemRelaxed,
    XModemCrc,
    XModem1k,
    XModem1kG,
    YModem,
    YModemG,
}

#[derive(Clone, Copy)]
pub struct XYModemConfiguration {
    pub variant: XYModemVariant,
    pub block_length: usize,
    pub checksum_mode: Checksum,
}

impl XYModemConfiguration {
    fn new(variant: XYModemVariant) -> Self {
        let (block_length, checksum_mode) = match variant {
            XYModemVariant::XModem | XYModemVariant::XModemRelaxed => {
                (constants::DEFAULT_BLOCK_LENGTH, Checksum::Default)
            }
            XYModemVariant::XModemCrc => (constants::DEFAULT_BLOCK_LENGTH, Checksum::CRC16),
            XYModemVariant::XModem1k
            | XYModemVariant::XModem1kG
            | XYModemVariant::YModem
            | XYModemVariant::YModemG => (constants::EXT_BLOCK_LENGTH, Checksum::CRC16),
        };

        Self {
            variant,
            block_length,
            checksum_mode,
        }
    }

    fn get_protocol_name(&self) -> &str {
        match self.variant {
            XYModemVariant::XModem => "Xmodem",
            XYModemVariant::XModemRelaxed => "Xmodem Relaxed",
            XYModemVariant::XModemCrc => "Xmodem/CRC",
            XYModemVariant::XModem1k => "Xmodem-1K",
            XYModemVariant::XModem1kG => "Xmodem-1K/G",
            XYModemVariant::YModem => "Ymodem",
            XYModemVariant::YModemG => "Ymodem-G",
        }
    }

    fn get_check_and_size(&self) -> String {
        let checksum = if let Checksum::Default = self.checksum_mode {
            "Checksum"
        } else {
            "Crc"
        };
        let block = if self.block_length == constants::DEFAULT_BLOCK_LENGTH {
            "128"
        } else {
            "1k"
        };
        format!("{checksum}/{block}")
    }

    fn is_ymodem(&self) -> bool {
        matches!(
            self.variant,
            XYModemVariant::YModem | XYModemVariant::YModemG
        )
    }

    fn is_streaming(&self) -> bool {
        matches!(
            self.variant,
            XYModemVariant::XModem1kG | XYModemVariant::YModemG
        )
    }

    fn use_crc(&self) -> bool {
        self.checksum_mode == Checksum::CRC16
    }

    /// The "start transmission" byte the receiver sends.
    fn ncg_byte(&self) -> u8 {
        if self.is_streaming() {
            b'G'
        } else if self.use_crc() {
            b'C'
        } else {
            constants::NAK
        }
    }

    /// Relaxed Xmodem waits 100 seconds for a block, everything else 10.
    fn timeout(&self) -> Duration {
        if let XYModemVariant::XModemRelaxed = self.variant {
            Duration::from_secs(100)
        } else {
            Duration::from_secs(10)
        }
    }

    /// A 1K/G session that fails on the first streamed block falls back to
    /// plain Xmodem-1K. Happens at most once, the downgraded variant can't
    /// trigger it again.
    fn downgrade(&mut self) {
        self.variant = XYModemVariant::XModem1k;
    }
}

fn get_checksum(block: &[u8]) -> u8 {
    crate::crc::get_checksum(block)
}

/// Xmodem (all five flavors) and Ymodem (batch and -G).
pub struct XYmodem {
    config: XYModemConfiguration,

    ry: Option<ry::Ry>,
    sy: Option<sy::Sy>,
}

impl XYmodem {
    pub fn new(variant: XYModemVariant) -> Self {
        XYmodem {
            config: XYModemConfiguration::new(variant),
            ry: None,
            sy: None,
        }
    }
}

impl crate::protocol::Protocol for XYmodem {
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
            if self.sy.is_some() {
                state.send_state.log_error("CANCELLED BY USER");
            } else {
                state.receive_state.log_error("CANCELLED BY USER");
            }
            state.is_finished = true;
            return Ok(false);
        }

        if let Some(ry) = &mut self.ry {
            ry.update(com, transfer_state, storage_handler)?;
            if ry.is_finished() {
                transfer_state.lock().unwrap().is_finished = true;
                return Ok(false);
            }
        } else if let Some(sy) = &mut self.sy {
            sy.update(com, transfer_state)?;
            if sy.is_finished() {
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
        if !self.config.is_ymodem() && files.len() != 1 {
            return Err(TransmissionError::XModem1File.into());
        }

        let mut sy = sy::Sy::new(self.config);
        sy.send(files)?;
        self.sy = Some(sy);
        transfer_state.lock().unwrap().protocol_name =
            self.config.get_protocol_name().to_string();
        Ok(())
    }

    fn initiate_recv(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        let mut ry = ry::Ry::new(self.config);
        ry.recv(com)?;
        self.ry = Some(ry);
        transfer_state.lock().unwrap().protocol_name =
            self.config.get_protocol_name().to_string();
        Ok(())
    }

    fn get_received_files(&mut self) -> Vec<crate::protocol::FileDescriptor> {
        if let Some(ry) = &mut self.ry {
            std::mem::take(&mut ry.files)
        } else {
            Vec::new()
        }
    }

    fn cancel(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        if let Some(ry) = &mut self.ry {
            ry.finish();
        }
        if let Some(sy) = &mut self.sy {
            sy.finish();
        }
        cancel(com)
    }
}

fn cancel(com: &mut Box<dyn Com>) -> TransferResult<()> {
    com.write(&[CAN, CAN, CAN, CAN, CAN, CAN])?;
    com.flush()?;
    Ok(())
}
