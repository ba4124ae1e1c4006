use std::sync::{Arc, Mutex};

use super::{
    constants::{ACK, CAN, DEFAULT_BLOCK_LENGTH, EOT, EXT_BLOCK_LENGTH, NAK, SOH, STX},
    err::TransmissionError,
    get_checksum, Checksum, XYModemConfiguration, XYModemVariant,
};
use crate::{
    com::{Com, ComError},
    protocol::{str_from_null_terminated_utf8_unchecked, FileDescriptor, FileStorageHandler, TransferState},
    TransferResult,
};

#[derive(Debug)]
pub enum RecvState {
    None,

    /// Waiting for the first block of a file, retries counted.
    StartReceive(usize),
    /// `(step, retries)` - step 0 awaits a block header byte, step 1 awaits
    /// the second EOT of the Ymodem end-of-file dance.
    ReadBlockStart(u8, usize),
    /// `(block_length, retries)` - reading the Ymodem block 0.
    ReadYModemHeader(usize, usize),
    /// `(block_length, retries)` - reading a data block.
    ReadBlock(usize, usize),
}

/// Xmodem/Ymodem receiver.
pub struct Ry {
    configuration: XYModemConfiguration,

    pub files: Vec<FileDescriptor>,
    pub bytes_send: usize,

    errors: usize,
    sequence_number: u8,
    recv_state: RecvState,
}

impl Ry {
    pub fn new(configuration: XYModemConfiguration) -> Self {
        Ry {
            configuration,
            recv_state: RecvState::None,
            files: Vec::new(),
            errors: 0,
            sequence_number: 1,
            bytes_send: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.recv_state, RecvState::None)
    }

    pub fn finish(&mut self) {
        self.recv_state = RecvState::None;
    }

    pub fn recv(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        self.await_data(com)?;
        self.recv_state = RecvState::StartReceive(0);
        Ok(())
    }

    pub fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        state: &Arc<Mutex<TransferState>>,
        storage: &mut dyn FileStorageHandler,
    ) -> TransferResult<()> {
        if let Ok(state) = &mut state.lock() {
            let transfer_info = &mut state.receive_state;
            if let Some(file) = self.files.last() {
                transfer_info.file_name = file.file_name.clone();
                transfer_info.file_size = file.size;
            }
            transfer_info.bytes_transfered = self.bytes_send;
            transfer_info.errors = self.errors;
            transfer_info.check_size = self.configuration.get_check_and_size();
            transfer_info.update_bps();
        }

        match self.recv_state {
            RecvState::None => {}

            RecvState::StartReceive(retries) => {
                state.lock().unwrap().current_state = "Start receiving...";
                match com.read_char(self.configuration.timeout()) {
                    Ok(SOH) => {
                        if self.configuration.is_ymodem() {
                            self.recv_state = RecvState::ReadYModemHeader(DEFAULT_BLOCK_LENGTH, 0);
                        } else {
                            self.recv_state = RecvState::ReadBlock(DEFAULT_BLOCK_LENGTH, 0);
                        }
                    }
                    Ok(STX) => {
                        if self.configuration.is_ymodem() {
                            self.recv_state = RecvState::ReadYModemHeader(EXT_BLOCK_LENGTH, 0);
                        } else {
                            self.recv_state = RecvState::ReadBlock(EXT_BLOCK_LENGTH, 0);
                        }
                    }
                    Ok(CAN) => {
                        return self.cancelled_by_remote(com, state);
                    }
                    Ok(_) => {
                        self.block_error(com, retries)?;
                        self.recv_state = RecvState::StartReceive(retries + 1);
                    }
                    Err(ComError::Timeout) => {
                        // Ask again with the start byte for our mode.
                        self.errors += 1;
                        if retries + 1 >= 10 {
                            return self.too_many_retries(com, retries + 1);
                        }
                        self.await_data(com)?;
                        self.recv_state = RecvState::StartReceive(retries + 1);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            RecvState::ReadYModemHeader(len, retries) => {
                state.lock().unwrap().current_state = "Get header...";
                let block = match self.read_block_payload(com, len) {
                    Ok(block) => block,
                    Err(ComError::Timeout) => {
                        self.block_error(com, retries)?;
                        self.recv_state = RecvState::StartReceive(retries + 1);
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                };

                if block[0] != 0 || block[1] != 0xFF || !self.check_crc(&block[2..]) {
                    self.block_error(com, retries)?;
                    self.recv_state = RecvState::StartReceive(retries + 1);
                    return Ok(());
                }
                let block = &block[2..];
                if block[0] == 0 {
                    // Empty file name: end of batch.
                    com.write(&[ACK])?;
                    self.recv_state = RecvState::None;
                    return Ok(());
                }

                let mut fd = FileDescriptor::new();
                fd.file_name = str_from_null_terminated_utf8_unchecked(block);
                let meta_start = (fd.file_name.len() + 1).min(block.len());
                let meta = str_from_null_terminated_utf8_unchecked(&block[meta_start..]);
                let mut parts = meta.split(' ');
                if let Some(size) = parts.next() {
                    fd.size = size.parse().unwrap_or(0);
                }
                if let Some(mtime) = parts.next() {
                    fd.date = u64::from_str_radix(mtime, 8).unwrap_or(0);
                }
                storage.open_file(&fd.file_name, fd.size);
                self.files.push(fd);
                self.sequence_number = 1;
                self.errors = 0;

                if self.configuration.is_streaming() {
                    com.write(&[b'G'])?;
                } else {
                    com.write(&[ACK, b'C'])?;
                }
                self.recv_state = RecvState::ReadBlockStart(0, 0);
            }

            RecvState::ReadBlockStart(step, retries) => {
                if step == 0 {
                    match com.read_char(self.configuration.timeout()) {
                        Ok(SOH) => {
                            self.recv_state = RecvState::ReadBlock(DEFAULT_BLOCK_LENGTH, retries);
                        }
                        Ok(STX) => {
                            self.recv_state = RecvState::ReadBlock(EXT_BLOCK_LENGTH, retries);
                        }
                        Ok(EOT) => {
                            if self.configuration.is_ymodem() {
                                com.write(&[NAK])?;
                                self.recv_state = RecvState::ReadBlockStart(1, 0);
                            } else {
                                com.write(&[ACK])?;
                                if storage.current_file_name().is_none() {
                                    storage.open_unnamed_file();
                                }
                                storage.remove_cpm_eof();
                                self.finish_file(state, storage);
                                self.recv_state = RecvState::None;
                            }
                        }
                        Ok(CAN) => {
                            return self.cancelled_by_remote(com, state);
                        }
                        Ok(_) => {
                            self.downgrade_check();
                            self.block_error(com, retries)?;
                            self.recv_state = RecvState::ReadBlockStart(0, retries + 1);
                        }
                        Err(ComError::Timeout) => {
                            self.downgrade_check();
                            self.block_error(com, retries)?;
                            self.recv_state = RecvState::ReadBlockStart(0, retries + 1);
                        }
                        Err(err) => return Err(err.into()),
                    }
                } else {
                    // Ymodem sends EOT twice; the second one completes the
                    // file.
                    let eot = match com.read_char(self.configuration.timeout()) {
                        Ok(eot) => eot,
                        Err(ComError::Timeout) => {
                            self.block_error(com, retries)?;
                            self.recv_state = RecvState::ReadBlockStart(1, retries + 1);
                            return Ok(());
                        }
                        Err(err) => return Err(err.into()),
                    };
                    if eot != EOT {
                        self.block_error(com, retries)?;
                        self.recv_state = RecvState::ReadBlockStart(1, retries + 1);
                        return Ok(());
                    }
                    if let Some(fd) = self.files.last() {
                        if fd.size > 0 {
                            storage.set_current_size_to(fd.size.min(storage.current_file_length()));
                        }
                        if fd.date > 0 {
                            storage.set_file_date(fd.date);
                        }
                    }
                    self.finish_file(state, storage);
                    com.write(&[ACK])?;
                    self.await_data(com)?;
                    self.recv_state = RecvState::StartReceive(0);
                }
            }

            RecvState::ReadBlock(len, retries) => {
                state.lock().unwrap().current_state = "Receiving data...";
                let block = match self.read_block_payload(com, len) {
                    Ok(block) => block,
                    Err(ComError::Timeout) => {
                        self.downgrade_check();
                        self.block_error(com, retries)?;
                        self.recv_state = RecvState::ReadBlockStart(0, retries + 1);
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                };

                let seq = block[0];
                if block[0] != block[1] ^ 0xFF {
                    self.block_error(com, retries)?;
                    self.recv_state = RecvState::ReadBlockStart(0, retries + 1);
                    return Ok(());
                }
                if seq == self.sequence_number.wrapping_sub(1) {
                    // A duplicate of the last block: the sender missed our
                    // ACK. Acknowledge again, drop the data.
                    self.downgrade_check();
                    if !self.configuration.is_streaming() {
                        com.write(&[ACK])?;
                    }
                    self.recv_state = RecvState::ReadBlockStart(0, 0);
                    return Ok(());
                }
                if seq != self.sequence_number {
                    self.block_error(com, retries)?;
                    self.recv_state = RecvState::ReadBlockStart(0, retries + 1);
                    return Ok(());
                }
                if !self.check_crc(&block[2..]) {
                    self.block_error(com, retries)?;
                    self.recv_state = RecvState::ReadBlockStart(0, retries + 1);
                    return Ok(());
                }

                if storage.current_file_name().is_none() {
                    // Plain Xmodem carries no file name; callers rename the
                    // file after the download.
                    storage.open_unnamed_file();
                    let mut fd = FileDescriptor::new();
                    fd.file_name = storage.current_file_name().unwrap_or_default();
                    self.files.push(fd);
                }
                storage.append(&block[2..2 + len]);
                self.bytes_send += len;
                self.sequence_number = self.sequence_number.wrapping_add(1);
                self.errors = 0;
                if !self.configuration.is_streaming() {
                    com.write(&[ACK])?;
                }
                self.recv_state = RecvState::ReadBlockStart(0, 0);
            }
        }
        Ok(())
    }

    /// Read seq + complement + data + check, in one go.
    fn read_block_payload(
        &mut self,
        com: &mut Box<dyn Com>,
        len: usize,
    ) -> Result<Vec<u8>, ComError> {
        let chksum_size = if let Checksum::CRC16 = self.configuration.checksum_mode {
            2
        } else {
            1
        };
        com.read_exact(self.configuration.timeout(), 2 + len + chksum_size)
    }

    fn check_crc(&self, block: &[u8]) -> bool {
        if block.len() < 2 {
            return false;
        }
        match self.configuration.checksum_mode {
            Checksum::Default => {
                let chk = get_checksum(&block[..block.len() - 1]);
                block[block.len() - 1] == chk
            }
            Checksum::CRC16 => {
                let check_crc = crate::crc::get_crc16(&block[..block.len() - 2]);
                let crc = u16::from_be_bytes(block[block.len() - 2..].try_into().unwrap());
                crc == check_crc
            }
        }
    }

    /// Purge pending input and NAK the sender so it resends from the failed
    /// block.
    fn block_error(&mut self, com: &mut Box<dyn Com>, retries: usize) -> TransferResult<()> {
        self.errors += 1;
        if retries + 1 >= 10 {
            return self.too_many_retries(com, retries + 1);
        }
        com.purge()?;
        com.write(&[NAK])?;
        Ok(())
    }

    /// First streamed block failed in 1K/G mode: the sender is not honoring
    /// streaming, fall back to Xmodem-1K.
    fn downgrade_check(&mut self) {
        if self.configuration.variant == XYModemVariant::XModem1kG && self.sequence_number == 2 {
            log::warn!("downgrading transfer to Xmodem-1K");
            self.configuration.downgrade();
        }
    }

    fn finish_file(&mut self, state: &Arc<Mutex<TransferState>>, storage: &mut dyn FileStorageHandler) {
        if let Some(name) = storage.current_file_name() {
            if let Some(fd) = self.files.last_mut() {
                if fd.size == 0 {
                    fd.size = storage.current_file_length();
                }
            }
            state
                .lock()
                .unwrap()
                .receive_state
                .files_finished
                .push(name);
        }
        storage.close();
    }

    fn cancelled_by_remote(
        &mut self,
        com: &mut Box<dyn Com>,
        state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        state
            .lock()
            .unwrap()
            .receive_state
            .log_error("transfer cancelled by sender");
        self.recv_state = RecvState::None;
        super::cancel(com)?;
        Err(TransmissionError::Cancel.into())
    }

    fn too_many_retries(&mut self, com: &mut Box<dyn Com>, retries: usize) -> TransferResult<()> {
        self.recv_state = RecvState::None;
        super::cancel(com)?;
        Err(TransmissionError::TooManyRetries(retries).into())
    }

    fn await_data(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        com.write(&[self.configuration.ncg_byte()])?;
        Ok(())
    }
}
