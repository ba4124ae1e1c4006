use std::{
    cmp::min,
    sync::{Arc, Mutex},
};

use super::{
    constants::{ACK, CAN, CPMEOF, DEFAULT_BLOCK_LENGTH, EOT, EXT_BLOCK_LENGTH, NAK, SOH, STX},
    err::TransmissionError,
    get_checksum, Checksum, XYModemConfiguration,
};
use crate::{
    com::{Com, ComError},
    protocol::{FileDescriptor, TransferState},
    TransferResult,
};

#[derive(Debug)]
pub enum SendState {
    None,
    /// Waiting for the receiver's NAK/'C'/'G' start byte.
    InitiateSend(usize),
    SendYModemHeader(usize),
    AckSendYModemHeader(usize),
    SendData(usize),
    AckSendData(usize),
    SendEOT(usize),
    AckEOT(u8, usize),
    /// Ymodem end-of-batch: send the empty block 0, await its ACK.
    EndOfBatch(usize),
}

/// Xmodem/Ymodem sender.
pub struct Sy {
    configuration: XYModemConfiguration,
    checksum_mode: Checksum,
    streaming_mode: bool,

    pub files: Vec<FileDescriptor>,
    cur_file: usize,
    data: Vec<u8>,

    pub bytes_send: usize,
    cur_offset: usize,
    last_block_offset: usize,
    block_number: u8,
    errors: usize,
    send_state: SendState,
}

impl Sy {
    pub fn new(configuration: XYModemConfiguration) -> Self {
        Self {
            configuration,
            checksum_mode: configuration.checksum_mode,
            streaming_mode: configuration.is_streaming(),
            send_state: SendState::None,
            files: Vec::new(),
            data: Vec::new(),
            errors: 0,
            bytes_send: 0,
            cur_offset: 0,
            last_block_offset: 0,
            block_number: 1,
            cur_file: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.send_state, SendState::None)
    }

    pub fn finish(&mut self) {
        self.send_state = SendState::None;
    }

    pub fn send(&mut self, files: Vec<FileDescriptor>) -> TransferResult<()> {
        self.files = files;
        self.cur_file = 0;
        self.bytes_send = 0;
        if !self.configuration.is_ymodem() {
            self.data = self.files[0].get_data()?;
        }
        self.send_state = SendState::InitiateSend(0);
        Ok(())
    }

    pub fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        if let Ok(state) = &mut state.lock() {
            let transfer_info = &mut state.send_state;
            if let Some(file) = self.files.get(self.cur_file) {
                transfer_info.file_name = file.file_name.clone();
                transfer_info.file_size = file.size;
            }
            transfer_info.bytes_transfered = self.bytes_send;
            transfer_info.errors = self.errors;
            transfer_info.check_size = self.configuration.get_check_and_size();
            transfer_info.update_bps();
        }

        match self.send_state {
            SendState::None => {}

            SendState::InitiateSend(retries) => {
                state.lock().unwrap().current_state = "Initiate send...";
                match self.read_mode(com) {
                    Ok(()) => {
                        if self.configuration.is_ymodem() {
                            self.send_state = SendState::SendYModemHeader(0);
                        } else {
                            self.block_number = 1;
                            self.cur_offset = 0;
                            self.send_state = SendState::SendData(0);
                        }
                    }
                    Err(ComError::Timeout) => {
                        self.errors += 1;
                        if retries + 1 >= 10 {
                            return self.too_many_retries(com, retries + 1);
                        }
                        self.send_state = SendState::InitiateSend(retries + 1);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            SendState::SendYModemHeader(retries) => {
                if self.cur_file >= self.files.len() {
                    self.send_state = SendState::EndOfBatch(0);
                    return Ok(());
                }
                state.lock().unwrap().current_state = "Send header...";
                self.block_number = 0;
                let fd = &self.files[self.cur_file];
                let mut block = Vec::new();
                block.extend_from_slice(fd.file_name.as_bytes());
                block.push(0);
                if fd.date > 0 {
                    block.extend_from_slice(format!("{} {:o}", fd.size, fd.date).as_bytes());
                } else {
                    block.extend_from_slice(format!("{}", fd.size).as_bytes());
                }
                self.data = fd.get_data()?;
                self.send_block(com, &block, 0)?;
                self.send_state = SendState::AckSendYModemHeader(retries);
            }

            SendState::AckSendYModemHeader(retries) => {
                state.lock().unwrap().current_state = "Wait for header acknowledge...";
                if self.streaming_mode {
                    // -G receivers acknowledge nothing, they just ask for the
                    // data with another 'G'.
                    match self.expect_char(com, b'G') {
                        Ok(true) => {
                            self.block_number = 1;
                            self.cur_offset = 0;
                            self.send_state = SendState::SendData(0);
                        }
                        Ok(false) => {
                            return self.header_nak(com, retries);
                        }
                        Err(ComError::Timeout) => {
                            return self.header_nak(com, retries);
                        }
                        Err(err) => return Err(err.into()),
                    }
                    return Ok(());
                }
                match com.read_char(self.configuration.timeout()) {
                    Ok(ACK) => {
                        // The NCG for the file body follows the ACK; tolerate
                        // receivers that skip it.
                        let _ = com.read_char(self.configuration.timeout());
                        self.block_number = 1;
                        self.cur_offset = 0;
                        self.send_state = SendState::SendData(0);
                    }
                    Ok(CAN) => return self.check_cancel(com, state),
                    Ok(_) => return self.header_nak(com, retries),
                    Err(ComError::Timeout) => return self.header_nak(com, retries),
                    Err(err) => return Err(err.into()),
                }
            }

            SendState::SendData(retries) => {
                state.lock().unwrap().current_state = "Send data...";
                if self.cur_offset >= self.data.len() {
                    self.send_state = SendState::SendEOT(0);
                    return Ok(());
                }
                self.send_data_block(com, self.cur_offset)?;
                if self.streaming_mode {
                    self.bytes_send = self.cur_offset;
                    self.send_state = SendState::SendData(0);
                } else {
                    self.send_state = SendState::AckSendData(retries);
                }
            }

            SendState::AckSendData(retries) => {
                match com.read_char(self.configuration.timeout()) {
                    Ok(ACK) => {
                        self.bytes_send = self.cur_offset;
                        self.errors = 0;
                        self.send_state = SendState::SendData(0);
                    }
                    Ok(CAN) => return self.check_cancel(com, state),
                    Ok(_) => {
                        // NAK or noise: resend the last block.
                        self.errors += 1;
                        if retries + 1 >= 10 {
                            return self.too_many_retries(com, retries + 1);
                        }
                        self.resend_last_block();
                        self.send_state = SendState::SendData(retries + 1);
                    }
                    Err(ComError::Timeout) => {
                        self.errors += 1;
                        if retries + 1 >= 10 {
                            return self.too_many_retries(com, retries + 1);
                        }
                        self.resend_last_block();
                        self.send_state = SendState::SendData(retries + 1);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            SendState::SendEOT(retries) => {
                state.lock().unwrap().current_state = "End of file...";
                com.write(&[EOT])?;
                self.send_state = SendState::AckEOT(0, retries);
            }

            SendState::AckEOT(step, retries) => {
                match com.read_char(self.configuration.timeout()) {
                    Ok(NAK) if step == 0 => {
                        // Ymodem receivers NAK the first EOT on purpose.
                        com.write(&[EOT])?;
                        self.send_state = SendState::AckEOT(1, retries);
                    }
                    Ok(ACK) => {
                        if self.configuration.is_ymodem() {
                            // Wait for the NCG of the next block 0.
                            match self.expect_start_byte(com) {
                                Ok(()) => {
                                    self.cur_file += 1;
                                    self.send_state = SendState::SendYModemHeader(0);
                                }
                                Err(ComError::Timeout) => {
                                    self.errors += 1;
                                    if retries + 1 >= 10 {
                                        return self.too_many_retries(com, retries + 1);
                                    }
                                    self.send_state = SendState::AckEOT(step, retries + 1);
                                }
                                Err(err) => return Err(err.into()),
                            }
                        } else {
                            self.send_state = SendState::None;
                        }
                    }
                    Ok(CAN) => return self.check_cancel(com, state),
                    Ok(_) | Err(ComError::Timeout) => {
                        self.errors += 1;
                        if retries + 1 >= 10 {
                            return self.too_many_retries(com, retries + 1);
                        }
                        self.send_state = SendState::SendEOT(retries + 1);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            SendState::EndOfBatch(retries) => {
                state.lock().unwrap().current_state = "End of batch...";
                self.block_number = 0;
                self.send_block(com, &[0], 0)?;
                if self.streaming_mode {
                    self.send_state = SendState::None;
                    return Ok(());
                }
                match com.read_char(self.configuration.timeout()) {
                    Ok(ACK) => self.send_state = SendState::None,
                    Ok(_) | Err(ComError::Timeout) => {
                        self.errors += 1;
                        if retries + 1 >= 10 {
                            return self.too_many_retries(com, retries + 1);
                        }
                        self.send_state = SendState::EndOfBatch(retries + 1);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Wait for the receiver's start byte and configure checksum/streaming
    /// from it.
    fn read_mode(&mut self, com: &mut Box<dyn Com>) -> Result<(), ComError> {
        let ch = com.read_char(self.configuration.timeout())?;
        match ch {
            NAK => {
                self.checksum_mode = Checksum::Default;
                self.streaming_mode = false;
                Ok(())
            }
            b'C' => {
                self.checksum_mode = Checksum::CRC16;
                self.streaming_mode = false;
                Ok(())
            }
            b'G' => {
                self.checksum_mode = Checksum::CRC16;
                self.streaming_mode = true;
                Ok(())
            }
            CAN => Err(ComError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                TransmissionError::Cancel.to_string(),
            ))),
            _ => Err(ComError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                TransmissionError::InvalidMode(ch).to_string(),
            ))),
        }
    }

    fn expect_char(&mut self, com: &mut Box<dyn Com>, expected: u8) -> Result<bool, ComError> {
        Ok(com.read_char(self.configuration.timeout())? == expected)
    }

    fn expect_start_byte(&mut self, com: &mut Box<dyn Com>) -> Result<(), ComError> {
        let ch = com.read_char(self.configuration.timeout())?;
        if ch == b'C' || ch == b'G' || ch == NAK {
            Ok(())
        } else {
            Err(ComError::Timeout)
        }
    }

    fn header_nak(&mut self, com: &mut Box<dyn Com>, retries: usize) -> TransferResult<()> {
        self.errors += 1;
        if retries + 1 >= 10 {
            return self.too_many_retries(com, retries + 1);
        }
        self.send_state = SendState::SendYModemHeader(retries + 1);
        Ok(())
    }

    fn send_block(&mut self, com: &mut Box<dyn Com>, data: &[u8], pad_byte: u8) -> TransferResult<()> {
        let block_len = if data.len() <= DEFAULT_BLOCK_LENGTH {
            DEFAULT_BLOCK_LENGTH
        } else {
            EXT_BLOCK_LENGTH
        };

        let mut block = Vec::with_capacity(block_len + 5);
        block.push(if block_len == DEFAULT_BLOCK_LENGTH { SOH } else { STX });
        block.push(self.block_number);
        block.push(!self.block_number);
        block.extend_from_slice(data);
        block.resize(block_len + 3, pad_byte);

        match self.checksum_mode {
            Checksum::Default => {
                let chk_sum = get_checksum(&block[3..]);
                block.push(chk_sum);
            }
            Checksum::CRC16 => {
                let crc = crate::crc::get_crc16(&block[3..]);
                block.extend_from_slice(&u16::to_be_bytes(crc));
            }
        }
        com.write(&block)?;
        self.block_number = self.block_number.wrapping_add(1);
        Ok(())
    }

    /// Send the block at `offset`, padding a short tail with CPM EOF. The
    /// final partial block drops back to 128 bytes when it fits.
    fn send_data_block(&mut self, com: &mut Box<dyn Com>, offset: usize) -> TransferResult<()> {
        let remaining = self.data.len() - offset;
        let block_length = if self.configuration.block_length == EXT_BLOCK_LENGTH
            && remaining > DEFAULT_BLOCK_LENGTH
        {
            EXT_BLOCK_LENGTH
        } else {
            DEFAULT_BLOCK_LENGTH
        };
        let block_end = min(offset + block_length, self.data.len());

        self.last_block_offset = offset;
        let chunk = self.data[offset..block_end].to_vec();
        // Force the frame size even when the chunk is shorter than 128.
        let mut padded = chunk;
        padded.resize(block_length, CPMEOF);
        self.send_block(com, &padded, CPMEOF)?;
        self.cur_offset = block_end;
        Ok(())
    }

    fn resend_last_block(&mut self) {
        self.cur_offset = self.last_block_offset;
        self.block_number = self.block_number.wrapping_sub(1);
    }

    fn check_cancel(
        &mut self,
        com: &mut Box<dyn Com>,
        state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        // A single stray CAN can be line noise; two in a row cancel.
        let can2 = com.read_char(self.configuration.timeout());
        if matches!(can2, Ok(CAN)) {
            state
                .lock()
                .unwrap()
                .send_state
                .log_error("transfer cancelled by receiver");
            self.send_state = SendState::None;
            return Err(TransmissionError::Cancel.into());
        }
        self.errors += 1;
        Ok(())
    }

    fn too_many_retries(&mut self, com: &mut Box<dyn Com>, retries: usize) -> TransferResult<()> {
        self.send_state = SendState::None;
        super::cancel(com)?;
        Err(TransmissionError::TooManyRetries(retries).into())
    }
}
