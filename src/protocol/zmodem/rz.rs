use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

use super::{
    constants::zrinit_flag, constants::zsinit_flag, is_session_abort, is_timeout, read_subpacket,
    CanCounter, EncodeByteMap, Header, HeaderType, TransmissionError, ZFrameType, ZMAXSPLEN,
};
use crate::{
    com::Com,
    options::ZmodemOptions,
    protocol::{
        str_from_null_terminated_utf8_unchecked, CancelRequest, FileDescriptor,
        FileStorageHandler, TransferState,
    },
    TransferResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Idle,
    /// Our ZCHALLENGE is out, the sender must echo it in a ZACK.
    AwaitChallengeAck,
    /// ZRINIT sent; ZRQINIT, ZSINIT, ZFILE or ZFIN may arrive.
    Await,
    /// ZRPOS sent; waiting for ZDATA at our offset, or ZEOF.
    AwaitZDATA,
    /// Consuming the subpacket stream of a ZDATA frame.
    AwaitFileData,
}

/// What we sent last, for resending after a timeout or a ZNAK.
#[derive(Debug, Clone, Copy)]
enum LastSent {
    None,
    ZRInit,
    ZRPos(u32),
    Challenge(u32),
}

/// Zmodem receiver.
pub struct Rz {
    state: RecvState,
    options: ZmodemOptions,
    block_length: usize,

    pub files: Vec<FileDescriptor>,
    pub errors: usize,
    can: CanCounter,
    encode_map: EncodeByteMap,
    last_sent: LastSent,

    cur_offset: usize,
    subpacket_crc32: bool,
    challenge_value: u32,
    sender_flags: u8,
}

impl Rz {
    pub fn new(block_length: usize, options: ZmodemOptions) -> Self {
        Self {
            state: RecvState::Idle,
            options,
            block_length,
            files: Vec::new(),
            errors: 0,
            can: CanCounter::new(),
            encode_map: EncodeByteMap::new(options.escape_control_chars, false),
            last_sent: LastSent::None,
            cur_offset: 0,
            subpacket_crc32: false,
            challenge_value: 0,
            sender_flags: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != RecvState::Idle
    }

    pub fn finish(&mut self) {
        self.state = RecvState::Idle;
    }

    pub fn recv(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        self.errors = 0;
        if self.options.download.issue_zchallenge {
            self.challenge_value = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0x55AA_55AA);
            self.send_header(
                com,
                Header::from_number(HeaderType::Hex, ZFrameType::Challenge, self.challenge_value),
            )?;
            self.last_sent = LastSent::Challenge(self.challenge_value);
            self.state = RecvState::AwaitChallengeAck;
        } else {
            self.send_zrinit(com)?;
            self.state = RecvState::Await;
        }
        Ok(())
    }

    pub fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
        storage: &mut dyn FileStorageHandler,
    ) -> TransferResult<()> {
        if self.state == RecvState::Idle {
            return Ok(());
        }
        if let Ok(state) = &mut transfer_state.lock() {
            let transfer_info = &mut state.receive_state;
            if let Some(fd) = self.files.last() {
                transfer_info.file_name = fd.file_name.clone();
                transfer_info.file_size = fd.size;
            }
            transfer_info.bytes_transfered = self.cur_offset;
            transfer_info.errors = self.errors;
            transfer_info.check_size = if self.options.use_crc32 {
                "Crc32".to_string()
            } else {
                "Crc16".to_string()
            };
            transfer_info.update_bps();
        }
        if self.errors >= 10 {
            self.state = RecvState::Idle;
            super::Zmodem::cancel(com)?;
            return Err(TransmissionError::TooManyErrors(self.errors).into());
        }

        // A pending skip closes the current file; the sender jumps to the
        // next one when it sees our ZSKIP.
        if self.state == RecvState::AwaitZDATA || self.state == RecvState::AwaitFileData {
            let skip = transfer_state.lock().unwrap().take_skip_request();
            if skip != CancelRequest::None {
                if skip == CancelRequest::DeletePartial {
                    storage.delete_current_file();
                } else {
                    storage.close();
                }
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Skip))?;
                self.state = RecvState::Await;
                return Ok(());
            }
        }

        match self.state {
            RecvState::Idle => {}

            RecvState::AwaitChallengeAck => match Header::read(com, &mut self.can) {
                Ok(header) => {
                    if header.frame_type == ZFrameType::Ack {
                        if header.number() != self.challenge_value {
                            self.state = RecvState::Idle;
                            super::Zmodem::cancel(com)?;
                            return Err(anyhow::anyhow!(
                                "ZCHALLENGE answer mismatch: got {:08X} expected {:08X}",
                                header.number(),
                                self.challenge_value
                            ));
                        }
                        self.send_zrinit(com)?;
                        self.state = RecvState::Await;
                    } else {
                        // Sender ignored the challenge (common), proceed.
                        self.send_zrinit(com)?;
                        self.state = RecvState::Await;
                    }
                }
                Err(err) => return self.handle_read_error(com, err),
            },

            RecvState::Await | RecvState::AwaitZDATA => {
                match Header::read(com, &mut self.can) {
                    Ok(header) => {
                        // Any frame that validated resets the consecutive
                        // error count, even one we then argue with.
                        self.errors = 0;
                        self.dispatch_header(com, header, transfer_state, storage)?;
                    }
                    Err(err) => return self.handle_read_error(com, err),
                }
            }

            RecvState::AwaitFileData => {
                match read_subpacket(
                    com,
                    self.block_length.max(ZMAXSPLEN),
                    self.subpacket_crc32,
                    &mut self.can,
                ) {
                    Ok((data, last, expect_ack)) => {
                        storage.append(&data);
                        self.cur_offset += data.len();
                        self.errors = 0;
                        if expect_ack {
                            self.send_header(
                                com,
                                Header::from_number(
                                    HeaderType::Hex,
                                    ZFrameType::Ack,
                                    self.cur_offset as u32,
                                ),
                            )?;
                        }
                        if last {
                            self.state = RecvState::AwaitZDATA;
                        }
                    }
                    Err(err) => {
                        if is_session_abort(&err) {
                            self.state = RecvState::Idle;
                            return Err(err);
                        }
                        // Bad subpacket: drop everything in flight, then ask
                        // the sender to rewind to the last byte we trust.
                        self.errors += 1;
                        com.purge()?;
                        self.request_position(com, self.cur_offset as u32)?;
                        self.state = RecvState::AwaitZDATA;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_header(
        &mut self,
        com: &mut Box<dyn Com>,
        header: Header,
        transfer_state: &Arc<Mutex<TransferState>>,
        storage: &mut dyn FileStorageHandler,
    ) -> TransferResult<()> {
        match header.frame_type {
            ZFrameType::RQInit => {
                self.send_zrinit(com)?;
                self.errors = 0;
            }

            ZFrameType::SInit => {
                let use_crc32 = header.header_type == HeaderType::Bin32;
                match read_subpacket(com, ZMAXSPLEN, use_crc32, &mut self.can) {
                    Ok(_attn) => {
                        self.sender_flags = header.f0();
                        if self.sender_flags & zsinit_flag::TESCCTL != 0
                            || self.sender_flags & zsinit_flag::TESC8 != 0
                        {
                            self.encode_map.set_escaping(
                                self.sender_flags & zsinit_flag::TESCCTL != 0,
                                self.sender_flags & zsinit_flag::TESC8 != 0,
                            );
                        }
                        self.send_header(
                            com,
                            Header::from_number(HeaderType::Hex, ZFrameType::Ack, 0),
                        )?;
                        self.errors = 0;
                    }
                    Err(err) => {
                        if is_session_abort(&err) {
                            self.state = RecvState::Idle;
                            return Err(err);
                        }
                        self.errors += 1;
                        self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Nak))?;
                    }
                }
            }

            ZFrameType::File => {
                let use_crc32 = header.header_type == HeaderType::Bin32;
                match read_subpacket(com, ZMAXSPLEN, use_crc32, &mut self.can) {
                    Ok((block, _, _)) => {
                        if transfer_state.lock().unwrap().take_skip_request()
                            != CancelRequest::None
                        {
                            self.send_header(
                                com,
                                Header::empty(HeaderType::Hex, ZFrameType::Skip),
                            )?;
                            return Ok(());
                        }
                        let fd = parse_file_block(&block);
                        let offset = storage.open_file_resume(&fd.file_name, fd.size);
                        self.cur_offset = offset;
                        transfer_state
                            .lock()
                            .unwrap()
                            .receive_state
                            .log_info(format!("receiving '{}'", fd.file_name));
                        // A ZFILE resent after an error must not be listed
                        // twice.
                        if self.files.last().map(|f| f.file_name.as_str())
                            != Some(fd.file_name.as_str())
                        {
                            self.files.push(fd);
                        }
                        self.errors = 0;
                        self.request_position(com, offset as u32)?;
                        self.state = RecvState::AwaitZDATA;
                    }
                    Err(err) => {
                        if is_session_abort(&err) {
                            self.state = RecvState::Idle;
                            return Err(err);
                        }
                        self.errors += 1;
                        self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Nak))?;
                    }
                }
            }

            ZFrameType::Data => {
                let offset = header.number() as usize;
                if self.files.is_empty() {
                    self.state = RecvState::Idle;
                    super::Zmodem::cancel(com)?;
                    return Err(TransmissionError::ZDataBeforeZFILE.into());
                }
                self.subpacket_crc32 = header.header_type == HeaderType::Bin32;
                if offset == self.cur_offset {
                    self.state = RecvState::AwaitFileData;
                } else if offset < self.cur_offset {
                    // Sender rewound (error recovery): drop what we wrote
                    // past that point.
                    storage.set_current_size_to(offset);
                    self.cur_offset = offset;
                    self.state = RecvState::AwaitFileData;
                } else {
                    // A gap; ask for our position again.
                    self.errors += 1;
                    com.purge()?;
                    self.request_position(com, self.cur_offset as u32)?;
                    self.state = RecvState::AwaitZDATA;
                }
            }

            ZFrameType::Eof => {
                if header.number() as usize != self.cur_offset {
                    self.errors += 1;
                    com.purge()?;
                    self.request_position(com, self.cur_offset as u32)?;
                    self.state = RecvState::AwaitZDATA;
                    return Ok(());
                }
                if let Some(fd) = self.files.last() {
                    if fd.date > 0 {
                        storage.set_file_date(fd.date);
                    }
                }
                if let Some(name) = storage.current_file_name() {
                    transfer_state
                        .lock()
                        .unwrap()
                        .receive_state
                        .files_finished
                        .push(name);
                }
                storage.close();
                self.errors = 0;
                self.send_zrinit(com)?;
                self.state = RecvState::Await;
            }

            ZFrameType::Fin => {
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Fin))?;
                transfer_state
                    .lock()
                    .unwrap()
                    .receive_state
                    .log_info("transfer finished");
                self.state = RecvState::Idle;
            }

            ZFrameType::Ack => {
                // A late answer, e.g. to a ZCHALLENGE the sender processed
                // after we moved on.
            }

            ZFrameType::Challenge => {
                // Not specified for the receiving side; answer anyway.
                self.send_header(
                    com,
                    Header::from_number(HeaderType::Hex, ZFrameType::Ack, header.number()),
                )?;
            }

            ZFrameType::FreeCnt => {
                // 0 means unlimited space; advertising real numbers to an
                // unknown remote is a privacy leak.
                self.send_header(com, Header::from_number(HeaderType::Hex, ZFrameType::Ack, 0))?;
            }

            ZFrameType::Command => {
                let use_crc32 = header.header_type == HeaderType::Bin32;
                if let Ok((block, _, _)) =
                    read_subpacket(com, ZMAXSPLEN, use_crc32, &mut self.can)
                {
                    let cmd = str_from_null_terminated_utf8_unchecked(&block);
                    log::warn!("remote wanted to execute '{cmd}' on this system (not executed)");
                }
                self.send_header(
                    com,
                    Header::from_number(HeaderType::Hex, ZFrameType::Compl, 0),
                )?;
            }

            ZFrameType::Nak => {
                self.errors += 1;
                self.resend_last(com)?;
            }

            ZFrameType::Abort | ZFrameType::FErr | ZFrameType::Can => {
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Fin))?;
                transfer_state
                    .lock()
                    .unwrap()
                    .receive_state
                    .log_error("transfer cancelled by sender");
                storage.close();
                self.state = RecvState::Idle;
            }

            unk_frame => {
                self.errors += 1;
                log::error!("unsupported frame {unk_frame:?}");
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Nak))?;
            }
        }
        Ok(())
    }

    fn handle_read_error(
        &mut self,
        com: &mut Box<dyn Com>,
        err: anyhow::Error,
    ) -> TransferResult<()> {
        if is_session_abort(&err) {
            // Session Abort sequence: stop without emitting another byte.
            self.state = RecvState::Idle;
            return Err(err);
        }
        self.errors += 1;
        if !is_timeout(&err) {
            log::error!("error reading header: {err}");
        }
        // Repeating our last header is always safe: another ZRINIT just
        // re-invites, another ZRPOS re-requests the offset we already
        // committed to.
        match self.last_sent {
            LastSent::None => {
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Nak))?;
            }
            _ => self.resend_last(com)?,
        }
        Ok(())
    }

    fn resend_last(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        match self.last_sent {
            LastSent::None => Ok(()),
            LastSent::ZRInit => self.send_zrinit(com),
            LastSent::ZRPos(offset) => self.request_position(com, offset),
            LastSent::Challenge(value) => self.send_header(
                com,
                Header::from_number(HeaderType::Hex, ZFrameType::Challenge, value),
            ),
        }
    }

    fn request_position(&mut self, com: &mut Box<dyn Com>, offset: u32) -> TransferResult<()> {
        self.send_header(
            com,
            Header::from_number(HeaderType::Hex, ZFrameType::RPos, offset),
        )?;
        self.last_sent = LastSent::ZRPos(offset);
        Ok(())
    }

    pub fn send_zrinit(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        let mut flags = zrinit_flag::CANFDX | zrinit_flag::CANOVIO;
        if self.options.use_crc32 {
            flags |= zrinit_flag::CANFC32;
        }
        if self.options.escape_control_chars {
            flags |= zrinit_flag::ESCCTL;
        }
        self.send_header(
            com,
            Header::from_flags(HeaderType::Hex, ZFrameType::RInit, 0, 0, 0, flags),
        )?;
        self.last_sent = LastSent::ZRInit;
        Ok(())
    }

    fn send_header(&mut self, com: &mut Box<dyn Com>, header: Header) -> TransferResult<()> {
        header.write(com, &self.encode_map)?;
        Ok(())
    }
}

/// Parse the ZFILE data subpacket: `name NUL size mtime mode serial
/// files-left bytes-left`. Size is decimal, mtime and mode octal; all
/// fields after the name are optional.
fn parse_file_block(block: &[u8]) -> FileDescriptor {
    let mut fd = FileDescriptor::new();
    fd.file_name = str_from_null_terminated_utf8_unchecked(block);
    let rest_start = (fd.file_name.len() + 1).min(block.len());
    let meta = str_from_null_terminated_utf8_unchecked(&block[rest_start..]);
    let mut parts = meta.split_whitespace();
    if let Some(size) = parts.next() {
        fd.size = size.parse().unwrap_or(0);
    }
    if let Some(mtime) = parts.next() {
        fd.date = u64::from_str_radix(mtime, 8).unwrap_or(0);
    }
    fd
}
