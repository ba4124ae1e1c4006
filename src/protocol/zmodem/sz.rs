use std::{
    cmp::min,
    sync::{Arc, Mutex},
};

use super::{
    constants::zfile_flag, constants::zrinit_flag, constants::zsinit_flag, encode_subpacket,
    is_session_abort, is_timeout, CanCounter, EncodeByteMap, Header, HeaderType,
    TransmissionError, ZFrameType, ZCRCE, ZCRCG, ZCRCQ, ZCRCW,
};
use crate::{
    com::Com,
    options::ZmodemOptions,
    protocol::{FileDescriptor, TransferState},
    TransferResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    /// Send (or resend) the opening ZRQINIT.
    SendZRQInit,
    /// Waiting for the receiver's next header.
    Await,
    /// Send a ZDATA header at the current file position.
    SendZDATA,
    /// Streaming data subpackets.
    SendDataPackages,
}

#[derive(Debug, Clone, Copy)]
enum LastSent {
    None,
    ZRQInit,
    ZSInit,
    ZFile,
    ZEof(u32),
    ZFin,
}

/// Zmodem sender.
pub struct Sz {
    state: SendState,
    options: ZmodemOptions,
    pub package_len: usize,

    pub files: Vec<FileDescriptor>,
    cur_file: usize,
    cur_file_pos: usize,
    data: Vec<u8>,
    pub errors: usize,

    can: CanCounter,
    encode_map: EncodeByteMap,
    last_sent: LastSent,

    receiver_capabilities: u8,
    use_crc32: bool,
    /// Receiver advertised a zero buffer size: full streaming allowed.
    nonstop: bool,
    transferred_file: bool,
    sent_zsinit: bool,
}

impl Sz {
    pub fn new(block_length: usize, options: ZmodemOptions) -> Self {
        Self {
            state: SendState::Idle,
            options,
            package_len: block_length,
            files: Vec::new(),
            cur_file: 0,
            cur_file_pos: 0,
            data: Vec::new(),
            errors: 0,
            can: CanCounter::new(),
            encode_map: EncodeByteMap::new(options.escape_control_chars, false),
            last_sent: LastSent::None,
            receiver_capabilities: 0,
            use_crc32: false,
            nonstop: true,
            transferred_file: false,
            sent_zsinit: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != SendState::Idle
    }

    pub fn finish(&mut self) {
        self.state = SendState::Idle;
    }

    pub fn send(&mut self, files: Vec<FileDescriptor>) {
        self.files = files;
        self.cur_file = 0;
        self.cur_file_pos = 0;
        self.errors = 0;
        self.transferred_file = false;
        self.sent_zsinit = false;
        self.state = SendState::SendZRQInit;
    }

    fn can_use_crc32(&self) -> bool {
        self.receiver_capabilities & zrinit_flag::CANFC32 != 0
    }

    fn receiver_wants_escaping(&self) -> bool {
        self.receiver_capabilities & zrinit_flag::ESCCTL != 0
    }

    fn receiver_wants_8bit_escaping(&self) -> bool {
        self.receiver_capabilities & zrinit_flag::ESC8 != 0
    }

    fn header_type(&self) -> HeaderType {
        if self.use_crc32 {
            HeaderType::Bin32
        } else {
            HeaderType::Bin
        }
    }

    pub fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        if self.state == SendState::Idle {
            return Ok(());
        }
        if let Ok(state) = &mut transfer_state.lock() {
            let transfer_info = &mut state.send_state;
            if let Some(fd) = self.files.get(self.cur_file) {
                transfer_info.file_name = fd.file_name.clone();
                transfer_info.file_size = fd.size;
            }
            transfer_info.bytes_transfered = self.cur_file_pos;
            transfer_info.errors = self.errors;
            transfer_info.check_size = format!(
                "{}/{}",
                if self.use_crc32 { "Crc32" } else { "Crc16" },
                self.package_len
            );
            transfer_info.update_bps();
        }
        if self.errors >= 10 {
            self.state = SendState::Idle;
            super::Zmodem::cancel(com)?;
            return Err(TransmissionError::TooManyErrors(self.errors).into());
        }

        match self.state {
            SendState::Idle => {}

            SendState::SendZRQInit => {
                transfer_state.lock().unwrap().current_state = "Negotiating transfer";
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::RQInit))?;
                self.last_sent = LastSent::ZRQInit;
                self.state = SendState::Await;
            }

            SendState::Await => match Header::read(com, &mut self.can) {
                Ok(header) => {
                    self.errors = 0;
                    self.dispatch_header(com, header, transfer_state)?;
                }
                Err(err) => return self.handle_read_error(com, err),
            },

            SendState::SendZDATA => {
                transfer_state.lock().unwrap().current_state = "Sending data";
                self.send_header_num(
                    com,
                    ZFrameType::Data,
                    self.cur_file_pos as u32,
                    self.header_type(),
                )?;
                self.state = SendState::SendDataPackages;
            }

            SendState::SendDataPackages => {
                // A ZRPOS or ZSKIP can arrive at any point of the stream;
                // look before pushing the next subpacket.
                if com.is_data_available()? {
                    match Header::read(com, &mut self.can) {
                        Ok(header) => {
                            self.errors = 0;
                            match header.frame_type {
                                ZFrameType::RPos => {
                                    self.cur_file_pos =
                                        (header.number() as usize).min(self.data.len());
                                    self.state = SendState::SendZDATA;
                                    return Ok(());
                                }
                                ZFrameType::Ack => { /* flow info only */ }
                                ZFrameType::Skip => {
                                    self.next_file();
                                    self.send_zfile(com)?;
                                    return Ok(());
                                }
                                ZFrameType::Nak => {
                                    self.state = SendState::SendZDATA;
                                    return Ok(());
                                }
                                other => {
                                    self.errors += 1;
                                    log::error!("unexpected header during data stream: {other:?}");
                                    return Ok(());
                                }
                            }
                        }
                        Err(err) => return self.handle_read_error(com, err),
                    }
                }

                let end_pos = min(self.data.len(), self.cur_file_pos + self.package_len);
                let chunk = &self.data[self.cur_file_pos..end_pos];
                let is_last = end_pos >= self.data.len();
                let crc_byte = match (self.nonstop, is_last) {
                    (true, false) => ZCRCG,
                    (true, true) => ZCRCE,
                    (false, false) => ZCRCQ,
                    (false, true) => ZCRCW,
                };
                let mut packet =
                    encode_subpacket(crc_byte, chunk, self.use_crc32, &self.encode_map);
                self.cur_file_pos = end_pos;

                if is_last {
                    packet.extend_from_slice(
                        &Header::from_number(
                            self.header_type(),
                            ZFrameType::Eof,
                            end_pos as u32,
                        )
                        .build(&self.encode_map),
                    );
                    self.last_sent = LastSent::ZEof(end_pos as u32);
                    self.transferred_file = true;
                    self.state = SendState::Await;
                }
                com.write(&packet)?;

                if !self.nonstop && !is_last {
                    // Window limited: wait for the ZACK before the next
                    // subpacket.
                    match Header::read(com, &mut self.can) {
                        Ok(header) => match header.frame_type {
                            ZFrameType::Ack => self.errors = 0,
                            ZFrameType::RPos => {
                                self.cur_file_pos =
                                    (header.number() as usize).min(self.data.len());
                                self.state = SendState::SendZDATA;
                            }
                            other => {
                                self.errors += 1;
                                log::error!("unexpected answer to subpacket: {other:?}");
                            }
                        },
                        Err(err) => return self.handle_read_error(com, err),
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
    ) -> TransferResult<()> {
        match header.frame_type {
            ZFrameType::RInit => {
                if self.transferred_file {
                    self.next_file();
                    self.transferred_file = false;
                }
                if self.cur_file >= self.files.len() {
                    self.send_zfin(com)?;
                    return Ok(());
                }

                self.receiver_capabilities = header.f0();
                self.use_crc32 = self.options.use_crc32 && self.can_use_crc32();
                self.encode_map.set_escaping(
                    self.options.escape_control_chars || self.receiver_wants_escaping(),
                    self.receiver_wants_8bit_escaping(),
                );
                let buffer_size =
                    usize::from(header.p0()) | (usize::from(header.p1()) << 8);
                self.nonstop = buffer_size == 0;
                if buffer_size != 0 {
                    self.package_len = self.package_len.min(buffer_size);
                }

                if self.sent_zsinit {
                    self.send_zfile(com)?;
                } else {
                    self.send_zsinit(com)?;
                }
            }

            ZFrameType::Ack => {
                if matches!(self.last_sent, LastSent::ZSInit) {
                    self.send_zfile(com)?;
                }
            }

            ZFrameType::Challenge => {
                // Echo the value back so the receiver knows a real program
                // is on this end.
                self.send_header_num(com, ZFrameType::Ack, header.number(), HeaderType::Hex)?;
            }

            ZFrameType::RPos => {
                self.cur_file_pos = (header.number() as usize).min(self.data.len());
                self.state = SendState::SendZDATA;
            }

            ZFrameType::Skip => {
                transfer_state
                    .lock()
                    .unwrap()
                    .send_state
                    .log_info("receiver skipped the file");
                self.next_file();
                self.send_zfile(com)?;
            }

            ZFrameType::Nak => {
                self.errors += 1;
                self.resend_last(com)?;
            }

            ZFrameType::Fin => {
                com.write(b"OO")?;
                transfer_state
                    .lock()
                    .unwrap()
                    .send_state
                    .log_info("transfer finished");
                self.state = SendState::Idle;
            }

            ZFrameType::Abort | ZFrameType::FErr | ZFrameType::Can => {
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Fin))?;
                transfer_state
                    .lock()
                    .unwrap()
                    .send_state
                    .log_error("transfer cancelled by receiver");
                self.state = SendState::Idle;
                return Err(TransmissionError::UnsupportedFrame(header.frame_type).into());
            }

            unk_frame => {
                self.errors += 1;
                log::error!("unsupported frame {unk_frame:?}");
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
            self.state = SendState::Idle;
            return Err(err);
        }
        self.errors += 1;
        if !is_timeout(&err) {
            log::error!("error reading header: {err}");
        }
        // Timeout or garble: repeat whatever we said last so the receiver
        // can re-answer.
        self.resend_last(com)?;
        Ok(())
    }

    fn resend_last(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        match self.last_sent {
            LastSent::None => Ok(()),
            LastSent::ZRQInit => {
                self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::RQInit))
            }
            LastSent::ZSInit => self.send_zsinit(com),
            LastSent::ZFile => self.send_zfile(com),
            LastSent::ZEof(pos) => {
                self.send_header_num(com, ZFrameType::Eof, pos, self.header_type())
            }
            LastSent::ZFin => self.send_zfin(com),
        }
    }

    fn next_file(&mut self) {
        self.cur_file += 1;
        self.cur_file_pos = 0;
    }

    fn send_zsinit(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        let flags = if self.options.escape_control_chars {
            zsinit_flag::TESCCTL
        } else {
            0
        };
        // rz only understands a binary ZSINIT when CRC32 was negotiated.
        let header_type = if self.use_crc32 {
            HeaderType::Bin32
        } else {
            HeaderType::Hex
        };
        let mut packet =
            Header::from_flags(header_type, ZFrameType::SInit, 0, 0, 0, flags)
                .build(&self.encode_map);
        // Empty attention string.
        packet.extend_from_slice(&encode_subpacket(
            ZCRCW,
            &[0],
            self.use_crc32,
            &self.encode_map,
        ));
        com.write(&packet)?;
        self.last_sent = LastSent::ZSInit;
        self.sent_zsinit = true;
        Ok(())
    }

    fn send_zfile(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        if self.cur_file >= self.files.len() {
            self.send_zfin(com)?;
            return Ok(());
        }
        let fd = &self.files[self.cur_file];
        self.data = fd.get_data()?;
        self.cur_file_pos = 0;

        let mut packet = Header::from_flags(
            self.header_type(),
            ZFrameType::File,
            0,
            0,
            0,
            zfile_flag::ZCBIN,
        )
        .build(&self.encode_map);

        let files_left = self.files.len() - self.cur_file;
        let bytes_left: usize = self.files.iter().skip(self.cur_file).map(|f| f.size).sum();
        let mut meta = Vec::new();
        meta.extend_from_slice(fd.file_name.as_bytes());
        meta.push(0);
        meta.extend_from_slice(
            format!(
                "{} {:o} 0 0 {} {}",
                fd.size, fd.date, files_left, bytes_left
            )
            .as_bytes(),
        );
        packet.extend_from_slice(&encode_subpacket(
            ZCRCW,
            &meta,
            self.use_crc32,
            &self.encode_map,
        ));
        com.write(&packet)?;
        self.last_sent = LastSent::ZFile;
        self.state = SendState::Await;
        Ok(())
    }

    fn send_zfin(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        self.send_header(com, Header::empty(HeaderType::Hex, ZFrameType::Fin))?;
        self.last_sent = LastSent::ZFin;
        self.state = SendState::Await;
        Ok(())
    }

    fn send_header(&mut self, com: &mut Box<dyn Com>, header: Header) -> TransferResult<()> {
        header.write(com, &self.encode_map)?;
        Ok(())
    }

    fn send_header_num(
        &mut self,
        com: &mut Box<dyn Com>,
        frame_type: ZFrameType,
        number: u32,
        header_type: HeaderType,
    ) -> TransferResult<()> {
        Header::from_number(header_type, frame_type, number).write(com, &self.encode_map)?;
        Ok(())
    }
}
