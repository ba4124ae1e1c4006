use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{
    constants::DEFAULT_QBIN,
    packet::{read_packet, unchar, CheckType, Encoding, Packet, PacketType},
    parse_attr_date, KermitError, KermitParameters, TransferParameters,
};
use crate::{
    com::{Com, ComError},
    options::KermitOptions,
    protocol::{str_from_null_terminated_utf8_unchecked, FileDescriptor, FileStorageHandler, TransferState},
    TransferResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    None,
    /// Waiting for the S packet.
    AwaitInit,
    /// Waiting for the next F (or the closing B).
    AwaitFile,
    /// Waiting for A, D and finally Z of the open file.
    AwaitData,
}

/// How to open the output file, from the attribute packet's access field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FileAccess {
    #[default]
    New,
    Supersede,
    Warn,
    Append,
}

#[derive(Default)]
struct PendingFile {
    name: String,
    size: usize,
    date: u64,
    access: FileAccess,
    opened: bool,
}

/// Kermit receiver.
pub struct Rk {
    options: KermitOptions,
    state: RecvState,
    params: TransferParameters,
    check_type: CheckType,
    rx_encoding: Encoding,
    /// Next expected sequence number, mod 64.
    seq: u8,
    pub errors: usize,
    streaming: bool,
    pub files: Vec<FileDescriptor>,
    pending: PendingFile,
    bytes_received: usize,
    /// Wire image of our last reply, resent when a duplicate arrives.
    last_reply: Option<Vec<u8>>,
}

impl Rk {
    pub fn new(options: KermitOptions) -> Self {
        let local = Self::local_params(&options);
        Self {
            options,
            state: RecvState::None,
            params: TransferParameters::new(local, KermitParameters::default()),
            check_type: CheckType::Sum6,
            rx_encoding: Encoding {
                qctl: b'#',
                qbin: None,
                rept: None,
            },
            seq: 0,
            errors: 0,
            streaming: false,
            files: Vec::new(),
            pending: PendingFile::default(),
            bytes_received: 0,
            last_reply: None,
        }
    }

    fn local_params(options: &KermitOptions) -> KermitParameters {
        let mut local = KermitParameters::from_options(options);
        if options.force_binary.download {
            local.qbin = DEFAULT_QBIN;
        }
        local
    }

    pub fn is_finished(&self) -> bool {
        self.state == RecvState::None
    }

    pub fn finish(&mut self) {
        self.state = RecvState::None;
    }

    pub fn recv(&mut self) {
        self.state = RecvState::AwaitInit;
        self.seq = 0;
        self.errors = 0;
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.params.local.timeout_secs.max(1)))
    }

    pub fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
        storage: &mut dyn FileStorageHandler,
    ) -> TransferResult<()> {
        if self.state == RecvState::None {
            return Ok(());
        }
        if let Ok(state) = &mut transfer_state.lock() {
            let transfer_info = &mut state.receive_state;
            if let Some(fd) = self.files.last() {
                transfer_info.file_name = fd.file_name.clone();
                transfer_info.file_size = fd.size;
            }
            transfer_info.bytes_transfered = self.bytes_received;
            transfer_info.errors = self.errors;
            transfer_info.check_size = format!("Block check {}", self.check_type as u8);
            transfer_info.update_bps();
        }
        if self.errors >= 10 {
            let msg = KermitError::TooManyRetries(self.errors).to_string();
            self.send_error(com, &msg)?;
            self.state = RecvState::None;
            return Err(KermitError::TooManyRetries(self.errors).into());
        }

        let packet = match read_packet(com, self.timeout(), self.check_type) {
            Ok(packet) => packet,
            Err(err) => return self.handle_read_error(com, err),
        };

        if packet.packet_type == PacketType::Error {
            let msg = str_from_null_terminated_utf8_unchecked(&packet.data);
            transfer_state
                .lock()
                .unwrap()
                .receive_state
                .log_error(format!("remote error: {msg}"));
            self.state = RecvState::None;
            return Err(KermitError::RemoteError(msg).into());
        }

        // The sender missed our last answer and repeated itself: repeat
        // the answer, don't process the packet again.
        if self.state != RecvState::AwaitInit && packet.seq == (self.seq + 63) % 64 {
            if let Some(reply) = &self.last_reply {
                com.write(reply)?;
            }
            return Ok(());
        }
        // Anything else out of sequence is rejected with the number we
        // actually expect.
        if self.state != RecvState::AwaitInit && packet.seq != self.seq {
            self.nak(com)?;
            return Ok(());
        }

        match self.state {
            RecvState::None => {}

            RecvState::AwaitInit => match packet.packet_type {
                PacketType::SendInit => {
                    let remote = KermitParameters::from_data(&packet.data);
                    self.params =
                        TransferParameters::new(Self::local_params(&self.options), remote);
                    // The answer itself still travels with the type 1 check.
                    let reply = Packet::new(
                        PacketType::Ack,
                        packet.seq,
                        self.params.local.to_data(),
                    );
                    self.send_reply(com, &reply)?;

                    let active = self.params.active();
                    self.check_type = active.check_type;
                    self.rx_encoding = self.params.rx_encoding();
                    self.streaming = active.streaming && self.options.streaming;
                    self.seq = 1;
                    self.errors = 0;
                    self.state = RecvState::AwaitFile;
                }
                _ => self.nak(com)?,
            },

            RecvState::AwaitFile => match packet.packet_type {
                PacketType::FileHeader => {
                    let name = String::from_utf8_lossy(&self.rx_encoding.decode(&packet.data))
                        .to_string();
                    self.pending = PendingFile {
                        name: name.clone(),
                        ..PendingFile::default()
                    };
                    let mut fd = FileDescriptor::new();
                    fd.file_name = name;
                    self.files.push(fd);
                    self.advance(com, packet.seq)?;
                    self.state = RecvState::AwaitData;
                }
                PacketType::Break => {
                    self.advance(com, packet.seq)?;
                    transfer_state
                        .lock()
                        .unwrap()
                        .receive_state
                        .log_info("transfer finished");
                    self.state = RecvState::None;
                }
                PacketType::Data => {
                    // A data packet with no open file is unrecoverable.
                    self.send_error(com, "data packet out of order")?;
                    self.state = RecvState::None;
                    return Err(KermitError::PacketOutOfOrder('D').into());
                }
                _ => self.nak(com)?,
            },

            RecvState::AwaitData => match packet.packet_type {
                PacketType::Attributes => {
                    self.parse_attributes(&packet.data);
                    if let Some(fd) = self.files.last_mut() {
                        fd.size = self.pending.size;
                        fd.date = self.pending.date;
                    }
                    self.advance(com, packet.seq)?;
                }
                PacketType::Data => {
                    if !self.pending.opened {
                        self.open_output(storage);
                    }
                    let bytes = self.rx_encoding.decode(&packet.data);
                    storage.append(&bytes);
                    self.bytes_received += bytes.len();
                    self.errors = 0;
                    if self.streaming {
                        // Streaming: data packets are not acknowledged, but
                        // keep our sequence tracking in step.
                        self.seq = (packet.seq + 1) % 64;
                    } else {
                        self.advance(com, packet.seq)?;
                    }
                }
                PacketType::Eof => {
                    if !self.pending.opened {
                        self.open_output(storage);
                    }
                    // A "D" in the data field means the sender discarded
                    // the file.
                    if packet.data.first() == Some(&b'D') {
                        storage.delete_current_file();
                    } else {
                        if self.pending.date > 0 {
                            storage.set_file_date(self.pending.date);
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
                    }
                    self.advance(com, packet.seq)?;
                    self.state = RecvState::AwaitFile;
                }
                _ => self.nak(com)?,
            },
        }
        Ok(())
    }

    fn open_output(&mut self, storage: &mut dyn FileStorageHandler) {
        match self.pending.access {
            FileAccess::Append => {
                storage.open_file_resume(&self.pending.name, self.pending.size);
            }
            _ => storage.open_file(&self.pending.name, self.pending.size),
        }
        self.pending.opened = true;
    }

    /// Attribute fields: one letter, a length character, then the value.
    /// Unknown attributes are skipped by their length.
    fn parse_attributes(&mut self, data: &[u8]) {
        let mut i = 0;
        while i + 1 < data.len() {
            let attr = data[i];
            let len = usize::from(unchar(data[i + 1]));
            let end = (i + 2 + len).min(data.len());
            let value = String::from_utf8_lossy(&data[i + 2..end]).to_string();
            match attr {
                b'!' => {
                    self.pending.size = value.trim().parse().unwrap_or(0);
                }
                b'1' => {
                    let kilobytes: usize = value.trim().parse().unwrap_or(0);
                    if self.pending.size == 0 {
                        self.pending.size = kilobytes * 1024;
                    }
                }
                b'#' => {
                    self.pending.date = parse_attr_date(&value).unwrap_or(0);
                }
                b'/' => {
                    self.pending.access = match value.as_bytes().first() {
                        Some(b'S') => FileAccess::Supersede,
                        Some(b'W') => FileAccess::Warn,
                        Some(b'A') => FileAccess::Append,
                        _ => FileAccess::New,
                    };
                }
                _ => {
                    // Forward compatibility: types, creator systems and
                    // encodings we don't process.
                }
            }
            i = end;
        }
    }

    /// ACK `seq` and expect the next number.
    fn advance(&mut self, com: &mut Box<dyn Com>, seq: u8) -> TransferResult<()> {
        let reply = Packet::empty(PacketType::Ack, seq);
        self.send_reply(com, &reply)?;
        self.seq = (seq + 1) % 64;
        Ok(())
    }

    fn nak(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()> {
        self.errors += 1;
        let reply = Packet::empty(PacketType::Nak, self.seq);
        self.send_reply(com, &reply)?;
        Ok(())
    }

    fn send_reply(&mut self, com: &mut Box<dyn Com>, reply: &Packet) -> TransferResult<()> {
        // Replies to the init exchange keep the single character check.
        let check = if self.state == RecvState::AwaitInit {
            CheckType::Sum6
        } else {
            self.check_type
        };
        let active = self.params.active();
        let bytes = reply.encode(check, active.eol, active.npad, active.padc);
        com.write(&bytes)?;
        self.last_reply = Some(bytes);
        Ok(())
    }

    fn handle_read_error(
        &mut self,
        com: &mut Box<dyn Com>,
        err: anyhow::Error,
    ) -> TransferResult<()> {
        let recoverable = matches!(err.downcast_ref::<ComError>(), Some(ComError::Timeout))
            || matches!(
                err.downcast_ref::<KermitError>(),
                Some(
                    KermitError::CheckMismatch
                        | KermitError::InvalidPacketType(_)
                        | KermitError::MarkExpected(_)
                )
            );
        if !recoverable {
            self.state = RecvState::None;
            return Err(err);
        }
        self.nak(com)
    }

    pub fn send_error(&mut self, com: &mut Box<dyn Com>, message: &str) -> TransferResult<()> {
        let reply = Packet::new(
            PacketType::Error,
            self.seq,
            message
                .bytes()
                .filter(|b| b.is_ascii_graphic() || *b == b' ')
                .collect(),
        );
        let active = self.params.active();
        com.write(&reply.encode(self.check_type, active.eol, active.npad, active.padc))?;
        Ok(())
    }
}
