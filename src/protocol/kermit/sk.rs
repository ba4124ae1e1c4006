use std::sync::{Arc, Mutex};

use super::{
    constants::DEFAULT_QBIN,
    format_attr_date,
    packet::{read_packet, tochar, CheckType, Encoding, Packet, PacketType},
    KermitError, KermitParameters, TransferParameters,
};
use crate::{
    com::{Com, ComError},
    options::KermitOptions,
    protocol::{str_from_null_terminated_utf8_unchecked, FileDescriptor, TransferState},
    TransferResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    None,
    /// S packet out, Y with the remote parameters awaited.
    SendInit(usize),
    SendFileHeader(usize),
    SendAttributes(usize),
    SendData(usize),
    SendEof(usize),
    SendBreak(usize),
}

enum AckOutcome {
    Acked(Vec<u8>),
    Rejected,
}

/// Kermit sender.
pub struct Sk {
    options: KermitOptions,
    state: SendState,
    params: TransferParameters,
    check_type: CheckType,
    tx_encoding: Encoding,
    streaming: bool,

    pub files: Vec<FileDescriptor>,
    cur_file: usize,
    data: Vec<u8>,
    pos: usize,
    seq: u8,
    pub errors: usize,
    bytes_sent: usize,
}

impl Sk {
    pub fn new(options: KermitOptions) -> Self {
        let mut local = KermitParameters::from_options(&options);
        if options.force_binary.upload {
            local.qbin = DEFAULT_QBIN;
        }
        Self {
            options,
            state: SendState::None,
            params: TransferParameters::new(local, KermitParameters::default()),
            check_type: CheckType::Sum6,
            tx_encoding: Encoding {
                qctl: local.qctl,
                qbin: None,
                rept: None,
            },
            streaming: false,
            files: Vec::new(),
            cur_file: 0,
            data: Vec::new(),
            pos: 0,
            seq: 0,
            errors: 0,
            bytes_sent: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == SendState::None
    }

    pub fn finish(&mut self) {
        self.state = SendState::None;
    }

    pub fn send(&mut self, files: Vec<FileDescriptor>) {
        self.files = files;
        self.cur_file = 0;
        self.seq = 0;
        self.errors = 0;
        self.state = SendState::SendInit(0);
    }

    /// Room for data characters in one packet.
    fn packet_capacity(&self) -> usize {
        let active = self.params.active();
        let check_len = self.check_type.size();
        if active.long_packets && active.max_long_packet_len > active.max_packet_len {
            active.max_long_packet_len - check_len
        } else {
            active.max_packet_len.saturating_sub(2 + check_len).max(1)
        }
    }

    pub fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()> {
        if self.state == SendState::None {
            return Ok(());
        }
        if let Ok(state) = &mut transfer_state.lock() {
            let transfer_info = &mut state.send_state;
            if let Some(fd) = self.files.get(self.cur_file) {
                transfer_info.file_name = fd.file_name.clone();
                transfer_info.file_size = fd.size;
            }
            transfer_info.bytes_transfered = self.bytes_sent;
            transfer_info.errors = self.errors;
            transfer_info.check_size = format!("Block check {}", self.check_type as u8);
            transfer_info.update_bps();
        }
        if self.errors >= 10 {
            self.send_error(com, "too many consecutive errors")?;
            self.state = SendState::None;
            return Err(KermitError::TooManyRetries(self.errors).into());
        }

        match self.state {
            SendState::None => {}

            SendState::SendInit(retries) => {
                transfer_state.lock().unwrap().current_state = "Negotiating transfer";
                let packet =
                    Packet::new(PacketType::SendInit, 0, self.params.local.to_data());
                match self.exchange(com, &packet)? {
                    AckOutcome::Acked(data) => {
                        let remote = KermitParameters::from_data(&data);
                        self.params = TransferParameters::new(self.params.local, remote);
                        let active = self.params.active();
                        self.check_type = active.check_type;
                        self.tx_encoding = self.params.tx_encoding();
                        self.streaming = active.streaming && self.options.streaming;
                        self.seq = 1;
                        self.errors = 0;
                        self.state = SendState::SendFileHeader(0);
                    }
                    AckOutcome::Rejected => {
                        self.state = SendState::SendInit(retries + 1);
                    }
                }
            }

            SendState::SendFileHeader(retries) => {
                if self.cur_file >= self.files.len() {
                    self.state = SendState::SendBreak(0);
                    return Ok(());
                }
                transfer_state.lock().unwrap().current_state = "Sending file header";
                let name = {
                    let fd = &self.files[self.cur_file];
                    if self.options.robust_filenames {
                        robust_file_name(&fd.file_name)
                    } else {
                        fd.file_name.clone()
                    }
                };
                let packet = Packet::new(
                    PacketType::FileHeader,
                    self.seq,
                    self.tx_encoding.encode(name.as_bytes()),
                );
                match self.exchange(com, &packet)? {
                    AckOutcome::Acked(_) => {
                        let fd = &self.files[self.cur_file];
                        self.data = fd.get_data()?;
                        self.pos = 0;
                        self.seq = (self.seq + 1) % 64;
                        self.errors = 0;
                        self.state = if self.params.active().attributes {
                            SendState::SendAttributes(0)
                        } else {
                            SendState::SendData(0)
                        };
                    }
                    AckOutcome::Rejected => {
                        self.state = SendState::SendFileHeader(retries + 1);
                    }
                }
            }

            SendState::SendAttributes(retries) => {
                let fd = &self.files[self.cur_file];
                let packet = Packet::new(
                    PacketType::Attributes,
                    self.seq,
                    build_attributes(fd),
                );
                match self.exchange(com, &packet)? {
                    AckOutcome::Acked(_) => {
                        self.seq = (self.seq + 1) % 64;
                        self.errors = 0;
                        self.state = SendState::SendData(0);
                    }
                    AckOutcome::Rejected => {
                        self.state = SendState::SendAttributes(retries + 1);
                    }
                }
            }

            SendState::SendData(retries) => {
                if self.pos >= self.data.len() {
                    self.state = SendState::SendEof(0);
                    return Ok(());
                }
                transfer_state.lock().unwrap().current_state = "Sending data";
                let (new_pos, payload) = self.fill_packet();
                let packet = Packet::new(PacketType::Data, self.seq, payload);

                if self.streaming {
                    // No per packet acknowledge; anything the receiver says
                    // during the stream is bad news.
                    self.send_raw(com, &packet)?;
                    if com.is_data_available()? {
                        let reply = read_packet(
                            com,
                            self.params.active().timeout,
                            self.check_type,
                        )?;
                        return self.fail_streaming(com, &reply);
                    }
                    self.pos = new_pos;
                    self.bytes_sent = new_pos;
                    self.seq = (self.seq + 1) % 64;
                    self.state = SendState::SendData(0);
                    return Ok(());
                }

                match self.exchange(com, &packet)? {
                    AckOutcome::Acked(_) => {
                        self.pos = new_pos;
                        self.bytes_sent = new_pos;
                        self.seq = (self.seq + 1) % 64;
                        self.errors = 0;
                        self.state = SendState::SendData(0);
                    }
                    AckOutcome::Rejected => {
                        // Same position, same packet on the next round.
                        self.state = SendState::SendData(retries + 1);
                    }
                }
            }

            SendState::SendEof(retries) => {
                let packet = Packet::empty(PacketType::Eof, self.seq);
                match self.exchange(com, &packet)? {
                    AckOutcome::Acked(_) => {
                        self.seq = (self.seq + 1) % 64;
                        self.errors = 0;
                        self.cur_file += 1;
                        self.state = SendState::SendFileHeader(0);
                    }
                    AckOutcome::Rejected => {
                        self.state = SendState::SendEof(retries + 1);
                    }
                }
            }

            SendState::SendBreak(retries) => {
                transfer_state.lock().unwrap().current_state = "Finishing transfer";
                let packet = Packet::empty(PacketType::Break, self.seq);
                match self.exchange(com, &packet)? {
                    AckOutcome::Acked(_) => {
                        transfer_state
                            .lock()
                            .unwrap()
                            .send_state
                            .log_info("transfer finished");
                        self.state = SendState::None;
                    }
                    AckOutcome::Rejected => {
                        self.state = SendState::SendBreak(retries + 1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Pack encoded groups until the packet is full. Returns the new file
    /// position and the data field.
    fn fill_packet(&self) -> (usize, Vec<u8>) {
        let capacity = self.packet_capacity();
        let mut payload = Vec::with_capacity(capacity);
        let mut pos = self.pos;
        while pos < self.data.len() {
            let (consumed, chars) = self.tx_encoding.encode_group(&self.data, pos);
            if !payload.is_empty() && payload.len() + chars.len() > capacity {
                break;
            }
            payload.extend_from_slice(&chars);
            pos += consumed;
        }
        (pos, payload)
    }

    /// Send `packet` and wait for the matching Y. NAKs, stale ACKs,
    /// timeouts and damaged replies all count as one error and ask for a
    /// retransmission.
    fn exchange(&mut self, com: &mut Box<dyn Com>, packet: &Packet) -> TransferResult<AckOutcome> {
        self.send_raw(com, packet)?;
        let reply = match read_packet(com, self.params.active().timeout, self.check_type) {
            Ok(reply) => reply,
            Err(err) => {
                let recoverable =
                    matches!(err.downcast_ref::<ComError>(), Some(ComError::Timeout))
                        || matches!(
                            err.downcast_ref::<KermitError>(),
                            Some(
                                KermitError::CheckMismatch
                                    | KermitError::InvalidPacketType(_)
                                    | KermitError::MarkExpected(_)
                            )
                        );
                if !recoverable {
                    self.state = SendState::None;
                    return Err(err);
                }
                self.errors += 1;
                return Ok(AckOutcome::Rejected);
            }
        };
        match reply.packet_type {
            PacketType::Ack if reply.seq == packet.seq => Ok(AckOutcome::Acked(reply.data)),
            PacketType::Error => {
                let msg = str_from_null_terminated_utf8_unchecked(&reply.data);
                self.state = SendState::None;
                Err(KermitError::RemoteError(msg).into())
            }
            _ => {
                // A NAK for the packet we just sent, or a stale answer.
                self.errors += 1;
                Ok(AckOutcome::Rejected)
            }
        }
    }

    fn fail_streaming(&mut self, com: &mut Box<dyn Com>, reply: &Packet) -> TransferResult<()> {
        if reply.packet_type == PacketType::Error {
            let msg = str_from_null_terminated_utf8_unchecked(&reply.data);
            self.state = SendState::None;
            return Err(KermitError::RemoteError(msg).into());
        }
        self.send_error(com, "streaming transfer interrupted")?;
        self.state = SendState::None;
        Err(KermitError::PacketOutOfOrder(
            reply.packet_type.wire_byte() as char
        )
        .into())
    }

    fn send_raw(&mut self, com: &mut Box<dyn Com>, packet: &Packet) -> TransferResult<()> {
        // The init exchange always runs with the single character check.
        let check = if matches!(packet.packet_type, PacketType::SendInit) {
            CheckType::Sum6
        } else {
            self.check_type
        };
        let active = self.params.active();
        com.write(&packet.encode(check, active.eol, active.npad, active.padc))?;
        Ok(())
    }

    pub fn send_error(&mut self, com: &mut Box<dyn Com>, message: &str) -> TransferResult<()> {
        let packet = Packet::new(
            PacketType::Error,
            self.seq,
            message
                .bytes()
                .filter(|b| b.is_ascii_graphic() || *b == b' ')
                .collect(),
        );
        self.send_raw(com, &packet)
    }
}

/// Attributes we announce: exact size in bytes, modification date, and the
/// "binary 8 bit" type.
fn build_attributes(fd: &FileDescriptor) -> Vec<u8> {
    let mut out = Vec::new();
    let size = fd.size.to_string();
    out.push(b'!');
    out.push(tochar(size.len() as u8));
    out.extend_from_slice(size.as_bytes());
    if fd.date > 0 {
        let date = format_attr_date(fd.date);
        out.push(b'#');
        out.push(tochar(date.len() as u8));
        out.extend_from_slice(date.as_bytes());
    }
    out.push(b'"');
    out.push(tochar(2));
    out.extend_from_slice(b"B8");
    out
}

/// Reduce a file name to the portable subset: upper case letters, digits
/// and a single dot.
fn robust_file_name(name: &str) -> String {
    let dot = name.rfind('.');
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.char_indices() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else if Some(i) == dot && !out.is_empty() {
            out.push('.');
        } else {
            out.push('X');
        }
    }
    if out.is_empty() {
        out.push_str("NONAME");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robust_names_are_portable() {
        assert_eq!("READXME.TXT", robust_file_name("read me.txt"));
        assert_eq!("XDOTFILE", robust_file_name(".dotfile"));
        assert_eq!("AXB.C", robust_file_name("a-b.c"));
        assert_eq!("NONAME", robust_file_name(""));
    }

    #[test]
    fn attributes_carry_size_and_date() {
        let mut fd = FileDescriptor::from_data("f".to_string(), vec![0; 15243]);
        fd.date = 86_400; // 1970-01-02 00:00:00
        let attrs = build_attributes(&fd);
        let text = String::from_utf8_lossy(&attrs);
        assert!(text.contains("15243"));
        assert!(text.contains("19700102 00:00:00"));
        assert!(text.contains("B8"));
    }
}
