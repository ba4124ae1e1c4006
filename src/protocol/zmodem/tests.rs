use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use super::{
    constants::{ABORT_SEQ, ZCRCE, ZCRCG, ZCRCQ, ZCRCW, ZDLE},
    encode_subpacket, read_subpacket, CanCounter, EncodeByteMap, Header, HeaderType, Zmodem,
    ZFrameType,
};
use crate::{
    com::{CancelToken, Com, ComResult, TestChannel},
    options::ZmodemOptions,
    protocol::{FileDescriptor, Protocol, TestStorageHandler, TransferState},
};

fn plain_map() -> EncodeByteMap {
    EncodeByteMap::new(false, false)
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn run_sender(
    mut com: Box<dyn Com>,
    options: ZmodemOptions,
    files: Vec<FileDescriptor>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut send = Zmodem::new(1024, options);
        let state = Arc::new(Mutex::new(TransferState::new()));
        let mut storage = TestStorageHandler::new();
        send.initiate_send(&mut com, files, &state).expect("initiate send");
        while send.update(&mut com, &state, &mut storage).expect("sender update") {}
    })
}

fn receive_all(
    com: &mut Box<dyn Com>,
    options: ZmodemOptions,
    storage: &mut TestStorageHandler,
) {
    let mut recv = Zmodem::new(1024, options);
    let state = Arc::new(Mutex::new(TransferState::new()));
    recv.initiate_recv(com, &state).expect("initiate recv");
    while recv.update(com, &state, storage).expect("receiver update") {}
    // Every received file is reported exactly once.
    for fd in recv.get_received_files() {
        assert!(storage.file.contains_key(&fd.file_name), "{}", fd.file_name);
    }
    assert!(recv.get_received_files().is_empty());
}

#[test]
fn subpacket_crc32_vector() {
    let pck = encode_subpacket(ZCRCE, b"a\n", true, &plain_map());
    assert_eq!(vec![0x61, 0x0A, 0x18, 0x68, 0xE5, 0x79, 0xD2, 0x0F], pck);
}

#[test]
fn hex_header_vectors() {
    let map = plain_map();
    assert_eq!(
        Header::empty(HeaderType::Hex, ZFrameType::RPos).build(&map),
        vec![
            b'*', b'*', 0x18, b'B', b'0', b'9', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'0',
            b'a', b'8', b'7', b'c', 0x0D, 0x8A, 0x11
        ]
    );
    assert_eq!(
        Header::empty(HeaderType::Hex, ZFrameType::RQInit).build(&map),
        b"**\x18B00000000000000\x0D\x8A\x11".to_vec()
    );
    assert_eq!(
        Header::from_flags(HeaderType::Hex, ZFrameType::RInit, 0, 0, 0, 0).build(&map),
        b"**\x18B0100000000aa51\x0D\x8A\x11".to_vec()
    );
    // ZFIN carries no trailing XON.
    assert_eq!(
        Header::from_flags(HeaderType::Hex, ZFrameType::Fin, 126, 4, 0, 0).build(&map),
        b"**\x18B087e0400003ec2\x0D\x8A".to_vec()
    );
}

#[test]
fn header_roundtrip_all_encodings() {
    for header_type in [HeaderType::Bin, HeaderType::Bin32, HeaderType::Hex] {
        let mut channel = TestChannel::new();
        let header = Header::from_flags(header_type, ZFrameType::Data, 3, 2, 1, 0);
        header.write(&mut channel.sender, &plain_map()).expect("write");
        let mut can = CanCounter::new();
        let read_header = Header::read(&mut channel.receiver, &mut can).expect("read");
        assert_eq!(header, read_header);
    }
}

#[test]
fn header_number_roundtrip() {
    // Position headers carry their number low byte first.
    let header = Header::from_number(HeaderType::Hex, ZFrameType::RPos, 0x0102_0304);
    assert_eq!([0x04, 0x03, 0x02, 0x01], header.data);
    assert_eq!(0x0102_0304, header.number());

    let mut channel = TestChannel::new();
    Header::from_number(HeaderType::Bin32, ZFrameType::Eof, 15243)
        .write(&mut channel.sender, &plain_map())
        .unwrap();
    let mut can = CanCounter::new();
    let read_header = Header::read(&mut channel.receiver, &mut can).unwrap();
    assert_eq!(ZFrameType::Eof, read_header.frame_type);
    assert_eq!(15243, read_header.number());
}

#[test]
fn subpacket_roundtrip_all_escape_modes() {
    let all_bytes: Vec<u8> = (0..=255u8).collect();
    for use_crc32 in [false, true] {
        for (escape_ctrl, escape_8bit) in [(false, false), (true, false), (false, true), (true, true)] {
            for terminator in [ZCRCE, ZCRCG, ZCRCQ, ZCRCW] {
                let map = EncodeByteMap::new(escape_ctrl, escape_8bit);
                let mut channel = TestChannel::new();
                let encoded = encode_subpacket(terminator, &all_bytes, use_crc32, &map);
                channel.sender.write(&encoded).unwrap();
                let mut can = CanCounter::new();
                let (data, last, expect_ack) =
                    read_subpacket(&mut channel.receiver, 2048, use_crc32, &mut can)
                        .expect("subpacket decode");
                assert_eq!(all_bytes, data, "escape mode ({escape_ctrl}, {escape_8bit})");
                assert_eq!(terminator == ZCRCE || terminator == ZCRCW, last);
                assert_eq!(terminator == ZCRCQ || terminator == ZCRCW, expect_ack);
            }
        }
    }
}

#[test]
fn encode_map_always_escapes_link_control_bytes() {
    let map = plain_map();
    for byte in [0x18u8, 0x11, 0x13, 0x91, 0x93, 0x7F, 0xFF, 0x81] {
        let mut out = Vec::new();
        map.encode_into(&mut out, &[byte]);
        assert_eq!(ZDLE, out[0], "0x{byte:02X} must be escaped");
    }
    // Plain printable data passes through untouched.
    let mut out = Vec::new();
    map.encode_into(&mut out, b"plain text");
    assert_eq!(b"plain text".to_vec(), out);
}

#[test]
fn zmodem_crc32_transfer() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = patterned_bytes(15243);
    let mut fd = FileDescriptor::from_data("x.jpg".to_string(), data.clone());
    fd.date = 0o17_000_000_000;
    let options = ZmodemOptions::default();
    let sender = run_sender(channel.sender, options, vec![fd]);

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(data, storage.file["x.jpg"]);
    assert_eq!(Some(&0o17_000_000_000), storage.file_date.get("x.jpg"));
    // The sender finishes the session with the "OO" trailer.
    assert_eq!(
        b"OO".to_vec(),
        receiver.read_exact(Duration::from_secs(1), 2).unwrap()
    );
}

#[test]
fn zmodem_crc16_transfer() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = patterned_bytes(4000);
    let options = ZmodemOptions {
        use_crc32: false,
        ..ZmodemOptions::default()
    };
    let sender = run_sender(
        channel.sender,
        options,
        vec![FileDescriptor::from_data("a.bin".to_string(), data.clone())],
    );

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(data, storage.file["a.bin"]);
}

#[test]
fn zmodem_batch_transfer() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let first = patterned_bytes(2000);
    let second = b"second file".to_vec();
    let options = ZmodemOptions::default();
    let sender = run_sender(
        channel.sender,
        options,
        vec![
            FileDescriptor::from_data("first.bin".to_string(), first.clone()),
            FileDescriptor::from_data("second.txt".to_string(), second.clone()),
        ],
    );

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(first, storage.file["first.bin"]);
    assert_eq!(second, storage.file["second.txt"]);
}

/// Wraps a stream and flips one bit of the nth written byte.
struct CorruptingCom {
    inner: Box<dyn Com>,
    corrupt_at: usize,
    written: usize,
}

impl Com for CorruptingCom {
    fn get_name(&self) -> &'static str {
        "corrupting"
    }

    fn read_char(&mut self, timeout: Duration) -> ComResult<u8> {
        self.inner.read_char(timeout)
    }

    fn is_data_available(&mut self) -> ComResult<bool> {
        self.inner.is_data_available()
    }

    fn write(&mut self, buf: &[u8]) -> ComResult<usize> {
        let mut copy = buf.to_vec();
        if self.written <= self.corrupt_at && self.corrupt_at < self.written + copy.len() {
            copy[self.corrupt_at - self.written] ^= 0x01;
        }
        self.written += copy.len();
        self.inner.write(&copy)
    }

    fn cancel_token(&self) -> CancelToken {
        self.inner.cancel_token()
    }
}

#[test]
fn zmodem_recovers_from_bit_flip() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = patterned_bytes(8000);
    let options = ZmodemOptions::default();
    // Byte 300 of the sender's output lands inside the first data
    // subpacket.
    let corrupted: Box<dyn Com> = Box::new(CorruptingCom {
        inner: channel.sender,
        corrupt_at: 300,
        written: 0,
    });
    let sender = run_sender(
        corrupted,
        options,
        vec![FileDescriptor::from_data("noisy.bin".to_string(), data.clone())],
    );

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    // No gaps, no duplicates: the receiver rewound with ZRPOS and the
    // sender resent from the last good offset.
    assert_eq!(data, storage.file["noisy.bin"]);
}

#[test]
fn zmodem_resumes_partial_download() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = patterned_bytes(5000);
    let options = ZmodemOptions::default();
    let sender = run_sender(
        channel.sender,
        options,
        vec![FileDescriptor::from_data("part.bin".to_string(), data.clone())],
    );

    let mut storage = TestStorageHandler::new();
    // The first 1500 bytes are already on disk from an earlier attempt.
    storage.file.insert("part.bin".to_string(), data[..1500].to_vec());
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(data, storage.file["part.bin"]);
}

#[test]
fn session_abort_sequence_stops_receiver_silently() {
    let channel = TestChannel::new();
    let mut com_recv = channel.receiver;
    let mut com_send = channel.sender;

    let mut recv = Zmodem::new(1024, ZmodemOptions::default());
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();

    // Drain the ZRINIT the receiver just sent.
    let mut can = CanCounter::new();
    let header = Header::read(&mut com_send, &mut can).unwrap();
    assert_eq!(ZFrameType::RInit, header.frame_type);

    com_send.write(&ABORT_SEQ).unwrap();
    let res = recv.update(&mut com_recv, &state, &mut storage);
    assert!(res.is_err());
    // Not a single further protocol byte may go out after the abort.
    assert!(!com_send.is_data_available().unwrap());
}

#[test]
fn receiver_acknowledges_zcrcq_offsets() {
    // A sender restricted to a 1024 byte window gets ZCRCQ subpackets
    // acknowledged with the running offset.
    let channel = TestChannel::new();
    let mut com_send = channel.sender;
    let mut com_recv = channel.receiver;

    let mut recv = Zmodem::new(1024, ZmodemOptions::default());
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();

    let mut can = CanCounter::new();
    let map = plain_map();
    let _zrinit = Header::read(&mut com_send, &mut can).unwrap();

    // Offer a file.
    let mut packet = Header::from_flags(HeaderType::Bin32, ZFrameType::File, 0, 0, 0, 1)
        .build(&map);
    packet.extend_from_slice(&encode_subpacket(ZCRCW, b"q.bin\x00100 0 0 0 1 100", true, &map));
    com_send.write(&packet).unwrap();
    recv.update(&mut com_recv, &state, &mut storage).unwrap();
    let rpos = Header::read(&mut com_send, &mut can).unwrap();
    assert_eq!(ZFrameType::RPos, rpos.frame_type);
    assert_eq!(0, rpos.number());

    // ZDATA with one ZCRCQ subpacket: expect a ZACK carrying the offset.
    let mut packet = Header::from_number(HeaderType::Bin32, ZFrameType::Data, 0).build(&map);
    packet.extend_from_slice(&encode_subpacket(ZCRCQ, &[0x42; 100], true, &map));
    com_send.write(&packet).unwrap();
    recv.update(&mut com_recv, &state, &mut storage).unwrap();
    recv.update(&mut com_recv, &state, &mut storage).unwrap();
    let ack = Header::read(&mut com_send, &mut can).unwrap();
    assert_eq!(ZFrameType::Ack, ack.frame_type);
    assert_eq!(100, ack.number());
}

#[test]
fn challenge_is_issued_when_configured() {
    let channel = TestChannel::new();
    let mut com_recv = channel.receiver;
    let mut com_send = channel.sender;

    let options = ZmodemOptions {
        download: crate::options::ZmodemDownloadOptions {
            issue_zchallenge: true,
        },
        ..ZmodemOptions::default()
    };
    let mut recv = Zmodem::new(1024, options);
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();

    let mut can = CanCounter::new();
    let challenge = Header::read(&mut com_send, &mut can).unwrap();
    assert_eq!(ZFrameType::Challenge, challenge.frame_type);

    // Echo it back; the receiver must answer with ZRINIT.
    Header::from_number(HeaderType::Hex, ZFrameType::Ack, challenge.number())
        .write(&mut com_send, &plain_map())
        .unwrap();
    recv.update(&mut com_recv, &state, &mut storage).unwrap();
    let zrinit = Header::read(&mut com_send, &mut can).unwrap();
    assert_eq!(ZFrameType::RInit, zrinit.frame_type);
}
