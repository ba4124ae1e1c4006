use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::{
    com::{Com, TestChannel},
    protocol::{
        xymodem::constants::{ACK, CAN, CPMEOF, EOT, NAK, SOH, STX},
        FileDescriptor, Protocol, TestStorageHandler, TransferState, XYModemVariant, XYmodem,
    },
};

fn run_sender(mut com: Box<dyn Com>, variant: XYModemVariant, files: Vec<FileDescriptor>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut send = XYmodem::new(variant);
        let state = Arc::new(Mutex::new(TransferState::new()));
        let mut storage = TestStorageHandler::new();
        send.initiate_send(&mut com, files, &state).expect("initiate send");
        while send.update(&mut com, &state, &mut storage).expect("sender update") {}
    })
}

fn receive_all(com: &mut Box<dyn Com>, variant: XYModemVariant) -> TestStorageHandler {
    let mut recv = XYmodem::new(variant);
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(com, &state).expect("initiate recv");
    while recv.update(com, &state, &mut storage).expect("receiver update") {}
    // Every received file is reported exactly once.
    for fd in recv.get_received_files() {
        assert!(storage.file.contains_key(&fd.file_name), "{}", fd.file_name);
    }
    assert!(recv.get_received_files().is_empty());
    storage
}

fn random_bytes(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    // Keep the tail away from the CPM EOF pad byte so the trim check stays
    // deterministic.
    if let Some(last) = data.last_mut() {
        if *last == CPMEOF {
            *last = 0;
        }
    }
    data
}

#[test]
fn xmodem_simple() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = b"abcdef\n".to_vec();
    let sender = run_sender(
        channel.sender,
        XYModemVariant::XModem,
        vec![FileDescriptor::from_data("x".to_string(), data.clone())],
    );

    let storage = receive_all(&mut receiver, XYModemVariant::XModem);
    sender.join().unwrap();

    let received: Vec<_> = storage.file.values().collect();
    assert_eq!(1, received.len());
    // 128 byte block, CPM EOF padding trimmed back off.
    assert_eq!(&data, received[0]);
}

#[test]
fn xmodem_sender_sees_two_acks_for_single_block() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    let sender = run_sender(
        channel.sender,
        XYModemVariant::XModem,
        vec![FileDescriptor::from_data(
            "x".to_string(),
            b"abcdef\n".to_vec(),
        )],
    );

    let timeout = Duration::from_secs(5);
    com.write(&[NAK]).unwrap();
    let block = com.read_exact(timeout, 1 + 2 + 128 + 1).unwrap();
    assert_eq!(SOH, block[0]);
    assert_eq!(1, block[1]);
    assert_eq!(0xFE, block[2]);
    assert_eq!(b"abcdef\n", &block[3..10]);
    assert!(block[10..131].iter().all(|&b| b == CPMEOF));
    com.write(&[ACK]).unwrap();
    assert_eq!(EOT, com.read_char(timeout).unwrap());
    com.write(&[ACK]).unwrap();
    // Exactly one block ACK and one EOT ACK were needed.
    sender.join().unwrap();
}

#[test]
fn xmodem_1k_binary() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = random_bytes(10_000);
    let sender = run_sender(
        channel.sender,
        XYModemVariant::XModem1k,
        vec![FileDescriptor::from_data("x".to_string(), data.clone())],
    );

    let storage = receive_all(&mut receiver, XYModemVariant::XModem1k);
    sender.join().unwrap();

    let received: Vec<_> = storage.file.values().collect();
    assert_eq!(1, received.len());
    assert_eq!(&data, received[0]);
}

#[test]
fn xmodem_crc_mode_negotiated() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    let sender = run_sender(
        channel.sender,
        XYModemVariant::XModem,
        vec![FileDescriptor::from_data("x".to_string(), vec![1, 2, 3])],
    );

    let timeout = Duration::from_secs(5);
    // Ask for CRC mode even though the sender was set up for checksum.
    com.write(&[b'C']).unwrap();
    let block = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    let crc = crate::crc::get_crc16(&block[3..131]);
    assert_eq!(crc.to_be_bytes(), [block[131], block[132]]);
    com.write(&[ACK]).unwrap();
    assert_eq!(EOT, com.read_char(timeout).unwrap());
    com.write(&[ACK]).unwrap();
    sender.join().unwrap();
}

#[test]
fn xmodem_sender_resends_on_nak() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    let sender = run_sender(
        channel.sender,
        XYModemVariant::XModemCrc,
        vec![FileDescriptor::from_data("x".to_string(), vec![0x42; 16])],
    );

    let timeout = Duration::from_secs(5);
    com.write(&[b'C']).unwrap();
    let first = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    com.write(&[NAK]).unwrap();
    let second = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    assert_eq!(first, second);
    com.write(&[ACK]).unwrap();
    assert_eq!(EOT, com.read_char(timeout).unwrap());
    com.write(&[ACK]).unwrap();
    sender.join().unwrap();
}

#[test]
fn ymodem_batch_of_two() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let hello = b"Hello, world!".to_vec();
    let binary = random_bytes(2048);
    let mut fd_a = FileDescriptor::from_data("a.txt".to_string(), hello.clone());
    fd_a.date = 0o17_000_000_000; // some mtime so block 0 carries it
    let fd_b = FileDescriptor::from_data("b.bin".to_string(), binary.clone());
    let sender = run_sender(channel.sender, XYModemVariant::YModem, vec![fd_a, fd_b]);

    let storage = receive_all(&mut receiver, XYModemVariant::YModem);
    sender.join().unwrap();

    assert_eq!(2, storage.file.len());
    assert_eq!(hello, storage.file["a.txt"]);
    assert_eq!(binary, storage.file["b.bin"]);
    assert_eq!(Some(&0o17_000_000_000), storage.file_date.get("a.txt"));
}

#[test]
fn ymodem_block0_layout() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    let mut fd = FileDescriptor::from_data("a.txt".to_string(), b"Hello, world!".to_vec());
    fd.date = 0o776_012_345;
    let sender = run_sender(channel.sender, XYModemVariant::YModem, vec![fd]);

    let timeout = Duration::from_secs(5);
    com.write(&[b'C']).unwrap();
    let block = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    assert_eq!(SOH, block[0]);
    assert_eq!(0, block[1]);
    assert_eq!(0xFF, block[2]);
    let expected = b"a.txt\x0013 776012345";
    assert_eq!(&block[3..3 + expected.len()], expected);
    assert!(block[3 + expected.len()..131].iter().all(|&b| b == 0));

    // Walk the rest of the transfer so the sender can finish.
    com.write(&[ACK, b'C']).unwrap();
    let _data_block = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    com.write(&[ACK]).unwrap();
    assert_eq!(EOT, com.read_char(timeout).unwrap());
    com.write(&[NAK]).unwrap();
    assert_eq!(EOT, com.read_char(timeout).unwrap());
    com.write(&[ACK]).unwrap();
    com.write(&[b'C']).unwrap();
    let end_block = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    assert_eq!(0, end_block[1]);
    assert!(end_block[3..131].iter().all(|&b| b == 0));
    com.write(&[ACK]).unwrap();
    sender.join().unwrap();
}

#[test]
fn ymodem_g_streams_without_acks() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = random_bytes(4096);
    let sender = run_sender(
        channel.sender,
        XYModemVariant::YModemG,
        vec![FileDescriptor::from_data("g.bin".to_string(), data.clone())],
    );

    let storage = receive_all(&mut receiver, XYModemVariant::YModemG);
    sender.join().unwrap();

    assert_eq!(data, storage.file["g.bin"]);
}

#[test]
fn receiver_aborts_on_cancel_bytes() {
    let channel = TestChannel::new();
    let mut com_recv = channel.receiver;
    let mut com_send = channel.sender;

    let mut recv = XYmodem::new(XYModemVariant::XModem);
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();

    com_send.write(&[CAN, CAN, CAN]).unwrap();
    let res = recv.update(&mut com_recv, &state, &mut storage);
    assert!(res.is_err());
}

#[test]
fn local_cancel_aborts_within_one_update() {
    let channel = TestChannel::new();
    let mut com_recv = channel.receiver;
    let mut com_send = channel.sender;

    let mut recv = XYmodem::new(XYModemVariant::XModem);
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();
    let _ncg = com_send.read_char(Duration::from_secs(1)).unwrap();

    state.lock().unwrap().request_cancel(false);
    let running = recv.update(&mut com_recv, &state, &mut storage).unwrap();
    assert!(!running);
    assert!(state.lock().unwrap().is_finished);
    // The abort went out as a run of CAN bytes.
    assert_eq!(CAN, com_send.read_char(Duration::from_secs(1)).unwrap());
    assert_eq!(CAN, com_send.read_char(Duration::from_secs(1)).unwrap());
}

#[test]
fn receiver_requests_with_ncg_byte() {
    for (variant, expected) in [
        (XYModemVariant::XModem, NAK),
        (XYModemVariant::XModemRelaxed, NAK),
        (XYModemVariant::XModemCrc, b'C'),
        (XYModemVariant::XModem1k, b'C'),
        (XYModemVariant::XModem1kG, b'G'),
        (XYModemVariant::YModem, b'C'),
        (XYModemVariant::YModemG, b'G'),
    ] {
        let channel = TestChannel::new();
        let mut com_recv = channel.receiver;
        let mut com_send = channel.sender;
        let mut recv = XYmodem::new(variant);
        let state = Arc::new(Mutex::new(TransferState::new()));
        recv.initiate_recv(&mut com_recv, &state).unwrap();
        assert_eq!(
            expected,
            com_send.read_char(Duration::from_secs(1)).unwrap(),
            "wrong start byte for {variant:?}"
        );
    }
}

#[test]
fn xmodem_1k_uses_short_final_block() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    // 1024 + 16 bytes: one STX block and one short SOH block.
    let data = random_bytes(1040);
    let sender = run_sender(
        channel.sender,
        XYModemVariant::XModem1k,
        vec![FileDescriptor::from_data("x".to_string(), data.clone())],
    );

    let timeout = Duration::from_secs(5);
    com.write(&[b'C']).unwrap();
    let block1 = com.read_exact(timeout, 1 + 2 + 1024 + 2).unwrap();
    assert_eq!(STX, block1[0]);
    com.write(&[ACK]).unwrap();
    let block2 = com.read_exact(timeout, 1 + 2 + 128 + 2).unwrap();
    assert_eq!(SOH, block2[0]);
    assert_eq!(&data[1024..1040], &block2[3..19]);
    assert!(block2[19..131].iter().all(|&b| b == CPMEOF));
    com.write(&[ACK]).unwrap();
    assert_eq!(EOT, com.read_char(timeout).unwrap());
    com.write(&[ACK]).unwrap();
    sender.join().unwrap();
}
