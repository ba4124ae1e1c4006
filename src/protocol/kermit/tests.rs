use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use super::{
    packet::{read_packet, CheckType, Packet, PacketType},
    parse_attr_date, Kermit, KermitParameters,
};
use crate::{
    com::Com,
    com::TestChannel,
    options::KermitOptions,
    protocol::{FileDescriptor, Protocol, TestStorageHandler, TransferState},
};

fn run_sender(
    mut com: Box<dyn Com>,
    options: KermitOptions,
    files: Vec<FileDescriptor>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut send = Kermit::new(options);
        let state = Arc::new(Mutex::new(TransferState::new()));
        let mut storage = TestStorageHandler::new();
        send.initiate_send(&mut com, files, &state).expect("initiate send");
        while send.update(&mut com, &state, &mut storage).expect("sender update") {}
    })
}

fn receive_all(
    com: &mut Box<dyn Com>,
    options: KermitOptions,
    storage: &mut TestStorageHandler,
) {
    let mut recv = Kermit::new(options);
    let state = Arc::new(Mutex::new(TransferState::new()));
    recv.initiate_recv(com, &state).expect("initiate recv");
    while recv.update(com, &state, storage).expect("receiver update") {}
    // Every received file is reported exactly once.
    for fd in recv.get_received_files() {
        assert!(storage.file.contains_key(&fd.file_name), "{}", fd.file_name);
    }
    assert!(recv.get_received_files().is_empty());
}

fn binary_payload(len: usize) -> Vec<u8> {
    // Covers control bytes, the quote characters and high bit values.
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn kermit_download_with_attributes() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = binary_payload(10_000);
    let mut fd = FileDescriptor::from_data("blob.bin".to_string(), data.clone());
    fd.date = 1_000_000_000;
    let options = KermitOptions::default();
    let sender = run_sender(channel.sender, options, vec![fd]);

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(data, storage.file["blob.bin"]);
    assert_eq!(Some(&1_000_000_000), storage.file_date.get("blob.bin"));
}

#[test]
fn kermit_batch_of_two() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let first = binary_payload(2048);
    let second = b"short text file\n".to_vec();
    let options = KermitOptions::default();
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

#[test]
fn kermit_non_streaming_transfer() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = binary_payload(5000);
    let options = KermitOptions {
        streaming: false,
        ..KermitOptions::default()
    };
    let sender = run_sender(
        channel.sender,
        options,
        vec![FileDescriptor::from_data("acked.bin".to_string(), data.clone())],
    );

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(data, storage.file["acked.bin"]);
}

#[test]
fn kermit_short_packets_only() {
    let channel = TestChannel::new();
    let mut receiver = channel.receiver;
    let data = binary_payload(3000);
    let options = KermitOptions {
        long_packets: false,
        streaming: false,
        ..KermitOptions::default()
    };
    let sender = run_sender(
        channel.sender,
        options,
        vec![FileDescriptor::from_data("short.bin".to_string(), data.clone())],
    );

    let mut storage = TestStorageHandler::new();
    receive_all(&mut receiver, options, &mut storage);
    sender.join().unwrap();

    assert_eq!(data, storage.file["short.bin"]);
}

#[test]
fn megabyte_fits_in_117_long_packets() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    // Plain printable data without runs: one wire character per byte.
    let data: Vec<u8> = (0..1_048_576).map(|i| b'a' + (i % 26) as u8).collect();
    let options = KermitOptions {
        streaming: false,
        ..KermitOptions::default()
    };
    let sender = run_sender(
        channel.sender,
        options,
        vec![FileDescriptor::from_data("big.txt".to_string(), data)],
    );

    let timeout = Duration::from_secs(10);
    // Negotiate: answer the S packet with our defaults (CHECK=3,
    // MAXLX=9024, long packets).
    let init = read_packet(&mut com, timeout, CheckType::Sum6).unwrap();
    assert_eq!(PacketType::SendInit, init.packet_type);
    com.write(
        &Packet::new(PacketType::Ack, 0, KermitParameters::default().to_data())
            .encode(CheckType::Sum6, 0x0D, 0, 0),
    )
    .unwrap();

    let mut data_packets = 0usize;
    loop {
        let packet = read_packet(&mut com, timeout, CheckType::Crc).unwrap();
        if packet.packet_type == PacketType::Data {
            data_packets += 1;
        }
        com.write(
            &Packet::empty(PacketType::Ack, packet.seq).encode(CheckType::Crc, 0x0D, 0, 0),
        )
        .unwrap();
        if packet.packet_type == PacketType::Break {
            break;
        }
    }
    sender.join().unwrap();
    assert!(
        data_packets <= 117,
        "1 MiB took {data_packets} data packets"
    );
}

#[test]
fn sender_retransmits_on_nak() {
    let channel = TestChannel::new();
    let mut com = channel.receiver;
    let options = KermitOptions {
        streaming: false,
        ..KermitOptions::default()
    };
    let sender = run_sender(
        channel.sender,
        options,
        vec![FileDescriptor::from_data("f.txt".to_string(), b"data".to_vec())],
    );

    let timeout = Duration::from_secs(10);
    let init = read_packet(&mut com, timeout, CheckType::Sum6).unwrap();
    assert_eq!(PacketType::SendInit, init.packet_type);
    com.write(
        &Packet::new(PacketType::Ack, 0, KermitParameters::default().to_data())
            .encode(CheckType::Sum6, 0x0D, 0, 0),
    )
    .unwrap();

    let header = read_packet(&mut com, timeout, CheckType::Crc).unwrap();
    assert_eq!(PacketType::FileHeader, header.packet_type);
    // Claim it was damaged.
    com.write(&Packet::empty(PacketType::Nak, 1).encode(CheckType::Crc, 0x0D, 0, 0))
        .unwrap();
    let resent = read_packet(&mut com, timeout, CheckType::Crc).unwrap();
    assert_eq!(header, resent);

    // Now play along until the end.
    com.write(&Packet::empty(PacketType::Ack, resent.seq).encode(CheckType::Crc, 0x0D, 0, 0))
        .unwrap();
    loop {
        let packet = read_packet(&mut com, timeout, CheckType::Crc).unwrap();
        com.write(
            &Packet::empty(PacketType::Ack, packet.seq).encode(CheckType::Crc, 0x0D, 0, 0),
        )
        .unwrap();
        if packet.packet_type == PacketType::Break {
            break;
        }
    }
    sender.join().unwrap();
}

#[test]
fn receiver_aborts_on_error_packet() {
    let channel = TestChannel::new();
    let mut com_recv = channel.receiver;
    let mut com_send = channel.sender;

    let mut recv = Kermit::new(KermitOptions::default());
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();

    com_send
        .write(
            &Packet::new(PacketType::Error, 0, b"disk on fire".to_vec())
                .encode(CheckType::Sum6, 0x0D, 0, 0),
        )
        .unwrap();
    let res = recv.update(&mut com_recv, &state, &mut storage);
    assert!(res.is_err());
    let msg = res.unwrap_err().to_string();
    assert!(msg.contains("disk on fire"), "unexpected message: {msg}");
}

#[test]
fn receiver_naks_garbled_file_header(){
    let channel = TestChannel::new();
    let mut com_recv = channel.receiver;
    let mut com_send = channel.sender;

    let mut recv = Kermit::new(KermitOptions::default());
    let state = Arc::new(Mutex::new(TransferState::new()));
    let mut storage = TestStorageHandler::new();
    recv.initiate_recv(&mut com_recv, &state).unwrap();

    let timeout = Duration::from_secs(5);
    com_send
        .write(
            &Packet::new(PacketType::SendInit, 0, KermitParameters::default().to_data())
                .encode(CheckType::Sum6, 0x0D, 0, 0),
        )
        .unwrap();
    recv.update(&mut com_recv, &state, &mut storage).unwrap();
    let ack = read_packet(&mut com_send, timeout, CheckType::Sum6).unwrap();
    assert_eq!(PacketType::Ack, ack.packet_type);

    // A file header with one corrupted byte.
    let mut wire = Packet::new(PacketType::FileHeader, 1, b"name.txt".to_vec())
        .encode(CheckType::Crc, 0x0D, 0, 0);
    wire[5] ^= 0x02;
    com_send.write(&wire).unwrap();
    recv.update(&mut com_recv, &state, &mut storage).unwrap();
    let nak = read_packet(&mut com_send, timeout, CheckType::Crc).unwrap();
    assert_eq!(PacketType::Nak, nak.packet_type);
    assert_eq!(1, nak.seq);
}

#[test]
fn attr_date_roundtrip() {
    for secs in [0u64, 86_399, 86_400, 1_000_000_000, 1_700_000_000] {
        let text = super::format_attr_date(secs);
        assert_eq!(Some(secs), parse_attr_date(&text), "for {text}");
    }
    assert_eq!(Some(0), parse_attr_date("19700101"));
    // Two digit years are 1900 based.
    assert_eq!(
        parse_attr_date("19850102 10:30:00"),
        parse_attr_date("850102 10:30:00")
    );
    assert_eq!(None, parse_attr_date("garbage"));
}
