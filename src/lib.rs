//! File transfer protocols for serial and BBS style connections.
//!
//! Implements Xmodem (checksum, CRC, 1k, 1k-G and the relaxed variant),
//! Ymodem (batch and -G), Zmodem and Kermit on top of a pluggable byte
//! stream ([`com::Com`]). The protocol engines are polled state machines:
//! call [`protocol::Protocol::update`] in a loop until the transfer reports
//! completion. Progress, cancellation and logging flow through a shared
//! [`protocol::TransferState`].

pub mod com;
pub mod crc;
pub mod options;
pub mod protocol;

/// Result alias used throughout the crate.
pub type TransferResult<T> = anyhow::Result<T>;

pub use options::Options;
pub use protocol::{
    FileDescriptor, Protocol, ProtocolType, TransferInformation, TransferState,
};
