//! Transfer protocol engines.
//!
//! Every protocol is a polled state machine implementing [`Protocol`]. A
//! driver loop calls [`Protocol::update`] until it returns `false`; progress
//! and control flow between the driver and a UI thread goes through a shared
//! [`TransferState`].

use std::{
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Instant, SystemTime},
};

use crate::{com::Com, options::Options, TransferResult};

pub mod file_storage_handler;
pub use file_storage_handler::{DiskStorageHandler, FileStorageHandler, CPMEOF};
#[cfg(test)]
pub use file_storage_handler::TestStorageHandler;

pub mod xymodem;
pub use xymodem::{XYModemVariant, XYmodem};

pub mod zmodem;
pub use zmodem::Zmodem;

pub mod kermit;
pub use kermit::Kermit;

/// A file queued for upload, or metadata of a received file.
#[derive(Clone, Default)]
pub struct FileDescriptor {
    pub path_name: String,
    pub file_name: String,
    pub size: usize,
    /// Modification time in unix seconds, 0 if unknown.
    pub date: u64,
    path: PathBuf,
    data: Option<Vec<u8>>,
}

impl FileDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(path: &PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let date = metadata
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            path_name: path.to_string_lossy().to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.clone(),
            size: metadata.len() as usize,
            date,
            data: None,
        })
    }

    pub fn from_data(file_name: String, data: Vec<u8>) -> Self {
        Self {
            path_name: String::new(),
            file_name,
            path: PathBuf::new(),
            size: data.len(),
            date: 0,
            data: Some(data),
        }
    }

    pub fn get_data(&self) -> io::Result<Vec<u8>> {
        if let Some(data) = &self.data {
            Ok(data.clone())
        } else {
            fs::read(&self.path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLogMessage {
    Info(String),
    Error(String),
}

/// Progress counters for one direction of a transfer.
#[derive(Clone)]
pub struct TransferInformation {
    pub file_name: String,
    pub file_size: usize,
    pub bytes_transfered: usize,
    pub errors: usize,
    pub files_finished: Vec<String>,
    pub check_size: String,
    started: Instant,
    bps: u64,
    pub output_log: Vec<OutputLogMessage>,
}

impl Default for TransferInformation {
    fn default() -> Self {
        Self {
            file_name: String::new(),
            file_size: 0,
            bytes_transfered: 0,
            errors: 0,
            files_finished: Vec::new(),
            check_size: String::new(),
            started: Instant::now(),
            bps: 0,
            output_log: Vec::new(),
        }
    }
}

impl TransferInformation {
    pub fn update_bps(&mut self) {
        let elapsed = self.started.elapsed().as_secs().max(1);
        self.bps = self.bytes_transfered as u64 / elapsed;
    }

    pub fn get_bps(&self) -> u64 {
        self.bps
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.output_log.push(OutputLogMessage::Info(message));
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        self.output_log.push(OutputLogMessage::Error(message));
    }
}

/// Cancel and skip requests are tri-state: untouched, keep what was
/// downloaded so far, or delete the partial file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelRequest {
    #[default]
    None,
    KeepPartial,
    DeletePartial,
}

/// State shared between the driver loop and other threads.
///
/// The driver updates counters and status from inside `update()`; a UI
/// thread may read them and may request cancellation or file skip at any
/// time. To wake a driver blocked in a read, also trigger the stream's
/// [`crate::com::CancelToken`] after requesting the cancel.
#[derive(Clone)]
pub struct TransferState {
    pub protocol_name: String,
    pub current_state: &'static str,
    pub start_time: Instant,
    pub is_finished: bool,
    pub send_state: TransferInformation,
    pub receive_state: TransferInformation,
    cancel_request: CancelRequest,
    skip_request: CancelRequest,
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferState {
    pub fn new() -> Self {
        Self {
            protocol_name: String::new(),
            current_state: "",
            start_time: Instant::now(),
            is_finished: false,
            send_state: TransferInformation::default(),
            receive_state: TransferInformation::default(),
            cancel_request: CancelRequest::None,
            skip_request: CancelRequest::None,
        }
    }

    pub fn request_cancel(&mut self, keep_partial: bool) {
        self.cancel_request = if keep_partial {
            CancelRequest::KeepPartial
        } else {
            CancelRequest::DeletePartial
        };
    }

    pub fn cancel_request(&self) -> CancelRequest {
        self.cancel_request
    }

    pub fn request_skip(&mut self, keep_partial: bool) {
        self.skip_request = if keep_partial {
            CancelRequest::KeepPartial
        } else {
            CancelRequest::DeletePartial
        };
    }

    /// Consume a pending skip request, resetting it to `None`.
    pub fn take_skip_request(&mut self) -> CancelRequest {
        std::mem::replace(&mut self.skip_request, CancelRequest::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    XModem,
    XModemRelaxed,
    XModemCrc,
    XModem1k,
    XModem1kG,
    YModem,
    YModemG,
    ZModem,
    Kermit,
}

impl ProtocolType {
    pub fn create(self, options: &Options) -> Box<dyn Protocol> {
        match self {
            ProtocolType::XModem => Box::new(XYmodem::new(XYModemVariant::XModem)),
            ProtocolType::XModemRelaxed => Box::new(XYmodem::new(XYModemVariant::XModemRelaxed)),
            ProtocolType::XModemCrc => Box::new(XYmodem::new(XYModemVariant::XModemCrc)),
            ProtocolType::XModem1k => Box::new(XYmodem::new(XYModemVariant::XModem1k)),
            ProtocolType::XModem1kG => Box::new(XYmodem::new(XYModemVariant::XModem1kG)),
            ProtocolType::YModem => Box::new(XYmodem::new(XYModemVariant::YModem)),
            ProtocolType::YModemG => Box::new(XYmodem::new(XYModemVariant::YModemG)),
            ProtocolType::ZModem => Box::new(Zmodem::new(1024, options.zmodem.clone())),
            ProtocolType::Kermit => Box::new(Kermit::new(options.kermit.clone())),
        }
    }
}

pub trait Protocol {
    /// Drive the state machine one step. Returns `false` once the transfer
    /// is finished or aborted.
    fn update(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
        storage_handler: &mut dyn FileStorageHandler,
    ) -> TransferResult<bool>;

    fn initiate_send(
        &mut self,
        com: &mut Box<dyn Com>,
        files: Vec<FileDescriptor>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()>;

    fn initiate_recv(
        &mut self,
        com: &mut Box<dyn Com>,
        transfer_state: &Arc<Mutex<TransferState>>,
    ) -> TransferResult<()>;

    /// Take the descriptors of the files received so far. Subsequent calls
    /// only return files that arrived in between.
    fn get_received_files(&mut self) -> Vec<FileDescriptor>;

    /// Push the protocol specific abort onto the wire.
    fn cancel(&mut self, com: &mut Box<dyn Com>) -> TransferResult<()>;
}

pub fn str_from_null_terminated_utf8_unchecked(s: &[u8]) -> String {
    let end = s.iter().position(|b| *b == 0).unwrap_or(s.len());
    String::from_utf8_lossy(&s[..end]).to_string()
}
