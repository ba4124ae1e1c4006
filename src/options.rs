//! Transfer options.
//!
//! The option document is a small TOML file; every key is optional and
//! unknown keys are ignored, so embedders can keep these settings inside a
//! larger configuration.
//!
//! ```toml
//! overwrite = false
//! downloadDirectory = "/home/user/Downloads"
//!
//! [xmodem]
//! flavor = "X_1K"
//!
//! [kermit]
//! streaming = true
//! windowSize = 1
//! longPackets = true
//!
//! [zmodem]
//! useCrc32 = true
//! ```

use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{protocol::ProtocolType, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum XmodemFlavor {
    /// 128 byte blocks, 8 bit checksum, 10 second timeout.
    #[serde(rename = "VANILLA")]
    #[default]
    Vanilla,
    /// Like vanilla but with a 100 second timeout, for slow links.
    #[serde(rename = "RELAXED")]
    Relaxed,
    /// 128 byte blocks with CRC16.
    #[serde(rename = "CRC")]
    Crc,
    /// 1024 byte blocks with CRC16.
    #[serde(rename = "X_1K")]
    X1k,
    /// 1024 byte blocks, CRC16, no per block ACKs.
    #[serde(rename = "X_1K_G")]
    X1kG,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XmodemOptions {
    pub flavor: XmodemFlavor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceBinary {
    pub upload: bool,
    pub download: bool,
}

impl Default for ForceBinary {
    fn default() -> Self {
        Self {
            upload: false,
            download: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KermitOptions {
    pub streaming: bool,
    #[serde(rename = "windowSize")]
    pub window_size: u8,
    #[serde(rename = "longPackets")]
    pub long_packets: bool,
    /// Mangle outgoing file names to the portable character subset.
    #[serde(rename = "robustFilenames")]
    pub robust_filenames: bool,
    #[serde(rename = "forceBinary")]
    pub force_binary: ForceBinary,
}

impl Default for KermitOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            window_size: 1,
            long_packets: true,
            robust_filenames: false,
            force_binary: ForceBinary::default(),
        }
    }
}

impl KermitOptions {
    /// Window size clamped to the 1..=31 range the WINDO field can carry.
    pub fn effective_window_size(&self) -> u8 {
        self.window_size.clamp(1, 31)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZmodemDownloadOptions {
    #[serde(rename = "issueZChallenge")]
    pub issue_zchallenge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZmodemOptions {
    #[serde(rename = "useCrc32")]
    pub use_crc32: bool,
    #[serde(rename = "escapeControlChars")]
    pub escape_control_chars: bool,
    pub download: ZmodemDownloadOptions,
}

impl Default for ZmodemOptions {
    fn default() -> Self {
        Self {
            use_crc32: true,
            escape_control_chars: false,
            download: ZmodemDownloadOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub xmodem: XmodemOptions,
    pub kermit: KermitOptions,
    pub zmodem: ZmodemOptions,
    #[serde(rename = "downloadDirectory")]
    pub download_directory: Option<PathBuf>,
    pub overwrite: bool,
}

impl Options {
    pub fn load_options_from(text: &str) -> TransferResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_options(path: &Path) -> TransferResult<Self> {
        Self::load_options_from(&fs::read_to_string(path)?)
    }

    pub fn store_options(&self, path: &Path) -> TransferResult<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The protocol selected by `xmodem.flavor`.
    pub fn xmodem_protocol(&self) -> ProtocolType {
        match self.xmodem.flavor {
            XmodemFlavor::Vanilla => ProtocolType::XModem,
            XmodemFlavor::Relaxed => ProtocolType::XModemRelaxed,
            XmodemFlavor::Crc => ProtocolType::XModemCrc,
            XmodemFlavor::X1k => ProtocolType::XModem1k,
            XmodemFlavor::X1kG => ProtocolType::XModem1kG,
        }
    }
}
