//! Local file side of a download.
//!
//! The protocol engines never touch the filesystem directly; everything
//! goes through a [`FileStorageHandler`] so tests can collect files in
//! memory and embedders can redirect output wherever they want.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use crate::TransferResult;

pub const CPMEOF: u8 = 0x1A;

pub trait FileStorageHandler {
    /// Open an output file for a protocol that transfers no file name
    /// (plain Xmodem).
    fn open_unnamed_file(&mut self);

    /// Open an output file. `total_size` is 0 when the size is unknown.
    fn open_file(&mut self, file_name: &str, total_size: usize);

    fn append(&mut self, data: &[u8]);

    fn current_file_name(&self) -> Option<String>;
    fn current_file_length(&self) -> usize;
    fn get_current_file_total_size(&self) -> usize;

    /// Truncate or grow the current file to an exact size (Ymodem/Zmodem
    /// know the real length from metadata).
    fn set_current_size_to(&mut self, size: usize);

    /// Drop trailing 0x1A padding (Xmodem block fill).
    fn remove_cpm_eof(&mut self);

    /// Apply a modification time, in unix seconds, to the current file.
    fn set_file_date(&mut self, unix_secs: u64);

    /// Length of an already present file with this name, for resuming a
    /// Zmodem download. `None` if no such file exists.
    fn existing_file_length(&self, file_name: &str) -> Option<usize>;

    /// Open `file_name` for appending when it already exists, creating it
    /// otherwise. Returns the offset at which writing continues.
    fn open_file_resume(&mut self, file_name: &str, total_size: usize) -> usize {
        self.open_file(file_name, total_size);
        0
    }

    fn close(&mut self);

    /// Close and delete the current file (cancel without keeping the
    /// partial download).
    fn delete_current_file(&mut self);
}

/// Collects received files in memory. Used by the protocol tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct TestStorageHandler {
    cur_file_name: Option<String>,
    cur_file_size: usize,
    cpm_run: usize,
    pub file: HashMap<String, Vec<u8>>,
    pub file_date: HashMap<String, u64>,
}

#[cfg(test)]
impl TestStorageHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl FileStorageHandler for TestStorageHandler {
    fn open_unnamed_file(&mut self) {
        self.open_file("unnamed_file", 0);
    }

    fn open_file(&mut self, file_name: &str, total_size: usize) {
        let name = file_name.to_string();
        self.cur_file_name = Some(name.clone());
        self.cur_file_size = total_size;
        self.cpm_run = 0;
        self.file.entry(name).or_default();
    }

    fn append(&mut self, data: &[u8]) {
        if let Some(file_name) = &self.cur_file_name {
            let tail = data.iter().rev().take_while(|d| **d == CPMEOF).count();
            if tail == data.len() {
                self.cpm_run += tail;
            } else {
                self.cpm_run = tail;
            }
            self.file.get_mut(file_name).unwrap().extend_from_slice(data);
        }
    }

    fn current_file_name(&self) -> Option<String> {
        self.cur_file_name.clone()
    }

    fn current_file_length(&self) -> usize {
        self.cur_file_name
            .as_ref()
            .map_or(0, |name| self.file[name].len())
    }

    fn get_current_file_total_size(&self) -> usize {
        self.cur_file_size
    }

    fn set_current_size_to(&mut self, size: usize) {
        if let Some(file_name) = &self.cur_file_name {
            self.file.get_mut(file_name).unwrap().resize(size, 0);
            self.cpm_run = 0;
        }
    }

    fn remove_cpm_eof(&mut self) {
        if let Some(file_name) = &self.cur_file_name {
            let content = self.file.get_mut(file_name).unwrap();
            content.truncate(content.len() - self.cpm_run);
            self.cpm_run = 0;
        }
    }

    fn set_file_date(&mut self, unix_secs: u64) {
        if let Some(file_name) = &self.cur_file_name {
            self.file_date.insert(file_name.clone(), unix_secs);
        }
    }

    fn existing_file_length(&self, file_name: &str) -> Option<usize> {
        self.file.get(file_name).map(Vec::len)
    }

    fn open_file_resume(&mut self, file_name: &str, total_size: usize) -> usize {
        let name = file_name.to_string();
        self.cur_file_name = Some(name.clone());
        self.cur_file_size = total_size;
        self.cpm_run = 0;
        self.file.entry(name).or_default().len()
    }

    fn close(&mut self) {
        self.cur_file_name = None;
        self.cur_file_size = 0;
        self.cpm_run = 0;
    }

    fn delete_current_file(&mut self) {
        if let Some(file_name) = self.cur_file_name.take() {
            self.file.remove(&file_name);
            self.file_date.remove(&file_name);
        }
        self.cur_file_size = 0;
        self.cpm_run = 0;
    }
}

/// Writes received files to a download directory, avoiding name collisions
/// with the usual `name.1`, `name.2` pattern unless overwriting was
/// requested.
pub struct DiskStorageHandler {
    output_path: PathBuf,
    overwrite: bool,
    cur_file_name: Option<String>,
    cur_file_path: Option<PathBuf>,
    cur_total_file_size: usize,
    current_file_length: usize,
    cpm_run: usize,
    pending_date: Option<u64>,
    file: Option<File>,
}

impl DiskStorageHandler {
    pub fn new(overwrite: bool) -> TransferResult<Self> {
        let Some(user_dirs) = directories::UserDirs::new() else {
            return Err(anyhow::anyhow!("failed to get user directories"));
        };
        let Some(download_dir) = user_dirs.download_dir() else {
            return Err(anyhow::anyhow!("failed to get download directory"));
        };
        Ok(Self::with_path(download_dir.to_path_buf(), overwrite))
    }

    /// Download directory and overwrite behavior from the transfer options;
    /// falls back to the user's download directory.
    pub fn from_options(options: &crate::options::Options) -> TransferResult<Self> {
        match &options.download_directory {
            Some(path) => Ok(Self::with_path(path.clone(), options.overwrite)),
            None => Self::new(options.overwrite),
        }
    }

    pub fn with_path(output_path: PathBuf, overwrite: bool) -> Self {
        Self {
            output_path,
            overwrite,
            cur_file_name: None,
            cur_file_path: None,
            cur_total_file_size: 0,
            current_file_length: 0,
            cpm_run: 0,
            pending_date: None,
            file: None,
        }
    }

    fn resolve_collision(&self, file_name: &str) -> PathBuf {
        let mut path = self.output_path.join(file_name);
        if self.overwrite {
            return path;
        }
        let mut i = 1;
        while path.exists() {
            path = self.output_path.join(format!("{file_name}.{i}"));
            i += 1;
        }
        path
    }
}

impl FileStorageHandler for DiskStorageHandler {
    fn open_unnamed_file(&mut self) {
        let mut num = 0;
        let mut file_name = format!("transferred_file.{num}");
        while self.output_path.join(&file_name).exists() {
            num += 1;
            file_name = format!("transferred_file.{num}");
        }
        self.open_file(&file_name, 0);
    }

    fn open_file(&mut self, file_name: &str, total_size: usize) {
        let name = if file_name.is_empty() {
            "new_file".to_string()
        } else {
            file_name.to_string()
        };
        let path = self.resolve_collision(&name);
        match File::create(&path) {
            Ok(file) => {
                self.file = Some(file);
                self.cur_file_path = Some(path);
            }
            Err(err) => {
                log::error!("failed to create {}: {err}", path.display());
                self.file = None;
                self.cur_file_path = None;
            }
        }
        self.cur_file_name = Some(name);
        self.cur_total_file_size = total_size;
        self.current_file_length = 0;
        self.cpm_run = 0;
        self.pending_date = None;
    }

    fn append(&mut self, data: &[u8]) {
        let Some(file) = &mut self.file else {
            return;
        };
        let tail = data.iter().rev().take_while(|d| **d == CPMEOF).count();
        if tail == data.len() {
            self.cpm_run += tail;
        } else {
            self.cpm_run = tail;
        }
        if let Err(err) = file.write_all(data) {
            log::error!("failed to write output file: {err}");
        }
        self.current_file_length += data.len();
    }

    fn current_file_name(&self) -> Option<String> {
        self.cur_file_name.clone()
    }

    fn current_file_length(&self) -> usize {
        self.current_file_length
    }

    fn get_current_file_total_size(&self) -> usize {
        self.cur_total_file_size
    }

    fn set_current_size_to(&mut self, size: usize) {
        if let Some(file) = &self.file {
            if let Err(err) = file.set_len(size as u64) {
                log::error!("failed to set file length: {err}");
                return;
            }
            self.current_file_length = size;
            self.cpm_run = 0;
        }
    }

    fn remove_cpm_eof(&mut self) {
        if self.cpm_run > 0 {
            self.set_current_size_to(self.current_file_length - self.cpm_run);
        }
    }

    fn set_file_date(&mut self, unix_secs: u64) {
        // Applied on close, after the last write.
        self.pending_date = Some(unix_secs);
    }

    fn existing_file_length(&self, file_name: &str) -> Option<usize> {
        let path = self.output_path.join(file_name);
        std::fs::metadata(path).ok().map(|m| m.len() as usize)
    }

    fn open_file_resume(&mut self, file_name: &str, total_size: usize) -> usize {
        let name = if file_name.is_empty() {
            "new_file".to_string()
        } else {
            file_name.to_string()
        };
        let path = self.output_path.join(&name);
        if self.overwrite || !path.exists() {
            self.open_file(&name, total_size);
            return 0;
        }
        match OpenOptions::new().append(true).open(&path) {
            Ok(file) => {
                let offset = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
                self.file = Some(file);
                self.cur_file_path = Some(path);
                self.cur_file_name = Some(name);
                self.cur_total_file_size = total_size;
                self.current_file_length = offset;
                self.cpm_run = 0;
                self.pending_date = None;
                offset
            }
            Err(err) => {
                log::error!("failed to reopen {}: {err}", path.display());
                self.open_file(&name, total_size);
                0
            }
        }
    }

    fn close(&mut self) {
        if let (Some(date), Some(path)) = (self.pending_date.take(), &self.cur_file_path) {
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(date);
            match OpenOptions::new().write(true).open(path) {
                Ok(file) => {
                    if let Err(err) = file.set_modified(mtime) {
                        log::warn!("failed to set mtime on {}: {err}", path.display());
                    }
                }
                Err(err) => log::warn!("failed to reopen {}: {err}", path.display()),
            }
        }
        self.file = None;
        self.cur_file_name = None;
        self.cur_file_path = None;
        self.cur_total_file_size = 0;
        self.current_file_length = 0;
        self.cpm_run = 0;
    }

    fn delete_current_file(&mut self) {
        self.file = None;
        self.pending_date = None;
        if let Some(path) = self.cur_file_path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                log::error!("failed to delete {}: {err}", path.display());
            }
        }
        self.cur_file_name = None;
        self.cur_total_file_size = 0;
        self.current_file_length = 0;
        self.cpm_run = 0;
    }
}
