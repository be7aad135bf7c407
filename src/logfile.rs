//! Timestamped, non-blocking ULog output files.
//!
//! The capture session owns exactly one open file at a time. The file is
//! opened `O_CREAT|O_TRUNC|O_NONBLOCK`, so writes may return short counts
//! or `WouldBlock`; the reassembly layer treats both as routine.

use crate::error::{Result, SinkError};
use chrono::Local;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Factory for capture output files inside a configured directory.
#[derive(Debug, Clone)]
pub struct LogDir {
    dir: PathBuf,
}

impl LogDir {
    /// Wraps a logs directory path. The directory is created lazily on the
    /// first `create_log`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The configured directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Opens a fresh `<logs_dir>/YYYY-MM-DD_HH-MM-SS.ulg` for writing.
    pub fn create_log(&self) -> Result<LogFile> {
        fs::create_dir_all(&self.dir).map_err(|e| SinkError::io_open(self.dir.clone(), e))?;

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = self.dir.join(format!("{stamp}.ulg"));
        let file = open_nonblocking(&path).map_err(|e| SinkError::io_open(path.clone(), e))?;

        info!("ULog capture: logging to {}", path.display());
        Ok(LogFile { file, path })
    }
}

#[cfg(unix)]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// One open capture output file.
#[derive(Debug)]
pub struct LogFile {
    file: File,
    path: PathBuf,
}

impl LogFile {
    /// Where this file lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes file contents and metadata to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
