use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::debug;

use super::format::LogFormat;
use super::record::LogRecord;
use crate::common::Result;

/// Appends encoded records to a log or script file.
///
/// Writes are buffered; [`LogWriter::sync`] pushes them to stable storage.
pub struct LogWriter {
    path: PathBuf,
    format: LogFormat,
    out: BufWriter<File>,
    /// Current file length including buffered bytes.
    size: u64,
    records: u64,
    syncs: u64,
    buf: BytesMut,
}

impl LogWriter {
    /// Opens `path` for appending, creating it if needed. A fresh file gets
    /// the format header.
    pub fn open_append<P: AsRef<Path>>(path: P, format: LogFormat) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let mut writer = Self::from_file(path.as_ref(), file, format, len);
        if len == 0 {
            writer.write_header()?;
        }
        Ok(writer)
    }

    /// Creates `path`, discarding any previous contents.
    pub fn create<P: AsRef<Path>>(path: P, format: LogFormat) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())?;
        let mut writer = Self::from_file(path.as_ref(), file, format, 0);
        writer.write_header()?;
        Ok(writer)
    }

    fn from_file(path: &Path, file: File, format: LogFormat, size: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            format,
            out: BufWriter::new(file),
            size,
            records: 0,
            syncs: 0,
            buf: BytesMut::with_capacity(256),
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.format.file_header();
        self.out.write_all(header)?;
        self.size += header.len() as u64;
        Ok(())
    }

    /// Appends one record.
    pub fn write(&mut self, record: &LogRecord) -> Result<()> {
        self.buf.clear();
        self.format.encode(record, &mut self.buf)?;
        self.out.write_all(&self.buf)?;
        self.size += self.buf.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Flushes buffered records and syncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.syncs += 1;
        Ok(())
    }

    /// Syncs and closes the file.
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        debug!(path = %self.path.display(), records = self.records, "closed log file");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Records appended through this writer.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs
    }
}
