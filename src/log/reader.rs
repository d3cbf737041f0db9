use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::format::{
    decode_binary_body, decode_frame_header, decode_text_line, LogFormat, BINARY_FRAME_HEADER,
    BINARY_LOG_MAGIC,
};
use super::record::LogRecord;
use crate::common::{Error, Result};

/// Streams records out of a log or script file.
///
/// Reading stops at the first truncated or corrupt record. Everything before
/// it is returned; [`LogReader::valid_len`] reports where the good prefix ends.
pub struct LogReader {
    path: PathBuf,
    format: LogFormat,
    input: BufReader<File>,
    offset: u64,
    stopped: Option<String>,
    records: u64,
}

impl LogReader {
    /// Opens `path` and detects its format. Returns `None` if the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut input = BufReader::new(file);
        let format = LogFormat::sniff(input.fill_buf()?);
        let mut offset = 0;
        if format == LogFormat::Binary {
            input.consume(BINARY_LOG_MAGIC.len());
            offset = BINARY_LOG_MAGIC.len() as u64;
        }
        Ok(Some(Self {
            path: path.as_ref().to_path_buf(),
            format,
            input,
            offset,
            stopped: None,
            records: 0,
        }))
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Length of the prefix made of complete, valid records.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Reason reading stopped early, if it did.
    pub fn stop_reason(&self) -> Option<&str> {
        self.stopped.as_deref()
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Returns the next record, or `None` at the end of the valid prefix.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.stopped.is_some() {
            return Ok(None);
        }
        let attempt = match self.format {
            LogFormat::Text => self.read_text(),
            LogFormat::Binary => self.read_binary(),
        };
        match attempt {
            Ok(Some((record, len))) => {
                self.offset += len;
                self.records += 1;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(Error::Corruption(reason)) => {
                warn!(
                    path = %self.path.display(),
                    offset = self.offset,
                    %reason,
                    "stopping at damaged log record"
                );
                self.stopped = Some(reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_text(&mut self) -> Result<Option<(LogRecord, u64)>> {
        let mut line = Vec::new();
        let n = self.input.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::Corruption("record truncated".to_string()));
        }
        line.pop();
        let record = decode_text_line(&line)?;
        Ok(Some((record, n as u64)))
    }

    fn read_binary(&mut self) -> Result<Option<(LogRecord, u64)>> {
        let mut header = [0u8; BINARY_FRAME_HEADER];
        match read_full(&mut self.input, &mut header)? {
            0 => return Ok(None),
            n if n < BINARY_FRAME_HEADER => {
                return Err(Error::Corruption("frame header truncated".to_string()))
            }
            _ => {}
        }
        let (len, crc) = decode_frame_header(&header)?;
        let mut body = vec![0u8; len];
        if read_full(&mut self.input, &mut body)? < len {
            return Err(Error::Corruption("frame truncated".to_string()));
        }
        let record = decode_binary_body(&body, crc)?;
        Ok(Some((record, (BINARY_FRAME_HEADER + len) as u64)))
    }
}

impl Iterator for LogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Reads until `buf` is full or the input ends, returning the bytes read.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
