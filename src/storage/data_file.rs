use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use crate::common::{
    Error, Result, COMPATIBLE_VERSION, DATA_FILE_MAGIC, DATA_FORMAT_VERSION, FREE_LIST_COUNT_POS,
    FREE_LIST_HEAD_POS, FREE_POS_POS, INITIAL_FREE_POS,
};

/// Fixed fields at the start of the `.data` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    pub version: u16,
    /// First byte past the last allocated row.
    pub free_pos: u32,
    /// Offset of the persisted free-list block, 0 when there is none.
    pub free_list_head: u32,
    /// Number of extents in the persisted free-list block.
    pub free_list_count: u32,
}

impl DataFileHeader {
    pub fn empty() -> Self {
        Self {
            version: DATA_FORMAT_VERSION,
            free_pos: INITIAL_FREE_POS,
            free_list_head: 0,
            free_list_count: 0,
        }
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(INITIAL_FREE_POS as usize);
        buf.put_slice(&DATA_FILE_MAGIC);
        buf.put_u16_le(self.version);
        buf.put_bytes(0, FREE_POS_POS as usize - buf.len());
        buf.put_u32_le(self.free_pos);
        buf.put_u32_le(self.free_list_head);
        buf.put_u32_le(self.free_list_count);
        buf.put_bytes(0, INITIAL_FREE_POS as usize - buf.len());
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf[..4] != DATA_FILE_MAGIC {
            return Err(Error::Corruption("data file has a bad magic number".to_string()));
        }
        buf.advance(4);
        let version = buf.get_u16_le();
        if version > DATA_FORMAT_VERSION {
            return Err(Error::IncompatibleVersion {
                found: format!("data format {}", version),
                supported: format!("data format {} ({})", DATA_FORMAT_VERSION, COMPATIBLE_VERSION),
            });
        }
        let mut fields = &buf[(FREE_POS_POS as usize - 6)..];
        let free_pos = fields.get_u32_le();
        let free_list_head = fields.get_u32_le();
        let free_list_count = fields.get_u32_le();
        if free_pos < INITIAL_FREE_POS {
            return Err(Error::Corruption(format!("free position {} inside the header", free_pos)));
        }
        Ok(Self {
            version,
            free_pos,
            free_list_head,
            free_list_count,
        })
    }
}

/// Random-access handle on the `.data` file.
/// Rows are addressed by byte offset; the first bytes hold [`DataFileHeader`].
pub struct DataFile {
    /// The data file
    file: Mutex<File>,
    /// Path to the data file
    path: PathBuf,
    read_only: bool,
    /// Number of read operations performed
    num_reads: AtomicU64,
    /// Number of write operations performed
    num_writes: AtomicU64,
}

impl DataFile {
    /// Opens the data file, creating it unless `read_only` is set.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = if read_only {
            OpenOptions::new().read(true).open(path.as_ref())?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path.as_ref())?
        };

        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            read_only,
            num_reads: AtomicU64::new(0),
            num_writes: AtomicU64::new(0),
        })
    }

    /// Reads `buf.len()` bytes at `pos`. Bytes past the end of the file read as zero.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // If we're reading beyond the file, fill with zeros
        buf[filled..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes `data` at `pos`, growing the file if needed.
    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_u32_at(&self, pos: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(pos, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32_at(&self, pos: u64, value: u32) -> Result<()> {
        self.write_at(pos, &value.to_le_bytes())
    }

    /// Reads the header, or `None` if the file is too short to hold one.
    pub fn read_header(&self) -> Result<Option<DataFileHeader>> {
        if self.len()? < INITIAL_FREE_POS as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; INITIAL_FREE_POS as usize];
        self.read_at(0, &mut buf)?;
        DataFileHeader::decode(&buf).map(Some)
    }

    pub fn write_header(&self, header: &DataFileHeader) -> Result<()> {
        self.write_at(0, &header.encode())
    }

    /// Updates only the free position field.
    pub fn write_free_pos(&self, free_pos: u32) -> Result<()> {
        self.write_u32_at(FREE_POS_POS, free_pos)
    }

    /// Updates the free-list fields of the header.
    pub fn write_free_list_fields(&self, head: u32, count: u32) -> Result<()> {
        self.write_u32_at(FREE_LIST_HEAD_POS, head)?;
        self.write_u32_at(FREE_LIST_COUNT_POS, count)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Shrinks or grows the file to `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file.lock().set_len(len)?;
        Ok(())
    }

    /// Forces written data to stable storage.
    pub fn sync(&self) -> Result<()> {
        if !self.read_only {
            self.file.lock().sync_all()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the number of read operations performed.
    pub fn num_reads(&self) -> u64 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of write operations performed.
    pub fn num_writes(&self) -> u64 {
        self.num_writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("t.data"), false).unwrap();
        assert_eq!(file.read_header().unwrap(), None);

        let header = DataFileHeader {
            free_pos: 4096,
            free_list_head: 4096,
            free_list_count: 3,
            ..DataFileHeader::empty()
        };
        file.write_header(&header).unwrap();
        assert_eq!(file.len().unwrap(), INITIAL_FREE_POS as u64);
        assert_eq!(file.read_header().unwrap(), Some(header));

        file.write_free_pos(8192).unwrap();
        assert_eq!(file.read_header().unwrap().unwrap().free_pos, 8192);
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("t.data"), false).unwrap();
        file.write_at(0, &[7u8; 32]).unwrap();
        assert!(matches!(file.read_header(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("t.data"), false).unwrap();
        file.write_header(&DataFileHeader::empty()).unwrap();
        file.write_at(4, &(DATA_FORMAT_VERSION + 1).to_le_bytes()).unwrap();
        assert!(matches!(file.read_header(), Err(Error::IncompatibleVersion { .. })));
    }

    #[test]
    fn test_read_past_end_is_zero() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("t.data"), false).unwrap();
        file.write_at(0, &[1, 2, 3]).unwrap();
        let mut buf = [9u8; 6];
        file.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 0, 0, 0, 0]);
        assert_eq!(file.read_u32_at(100).unwrap(), 0);
        assert_eq!(file.num_reads(), 2);
        assert_eq!(file.num_writes(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");
        DataFile::open(&path, false).unwrap();
        let file = DataFile::open(&path, true).unwrap();
        assert!(matches!(file.write_at(0, &[1]), Err(Error::ReadOnly)));
    }
}
