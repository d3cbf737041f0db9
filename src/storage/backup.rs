use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use tracing::info;

use crate::common::Result;

/// Writes a compressed copy of `src` to `dest`, replacing `dest`.
pub fn compress_file<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dest: Q) -> Result<u64> {
    let mut input = BufReader::new(File::open(src.as_ref())?);
    let out = File::create(dest.as_ref())?;
    let mut encoder = FrameEncoder::new(BufWriter::new(out));
    let copied = io::copy(&mut input, &mut encoder)?;
    encoder.flush()?;
    encoder.get_ref().get_ref().sync_all()?;
    info!(
        src = %src.as_ref().display(),
        dest = %dest.as_ref().display(),
        bytes = copied,
        "wrote backup"
    );
    Ok(copied)
}

/// Restores `dest` from a backup written by [`compress_file`].
pub fn decompress_file<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dest: Q) -> Result<u64> {
    let mut decoder = FrameDecoder::new(BufReader::new(File::open(src.as_ref())?));
    let mut out = BufWriter::new(File::create(dest.as_ref())?);
    let copied = io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    out.get_ref().sync_all()?;
    info!(
        src = %src.as_ref().display(),
        dest = %dest.as_ref().display(),
        bytes = copied,
        "restored data file from backup"
    );
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_compress_and_restore() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("db.data");
        let backup = dir.path().join("db.backup");
        let restored = dir.path().join("restored.data");

        let mut contents = vec![0u8; 64 * 1024];
        for (i, b) in contents.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        std::fs::write(&data, &contents).unwrap();

        assert_eq!(compress_file(&data, &backup).unwrap(), contents.len() as u64);
        assert!(std::fs::metadata(&backup).unwrap().len() < contents.len() as u64);
        decompress_file(&backup, &restored).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), contents);
    }

    #[test]
    fn test_garbage_backup_fails() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("db.backup");
        std::fs::write(&backup, b"definitely not snappy").unwrap();
        assert!(decompress_file(&backup, dir.path().join("out")).is_err());
    }
}
