use std::fs::OpenOptions;
use std::path::Path;

use tracing::{info, warn};

use super::format::LogFormat;
use super::reader::LogReader;
use super::record::LogRecord;
use crate::common::Result;

/// Outcome of replaying one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: u64,
    pub format: Option<LogFormat>,
    /// Set when a damaged tail was found; holds the length of the good prefix.
    pub truncated_at: Option<u64>,
}

/// Feeds every valid record of `path` to `apply`, in file order.
///
/// A missing file replays nothing. Errors returned by `apply` abort replay.
pub fn replay_file<P, F>(path: P, mut apply: F) -> Result<ReplaySummary>
where
    P: AsRef<Path>,
    F: FnMut(LogRecord) -> Result<()>,
{
    let mut reader = match LogReader::open(path.as_ref())? {
        Some(r) => r,
        None => return Ok(ReplaySummary::default()),
    };
    while let Some(record) = reader.next_record()? {
        apply(record)?;
    }
    let summary = ReplaySummary {
        records: reader.records_read(),
        format: Some(reader.format()),
        truncated_at: reader.stop_reason().map(|_| reader.valid_len()),
    };
    info!(
        path = %path.as_ref().display(),
        records = summary.records,
        format = %reader.format(),
        "replayed"
    );
    Ok(summary)
}

/// Cuts a file back to `len` bytes so new records follow the last valid one.
pub fn truncate_damaged_tail<P: AsRef<Path>>(path: P, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path.as_ref())?;
    let before = file.metadata()?.len();
    file.set_len(len)?;
    file.sync_all()?;
    warn!(
        path = %path.as_ref().display(),
        dropped = before.saturating_sub(len),
        "truncated damaged log tail"
    );
    Ok(())
}
