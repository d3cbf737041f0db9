use thiserror::Error;

use super::types::{RowPos, TableId};

/// Errors raised by the cache, the allocator and the durability log.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted file: {0}")]
    Corruption(String),

    #[error("Invalid value {value} for {name}, expected {min}..={max}")]
    InvalidConfig {
        name: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("Files written by format version {found}, this build supports up to {supported}")]
    IncompatibleVersion { found: String, supported: String },

    #[error("Value does not fit its column: {0}")]
    TypeMismatch(String),

    #[error("Row cache is full and no resident row can be evicted")]
    CacheFull,

    #[error("Data file cannot grow past 4 GiB to place {0} more bytes")]
    DataFileFull(u32),

    #[error("Table {0} not found")]
    TableNotFound(TableId),

    #[error("No row at {0}")]
    RowNotFound(RowPos),

    #[error("Replayed row landed at {actual}, log expected {expected}")]
    PositionMismatch { expected: RowPos, actual: RowPos },

    #[error("Database is read-only")]
    ReadOnly,

    #[error("Database is closed")]
    Closed,

    #[error("Database was not closed cleanly; open it read-write once to recover")]
    NeedsRecovery,

    #[error("Properties error: {0}")]
    Properties(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Properties(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Properties(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig {
            name: "cache_scale",
            value: 30,
            min: 8,
            max: 18,
        };
        assert_eq!(
            err.to_string(),
            "Invalid value 30 for cache_scale, expected 8..=18"
        );

        let err = Error::PositionMismatch {
            expected: RowPos::new(32),
            actual: RowPos::new(40),
        };
        assert_eq!(
            err.to_string(),
            "Replayed row landed at RowPos(40), log expected RowPos(32)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
