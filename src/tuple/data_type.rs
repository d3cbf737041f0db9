use std::fmt;
use std::str::FromStr;

use crate::common::{Error, Result};

/// Column types a cached row can hold.
///
/// Widths below are the on-disk widths inside a row image; all integers are
/// written little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// One byte, nonzero means true.
    Boolean,

    /// `i16`.
    SmallInt,

    /// `i32`.
    Integer,

    /// `i64`.
    BigInt,

    /// `f64` bit pattern.
    Double,

    /// UTF-8 text of at most `n` bytes behind a `u16` length.
    VarChar(u16),

    /// Microseconds since the Unix epoch as an `i64`.
    Timestamp,
}

impl DataType {
    /// Encoded width, or `None` when the width depends on the value.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(1),
            DataType::SmallInt => Some(2),
            DataType::Integer => Some(4),
            DataType::BigInt => Some(8),
            DataType::Double => Some(8),
            DataType::Timestamp => Some(8),
            DataType::VarChar(_) => None,
        }
    }

    /// One-byte tag used by the binary log encoding.
    pub fn code(&self) -> u8 {
        match self {
            DataType::Boolean => 1,
            DataType::SmallInt => 2,
            DataType::Integer => 3,
            DataType::BigInt => 4,
            DataType::Double => 5,
            DataType::VarChar(_) => 6,
            DataType::Timestamp => 7,
        }
    }

    /// Rebuilds a type from its binary tag; `len` is only used by `VarChar`.
    pub fn from_code(code: u8, len: u16) -> Result<Self> {
        match code {
            1 => Ok(DataType::Boolean),
            2 => Ok(DataType::SmallInt),
            3 => Ok(DataType::Integer),
            4 => Ok(DataType::BigInt),
            5 => Ok(DataType::Double),
            6 => Ok(DataType::VarChar(len)),
            7 => Ok(DataType::Timestamp),
            other => Err(Error::Corruption(format!("unknown column type tag {}", other))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::SmallInt => write!(f, "SMALLINT"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::VarChar(n) => write!(f, "VARCHAR({})", n),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "BOOLEAN" => Ok(DataType::Boolean),
            "SMALLINT" => Ok(DataType::SmallInt),
            "INTEGER" => Ok(DataType::Integer),
            "BIGINT" => Ok(DataType::BigInt),
            "DOUBLE" => Ok(DataType::Double),
            "TIMESTAMP" => Ok(DataType::Timestamp),
            _ => {
                let len = upper
                    .strip_prefix("VARCHAR(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|n| n.parse::<u16>().ok())
                    .ok_or_else(|| Error::Corruption(format!("unknown column type {}", s)))?;
                Ok(DataType::VarChar(len))
            }
        }
    }
}
