use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::common::{Error, Result};

use super::DataType;

/// A typed column value held by a cached row or carried by a log record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL in a column of any type.
    Null,
    Boolean(bool),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Double(f64),
    /// Text for a `VARCHAR` column.
    String(String),

    /// Microseconds since the Unix epoch.
    Timestamp(i64),
}

const TAG_NULL: u8 = 0;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Number of bytes `encode` writes for this value in a column of `data_type`.
    pub fn encoded_len(&self, data_type: &DataType) -> usize {
        match (self, data_type) {
            (Value::Null, _) => 0,
            (Value::String(s), DataType::VarChar(_)) => 2 + s.len(),
            (_, dt) => dt.fixed_size().unwrap_or(0),
        }
    }

    /// Writes the value in the untagged row layout of `data_type`.
    /// Nulls are carried by the row's null bitmap and write nothing.
    pub fn encode(&self, data_type: &DataType, out: &mut BytesMut) -> Result<()> {
        match (self, data_type) {
            (Value::Null, _) => {}
            (Value::Boolean(b), DataType::Boolean) => out.put_u8(*b as u8),
            (Value::SmallInt(v), DataType::SmallInt) => out.put_i16_le(*v),
            (Value::Integer(v), DataType::Integer) => out.put_i32_le(*v),
            (Value::BigInt(v), DataType::BigInt) => out.put_i64_le(*v),
            (Value::Double(v), DataType::Double) => out.put_f64_le(*v),
            (Value::Timestamp(v), DataType::Timestamp) => out.put_i64_le(*v),
            (Value::String(s), DataType::VarChar(max_len)) => {
                if s.len() > *max_len as usize {
                    return Err(Error::TypeMismatch(format!(
                        "string of {} bytes exceeds {}",
                        s.len(),
                        data_type
                    )));
                }
                out.put_u16_le(s.len() as u16);
                out.put_slice(s.as_bytes());
            }

            // Widening coercions
            (Value::SmallInt(v), DataType::Integer) => out.put_i32_le(*v as i32),
            (Value::SmallInt(v), DataType::BigInt) => out.put_i64_le(*v as i64),
            (Value::Integer(v), DataType::BigInt) => out.put_i64_le(*v as i64),

            (value, dt) => {
                return Err(Error::TypeMismatch(format!("{} is not a {}", value, dt)));
            }
        }
        Ok(())
    }

    /// Reads a non-null value of `data_type` written by [`Value::encode`].
    pub fn decode(buf: &mut &[u8], data_type: &DataType) -> Result<Self> {
        let needed = match data_type {
            DataType::VarChar(_) => 2,
            dt => dt.fixed_size().unwrap_or(0),
        };
        if buf.remaining() < needed {
            return Err(truncated(data_type));
        }
        let value = match data_type {
            DataType::Boolean => Value::Boolean(buf.get_u8() != 0),
            DataType::SmallInt => Value::SmallInt(buf.get_i16_le()),
            DataType::Integer => Value::Integer(buf.get_i32_le()),
            DataType::BigInt => Value::BigInt(buf.get_i64_le()),
            DataType::Double => Value::Double(buf.get_f64_le()),
            DataType::Timestamp => Value::Timestamp(buf.get_i64_le()),
            DataType::VarChar(_) => {
                let len = buf.get_u16_le() as usize;
                if buf.remaining() < len {
                    return Err(truncated(data_type));
                }
                let s = String::from_utf8_lossy(&buf[..len]).to_string();
                buf.advance(len);
                Value::String(s)
            }
        };
        Ok(value)
    }

    /// Writes the value with a leading type tag, so it can be read back
    /// without knowing the column type. Used by the binary log.
    pub fn encode_tagged(&self, out: &mut BytesMut) {
        match self {
            Value::Null => out.put_u8(TAG_NULL),
            Value::Boolean(b) => {
                out.put_u8(DataType::Boolean.code());
                out.put_u8(*b as u8);
            }
            Value::SmallInt(v) => {
                out.put_u8(DataType::SmallInt.code());
                out.put_i16_le(*v);
            }
            Value::Integer(v) => {
                out.put_u8(DataType::Integer.code());
                out.put_i32_le(*v);
            }
            Value::BigInt(v) => {
                out.put_u8(DataType::BigInt.code());
                out.put_i64_le(*v);
            }
            Value::Double(v) => {
                out.put_u8(DataType::Double.code());
                out.put_f64_le(*v);
            }
            Value::String(s) => {
                out.put_u8(DataType::VarChar(0).code());
                out.put_u32_le(s.len() as u32);
                out.put_slice(s.as_bytes());
            }
            Value::Timestamp(v) => {
                out.put_u8(DataType::Timestamp.code());
                out.put_i64_le(*v);
            }
        }
    }

    /// Reads a value written by [`Value::encode_tagged`].
    pub fn decode_tagged(buf: &mut &[u8]) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::Corruption("value tag truncated".to_string()));
        }
        let tag = buf.get_u8();
        if tag == TAG_NULL {
            return Ok(Value::Null);
        }
        if tag == DataType::VarChar(0).code() {
            if buf.remaining() < 4 {
                return Err(truncated(&DataType::VarChar(0)));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(truncated(&DataType::VarChar(0)));
            }
            let s = String::from_utf8_lossy(&buf[..len]).to_string();
            buf.advance(len);
            return Ok(Value::String(s));
        }
        let data_type = DataType::from_code(tag, 0)?;
        Value::decode(buf, &data_type)
    }

    /// Self-describing text token used by the text log format.
    pub fn to_token(&self) -> String {
        match self {
            Value::Null => "n".to_string(),
            Value::Boolean(b) => format!("b{}", *b as u8),
            Value::SmallInt(v) => format!("h{}", v),
            Value::Integer(v) => format!("i{}", v),
            Value::BigInt(v) => format!("l{}", v),
            Value::Double(v) => format!("d{:016x}", v.to_bits()),
            Value::String(s) => format!("s{}", s),
            Value::Timestamp(v) => format!("t{}", v),
        }
    }

    /// Parses a token produced by [`Value::to_token`].
    pub fn from_token(token: &str) -> Result<Self> {
        let bad = || Error::Corruption(format!("malformed value token {:?}", token));
        let mut chars = token.chars();
        let kind = chars.next().ok_or_else(bad)?;
        let rest = chars.as_str();
        let value = match kind {
            'n' if rest.is_empty() => Value::Null,
            'b' => match rest {
                "0" => Value::Boolean(false),
                "1" => Value::Boolean(true),
                _ => return Err(bad()),
            },
            'h' => Value::SmallInt(rest.parse().map_err(|_| bad())?),
            'i' => Value::Integer(rest.parse().map_err(|_| bad())?),
            'l' => Value::BigInt(rest.parse().map_err(|_| bad())?),
            'd' => Value::Double(f64::from_bits(
                u64::from_str_radix(rest, 16).map_err(|_| bad())?,
            )),
            's' => Value::String(rest.to_string()),
            't' => Value::Timestamp(rest.parse().map_err(|_| bad())?),
            _ => return Err(bad()),
        };
        Ok(value)
    }
}

fn truncated(data_type: &DataType) -> Error {
    Error::Corruption(format!("{} value truncated", data_type))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "'{}'", s),
            Value::Timestamp(v) => write!(f, "TIMESTAMP({})", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
