use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::record::{corrupt, FieldSink, FieldSource, LogRecord, RecordKind};
use crate::common::{Error, Result, SessionId};
use crate::tuple::{DataType, Value};

/// Leading bytes of a binary log or script file. Text files start with a
/// hex checksum and never match.
pub const BINARY_LOG_MAGIC: [u8; 8] = *b"RSLGBIN1";

/// Size of a binary frame header: body length then body checksum.
pub const BINARY_FRAME_HEADER: usize = 8;

/// Upper bound on a single binary frame, used to reject garbage lengths.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// On-disk encoding of log and script records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One checksummed line per record.
    #[default]
    Text,
    /// Length-prefixed checksummed frames after a magic header.
    Binary,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "binary" => Ok(LogFormat::Binary),
            other => Err(Error::Properties(format!("unknown log format {:?}", other))),
        }
    }
}

impl LogFormat {
    /// Bytes written once at the start of a fresh file.
    pub fn file_header(&self) -> &'static [u8] {
        match self {
            LogFormat::Text => &[],
            LogFormat::Binary => &BINARY_LOG_MAGIC,
        }
    }

    /// Guesses the format from the first bytes of a file.
    pub fn sniff(prefix: &[u8]) -> LogFormat {
        if prefix.starts_with(&BINARY_LOG_MAGIC) {
            LogFormat::Binary
        } else {
            LogFormat::Text
        }
    }

    /// Appends one complete, checksummed record to `out`.
    pub fn encode(&self, record: &LogRecord, out: &mut BytesMut) -> Result<()> {
        match self {
            LogFormat::Text => encode_text(record, out),
            LogFormat::Binary => encode_binary(record, out),
        }
    }
}

// Text format

fn encode_text(record: &LogRecord, out: &mut BytesMut) -> Result<()> {
    let mut sink = TextSink {
        tokens: vec![
            record.kind().tag().to_string(),
            record.session().as_u32().to_string(),
        ],
    };
    record.write_fields(&mut sink)?;
    let body = sink.tokens.join(" ");
    let crc = crc32fast::hash(body.as_bytes());
    out.put_slice(format!("{:08x} ", crc).as_bytes());
    out.put_slice(body.as_bytes());
    out.put_u8(b'\n');
    Ok(())
}

/// Decodes one text line, without its trailing newline.
pub fn decode_text_line(line: &[u8]) -> Result<LogRecord> {
    let line = std::str::from_utf8(line).map_err(|_| corrupt("line is not UTF-8"))?;
    let (crc, body) = line.split_once(' ').ok_or_else(|| corrupt("missing checksum"))?;
    let expected = u32::from_str_radix(crc, 16).map_err(|_| corrupt("malformed checksum"))?;
    if crc32fast::hash(body.as_bytes()) != expected {
        return Err(corrupt("checksum mismatch"));
    }

    let mut parts = body.split(' ');
    let tag = parts.next().ok_or_else(|| corrupt("missing kind"))?;
    let kind = RecordKind::from_tag(tag).ok_or_else(|| corrupt(format!("unknown kind {}", tag)))?;
    let session = parts
        .next()
        .and_then(|s| s.parse().ok())
        .map(SessionId::new)
        .ok_or_else(|| corrupt("malformed session id"))?;
    let tokens = parts.map(unescape).collect::<Result<Vec<_>>>()?;
    let mut source = TextSource {
        tokens: tokens.into_iter(),
    };
    LogRecord::read_fields(kind, session, &mut source)
}

fn escape(s: &str) -> String {
    if s.is_empty() {
        return "\\0".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(token: &str) -> Result<String> {
    if token == "\\0" {
        return Ok(String::new());
    }
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            _ => return Err(corrupt("bad escape sequence")),
        }
    }
    Ok(out)
}

struct TextSink {
    tokens: Vec<String>,
}

impl FieldSink for TextSink {
    fn put_u32(&mut self, v: u32) {
        self.tokens.push(v.to_string());
    }

    fn put_u64(&mut self, v: u64) {
        self.tokens.push(v.to_string());
    }

    fn put_i64(&mut self, v: i64) {
        self.tokens.push(v.to_string());
    }

    fn put_bool(&mut self, v: bool) {
        self.tokens.push(if v { "1" } else { "0" }.to_string());
    }

    fn put_str(&mut self, v: &str) {
        self.tokens.push(escape(v));
    }

    fn put_value(&mut self, v: &Value) -> Result<()> {
        self.tokens.push(escape(&v.to_token()));
        Ok(())
    }

    fn put_type(&mut self, t: DataType) {
        self.tokens.push(t.to_string());
    }
}

struct TextSource {
    tokens: std::vec::IntoIter<String>,
}

impl TextSource {
    fn next_token(&mut self) -> Result<String> {
        self.tokens.next().ok_or_else(|| corrupt("missing field"))
    }

    fn parse<T: FromStr>(&mut self) -> Result<T> {
        let token = self.next_token()?;
        token
            .parse()
            .map_err(|_| corrupt(format!("malformed field {:?}", token)))
    }
}

impl FieldSource for TextSource {
    fn get_u32(&mut self) -> Result<u32> {
        self.parse()
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.parse()
    }

    fn get_i64(&mut self) -> Result<i64> {
        self.parse()
    }

    fn get_bool(&mut self) -> Result<bool> {
        match self.next_token()?.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(corrupt(format!("malformed flag {:?}", other))),
        }
    }

    fn get_str(&mut self) -> Result<String> {
        self.next_token()
    }

    fn get_value(&mut self) -> Result<Value> {
        Value::from_token(&self.next_token()?)
    }

    fn get_type(&mut self) -> Result<DataType> {
        self.next_token()?.parse()
    }

    fn finish(&mut self) -> Result<()> {
        match self.tokens.next() {
            Some(extra) => Err(corrupt(format!("unexpected trailing field {:?}", extra))),
            None => Ok(()),
        }
    }
}

// Binary format

fn encode_binary(record: &LogRecord, out: &mut BytesMut) -> Result<()> {
    let mut sink = BinarySink {
        body: BytesMut::with_capacity(64),
    };
    sink.body.put_u8(record.kind().code());
    sink.body.put_u32_le(record.session().as_u32());
    record.write_fields(&mut sink)?;
    out.put_u32_le(sink.body.len() as u32);
    out.put_u32_le(crc32fast::hash(&sink.body));
    out.put_slice(&sink.body);
    Ok(())
}

/// Reads the length and checksum of a binary frame header.
pub fn decode_frame_header(header: &[u8; BINARY_FRAME_HEADER]) -> Result<(usize, u32)> {
    let mut buf = &header[..];
    let len = buf.get_u32_le() as usize;
    let crc = buf.get_u32_le();
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(corrupt(format!("frame length {} out of range", len)));
    }
    Ok((len, crc))
}

/// Decodes a binary frame body once its checksum has been read.
pub fn decode_binary_body(body: &[u8], crc: u32) -> Result<LogRecord> {
    if crc32fast::hash(body) != crc {
        return Err(corrupt("checksum mismatch"));
    }
    let mut source = BinarySource { buf: body };
    if source.buf.remaining() < 5 {
        return Err(corrupt("frame too short"));
    }
    let code = source.buf.get_u8();
    let kind = RecordKind::from_code(code).ok_or_else(|| corrupt(format!("unknown kind {}", code)))?;
    let session = SessionId::new(source.buf.get_u32_le());
    LogRecord::read_fields(kind, session, &mut source)
}

struct BinarySink {
    body: BytesMut,
}

impl FieldSink for BinarySink {
    fn put_u32(&mut self, v: u32) {
        self.body.put_u32_le(v);
    }

    fn put_u64(&mut self, v: u64) {
        self.body.put_u64_le(v);
    }

    fn put_i64(&mut self, v: i64) {
        self.body.put_i64_le(v);
    }

    fn put_bool(&mut self, v: bool) {
        self.body.put_u8(v as u8);
    }

    fn put_str(&mut self, v: &str) {
        self.body.put_u32_le(v.len() as u32);
        self.body.put_slice(v.as_bytes());
    }

    fn put_value(&mut self, v: &Value) -> Result<()> {
        v.encode_tagged(&mut self.body);
        Ok(())
    }

    fn put_type(&mut self, t: DataType) {
        self.body.put_u8(t.code());
        let len = match t {
            DataType::VarChar(n) => n,
            _ => 0,
        };
        self.body.put_u16_le(len);
    }
}

struct BinarySource<'a> {
    buf: &'a [u8],
}

impl BinarySource<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(corrupt("frame truncated"));
        }
        Ok(())
    }
}

impl FieldSource for BinarySource<'_> {
    fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn get_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn get_bool(&mut self) -> Result<bool> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(corrupt(format!("malformed flag {}", other))),
        }
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| corrupt("string is not UTF-8"))?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    fn get_value(&mut self) -> Result<Value> {
        Value::decode_tagged(&mut self.buf)
    }

    fn get_type(&mut self) -> Result<DataType> {
        self.need(3)?;
        let code = self.buf.get_u8();
        let len = self.buf.get_u16_le();
        DataType::from_code(code, len)
    }

    fn finish(&mut self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(corrupt(format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{RowPos, TableId};

    fn sample() -> LogRecord {
        LogRecord::Insert {
            session: SessionId::new(3),
            table: TableId::new(1),
            pos: RowPos::new(96),
            values: vec![
                Value::Integer(7),
                Value::String("two words\nand a \\ slash".to_string()),
                Value::String(String::new()),
                Value::Null,
                Value::Double(1.5),
            ],
        }
    }

    fn decode_one(format: LogFormat, bytes: &[u8]) -> Result<LogRecord> {
        match format {
            LogFormat::Text => decode_text_line(&bytes[..bytes.len() - 1]),
            LogFormat::Binary => {
                let mut header = [0u8; BINARY_FRAME_HEADER];
                header.copy_from_slice(&bytes[..BINARY_FRAME_HEADER]);
                let (len, crc) = decode_frame_header(&header)?;
                decode_binary_body(&bytes[BINARY_FRAME_HEADER..BINARY_FRAME_HEADER + len], crc)
            }
        }
    }

    #[test]
    fn test_both_formats_preserve_records() {
        let records = vec![
            sample(),
            LogRecord::CreateTable {
                session: SessionId::SYSTEM,
                table: TableId::new(2),
                name: "orders".to_string(),
                columns: vec![DataType::BigInt, DataType::VarChar(40)],
                index_count: 2,
            },
            LogRecord::Statement {
                session: SessionId::new(1),
                sql: String::new(),
            },
            LogRecord::IndexRoots {
                session: SessionId::SYSTEM,
                table: TableId::new(2),
                roots: vec![RowPos::new(32), RowPos::NONE],
            },
            LogRecord::MutationCount {
                session: SessionId::SYSTEM,
                count: 12,
            },
        ];
        for format in [LogFormat::Text, LogFormat::Binary] {
            for record in &records {
                let mut out = BytesMut::new();
                format.encode(record, &mut out).unwrap();
                assert_eq!(&decode_one(format, &out).unwrap(), record, "{format}");
            }
        }
    }

    #[test]
    fn test_text_line_is_single_line() {
        let mut out = BytesMut::new();
        LogFormat::Text.encode(&sample(), &mut out).unwrap();
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(out.last(), Some(&b'\n'));
    }

    #[test]
    fn test_checksum_mismatch_is_detected() {
        for format in [LogFormat::Text, LogFormat::Binary] {
            let mut out = BytesMut::new();
            format.encode(&sample(), &mut out).unwrap();
            let idx = out.len() - 3;
            out[idx] ^= 0x01;
            assert!(matches!(decode_one(format, &out), Err(Error::Corruption(_))));
        }
    }

    #[test]
    fn test_sniff() {
        assert_eq!(LogFormat::sniff(&BINARY_LOG_MAGIC), LogFormat::Binary);
        assert_eq!(LogFormat::sniff(b"0badf00d INS"), LogFormat::Text);
        assert_eq!(LogFormat::sniff(b""), LogFormat::Text);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("binary".parse::<LogFormat>().unwrap(), LogFormat::Binary);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
