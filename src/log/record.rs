use crate::common::{Error, Result, RowPos, SessionId, TableId};
use crate::tuple::{DataType, Value};

/// A single entry of the log or the checkpoint script.
///
/// Session records describe mutations in the order they happened. The
/// snapshot records (`CreateTable`, `IndexRoots`, `TableRows`,
/// `MutationCount`) are what a checkpoint writes to the script; they carry
/// `SessionId::SYSTEM`.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Statement {
        session: SessionId,
        sql: String,
    },
    Insert {
        session: SessionId,
        table: TableId,
        pos: RowPos,
        values: Vec<Value>,
    },
    Delete {
        session: SessionId,
        table: TableId,
        pos: RowPos,
    },
    Sequence {
        session: SessionId,
        name: String,
        value: i64,
    },
    AutoCommit {
        session: SessionId,
        enabled: bool,
    },
    Commit {
        session: SessionId,
    },
    CreateTable {
        session: SessionId,
        table: TableId,
        name: String,
        columns: Vec<DataType>,
        index_count: u32,
    },
    DropTable {
        session: SessionId,
        table: TableId,
    },
    IndexRoots {
        session: SessionId,
        table: TableId,
        roots: Vec<RowPos>,
    },
    TableRows {
        session: SessionId,
        table: TableId,
        rows: Vec<RowPos>,
    },
    MutationCount {
        session: SessionId,
        count: u64,
    },
}

/// Record kind as it appears on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Statement = 1,
    Insert = 2,
    Delete = 3,
    Sequence = 4,
    AutoCommit = 5,
    Commit = 6,
    CreateTable = 7,
    DropTable = 8,
    IndexRoots = 9,
    TableRows = 10,
    MutationCount = 11,
}

const ALL_KINDS: [RecordKind; 11] = [
    RecordKind::Statement,
    RecordKind::Insert,
    RecordKind::Delete,
    RecordKind::Sequence,
    RecordKind::AutoCommit,
    RecordKind::Commit,
    RecordKind::CreateTable,
    RecordKind::DropTable,
    RecordKind::IndexRoots,
    RecordKind::TableRows,
    RecordKind::MutationCount,
];

impl RecordKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.code() == code)
    }

    /// Tag used by the text format.
    pub fn tag(self) -> &'static str {
        match self {
            RecordKind::Statement => "STMT",
            RecordKind::Insert => "INS",
            RecordKind::Delete => "DEL",
            RecordKind::Sequence => "SEQ",
            RecordKind::AutoCommit => "AUTOCOMMIT",
            RecordKind::Commit => "COMMIT",
            RecordKind::CreateTable => "TABLE",
            RecordKind::DropTable => "DROP",
            RecordKind::IndexRoots => "ROOTS",
            RecordKind::TableRows => "ROWS",
            RecordKind::MutationCount => "COUNT",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.tag() == tag)
    }
}

/// Destination for the fields of a record. Each log format provides one.
pub trait FieldSink {
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_i64(&mut self, v: i64);
    fn put_bool(&mut self, v: bool);
    fn put_str(&mut self, v: &str);
    fn put_value(&mut self, v: &Value) -> Result<()>;
    fn put_type(&mut self, t: DataType);
}

/// Source of the fields of a record, the inverse of [`FieldSink`].
pub trait FieldSource {
    fn get_u32(&mut self) -> Result<u32>;
    fn get_u64(&mut self) -> Result<u64>;
    fn get_i64(&mut self) -> Result<i64>;
    fn get_bool(&mut self) -> Result<bool>;
    fn get_str(&mut self) -> Result<String>;
    fn get_value(&mut self) -> Result<Value>;
    fn get_type(&mut self) -> Result<DataType>;
    /// Fails if unread fields are left over.
    fn finish(&mut self) -> Result<()>;
}

impl LogRecord {
    pub fn session(&self) -> SessionId {
        match self {
            LogRecord::Statement { session, .. }
            | LogRecord::Insert { session, .. }
            | LogRecord::Delete { session, .. }
            | LogRecord::Sequence { session, .. }
            | LogRecord::AutoCommit { session, .. }
            | LogRecord::Commit { session }
            | LogRecord::CreateTable { session, .. }
            | LogRecord::DropTable { session, .. }
            | LogRecord::IndexRoots { session, .. }
            | LogRecord::TableRows { session, .. }
            | LogRecord::MutationCount { session, .. } => *session,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Statement { .. } => RecordKind::Statement,
            LogRecord::Insert { .. } => RecordKind::Insert,
            LogRecord::Delete { .. } => RecordKind::Delete,
            LogRecord::Sequence { .. } => RecordKind::Sequence,
            LogRecord::AutoCommit { .. } => RecordKind::AutoCommit,
            LogRecord::Commit { .. } => RecordKind::Commit,
            LogRecord::CreateTable { .. } => RecordKind::CreateTable,
            LogRecord::DropTable { .. } => RecordKind::DropTable,
            LogRecord::IndexRoots { .. } => RecordKind::IndexRoots,
            LogRecord::TableRows { .. } => RecordKind::TableRows,
            LogRecord::MutationCount { .. } => RecordKind::MutationCount,
        }
    }

    /// Returns true for records that change table contents or sequences.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            LogRecord::Statement { .. }
                | LogRecord::Insert { .. }
                | LogRecord::Delete { .. }
                | LogRecord::Sequence { .. }
        )
    }

    /// Writes everything after the kind and session.
    pub fn write_fields<S: FieldSink>(&self, sink: &mut S) -> Result<()> {
        match self {
            LogRecord::Statement { sql, .. } => sink.put_str(sql),
            LogRecord::Insert {
                table, pos, values, ..
            } => {
                sink.put_u32(table.as_u32());
                sink.put_u32(pos.as_u32());
                sink.put_u32(values.len() as u32);
                for v in values {
                    sink.put_value(v)?;
                }
            }
            LogRecord::Delete { table, pos, .. } => {
                sink.put_u32(table.as_u32());
                sink.put_u32(pos.as_u32());
            }
            LogRecord::Sequence { name, value, .. } => {
                sink.put_str(name);
                sink.put_i64(*value);
            }
            LogRecord::AutoCommit { enabled, .. } => sink.put_bool(*enabled),
            LogRecord::Commit { .. } => {}
            LogRecord::CreateTable {
                table,
                name,
                columns,
                index_count,
                ..
            } => {
                sink.put_u32(table.as_u32());
                sink.put_str(name);
                sink.put_u32(*index_count);
                sink.put_u32(columns.len() as u32);
                for c in columns {
                    sink.put_type(*c);
                }
            }
            LogRecord::DropTable { table, .. } => sink.put_u32(table.as_u32()),
            LogRecord::IndexRoots { table, roots, .. } => {
                sink.put_u32(table.as_u32());
                write_positions(sink, roots);
            }
            LogRecord::TableRows { table, rows, .. } => {
                sink.put_u32(table.as_u32());
                write_positions(sink, rows);
            }
            LogRecord::MutationCount { count, .. } => sink.put_u64(*count),
        }
        Ok(())
    }

    /// Reads the fields of a record of `kind` written by [`write_fields`](Self::write_fields).
    pub fn read_fields<S: FieldSource>(kind: RecordKind, session: SessionId, src: &mut S) -> Result<Self> {
        let record = match kind {
            RecordKind::Statement => LogRecord::Statement {
                session,
                sql: src.get_str()?,
            },
            RecordKind::Insert => {
                let table = TableId::new(src.get_u32()?);
                let pos = RowPos::new(src.get_u32()?);
                let n = src.get_u32()?;
                let mut values = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    values.push(src.get_value()?);
                }
                LogRecord::Insert {
                    session,
                    table,
                    pos,
                    values,
                }
            }
            RecordKind::Delete => LogRecord::Delete {
                session,
                table: TableId::new(src.get_u32()?),
                pos: RowPos::new(src.get_u32()?),
            },
            RecordKind::Sequence => LogRecord::Sequence {
                session,
                name: src.get_str()?,
                value: src.get_i64()?,
            },
            RecordKind::AutoCommit => LogRecord::AutoCommit {
                session,
                enabled: src.get_bool()?,
            },
            RecordKind::Commit => LogRecord::Commit { session },
            RecordKind::CreateTable => {
                let table = TableId::new(src.get_u32()?);
                let name = src.get_str()?;
                let index_count = src.get_u32()?;
                let n = src.get_u32()?;
                let mut columns = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    columns.push(src.get_type()?);
                }
                LogRecord::CreateTable {
                    session,
                    table,
                    name,
                    columns,
                    index_count,
                }
            }
            RecordKind::DropTable => LogRecord::DropTable {
                session,
                table: TableId::new(src.get_u32()?),
            },
            RecordKind::IndexRoots => LogRecord::IndexRoots {
                session,
                table: TableId::new(src.get_u32()?),
                roots: read_positions(src)?,
            },
            RecordKind::TableRows => LogRecord::TableRows {
                session,
                table: TableId::new(src.get_u32()?),
                rows: read_positions(src)?,
            },
            RecordKind::MutationCount => LogRecord::MutationCount {
                session,
                count: src.get_u64()?,
            },
        };
        src.finish()?;
        Ok(record)
    }
}

fn write_positions<S: FieldSink>(sink: &mut S, positions: &[RowPos]) {
    sink.put_u32(positions.len() as u32);
    for p in positions {
        sink.put_u32(p.as_u32());
    }
}

fn read_positions<S: FieldSource>(src: &mut S) -> Result<Vec<RowPos>> {
    let n = src.get_u32()?;
    let mut out = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        out.push(RowPos::new(src.get_u32()?));
    }
    Ok(out)
}

pub(crate) fn corrupt(what: impl std::fmt::Display) -> Error {
    Error::Corruption(format!("log record: {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_and_tags() {
        for kind in ALL_KINDS {
            assert_eq!(RecordKind::from_code(kind.code()), Some(kind));
            assert_eq!(RecordKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(RecordKind::from_code(0), None);
        assert_eq!(RecordKind::from_tag("BOGUS"), None);
    }

    #[test]
    fn test_session_and_mutation() {
        let s = SessionId::new(4);
        let ins = LogRecord::Insert {
            session: s,
            table: TableId::new(1),
            pos: RowPos::new(32),
            values: vec![Value::Integer(1)],
        };
        assert_eq!(ins.session(), s);
        assert!(ins.is_mutation());
        assert!(!LogRecord::Commit { session: s }.is_mutation());
    }
}
