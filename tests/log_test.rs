//! Integration tests for the durability log

use std::fs::OpenOptions;
use std::io::Write;

use rowstore::catalog::SessionRegistry;
use rowstore::common::{RowPos, SessionId, TableId};
use rowstore::log::{replay_file, truncate_damaged_tail, LogFormat, LogReader, LogRecord, LogWriter};
use rowstore::tuple::Value;
use tempfile::tempdir;

fn interleaved() -> Vec<LogRecord> {
    let s1 = SessionId::new(1);
    let s2 = SessionId::new(2);
    let table = TableId::new(1);
    vec![
        LogRecord::AutoCommit {
            session: s2,
            enabled: false,
        },
        LogRecord::Insert {
            session: s1,
            table,
            pos: RowPos::new(32),
            values: vec![Value::Integer(1), Value::String("a b\nc".to_string())],
        },
        LogRecord::Statement {
            session: s2,
            sql: "UPDATE t SET b = ''".to_string(),
        },
        LogRecord::Insert {
            session: s2,
            table,
            pos: RowPos::new(64),
            values: vec![Value::Null, Value::String(String::new())],
        },
        LogRecord::Delete {
            session: s1,
            table,
            pos: RowPos::new(32),
        },
        LogRecord::Sequence {
            session: s1,
            name: "ids".to_string(),
            value: 7,
        },
        LogRecord::Commit { session: s2 },
    ]
}

fn write_log(path: &std::path::Path, format: LogFormat, records: &[LogRecord]) {
    let mut writer = LogWriter::create(path, format).unwrap();
    for record in records {
        writer.write(record).unwrap();
    }
    writer.close().unwrap();
}

fn check_routing(format: LogFormat) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.log");
    let records = interleaved();
    write_log(&path, format, &records);

    let mut sessions = SessionRegistry::new();
    let summary = replay_file(&path, |record| {
        sessions.route(record);
        Ok(())
    })
    .unwrap();
    assert_eq!(summary.records, records.len() as u64);
    assert_eq!(summary.format, Some(format));
    assert_eq!(summary.truncated_at, None);

    for id in [SessionId::new(1), SessionId::new(2)] {
        let expected: Vec<LogRecord> = records.iter().filter(|r| r.session() == id).cloned().collect();
        assert_eq!(sessions.session(id).unwrap().replayed(), &expected[..]);
    }
    assert!(sessions.session(SessionId::SYSTEM).unwrap().replayed().is_empty());
}

#[test]
fn test_sessions_routed_text() {
    check_routing(LogFormat::Text);
}

#[test]
fn test_sessions_routed_binary() {
    check_routing(LogFormat::Binary);
}

fn check_damaged_tail(format: LogFormat, garbage: &[u8]) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.log");
    let records = interleaved();
    write_log(&path, format, &records[..3]);
    let good_len = std::fs::metadata(&path).unwrap().len();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(garbage).unwrap();
    drop(file);

    let mut reader = LogReader::open(&path).unwrap().unwrap();
    let read: Vec<LogRecord> = reader.by_ref().map(|r| r.unwrap()).collect();
    assert_eq!(read, records[..3].to_vec());
    assert!(reader.stop_reason().is_some());
    assert_eq!(reader.valid_len(), good_len);

    truncate_damaged_tail(&path, reader.valid_len()).unwrap();
    let mut writer = LogWriter::open_append(&path, format).unwrap();
    writer.write(&records[3]).unwrap();
    writer.close().unwrap();

    let mut replayed = Vec::new();
    let summary = replay_file(&path, |record| {
        replayed.push(record);
        Ok(())
    })
    .unwrap();
    assert_eq!(summary.truncated_at, None);
    assert_eq!(replayed, records[..4].to_vec());
}

#[test]
fn test_damaged_tail_text() {
    check_damaged_tail(LogFormat::Text, b"0badc0de INS 1 1 32");
}

#[test]
fn test_damaged_tail_binary() {
    check_damaged_tail(LogFormat::Binary, &[0x20, 0, 0, 0, 0xAA, 0xBB]);
}

#[test]
fn test_missing_log_replays_nothing() {
    let dir = tempdir().unwrap();
    let summary = replay_file(dir.path().join("absent.log"), |_| Ok(())).unwrap();
    assert_eq!(summary.records, 0);
    assert_eq!(summary.format, None);
}
