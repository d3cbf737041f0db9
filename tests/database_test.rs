//! Integration tests for recovery and checkpoints

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rowstore::common::{RowPos, TableId};
use rowstore::database::{Database, DatabaseOptions};
use rowstore::storage::ModificationState;
use rowstore::tuple::{DataType, Value};
use tempfile::TempDir;

fn options() -> DatabaseOptions {
    DatabaseOptions::new()
        .cache_scale(8)
        .cache_size_scale(8)
        .sync_tick(Duration::from_millis(20))
}

fn row(i: i64) -> Vec<Value> {
    vec![Value::BigInt(i), Value::String(format!("value {}", i)), Value::Boolean(i % 2 == 0)]
}

fn columns() -> Vec<DataType> {
    vec![DataType::BigInt, DataType::VarChar(40), DataType::Boolean]
}

fn all_rows(db: &Database, table: TableId) -> Vec<(RowPos, Vec<Value>)> {
    db.table_rows(table)
        .unwrap()
        .into_iter()
        .map(|pos| (pos, db.fetch(table, pos).unwrap().unwrap()))
        .collect()
}

#[test]
fn test_crash_without_checkpoint_recovers_everything() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("db");

    let (table, expected) = {
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        let mut positions = Vec::new();
        for i in 0..100 {
            positions.push(db.insert(s, t, row(i)).unwrap());
        }
        for pos in positions.iter().skip(1).step_by(5) {
            db.update(s, t, *pos, row(-1)).unwrap();
        }
        for pos in positions.iter().step_by(5) {
            db.delete(s, t, *pos).unwrap();
        }
        db.commit(s).unwrap();
        (t, all_rows(&db, t))
        // dropped without close
    };

    let db = Database::open(&base, options()).unwrap();
    assert_eq!(all_rows(&db, table), expected);
    assert_eq!(db.state(), ModificationState::Modified);
    db.close().unwrap();
    assert_eq!(db.state(), ModificationState::NotModified);
}

#[test]
fn test_evicted_rows_recover_after_checkpoint() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("db");

    let table = {
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "big", columns(), 1).unwrap();
        for i in 0..2000 {
            db.insert(s, t, row(i)).unwrap();
        }
        db.checkpoint(false).unwrap();
        for i in 2000..2500 {
            db.insert(s, t, row(i)).unwrap();
        }
        assert!(db.stats().cache.rows_evicted > 0);
        db.shutdown();
        t
    };

    let db = Database::open(&base, options()).unwrap();
    let rows = all_rows(&db, table);
    assert_eq!(rows.len(), 2500);
    for (i, (_, values)) in rows.iter().enumerate() {
        assert_eq!(values, &row(i as i64));
    }
    assert_eq!(db.mutation_count().unwrap(), 2500);
}

#[test]
fn test_concurrent_sessions() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("db");
    let db = Arc::new(Database::open(&base, options()).unwrap());
    let t = db.create_table(db.open_session().unwrap(), "shared", columns(), 1).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let s = db.open_session().unwrap();
                for i in 0..50 {
                    db.insert(s, t, row(worker * 1000 + i)).unwrap();
                }
                db.next_sequence(s, "batch").unwrap();
                db.commit(s).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(db.table_rows(t).unwrap().len(), 200);
    db.shutdown();
    drop(db);

    let db = Database::open(&base, options()).unwrap();
    assert_eq!(db.table_rows(t).unwrap().len(), 200);
    assert_eq!(db.sequence("batch").unwrap(), Some(4));
    assert_eq!(db.sessions().unwrap().len(), 1 + 1 + 4);
}

#[test]
fn test_drop_table_survives_restart() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("db");
    {
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let a = db.create_table(s, "a", columns(), 1).unwrap();
        let b = db.create_table(s, "b", columns(), 1).unwrap();
        db.insert(s, a, row(1)).unwrap();
        db.insert(s, b, row(2)).unwrap();
        db.drop_table(s, a).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&base, options()).unwrap();
    assert_eq!(db.table_id("a").unwrap(), None);
    let b = db.table_id("b").unwrap().unwrap();
    assert_eq!(all_rows(&db, b).len(), 1);
}

#[test]
fn test_random_workload_matches_model_after_crash() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("db");
    let mut rng = StdRng::seed_from_u64(42);
    let mut model: BTreeMap<RowPos, Vec<Value>> = BTreeMap::new();

    let table = {
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "random", columns(), 1).unwrap();
        for step in 0..1500i64 {
            if model.is_empty() || rng.gen_bool(0.6) {
                let values = row(step * 1000 + rng.gen_range(0..1000));
                let pos = db.insert(s, t, values.clone()).unwrap();
                assert!(model.insert(pos, values).is_none());
            } else {
                let idx = rng.gen_range(0..model.len());
                let pos = *model.keys().nth(idx).unwrap();
                db.delete(s, t, pos).unwrap();
                model.remove(&pos);
            }
            if step == 700 {
                db.checkpoint(false).unwrap();
            }
        }
        db.shutdown();
        t
    };

    let db = Database::open(&base, options()).unwrap();
    let expected: Vec<(RowPos, Vec<Value>)> = model.into_iter().collect();
    assert_eq!(all_rows(&db, table), expected);
}
