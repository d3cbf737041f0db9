use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::Table;
use crate::common::{Error, Result, RowPos, SessionId, TableId};
use crate::log::LogRecord;
use crate::tuple::DataType;

/// Tables, sequences and the mutation counter of one database.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: BTreeMap<TableId, Arc<Table>>,
    next_table_id: u32,
    sequences: BTreeMap<String, i64>,
    mutation_count: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            next_table_id: 1,
            ..Default::default()
        }
    }

    /// Creates a table with a fresh id.
    pub fn create_table(&mut self, name: &str, columns: Vec<DataType>, index_count: usize) -> Arc<Table> {
        let id = TableId::new(self.next_table_id.max(1));
        let table = Arc::new(Table::new(id, name, columns, index_count));
        self.insert_table(Arc::clone(&table));
        table
    }

    /// Registers a table whose id was decided elsewhere (replay).
    pub fn insert_table(&mut self, table: Arc<Table>) {
        let id = table.id().as_u32();
        if id >= self.next_table_id {
            self.next_table_id = id + 1;
        }
        self.tables.insert(table.id(), table);
    }

    pub fn drop_table(&mut self, id: TableId) -> Option<Arc<Table>> {
        self.tables.remove(&id)
    }

    pub fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.tables.get(&id).cloned().ok_or(Error::TableNotFound(id))
    }

    pub fn table_by_name(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.values().find(|t| t.name() == name).cloned()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.values()
    }

    /// Advances a sequence and returns its new value. Sequences start at 1.
    pub fn next_sequence(&mut self, name: &str) -> i64 {
        let value = self.sequences.entry(name.to_string()).or_insert(0);
        *value += 1;
        *value
    }

    pub fn set_sequence(&mut self, name: &str, value: i64) {
        self.sequences.insert(name.to_string(), value);
    }

    /// Forgets a sequence; returns its last value if it existed.
    pub fn remove_sequence(&mut self, name: &str) -> Option<i64> {
        self.sequences.remove(name)
    }

    pub fn sequence(&self, name: &str) -> Option<i64> {
        self.sequences.get(name).copied()
    }

    pub fn mutation_count(&self) -> u64 {
        self.mutation_count
    }

    pub fn record_mutation(&mut self) {
        self.mutation_count += 1;
    }

    pub fn set_mutation_count(&mut self, count: u64) {
        self.mutation_count = count;
    }

    /// Every live row as `(offset, index count)`, ascending by offset.
    pub fn live_rows(&self) -> Vec<(RowPos, usize)> {
        let mut rows: Vec<(RowPos, usize)> = self
            .tables
            .values()
            .flat_map(|t| {
                let n = t.index_count();
                t.row_positions().into_iter().map(move |p| (p, n))
            })
            .collect();
        rows.sort_unstable_by_key(|(p, _)| *p);
        rows
    }

    /// Applies an offset remapping produced by compaction to every table.
    pub fn relocate(&self, remap: &HashMap<RowPos, RowPos>) {
        for table in self.tables.values() {
            table.relocate(remap);
        }
    }

    /// Records that rebuild this catalog on top of the data file.
    /// The mutation counter comes last so it overrides anything replay counts.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        let session = SessionId::SYSTEM;
        let mut records = Vec::new();
        for table in self.tables.values() {
            records.push(LogRecord::CreateTable {
                session,
                table: table.id(),
                name: table.name().to_string(),
                columns: table.columns().to_vec(),
                index_count: table.index_count() as u32,
            });
            records.push(LogRecord::IndexRoots {
                session,
                table: table.id(),
                roots: table.index_roots(),
            });
            records.push(LogRecord::TableRows {
                session,
                table: table.id(),
                rows: table.row_positions(),
            });
        }
        for (name, value) in &self.sequences {
            records.push(LogRecord::Sequence {
                session,
                name: name.clone(),
                value: *value,
            });
        }
        records.push(LogRecord::MutationCount {
            session,
            count: self.mutation_count,
        });
        records
    }
}
