use std::collections::{BTreeSet, HashMap};

use parking_lot::{Mutex, RwLock};

use crate::common::{RowPos, TableId};
use crate::tuple::DataType;

/// Description of a table whose rows live in the cache-backed data file.
///
/// The table does not own its rows. It keeps the offsets of the rows that
/// belong to it and one root offset per index; the cache treats a row that
/// is an index root as pinned.
#[derive(Debug)]
pub struct Table {
    id: TableId,
    name: String,
    columns: Vec<DataType>,
    index_count: usize,
    index_roots: RwLock<Vec<RowPos>>,
    rows: Mutex<BTreeSet<RowPos>>,
}

impl Table {
    /// Creates a table. Every table has at least one index (the primary node).
    pub fn new(id: TableId, name: impl Into<String>, columns: Vec<DataType>, index_count: usize) -> Self {
        let index_count = index_count.max(1);
        Self {
            id,
            name: name.into(),
            columns,
            index_count,
            index_roots: RwLock::new(vec![RowPos::NONE; index_count]),
            rows: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[DataType] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn index_count(&self) -> usize {
        self.index_count
    }

    /// Returns the root offset of every index, `RowPos::NONE` for an empty index.
    pub fn index_roots(&self) -> Vec<RowPos> {
        self.index_roots.read().clone()
    }

    /// Replaces the index roots. Missing entries become `RowPos::NONE`.
    pub fn set_index_roots(&self, roots: &[RowPos]) {
        let mut current = self.index_roots.write();
        for (i, slot) in current.iter_mut().enumerate() {
            *slot = roots.get(i).copied().unwrap_or(RowPos::NONE);
        }
    }

    pub fn set_index_root(&self, index: usize, pos: RowPos) -> bool {
        let mut current = self.index_roots.write();
        match current.get_mut(index) {
            Some(slot) => {
                *slot = pos;
                true
            }
            None => false,
        }
    }

    /// Returns true if the row at `pos` anchors one of this table's indexes.
    pub fn is_index_root(&self, pos: RowPos) -> bool {
        pos.is_placed() && self.index_roots.read().contains(&pos)
    }

    pub fn register_row(&self, pos: RowPos) {
        self.rows.lock().insert(pos);
    }

    pub fn unregister_row(&self, pos: RowPos) -> bool {
        self.rows.lock().remove(&pos)
    }

    pub fn contains_row(&self, pos: RowPos) -> bool {
        self.rows.lock().contains(&pos)
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    /// Offsets of all rows of this table in ascending order.
    pub fn row_positions(&self) -> Vec<RowPos> {
        self.rows.lock().iter().copied().collect()
    }

    pub fn set_rows(&self, rows: impl IntoIterator<Item = RowPos>) {
        let mut current = self.rows.lock();
        current.clear();
        current.extend(rows);
    }

    /// Rewrites row offsets and index roots after the data file was compacted.
    /// Offsets absent from `remap` are dropped.
    pub fn relocate(&self, remap: &HashMap<RowPos, RowPos>) {
        {
            let mut rows = self.rows.lock();
            let moved: BTreeSet<RowPos> = rows.iter().filter_map(|p| remap.get(p).copied()).collect();
            *rows = moved;
        }
        let mut roots = self.index_roots.write();
        for root in roots.iter_mut() {
            if root.is_placed() {
                *root = remap.get(&*root).copied().unwrap_or(RowPos::NONE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new(TableId::new(1), "t", vec![DataType::Integer], 2)
    }

    #[test]
    fn test_index_roots() {
        let t = table();
        assert_eq!(t.index_roots(), vec![RowPos::NONE, RowPos::NONE]);
        assert!(!t.is_index_root(RowPos::NONE));

        t.set_index_roots(&[RowPos::new(32)]);
        assert!(t.is_index_root(RowPos::new(32)));
        assert!(t.set_index_root(1, RowPos::new(64)));
        assert!(!t.set_index_root(2, RowPos::new(64)));
        assert_eq!(t.index_roots(), vec![RowPos::new(32), RowPos::new(64)]);
    }

    #[test]
    fn test_relocate() {
        let t = table();
        t.set_rows([RowPos::new(32), RowPos::new(96), RowPos::new(200)]);
        t.set_index_roots(&[RowPos::new(96), RowPos::new(200)]);

        let mut remap = HashMap::new();
        remap.insert(RowPos::new(32), RowPos::new(32));
        remap.insert(RowPos::new(96), RowPos::new(48));

        t.relocate(&remap);
        assert_eq!(t.row_positions(), vec![RowPos::new(32), RowPos::new(48)]);
        assert_eq!(t.index_roots(), vec![RowPos::new(48), RowPos::NONE]);
    }

    #[test]
    fn test_at_least_one_index() {
        let t = Table::new(TableId::new(2), "u", vec![], 0);
        assert_eq!(t.index_count(), 1);
    }
}
