use std::sync::Arc;

use crate::catalog::Table;
use crate::common::{AccessCount, Error, Result, RowPos, TableId};
use crate::tuple::Value;

/// Position of a row inside one index tree, stored with the row on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLinks {
    pub left: RowPos,
    pub right: RowPos,
    pub parent: RowPos,
    pub balance: i32,
}

impl Default for NodeLinks {
    fn default() -> Self {
        Self {
            left: RowPos::NONE,
            right: RowPos::NONE,
            parent: RowPos::NONE,
            balance: 0,
        }
    }
}

/// A table row as held by the cache: its column values, one [`NodeLinks`]
/// per index of its table, and the bookkeeping the cache needs.
///
/// A row is dirty when its links or its data changed since it was last
/// written. If only the links changed, saving rewrites just the link prefix.
#[derive(Debug, Clone)]
pub struct CachedRow {
    table: Arc<Table>,
    pos: RowPos,
    /// Bytes the row occupies in the data file, including padding
    storage_size: u32,
    nodes: Vec<NodeLinks>,
    data: Vec<Value>,
    links_changed: bool,
    data_changed: bool,
    last_access: AccessCount,
}

impl CachedRow {
    /// Creates an unplaced row. The cache assigns its offset on insert.
    pub fn new(table: Arc<Table>, data: Vec<Value>) -> Result<Self> {
        if data.len() != table.column_count() {
            return Err(Error::TypeMismatch(format!(
                "table {} has {} columns, row has {}",
                table.name(),
                table.column_count(),
                data.len()
            )));
        }
        let nodes = vec![NodeLinks::default(); table.index_count()];
        Ok(Self {
            table,
            pos: RowPos::NONE,
            storage_size: 0,
            nodes,
            data,
            links_changed: true,
            data_changed: true,
            last_access: 0,
        })
    }

    /// Rebuilds a clean row read from disk.
    pub(crate) fn from_disk(
        table: Arc<Table>,
        pos: RowPos,
        storage_size: u32,
        nodes: Vec<NodeLinks>,
        data: Vec<Value>,
    ) -> Self {
        Self {
            table,
            pos,
            storage_size,
            nodes,
            data,
            links_changed: false,
            data_changed: false,
            last_access: 0,
        }
    }

    pub fn pos(&self) -> RowPos {
        self.pos
    }

    pub(crate) fn set_pos(&mut self, pos: RowPos) {
        self.pos = pos;
    }

    pub fn storage_size(&self) -> u32 {
        self.storage_size
    }

    pub(crate) fn set_storage_size(&mut self, size: u32) {
        self.storage_size = size;
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn table_id(&self) -> TableId {
        self.table.id()
    }

    pub fn data(&self) -> &[Value] {
        &self.data
    }

    pub fn nodes(&self) -> &[NodeLinks] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&NodeLinks> {
        self.nodes.get(index)
    }

    /// Replaces the links of one index and marks the row dirty.
    pub fn set_node(&mut self, index: usize, links: NodeLinks) -> Result<()> {
        let slot = self.nodes.get_mut(index).ok_or_else(|| {
            Error::TypeMismatch(format!(
                "table {} has no index {}",
                self.table.name(),
                index
            ))
        })?;
        if *slot != links {
            *slot = links;
            self.links_changed = true;
        }
        Ok(())
    }

    /// True if the row has to be written before it may be dropped.
    pub fn is_dirty(&self) -> bool {
        self.links_changed || self.data_changed
    }

    pub fn has_links_changed(&self) -> bool {
        self.links_changed
    }

    pub fn has_data_changed(&self) -> bool {
        self.data_changed
    }

    pub(crate) fn mark_clean(&mut self) {
        self.links_changed = false;
        self.data_changed = false;
    }

    /// True while the row anchors one of its table's indexes; the cache
    /// never evicts such a row.
    pub fn is_root(&self) -> bool {
        self.table.is_index_root(self.pos)
    }

    pub fn last_access(&self) -> AccessCount {
        self.last_access
    }

    pub(crate) fn set_last_access(&mut self, count: AccessCount) {
        self.last_access = count;
    }
}
