use std::fmt;

/// Byte offset of a row inside the `.data` file.
///
/// Offsets are the cache's lookup key. A row that has not been placed yet
/// carries [`RowPos::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowPos(pub u32);

impl RowPos {
    /// Sentinel for a row that has no disk offset yet.
    pub const NONE: RowPos = RowPos(u32::MAX);

    pub fn new(pos: u32) -> Self {
        Self(pos)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// Returns true once the allocator has assigned an offset.
    pub fn is_placed(&self) -> bool {
        *self != Self::NONE
    }
}

impl fmt::Display for RowPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_placed() {
            write!(f, "RowPos({})", self.0)
        } else {
            write!(f, "RowPos(none)")
        }
    }
}

/// Identifier of a table known to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

impl TableId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// Identifier of the session a log record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Session used for snapshot records and internal work.
    pub const SYSTEM: SessionId = SessionId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Stable index of a resident row inside the cache arena.
///
/// A handle is only meaningful while the row it was issued for stays
/// resident; slots are recycled after eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowHandle(pub u32);

impl RowHandle {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowHandle({})", self.0)
    }
}

/// Value of the cache's monotonic access counter.
pub type AccessCount = u32;
