use super::CachedRow;
use crate::common::RowHandle;

/// Circular doubly linked list of resident rows, stored in an arena.
///
/// Rows are addressed by [`RowHandle`]; `next` and `prev` are parallel
/// arrays indexed by handle. Vacated slots are reused. A single row links to
/// itself.
#[derive(Debug, Default)]
pub struct AccessList {
    rows: Vec<Option<CachedRow>>,
    next: Vec<RowHandle>,
    prev: Vec<RowHandle>,
    vacant: Vec<RowHandle>,
    len: usize,
}

impl AccessList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            next: Vec::with_capacity(capacity),
            prev: Vec::with_capacity(capacity),
            vacant: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, handle: RowHandle) -> bool {
        matches!(self.rows.get(handle.as_usize()), Some(Some(_)))
    }

    pub fn get(&self, handle: RowHandle) -> Option<&CachedRow> {
        self.rows.get(handle.as_usize()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: RowHandle) -> Option<&mut CachedRow> {
        self.rows.get_mut(handle.as_usize()).and_then(Option::as_mut)
    }

    pub fn next(&self, handle: RowHandle) -> RowHandle {
        self.next[handle.as_usize()]
    }

    pub fn prev(&self, handle: RowHandle) -> RowHandle {
        self.prev[handle.as_usize()]
    }

    /// Links `row` in front of `before`, or as the only element when
    /// `before` is `None`.
    pub fn insert(&mut self, row: CachedRow, before: Option<RowHandle>) -> RowHandle {
        let handle = match self.vacant.pop() {
            Some(h) => {
                self.rows[h.as_usize()] = Some(row);
                h
            }
            None => {
                let h = RowHandle::new(self.rows.len() as u32);
                self.rows.push(Some(row));
                self.next.push(h);
                self.prev.push(h);
                h
            }
        };

        match before {
            Some(b) if self.contains(b) => {
                let p = self.prev(b);
                self.next[handle.as_usize()] = b;
                self.prev[handle.as_usize()] = p;
                self.next[p.as_usize()] = handle;
                self.prev[b.as_usize()] = handle;
            }
            _ => {
                self.next[handle.as_usize()] = handle;
                self.prev[handle.as_usize()] = handle;
            }
        }
        self.len += 1;
        handle
    }

    /// Unlinks the row at `handle` and returns it.
    pub fn unlink(&mut self, handle: RowHandle) -> Option<CachedRow> {
        let row = self.rows.get_mut(handle.as_usize())?.take()?;
        let n = self.next(handle);
        let p = self.prev(handle);
        self.next[p.as_usize()] = n;
        self.prev[n.as_usize()] = p;
        self.next[handle.as_usize()] = handle;
        self.prev[handle.as_usize()] = handle;
        self.vacant.push(handle);
        self.len -= 1;
        Some(row)
    }

    /// Handles in list order, starting at `start` and visiting each row once.
    pub fn walk_from(&self, start: RowHandle) -> Walk<'_> {
        Walk {
            list: self,
            current: Some(start).filter(|h| self.contains(*h)),
            start,
            remaining: self.len,
        }
    }

    /// Drops every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.next.clear();
        self.prev.clear();
        self.vacant.clear();
        self.len = 0;
    }
}

pub struct Walk<'a> {
    list: &'a AccessList,
    current: Option<RowHandle>,
    start: RowHandle,
    remaining: usize,
}

impl Iterator for Walk<'_> {
    type Item = RowHandle;

    fn next(&mut self) -> Option<RowHandle> {
        let current = self.current?;
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let next = self.list.next(current);
        self.current = if next == self.start { None } else { Some(next) };
        Some(current)
    }
}
