use std::collections::VecDeque;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use super::{DataFile, DataFileHeader};
use crate::common::{Error, Result, RowPos, INITIAL_FREE_POS, MAX_FREE_EXTENTS};

/// A run of reusable bytes inside the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub pos: u32,
    pub len: u32,
}

/// Hands out byte ranges of the data file for rows.
///
/// Freed ranges go to the head of a list that is searched first-fit; when
/// nothing fits, space is taken from the end of the file. The list holds at
/// most `max_extents` entries and is dropped wholesale when it overflows,
/// leaking the forgotten ranges until the next compaction. Adjacent ranges
/// are never merged.
#[derive(Debug, Clone)]
pub struct FreeSpaceAllocator {
    extents: VecDeque<FreeExtent>,
    /// First byte past the last allocated row
    free_pos: u32,
    max_extents: usize,
    /// Bytes dropped because the list overflowed
    leaked_bytes: u64,
}

impl FreeSpaceAllocator {
    pub fn new(free_pos: u32) -> Self {
        Self {
            extents: VecDeque::new(),
            free_pos: free_pos.max(INITIAL_FREE_POS),
            max_extents: MAX_FREE_EXTENTS,
            leaked_bytes: 0,
        }
    }

    /// Overrides the list capacity.
    pub fn with_max_extents(mut self, max_extents: usize) -> Self {
        self.max_extents = max_extents.max(1);
        self
    }

    pub fn free_pos(&self) -> u32 {
        self.free_pos
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Extents in search order.
    pub fn extents(&self) -> impl Iterator<Item = &FreeExtent> {
        self.extents.iter()
    }

    pub fn free_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    pub fn leaked_bytes(&self) -> u64 {
        self.leaked_bytes
    }

    /// Returns an offset for `size` bytes.
    ///
    /// The first extent large enough wins. Whatever it has left over stays
    /// in the list in its place. Fails with `DataFileFull` when the file
    /// would have to grow past the 32-bit offset range.
    pub fn allocate(&mut self, size: u32) -> Result<RowPos> {
        if let Some(i) = self.extents.iter().position(|e| e.len >= size) {
            let extent = &mut self.extents[i];
            let pos = extent.pos;
            if extent.len == size {
                self.extents.remove(i);
            } else {
                extent.pos += size;
                extent.len -= size;
            }
            return Ok(RowPos::new(pos));
        }

        let pos = self.free_pos;
        self.free_pos = pos.checked_add(size).ok_or(Error::DataFileFull(size))?;
        Ok(RowPos::new(pos))
    }

    /// Returns `len` bytes at `pos` to the list.
    pub fn free(&mut self, pos: RowPos, len: u32) {
        if len == 0 || !pos.is_placed() {
            return;
        }
        if self.extents.len() >= self.max_extents {
            self.leaked_bytes += self.free_bytes();
            debug!(
                extents = self.extents.len(),
                leaked = self.leaked_bytes,
                "free list full, starting over"
            );
            self.extents.clear();
        }
        self.extents.push_front(FreeExtent {
            pos: pos.as_u32(),
            len,
        });
    }

    /// Forgets every extent and moves the end of file to `free_pos`.
    pub fn reset(&mut self, free_pos: u32) {
        self.extents.clear();
        self.free_pos = free_pos.max(INITIAL_FREE_POS);
        self.leaked_bytes = 0;
    }

    /// Writes the list as a checksummed block at the end of the file and
    /// records its location in the header.
    pub fn save(&self, file: &DataFile) -> Result<()> {
        let (head, count) = if self.extents.is_empty() {
            (0, 0)
        } else {
            let mut block = BytesMut::with_capacity(self.extents.len() * 8 + 4);
            for extent in &self.extents {
                block.put_u32_le(extent.pos);
                block.put_u32_le(extent.len);
            }
            let crc = crc32fast::hash(&block);
            block.put_u32_le(crc);
            file.write_at(self.free_pos as u64, &block)?;
            (self.free_pos, self.extents.len() as u32)
        };
        file.write_free_pos(self.free_pos)?;
        file.write_free_list_fields(head, count)
    }

    /// Rebuilds the allocator from the header and the block it points at.
    /// A damaged block yields an empty list, which only leaks space.
    pub fn load(file: &DataFile, header: &DataFileHeader) -> Result<Self> {
        let mut allocator = Self::new(header.free_pos);
        if header.free_list_head == 0 || header.free_list_count == 0 {
            return Ok(allocator);
        }

        let count = header.free_list_count as usize;
        let mut block = vec![0u8; count * 8 + 4];
        file.read_at(header.free_list_head as u64, &mut block)?;
        let (body, mut tail) = block.split_at(count * 8);
        if crc32fast::hash(body) != tail.get_u32_le() {
            warn!(
                path = %file.path().display(),
                count,
                "free list block is damaged, starting with an empty list"
            );
            return Ok(allocator);
        }

        let mut body = body;
        while body.has_remaining() {
            let pos = body.get_u32_le();
            let len = body.get_u32_le();
            if pos < INITIAL_FREE_POS || pos.saturating_add(len) > header.free_pos {
                warn!(pos, len, "dropping free extent outside the row area");
                continue;
            }
            allocator.extents.push_back(FreeExtent { pos, len });
        }
        Ok(allocator)
    }
}
