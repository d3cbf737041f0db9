use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use super::{CachedRow, NodeLinks};
use crate::catalog::Table;
use crate::common::{Error, Result, RowPos, NODE_LINK_SIZE, ROW_ALIGNMENT, ROW_SIZE_PREFIX};
use crate::tuple::Value;

/// Serialization of rows to and from the data file.
///
/// Every encoding starts with a `u32` holding the total stored size,
/// followed by the node links, so the cache can rewrite links alone.
pub trait RowCodec: Send + Sync {
    /// Bytes the row occupies on disk, padding included. Fails if a value
    /// does not fit its column.
    fn size_of(&self, row: &CachedRow) -> Result<u32>;

    /// Length of the prefix holding the size and the node links.
    fn links_len(&self, index_count: usize) -> usize;

    /// Appends exactly `row.storage_size()` bytes to `out`.
    fn encode(&self, row: &CachedRow, out: &mut BytesMut) -> Result<()>;

    /// Rebuilds a clean row from the bytes stored at `pos`.
    fn decode(&self, pos: RowPos, bytes: &[u8], table: Arc<Table>) -> Result<CachedRow>;

    /// Rewrites the node links of an encoded row through `remap`. Links to
    /// rows missing from `remap` become `RowPos::NONE`.
    fn relink(&self, bytes: &mut [u8], index_count: usize, remap: &HashMap<RowPos, RowPos>) -> Result<()>;
}

/// The default row layout:
///
/// ```text
/// +----------+------------------------------+-------------+--------+---------+
/// | size u32 | per index: left, right,      | null bitmap | values | padding |
/// |          | parent (u32), balance (i32)  |             |        | to 8    |
/// +----------+------------------------------+-------------+--------+---------+
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryRowCodec;

impl BinaryRowCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode_data(&self, row: &CachedRow, out: &mut BytesMut) -> Result<()> {
        let columns = row.table().columns();
        let mut bitmap = vec![0u8; columns.len().div_ceil(8)];
        for (i, value) in row.data().iter().enumerate() {
            if value.is_null() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        out.put_slice(&bitmap);
        for (value, data_type) in row.data().iter().zip(columns) {
            value.encode(data_type, out)?;
        }
        Ok(())
    }
}

fn align(size: u32) -> u32 {
    size.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
}

impl RowCodec for BinaryRowCodec {
    fn size_of(&self, row: &CachedRow) -> Result<u32> {
        let mut data = BytesMut::new();
        self.encode_data(row, &mut data)?;
        let raw = self.links_len(row.nodes().len()) + data.len();
        let raw = u32::try_from(raw)
            .map_err(|_| Error::TypeMismatch(format!("row of {} bytes is too large", raw)))?;
        Ok(align(raw))
    }

    fn links_len(&self, index_count: usize) -> usize {
        (ROW_SIZE_PREFIX + NODE_LINK_SIZE * index_count as u32) as usize
    }

    fn encode(&self, row: &CachedRow, out: &mut BytesMut) -> Result<()> {
        let size = match row.storage_size() {
            0 => self.size_of(row)?,
            n => n,
        };
        let start = out.len();
        out.put_u32_le(size);
        for node in row.nodes() {
            out.put_u32_le(node.left.as_u32());
            out.put_u32_le(node.right.as_u32());
            out.put_u32_le(node.parent.as_u32());
            out.put_i32_le(node.balance);
        }
        self.encode_data(row, out)?;

        let written = out.len() - start;
        if written > size as usize {
            return Err(Error::TypeMismatch(format!(
                "row at {} grew from {} to {} bytes",
                row.pos(),
                size,
                written
            )));
        }
        out.put_bytes(0, size as usize - written);
        Ok(())
    }

    fn decode(&self, pos: RowPos, bytes: &[u8], table: Arc<Table>) -> Result<CachedRow> {
        let corrupt = |what: &str| Error::Corruption(format!("row at {}: {}", pos, what));
        let mut buf = bytes;
        if buf.remaining() < self.links_len(table.index_count()) {
            return Err(corrupt("shorter than its links"));
        }

        let size = buf.get_u32_le();
        if size as usize != bytes.len() {
            return Err(corrupt("size prefix disagrees with length"));
        }
        let mut nodes = Vec::with_capacity(table.index_count());
        for _ in 0..table.index_count() {
            nodes.push(NodeLinks {
                left: RowPos::new(buf.get_u32_le()),
                right: RowPos::new(buf.get_u32_le()),
                parent: RowPos::new(buf.get_u32_le()),
                balance: buf.get_i32_le(),
            });
        }

        let columns = table.columns();
        let bitmap_len = columns.len().div_ceil(8);
        if buf.remaining() < bitmap_len {
            return Err(corrupt("null bitmap truncated"));
        }
        let bitmap = buf[..bitmap_len].to_vec();
        buf.advance(bitmap_len);

        let mut data = Vec::with_capacity(columns.len());
        for (i, data_type) in columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                data.push(Value::Null);
            } else {
                data.push(Value::decode(&mut buf, data_type)?);
            }
        }

        Ok(CachedRow::from_disk(table, pos, size, nodes, data))
    }

    fn relink(&self, bytes: &mut [u8], index_count: usize, remap: &HashMap<RowPos, RowPos>) -> Result<()> {
        if bytes.len() < self.links_len(index_count) {
            return Err(Error::Corruption("row shorter than its links".to_string()));
        }
        for i in 0..index_count {
            let node = ROW_SIZE_PREFIX as usize + i * NODE_LINK_SIZE as usize;
            // left, right and parent; the balance that follows is kept
            for field in 0..3 {
                let at = node + field * 4;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[at..at + 4]);
                let link = RowPos::new(u32::from_le_bytes(raw));
                if link.is_placed() {
                    let moved = remap.get(&link).copied().unwrap_or(RowPos::NONE);
                    bytes[at..at + 4].copy_from_slice(&moved.as_u32().to_le_bytes());
                }
            }
        }
        Ok(())
    }
}
