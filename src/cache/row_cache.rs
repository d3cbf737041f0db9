use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info};

use super::{plan_eviction, AccessList, BinaryRowCodec, CachedRow, EvictionCandidate, RowCodec};
use crate::catalog::Table;
use crate::common::{
    AccessCount, Error, Result, RowHandle, RowPos, TableId, BUCKET_SHIFT, DEFAULT_EVICTION_BIAS_DIVISOR,
    INITIAL_FREE_POS, MIN_RETAINED_ROWS, ROWS_PER_BUCKET, ROW_SIZE_PREFIX,
};
use crate::storage::{
    delete_if_exists, path_with_suffix, rename_overwrite, DataFile, DataFileHeader, FreeSpaceAllocator,
};

/// Size limits of a cache, derived from the two scale settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Number of hash buckets, `2^cache_scale`
    pub bucket_count: usize,
    /// Resident rows allowed, three per bucket
    pub max_rows: usize,
    /// Resident bytes allowed, `max_rows * 2^size_scale`
    pub max_bytes: u64,
}

impl CacheLimits {
    /// Computes limits without range checks; options are validated before
    /// they get here.
    pub fn from_scales(cache_scale: u32, size_scale: u32) -> Self {
        let bucket_count = 1usize << cache_scale;
        let max_rows = ROWS_PER_BUCKET * bucket_count;
        Self {
            bucket_count,
            max_rows,
            max_bytes: max_rows as u64 * (1u64 << size_scale),
        }
    }
}

/// Counters describing cache activity since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub rows_loaded: u64,
    pub rows_saved: u64,
    pub eviction_passes: u64,
    pub rows_evicted: u64,
    pub counter_rescales: u64,
}

/// RowCache keeps a bounded set of rows of the data file in memory.
///
/// Rows are found by offset through a bucket table whose slots point into a
/// circular access list. Rows of one bucket sit next to each other in the
/// list, starting at the slot's row. When the cache runs out of room it
/// drops roughly the least recently used quarter of its rows, writing dirty
/// ones first. Rows that anchor an index are never dropped.
pub struct RowCache {
    /// Path of the data file
    path: PathBuf,
    limits: CacheLimits,
    codec: Box<dyn RowCodec>,
    file: Option<DataFile>,
    is_open: bool,
    read_only: bool,
    allocator: FreeSpaceAllocator,
    /// Resident rows
    list: AccessList,
    /// Bucket slots: the first row of each bucket's run, if any
    buckets: Vec<Option<RowHandle>>,
    /// Most recently inserted row
    cursor: Option<RowHandle>,
    resident_bytes: u64,
    /// Next value of the access counter
    access_count: AccessCount,
    /// Access count at the last eviction cut
    first_access_count: AccessCount,
    /// Counters are renumbered once `access_count` reaches this
    access_ceiling: AccessCount,
    eviction_bias_divisor: usize,
    /// Write rows as soon as they are added
    store_on_insert: bool,
    /// Set when the data file changed since open
    file_modified: bool,
    stats: CacheStats,
    write_buf: BytesMut,
}

impl RowCache {
    /// Creates a closed cache for the data file at `path`.
    pub fn new<P: AsRef<Path>>(path: P, limits: CacheLimits) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            limits,
            codec: Box::new(BinaryRowCodec::new()),
            file: None,
            is_open: false,
            read_only: false,
            allocator: FreeSpaceAllocator::new(INITIAL_FREE_POS),
            list: AccessList::with_capacity(limits.max_rows.min(1 << 16)),
            buckets: vec![None; limits.bucket_count],
            cursor: None,
            resident_bytes: 0,
            access_count: 0,
            first_access_count: 0,
            access_ceiling: AccessCount::MAX,
            eviction_bias_divisor: DEFAULT_EVICTION_BIAS_DIVISOR,
            store_on_insert: false,
            file_modified: false,
            stats: CacheStats::default(),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    /// Replaces the row codec.
    pub fn with_codec(mut self, codec: Box<dyn RowCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Makes `add` write each row immediately.
    pub fn set_store_on_insert(&mut self, enabled: bool) {
        self.store_on_insert = enabled;
    }

    /// Sets the extra share of rows evicted per pass, as `resident / divisor`.
    pub fn set_eviction_bias(&mut self, divisor: usize) {
        self.eviction_bias_divisor = divisor.max(1);
    }

    /// Opens the data file and loads the free list.
    pub fn open(&mut self, read_only: bool) -> Result<()> {
        self.read_only = read_only;
        if read_only && !self.path.exists() {
            self.allocator = FreeSpaceAllocator::new(INITIAL_FREE_POS);
            self.is_open = true;
            return Ok(());
        }

        let file = DataFile::open(&self.path, read_only)?;
        let header = match file.read_header()? {
            Some(header) => header,
            None => {
                let header = DataFileHeader::empty();
                if !read_only {
                    file.write_header(&header)?;
                }
                header
            }
        };
        self.allocator = FreeSpaceAllocator::load(&file, &header)?;
        self.file = Some(file);
        self.is_open = true;
        self.file_modified = false;

        info!(
            path = %self.path.display(),
            free_pos = self.allocator.free_pos(),
            free_extents = self.allocator.len(),
            read_only,
            "opened data file"
        );
        Ok(())
    }

    /// Writes every dirty row and the free list, then closes the data file.
    /// Resident rows stay cached and clean. A file that never held a row is
    /// deleted.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        if !self.read_only {
            self.flush_all()?;
            if let Some(file) = self.file.as_ref() {
                self.allocator.save(file)?;
                file.sync()?;
            }
        }
        self.file = None;
        self.is_open = false;

        if !self.read_only && self.allocator.free_pos() <= INITIAL_FREE_POS {
            delete_if_exists(&self.path)?;
            debug!(path = %self.path.display(), "deleted empty data file");
        }
        Ok(())
    }

    /// Closes the data file without writing anything and forgets every row.
    pub fn abandon(&mut self) {
        self.file = None;
        self.is_open = false;
        self.clear();
    }

    /// Drops every resident row without writing it.
    pub fn clear(&mut self) {
        self.list.clear();
        self.buckets.iter_mut().for_each(|slot| *slot = None);
        self.cursor = None;
        self.resident_bytes = 0;
        self.access_count = 0;
        self.first_access_count = 0;
    }

    /// Registers a new row, placing it in the data file if it has no offset.
    ///
    /// Makes room first if the cache is at its row or byte limit. If the row
    /// cannot be stored the cache and the allocator are left as they were,
    /// so the next row is placed where this one would have been.
    pub fn add(&mut self, mut row: CachedRow) -> Result<RowHandle> {
        self.ensure_writable()?;
        let size = self.codec.size_of(&row)?;
        if row.pos().is_placed() && self.lookup(row.pos()).is_some() {
            return Err(Error::Corruption(format!("row at {} is already cached", row.pos())));
        }

        self.make_room(size as u64)?;

        let before = self.store_on_insert.then(|| self.allocator.clone());
        if !row.pos().is_placed() {
            row.set_pos(self.allocator.allocate(size)?);
        }
        row.set_storage_size(size);
        self.file_modified = true;

        let handle = self.link_row(row);
        self.touch(handle);
        if let Some(before) = before {
            if let Err(e) = self.save_row(handle) {
                self.remove(handle);
                self.allocator = before;
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Returns the row at `pos`, reading it from disk on a miss.
    ///
    /// `Ok(None)` means the file holds no row there.
    pub fn get(&mut self, pos: RowPos, table: &Arc<Table>) -> Result<Option<RowHandle>> {
        if let Some(handle) = self.lookup(pos) {
            self.stats.hits += 1;
            self.touch(handle);
            return Ok(Some(handle));
        }
        self.stats.misses += 1;

        let row = match self.read_row(pos, table)? {
            Some(row) => row,
            None => return Ok(None),
        };
        self.make_room(row.storage_size() as u64)?;
        let handle = self.link_row(row);
        self.touch(handle);
        Ok(Some(handle))
    }

    /// Resident row at `pos`, without counting an access.
    pub fn find(&self, pos: RowPos) -> Option<RowHandle> {
        self.lookup(pos)
    }

    pub fn row(&self, handle: RowHandle) -> Option<&CachedRow> {
        self.list.get(handle)
    }

    /// Mutable access to a resident row, e.g. to update its node links.
    pub fn row_mut(&mut self, handle: RowHandle) -> Option<&mut CachedRow> {
        self.list.get_mut(handle)
    }

    /// Unlinks a row from the cache without writing it.
    pub fn remove(&mut self, handle: RowHandle) -> Option<CachedRow> {
        let pos = self.list.get(handle)?.pos();
        let bucket = self.bucket_of(pos);
        let next = self.list.next(handle);
        let next_in_bucket = next != handle
            && self
                .list
                .get(next)
                .map_or(false, |r| self.bucket_of(r.pos()) == bucket);

        if self.buckets[bucket] == Some(handle) {
            self.buckets[bucket] = if next_in_bucket { Some(next) } else { None };
        }
        if self.cursor == Some(handle) {
            self.cursor = if next != handle { Some(next) } else { None };
        }

        let row = self.list.unlink(handle)?;
        self.resident_bytes -= row.storage_size() as u64;
        Some(row)
    }

    /// Drops every resident row of `table` without writing it.
    pub fn remove_table(&mut self, table: TableId) -> usize {
        let victims: Vec<RowHandle> = self
            .handles()
            .into_iter()
            .filter(|h| self.list.get(*h).map_or(false, |r| r.table_id() == table))
            .collect();
        for handle in &victims {
            self.remove(*handle);
        }
        debug!(%table, rows = victims.len(), "removed table rows from cache");
        victims.len()
    }

    /// Returns the space of the row at `pos` to the free list and drops any
    /// resident copy.
    pub fn free(&mut self, pos: RowPos) -> Result<()> {
        self.ensure_writable()?;
        let size = match self.lookup(pos) {
            Some(handle) => self.remove(handle).map_or(0, |r| r.storage_size()),
            None => self.read_row_size(pos)?,
        };
        if size == 0 {
            return Err(Error::RowNotFound(pos));
        }

        if let Some(file) = self.file.as_ref() {
            file.write_u32_at(pos.as_u64(), 0)?;
        }
        self.allocator.free(pos, size);
        self.file_modified = true;
        Ok(())
    }

    /// Writes every dirty row in ascending offset order.
    pub fn flush_all(&mut self) -> Result<usize> {
        if self.read_only || !self.is_open {
            return Ok(0);
        }
        let mut dirty: Vec<(RowPos, RowHandle)> = self
            .handles()
            .into_iter()
            .filter_map(|h| {
                let row = self.list.get(h)?;
                row.is_dirty().then(|| (row.pos(), h))
            })
            .collect();
        dirty.sort_unstable();

        for (_, handle) in &dirty {
            self.save_row(*handle)?;
        }
        if !dirty.is_empty() {
            debug!(rows = dirty.len(), "flushed dirty rows");
        }
        Ok(dirty.len())
    }

    /// Rewrites the live rows into a fresh data file with no gaps.
    ///
    /// `live` lists each row's offset and index count. Node links are
    /// rewritten to the new offsets. Returns the old-to-new offset map; the
    /// cache is empty afterwards and reopened on the new file.
    pub fn defragment(&mut self, live: &[(RowPos, usize)]) -> Result<HashMap<RowPos, RowPos>> {
        self.ensure_writable()?;
        self.flush_all()?;
        let source = self.file.as_ref().ok_or(Error::Closed)?;

        let mut rows = live.to_vec();
        rows.sort_unstable_by_key(|(pos, _)| *pos);

        let mut remap = HashMap::with_capacity(rows.len());
        let mut sizes = Vec::with_capacity(rows.len());
        let mut next = INITIAL_FREE_POS;
        for (pos, _) in &rows {
            let size = self.read_row_size(*pos)?;
            if size == 0 {
                return Err(Error::RowNotFound(*pos));
            }
            remap.insert(*pos, RowPos::new(next));
            sizes.push(size);
            next = next
                .checked_add(size)
                .ok_or_else(|| Error::Corruption("compacted file exceeds 4 GiB".to_string()))?;
        }

        let new_path = path_with_suffix(&self.path, ".new");
        delete_if_exists(&new_path)?;
        let target = DataFile::open(&new_path, false)?;
        let mut buf = Vec::new();
        for ((pos, index_count), size) in rows.iter().zip(&sizes) {
            buf.resize(*size as usize, 0);
            source.read_at(pos.as_u64(), &mut buf)?;
            self.codec.relink(&mut buf, *index_count, &remap)?;
            target.write_at(remap[pos].as_u64(), &buf)?;
        }
        target.write_header(&DataFileHeader {
            free_pos: next,
            ..DataFileHeader::empty()
        })?;
        target.sync()?;
        drop(target);

        let before = self.allocator.free_pos();
        self.file = None;
        self.is_open = false;
        rename_overwrite(&new_path, &self.path)?;
        self.clear();
        self.open(false)?;
        self.file_modified = true;

        info!(
            rows = rows.len(),
            before,
            after = next,
            "defragmented data file"
        );
        Ok(remap)
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn allocator(&self) -> &FreeSpaceAllocator {
        &self.allocator
    }

    pub fn free_pos(&self) -> u32 {
        self.allocator.free_pos()
    }

    pub fn data_file(&self) -> Option<&DataFile> {
        self.file.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True if the data file changed since it was opened.
    pub fn file_modified(&self) -> bool {
        self.file_modified
    }

    /// Access count at the most recent eviction cut.
    pub fn first_access_count(&self) -> AccessCount {
        self.first_access_count
    }

    /// Resident rows in access-list order, starting at the cursor.
    pub fn handles(&self) -> Vec<RowHandle> {
        match self.cursor {
            Some(start) => self.list.walk_from(start).collect(),
            None => Vec::new(),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.is_open {
            return Err(Error::Closed);
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn bucket_of(&self, pos: RowPos) -> usize {
        ((pos.as_u32() >> BUCKET_SHIFT) as usize) & (self.limits.bucket_count - 1)
    }

    /// The bucket's slot if it still points at a row of that bucket.
    fn valid_head(&self, bucket: usize) -> Option<RowHandle> {
        let head = self.buckets[bucket]?;
        let row = self.list.get(head)?;
        (self.bucket_of(row.pos()) == bucket).then_some(head)
    }

    fn lookup(&self, pos: RowPos) -> Option<RowHandle> {
        let bucket = self.bucket_of(pos);
        let start = self.valid_head(bucket)?;
        let mut handle = start;
        loop {
            let row_pos = self.list.get(handle)?.pos();
            if row_pos == pos {
                return Some(handle);
            }
            if self.bucket_of(row_pos) != bucket {
                return None;
            }
            handle = self.list.next(handle);
            if handle == start {
                return None;
            }
        }
    }

    /// Links a row in front of its bucket's run, or in front of the run
    /// holding the cursor when the bucket is empty.
    fn link_row(&mut self, row: CachedRow) -> RowHandle {
        let bucket = self.bucket_of(row.pos());
        let head = self.valid_head(bucket);
        let before = head.or_else(|| {
            let cursor = self.cursor?;
            let cursor_bucket = self.bucket_of(self.list.get(cursor)?.pos());
            Some(self.valid_head(cursor_bucket).unwrap_or(cursor))
        });

        self.resident_bytes += row.storage_size() as u64;
        let handle = self.list.insert(row, before);
        self.buckets[bucket] = Some(handle);
        self.cursor = Some(handle);
        handle
    }

    fn touch(&mut self, handle: RowHandle) {
        if self.access_count >= self.access_ceiling {
            self.rescale_access_counts();
        }
        let count = self.access_count;
        self.access_count += 1;
        if let Some(row) = self.list.get_mut(handle) {
            row.set_last_access(count);
        }
    }

    /// Renumbers access counters 0..n in their current order so the counter
    /// can keep growing.
    fn rescale_access_counts(&mut self) {
        let mut ranked: Vec<(AccessCount, RowPos, RowHandle)> = self
            .handles()
            .into_iter()
            .filter_map(|h| self.list.get(h).map(|r| (r.last_access(), r.pos(), h)))
            .collect();
        ranked.sort_unstable();

        let old_first = self.first_access_count;
        let mut new_first = ranked.len() as AccessCount;
        for (rank, (access, _, handle)) in ranked.iter().enumerate() {
            if *access >= old_first && new_first == ranked.len() as AccessCount {
                new_first = rank as AccessCount;
            }
            if let Some(row) = self.list.get_mut(*handle) {
                row.set_last_access(rank as AccessCount);
            }
        }
        self.first_access_count = new_first;
        self.access_count = ranked.len() as AccessCount;
        self.stats.counter_rescales += 1;
        debug!(rows = ranked.len(), "rescaled access counters");
    }

    /// Evicts until a row slot is free and the byte limit leaves room for
    /// `incoming` bytes.
    ///
    /// A row larger than the whole byte limit is admitted without evicting
    /// for bytes. When the rows left are pinned or among the most recent,
    /// the byte limit gives way; the row limit fails with `CacheFull`.
    fn make_room(&mut self, incoming: u64) -> Result<()> {
        let fits_budget = incoming <= self.limits.max_bytes;
        if !fits_budget {
            debug!(
                bytes = incoming,
                limit = self.limits.max_bytes,
                "row exceeds cache byte limit"
            );
        }
        loop {
            let over_rows = self.list.len() >= self.limits.max_rows;
            let over_bytes = fits_budget && self.resident_bytes + incoming > self.limits.max_bytes;
            if !over_rows && !over_bytes {
                return Ok(());
            }
            if self.evict_pass()? > 0 || self.evict_least_recent()? {
                continue;
            }
            if over_rows {
                return Err(Error::CacheFull);
            }
            debug!(
                resident = self.resident_bytes,
                limit = self.limits.max_bytes,
                "no evictable row left, exceeding byte limit"
            );
            return Ok(());
        }
    }

    /// One eviction pass. Returns the number of rows dropped.
    fn evict_pass(&mut self) -> Result<usize> {
        let snapshot: Vec<EvictionCandidate> = self
            .handles()
            .into_iter()
            .filter_map(|h| {
                self.list.get(h).map(|r| EvictionCandidate {
                    handle: h,
                    pos: r.pos(),
                    last_access: r.last_access(),
                })
            })
            .collect();
        let plan = plan_eviction(snapshot, self.eviction_bias_divisor);
        self.first_access_count = plan.threshold;
        self.stats.eviction_passes += 1;

        let mut evicted = 0;
        for victim in &plan.victims {
            let (dirty, pinned) = match self.list.get(victim.handle) {
                Some(row) => (row.is_dirty(), row.is_root()),
                None => continue,
            };
            if dirty {
                self.save_row(victim.handle)?;
            }
            if !pinned {
                self.remove(victim.handle);
                evicted += 1;
            }
        }
        self.stats.rows_evicted += evicted as u64;
        debug!(
            selected = plan.victims.len(),
            evicted,
            resident = self.list.len(),
            threshold = plan.threshold,
            "eviction pass"
        );
        Ok(evicted)
    }

    /// Drops the least recently used row that is not pinned, leaving the
    /// [`MIN_RETAINED_ROWS`] most recent alone when there are more than that.
    fn evict_least_recent(&mut self) -> Result<bool> {
        let mut ranked: Vec<(AccessCount, RowPos, RowHandle)> = self
            .handles()
            .into_iter()
            .filter_map(|h| self.list.get(h).map(|r| (r.last_access(), r.pos(), h)))
            .collect();
        ranked.sort_unstable();
        if ranked.len() > MIN_RETAINED_ROWS {
            ranked.truncate(ranked.len() - MIN_RETAINED_ROWS);
        }
        let victim = ranked
            .into_iter()
            .find(|(_, _, h)| self.list.get(*h).map_or(false, |r| !r.is_root()));
        let Some((_, _, handle)) = victim else {
            return Ok(false);
        };
        if self.list.get(handle).map_or(false, CachedRow::is_dirty) {
            self.save_row(handle)?;
        }
        self.remove(handle);
        self.stats.rows_evicted += 1;
        Ok(true)
    }

    /// Writes one row. When only its links changed, only the link prefix
    /// is written. The row stays dirty if the write fails.
    fn save_row(&mut self, handle: RowHandle) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        let row = match self.list.get(handle) {
            Some(row) => row,
            None => return Ok(()),
        };

        self.write_buf.clear();
        self.codec.encode(row, &mut self.write_buf)?;
        let len = if row.has_data_changed() {
            self.write_buf.len()
        } else {
            self.codec.links_len(row.nodes().len())
        };
        file.write_at(row.pos().as_u64(), &self.write_buf[..len])?;

        if let Some(row) = self.list.get_mut(handle) {
            row.mark_clean();
        }
        self.file_modified = true;
        self.stats.rows_saved += 1;
        Ok(())
    }

    /// Stored size of the row at `pos`, or 0 if there is none.
    fn read_row_size(&self, pos: RowPos) -> Result<u32> {
        let file = match self.file.as_ref() {
            Some(file) => file,
            None if self.is_open => return Ok(0),
            None => return Err(Error::Closed),
        };
        let free_pos = self.allocator.free_pos();
        if pos.as_u32() < INITIAL_FREE_POS || pos.as_u32() >= free_pos {
            return Ok(0);
        }
        let size = file.read_u32_at(pos.as_u64())?;
        if size == 0 {
            return Ok(0);
        }
        if size < ROW_SIZE_PREFIX || pos.as_u32().saturating_add(size) > free_pos {
            return Err(Error::Corruption(format!(
                "row at {} claims {} bytes, file ends at {}",
                pos, size, free_pos
            )));
        }
        Ok(size)
    }

    fn read_row(&mut self, pos: RowPos, table: &Arc<Table>) -> Result<Option<CachedRow>> {
        let size = self.read_row_size(pos)?;
        if size == 0 {
            return Ok(None);
        }
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        let mut buf = vec![0u8; size as usize];
        file.read_at(pos.as_u64(), &mut buf)?;
        let row = self.codec.decode(pos, &buf, Arc::clone(table))?;
        self.stats.rows_loaded += 1;
        Ok(Some(row))
    }

    #[cfg(test)]
    pub(crate) fn set_access_ceiling(&mut self, ceiling: AccessCount) {
        self.access_ceiling = ceiling;
    }

    /// Checks the bucket layout; used by tests.
    #[cfg(test)]
    pub(crate) fn check_buckets(&self) {
        for handle in self.handles() {
            let pos = self.list.get(handle).unwrap().pos();
            assert_eq!(self.lookup(pos), Some(handle), "row at {} not reachable", pos);
        }
        let mut seen = std::collections::HashSet::new();
        let handles = self.handles();
        for (i, handle) in handles.iter().enumerate() {
            let bucket = self.bucket_of(self.list.get(*handle).unwrap().pos());
            let prev = handles[(i + handles.len() - 1) % handles.len()];
            let prev_bucket = self.bucket_of(self.list.get(prev).unwrap().pos());
            if handles.len() > 1 && prev_bucket != bucket {
                assert!(seen.insert(bucket), "bucket {} split into two runs", bucket);
                assert_eq!(self.buckets[bucket], Some(*handle));
            }
        }
    }
}
