use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::options::{validate_properties, DatabaseOptions};
use crate::cache::{CacheLimits, CacheStats, CachedRow, NodeLinks, RowCache};
use crate::catalog::{Catalog, SessionRegistry, Table};
use crate::common::{Error, Result, RowPos, SessionId, TableId};
use crate::log::{replay_file, truncate_damaged_tail, LogFormat, LogRecord, LogSyncTimer, LogWriter, SharedLogWriter};
use crate::storage::{
    compress_file, decompress_file, delete_if_exists, rename_if_exists, rename_overwrite, DatabaseFiles,
    DatabaseProperties, ModificationState,
};
use crate::tuple::{DataType, Value};

/// Counters describing one open database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub cache: CacheStats,
    pub resident_rows: usize,
    pub resident_bytes: u64,
    pub data_reads: u64,
    pub data_writes: u64,
    pub log_size: u64,
    pub log_records: u64,
    pub log_syncs: u64,
    pub mutation_count: u64,
}

/// What a checkpoint does with the backup once the new script is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackupChange {
    /// Data file unchanged since the last backup
    Keep,
    /// `.backup.new` holds a fresh copy
    Replace,
    /// The data file was deleted as empty
    Remove,
}

struct DatabaseState {
    props: DatabaseProperties,
    cache: RowCache,
    catalog: Catalog,
    sessions: SessionRegistry,
    /// Log size that triggers a checkpoint; 0 disables it
    max_log_bytes: u64,
    /// The data file changed since `.backup` was written. Survives cache
    /// reopens, which forget their own modified flag.
    backup_stale: bool,
    closed: bool,
    #[cfg(test)]
    fail_next_backup: bool,
}

impl DatabaseState {
    #[cfg(test)]
    fn backup_fault(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_backup) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "backup device full",
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn backup_fault(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Database ties the row cache, the catalog and the durability log together.
///
/// Every committed change is appended to the `.log` file. A checkpoint
/// writes the catalog to `.script`, flushes the cache into `.data`, keeps a
/// compressed copy of it in `.backup` and then starts an empty log. The
/// modification state in `.properties` tells the next open which of those
/// files can be trusted:
///
/// - `NotModified`/`New`: script and data are consistent, there is no log.
/// - `Modified`: data may hold changes newer than the backup; restore the
///   backup and replay script and log on top.
/// - `ModifiedNew`: a checkpoint wrote its `.new` files but did not finish
///   renaming them; finish the renames and trust the result.
///
/// All state sits behind one lock, taken before the log lock.
pub struct Database {
    files: DatabaseFiles,
    read_only: bool,
    sync_tick: Duration,
    inner: Mutex<DatabaseState>,
    log: SharedLogWriter,
    sync_timer: Mutex<Option<LogSyncTimer>>,
}

impl Database {
    /// Opens or creates the database whose files share the base path `path`,
    /// recovering from an interrupted session or checkpoint if needed.
    pub fn open<P: AsRef<Path>>(path: P, options: DatabaseOptions) -> Result<Self> {
        options.validate()?;
        let files = DatabaseFiles::new(path);
        let mut props = DatabaseProperties::load(files.properties())?;
        let read_only = options.is_read_only() || props.read_only;
        options.apply_to(&mut props);
        validate_properties(&props)?;

        if !read_only {
            if let Some(parent) = files.base().parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }

        let limits = CacheLimits::from_scales(props.cache.scale, props.cache.size_scale);
        let mut cache = RowCache::new(files.data(), limits);
        cache.set_eviction_bias(options.get_eviction_bias_divisor());
        cache.set_store_on_insert(options.get_store_on_insert());

        let max_log_bytes = props.log.size_mb as u64 * 1024 * 1024;
        let db = Self {
            files,
            read_only,
            sync_tick: options.get_sync_tick(),
            inner: Mutex::new(DatabaseState {
                props,
                cache,
                catalog: Catalog::new(),
                sessions: SessionRegistry::new(),
                max_log_bytes,
                backup_stale: false,
                closed: false,
                #[cfg(test)]
                fail_next_backup: false,
            }),
            log: Arc::new(Mutex::new(None)),
            sync_timer: Mutex::new(None),
        };

        {
            let mut guard = db.inner.lock();
            if read_only {
                db.open_read_only(&mut guard)?;
            } else {
                db.recover(&mut guard)?;
            }
        }
        if !read_only {
            db.start_sync_timer();
        }
        Ok(db)
    }

    fn open_read_only(&self, state: &mut DatabaseState) -> Result<()> {
        match state.props.state() {
            ModificationState::NotModified | ModificationState::New => {}
            other => {
                warn!(path = %self.files.base().display(), state = ?other, "read-only open of unclean database");
                return Err(Error::NeedsRecovery);
            }
        }
        state.cache.open(true)?;
        replay_file(self.files.script(), |record| apply_record(state, record, false))?;
        info!(path = %self.files.base().display(), "opened database read-only");
        Ok(())
    }

    fn recover(&self, state: &mut DatabaseState) -> Result<()> {
        let found = state.props.state();
        info!(path = %self.files.base().display(), state = ?found, "opening database");

        let mut needs_checkpoint = false;
        match found {
            ModificationState::ModifiedNew => self.finish_renames()?,
            ModificationState::Modified => {
                self.restore_backup()?;
                needs_checkpoint = true;
            }
            ModificationState::NotModified | ModificationState::New => {}
        }

        state.props.set_state(ModificationState::Modified)?;
        state.cache.open(false)?;

        state.sessions.clear_replay_history();
        let script = replay_file(self.files.script(), |record| apply_record(state, record, false))?;
        if script.truncated_at.is_some() {
            warn!(path = %self.files.script().display(), "script has a damaged tail");
        }
        let log = replay_file(self.files.log(), |record| apply_record(state, record, true))?;
        if let Some(len) = log.truncated_at {
            truncate_damaged_tail(self.files.log(), len)?;
        }
        if log.format.is_some() {
            needs_checkpoint = true;
        }

        info!(
            tables = state.catalog.tables().count(),
            script_records = script.records,
            log_records = log.records,
            mutations = state.catalog.mutation_count(),
            "database recovered"
        );

        if needs_checkpoint {
            self.checkpoint_locked(state, false, true)
        } else {
            self.open_log(state)
        }
    }

    /// A checkpoint got as far as `ModifiedNew`: its `.new` files are
    /// complete and only need to replace the old ones.
    fn finish_renames(&self) -> Result<()> {
        rename_if_exists(self.files.script_new(), self.files.script())?;
        delete_if_exists(self.files.log())?;
        rename_if_exists(self.files.backup_new(), self.files.backup())?;
        if !self.files.data().exists() {
            delete_if_exists(self.files.backup())?;
        }
        debug!("finished interrupted checkpoint");
        Ok(())
    }

    /// The data file may hold writes newer than the script; go back to the
    /// backup taken with the last checkpoint.
    fn restore_backup(&self) -> Result<()> {
        delete_if_exists(self.files.data())?;
        if self.files.backup().exists() {
            let bytes = decompress_file(self.files.backup(), self.files.data())?;
            info!(bytes, "restored data file from backup");
        }
        Ok(())
    }

    fn open_log(&self, state: &mut DatabaseState) -> Result<()> {
        let mut writer = LogWriter::open_append(self.files.log(), state.props.log.format)?;
        for session in state.sessions.all_sessions() {
            if !state.sessions.auto_commit_state(session) {
                writer.write(&LogRecord::AutoCommit {
                    session,
                    enabled: false,
                })?;
            }
        }
        *self.log.lock() = Some(writer);
        Ok(())
    }

    fn start_sync_timer(&self) {
        let delay = self.inner.lock().props.log.write_delay_secs;
        let timer = LogSyncTimer::start(Arc::clone(&self.log), self.sync_tick, delay);
        *self.sync_timer.lock() = Some(timer);
    }

    fn stop_sync_timer(&self) {
        if let Some(mut timer) = self.sync_timer.lock().take() {
            timer.stop();
        }
    }

    /// Runs a checkpoint, optionally compacting the data file first.
    pub fn checkpoint(&self, defragment: bool) -> Result<()> {
        let mut guard = self.lock_writable()?;
        self.checkpoint_locked(&mut guard, defragment, true)
    }

    fn checkpoint_locked(&self, state: &mut DatabaseState, defragment: bool, reopen: bool) -> Result<()> {
        info!(defragment, "checkpoint started");
        let backup = match self.write_checkpoint_files(state, defragment) {
            Ok(backup) => backup,
            Err(e) => {
                if defragment {
                    warn!(error = %e, "checkpoint failed while compacting; reopen to recover");
                    self.poison(state);
                    return Err(e);
                }
                warn!(error = %e, "checkpoint failed; previous files are still current");
                if reopen {
                    if let Err(resume) = self.resume(state) {
                        warn!(error = %resume, "could not resume after failed checkpoint");
                        self.poison(state);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = self.commit_checkpoint_files(state, backup) {
            warn!(error = %e, "checkpoint failed while renaming files; reopen to recover");
            self.poison(state);
            return Err(e);
        }

        if reopen {
            self.resume(state)?;
        }
        info!(mutations = state.catalog.mutation_count(), "checkpoint complete");
        Ok(())
    }

    /// Steps up to and including the backup: nothing written here is used
    /// by recovery until the state moves to `ModifiedNew`.
    fn write_checkpoint_files(&self, state: &mut DatabaseState, defragment: bool) -> Result<BackupChange> {
        if let Some(writer) = self.log.lock().take() {
            writer.close()?;
        }
        delete_if_exists(self.files.backup_new())?;

        if defragment {
            let live = state.catalog.live_rows();
            let remap = state.cache.defragment(&live)?;
            state.catalog.relocate(&remap);
        }

        let mut script = LogWriter::create(self.files.script_new(), state.props.log.format)?;
        for record in state.catalog.snapshot() {
            script.write(&record)?;
        }
        script.close()?;

        let closed = state.cache.close();
        if state.cache.file_modified() {
            state.backup_stale = true;
        }
        closed?;

        let data = self.files.data();
        if !data.exists() {
            return Ok(BackupChange::Remove);
        }
        if state.backup_stale || defragment || !self.files.backup().exists() {
            state.backup_fault()?;
            let bytes = compress_file(&data, self.files.backup_new())?;
            debug!(bytes, "wrote backup");
            return Ok(BackupChange::Replace);
        }
        Ok(BackupChange::Keep)
    }

    fn commit_checkpoint_files(&self, state: &mut DatabaseState, backup: BackupChange) -> Result<()> {
        state.props.set_state(ModificationState::ModifiedNew)?;
        rename_overwrite(self.files.script_new(), self.files.script())?;
        delete_if_exists(self.files.log())?;
        match backup {
            BackupChange::Replace => rename_overwrite(self.files.backup_new(), self.files.backup())?,
            BackupChange::Remove => {
                delete_if_exists(self.files.backup())?;
            }
            BackupChange::Keep => {}
        }
        state.backup_stale = false;
        state.props.set_state(ModificationState::NotModified)
    }

    /// Reopens the data file and an empty log after a checkpoint.
    fn resume(&self, state: &mut DatabaseState) -> Result<()> {
        state.props.set_state(ModificationState::Modified)?;
        if !state.cache.is_open() {
            state.cache.open(false)?;
        }
        if self.log.lock().is_none() {
            self.open_log(state)?;
        }
        Ok(())
    }

    /// Gives up on the in-memory state. The files on disk stay recoverable.
    fn poison(&self, state: &mut DatabaseState) {
        state.closed = true;
        self.log.lock().take();
        state.cache.abandon();
    }

    /// Checkpoints and closes the database. Further calls return `Closed`.
    pub fn close(&self) -> Result<()> {
        self.stop_sync_timer();
        let mut guard = self.inner.lock();
        if guard.closed {
            return Ok(());
        }
        let result = if self.read_only {
            guard.cache.close()
        } else {
            self.checkpoint_locked(&mut guard, false, false)
        };
        if result.is_err() {
            self.poison(&mut guard);
        }
        guard.closed = true;
        info!(path = %self.files.base().display(), "database closed");
        result
    }

    /// Closes files without a checkpoint or flushing the cache. The next open
    /// recovers from backup, script and log.
    pub fn shutdown(&self) {
        self.stop_sync_timer();
        let mut guard = self.inner.lock();
        if guard.closed {
            return;
        }
        if let Some(writer) = self.log.lock().take() {
            if let Err(e) = writer.close() {
                warn!(error = %e, "failed to close log on shutdown");
            }
        }
        guard.cache.abandon();
        guard.closed = true;
        debug!(path = %self.files.base().display(), "database shut down");
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, DatabaseState>> {
        let guard = self.inner.lock();
        if guard.closed {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    fn lock_writable(&self) -> Result<MutexGuard<'_, DatabaseState>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.lock_open()
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        match self.log.lock().as_mut() {
            Some(writer) => writer.write(record),
            None => Err(Error::Closed),
        }
    }

    /// The log no longer matches what was applied in memory. A checkpoint
    /// replaces it with a script of the current state.
    fn realign_log(&self, state: &mut DatabaseState) {
        warn!("log append failed after a change was applied; checkpointing");
        if let Err(e) = self.checkpoint_locked(state, false, true) {
            warn!(error = %e, "checkpoint after log failure failed; reopen to recover");
            self.poison(state);
        }
    }

    fn maybe_checkpoint(&self, state: &mut DatabaseState) {
        if state.max_log_bytes == 0 {
            return;
        }
        let size = self.log.lock().as_ref().map_or(0, LogWriter::size);
        if size <= state.max_log_bytes {
            return;
        }
        info!(size, limit = state.max_log_bytes, "log size limit reached");
        if let Err(e) = self.checkpoint_locked(state, false, true) {
            warn!(error = %e, "automatic checkpoint failed");
        }
    }

    pub fn open_session(&self) -> Result<SessionId> {
        let mut guard = self.lock_open()?;
        Ok(guard.sessions.open_session())
    }

    pub fn close_session(&self, session: SessionId) -> Result<bool> {
        let mut guard = self.lock_open()?;
        Ok(guard.sessions.close_session(session))
    }

    /// Sessions known to the database, including those rebuilt by replay.
    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        Ok(self.lock_open()?.sessions.all_sessions())
    }

    pub fn is_auto_commit(&self, session: SessionId) -> Result<bool> {
        Ok(self.lock_open()?.sessions.auto_commit_state(session))
    }

    /// Records replayed into `session` during the last recovery.
    pub fn replay_history(&self, session: SessionId) -> Result<Vec<LogRecord>> {
        let guard = self.lock_open()?;
        Ok(guard
            .sessions
            .session(session)
            .map(|s| s.replayed().to_vec())
            .unwrap_or_default())
    }

    pub fn set_auto_commit(&self, session: SessionId, enabled: bool) -> Result<()> {
        let mut guard = self.lock_writable()?;
        self.append(&LogRecord::AutoCommit { session, enabled })?;
        guard.sessions.set_auto_commit(session, enabled);
        Ok(())
    }

    /// Logs a commit for `session` and syncs the log.
    pub fn commit(&self, session: SessionId) -> Result<()> {
        let _guard = self.lock_writable()?;
        let mut log = self.log.lock();
        let writer = log.as_mut().ok_or(Error::Closed)?;
        writer.write(&LogRecord::Commit { session })?;
        writer.sync()
    }

    pub fn create_table(
        &self,
        session: SessionId,
        name: &str,
        columns: Vec<DataType>,
        index_count: usize,
    ) -> Result<TableId> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        let table = state.catalog.create_table(name, columns, index_count);
        let record = LogRecord::CreateTable {
            session,
            table: table.id(),
            name: table.name().to_string(),
            columns: table.columns().to_vec(),
            index_count: table.index_count() as u32,
        };
        if let Err(e) = self.append(&record) {
            state.catalog.drop_table(table.id());
            return Err(e);
        }
        debug!(table = %table.id(), name, "created table");
        Ok(table.id())
    }

    /// Drops a table and forgets its resident rows. Its rows' space is not
    /// reclaimed until the next compaction.
    pub fn drop_table(&self, session: SessionId, table: TableId) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        state.catalog.table(table)?;
        self.append(&LogRecord::DropTable { session, table })?;
        state.catalog.drop_table(table);
        state.cache.remove_table(table);
        Ok(())
    }

    pub fn table_id(&self, name: &str) -> Result<Option<TableId>> {
        Ok(self.lock_open()?.catalog.table_by_name(name).map(|t| t.id()))
    }

    pub fn tables(&self) -> Result<Vec<Arc<Table>>> {
        Ok(self.lock_open()?.catalog.tables().cloned().collect())
    }

    /// Offsets of every live row of `table`, ascending.
    pub fn table_rows(&self, table: TableId) -> Result<Vec<RowPos>> {
        Ok(self.lock_open()?.catalog.table(table)?.row_positions())
    }

    pub fn index_roots(&self, table: TableId) -> Result<Vec<RowPos>> {
        Ok(self.lock_open()?.catalog.table(table)?.index_roots())
    }

    /// Replaces the root row of every index of `table`.
    pub fn set_index_roots(&self, session: SessionId, table: TableId, roots: Vec<RowPos>) -> Result<()> {
        let guard = self.lock_writable()?;
        let target = guard.catalog.table(table)?;
        if roots.len() != target.index_count() {
            return Err(Error::TypeMismatch(format!(
                "table {} has {} indexes, got {} roots",
                table,
                target.index_count(),
                roots.len()
            )));
        }
        self.append(&LogRecord::IndexRoots {
            session,
            table,
            roots: roots.clone(),
        })?;
        target.set_index_roots(&roots);
        Ok(())
    }

    /// Stores a new row and logs it. Returns the row's offset.
    pub fn insert(&self, session: SessionId, table: TableId, values: Vec<Value>) -> Result<RowPos> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        let target = state.catalog.table(table)?;
        let row = CachedRow::new(Arc::clone(&target), values.clone())?;
        let handle = state.cache.add(row)?;
        let pos = state.cache.row(handle).map_or(RowPos::NONE, |r| r.pos());

        let record = LogRecord::Insert {
            session,
            table,
            pos,
            values,
        };
        if let Err(e) = self.append(&record) {
            if let Err(undo) = state.cache.free(pos) {
                warn!(error = %undo, %pos, "could not release unlogged row");
            }
            self.realign_log(state);
            return Err(e);
        }
        target.register_row(pos);
        state.catalog.record_mutation();
        self.maybe_checkpoint(state);
        Ok(pos)
    }

    /// Deletes the row at `pos` and returns its space to the free list.
    pub fn delete(&self, session: SessionId, table: TableId, pos: RowPos) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        let target = state.catalog.table(table)?;
        if !target.contains_row(pos) {
            return Err(Error::RowNotFound(pos));
        }
        self.append(&LogRecord::Delete { session, table, pos })?;
        if let Err(e) = state.cache.free(pos) {
            self.poison(state);
            return Err(e);
        }
        forget_row(&target, pos);
        state.catalog.record_mutation();
        self.maybe_checkpoint(state);
        Ok(())
    }

    /// Replaces a row: the old one is deleted and the new values are
    /// inserted, possibly at a different offset which is returned.
    pub fn update(&self, session: SessionId, table: TableId, pos: RowPos, values: Vec<Value>) -> Result<RowPos> {
        self.delete(session, table, pos)?;
        self.insert(session, table, values)
    }

    /// Column values of the row at `pos`, reading it from disk if needed.
    pub fn fetch(&self, table: TableId, pos: RowPos) -> Result<Option<Vec<Value>>> {
        let mut guard = self.lock_open()?;
        let state = &mut *guard;
        let target = state.catalog.table(table)?;
        if !target.contains_row(pos) {
            return Ok(None);
        }
        let handle = state.cache.get(pos, &target)?;
        Ok(handle
            .and_then(|h| state.cache.row(h))
            .map(|row| row.data().to_vec()))
    }

    pub fn node_links(&self, table: TableId, pos: RowPos, index: usize) -> Result<Option<NodeLinks>> {
        let mut guard = self.lock_open()?;
        let state = &mut *guard;
        let target = state.catalog.table(table)?;
        let handle = match state.cache.get(pos, &target)? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        Ok(state.cache.row(handle).and_then(|row| row.node(index).copied()))
    }

    /// Updates the tree links of one index of a row. Links are not logged;
    /// the index layer rebuilds them from logged row changes.
    pub fn set_node_links(&self, table: TableId, pos: RowPos, index: usize, links: NodeLinks) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        let target = state.catalog.table(table)?;
        let handle = state.cache.get(pos, &target)?.ok_or(Error::RowNotFound(pos))?;
        let row = state.cache.row_mut(handle).ok_or(Error::RowNotFound(pos))?;
        row.set_node(index, links)
    }

    /// Advances a sequence and logs its new value.
    pub fn next_sequence(&self, session: SessionId, name: &str) -> Result<i64> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        let existed = state.catalog.sequence(name).is_some();
        let value = state.catalog.next_sequence(name);
        let record = LogRecord::Sequence {
            session,
            name: name.to_string(),
            value,
        };
        if let Err(e) = self.append(&record) {
            if existed {
                state.catalog.set_sequence(name, value - 1);
            } else {
                state.catalog.remove_sequence(name);
            }
            return Err(e);
        }
        state.catalog.record_mutation();
        self.maybe_checkpoint(state);
        Ok(value)
    }

    pub fn sequence(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.lock_open()?.catalog.sequence(name))
    }

    /// Appends a raw statement for `session` to the log.
    pub fn write_mutation(&self, session: SessionId, sql: &str) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let state = &mut *guard;
        self.append(&LogRecord::Statement {
            session,
            sql: sql.to_string(),
        })?;
        state.catalog.record_mutation();
        self.maybe_checkpoint(state);
        Ok(())
    }

    /// Number of committed mutations applied so far, across restarts.
    pub fn mutation_count(&self) -> Result<u64> {
        Ok(self.lock_open()?.catalog.mutation_count())
    }

    /// Runs `f` with the row cache and catalog under the database lock.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut RowCache, &Catalog) -> R) -> Result<R> {
        let mut guard = self.lock_open()?;
        let state = &mut *guard;
        Ok(f(&mut state.cache, &state.catalog))
    }

    pub fn set_write_delay(&self, secs: u32) -> Result<()> {
        let mut guard = self.lock_writable()?;
        guard.props.log.write_delay_secs = secs;
        guard.props.save()?;
        if let Some(timer) = self.sync_timer.lock().as_ref() {
            timer.set_write_delay(secs);
        }
        Ok(())
    }

    /// Log size in MiB that triggers a checkpoint; 0 disables it.
    pub fn set_log_size(&self, mb: u32) -> Result<()> {
        let mut guard = self.lock_writable()?;
        guard.props.log.size_mb = mb;
        guard.props.save()?;
        guard.max_log_bytes = mb as u64 * 1024 * 1024;
        Ok(())
    }

    /// Switches the log encoding. Takes effect through a checkpoint so no
    /// file mixes both encodings.
    pub fn set_log_format(&self, format: LogFormat) -> Result<()> {
        let mut guard = self.lock_writable()?;
        if guard.props.log.format == format {
            return Ok(());
        }
        guard.props.log.format = format;
        guard.props.save()?;
        self.checkpoint_locked(&mut guard, false, true)
    }

    pub fn log_format(&self) -> LogFormat {
        self.inner.lock().props.log.format
    }

    pub fn state(&self) -> ModificationState {
        self.inner.lock().props.state()
    }

    pub fn stats(&self) -> DatabaseStats {
        let guard = self.inner.lock();
        let (data_reads, data_writes) = guard
            .cache
            .data_file()
            .map_or((0, 0), |f| (f.num_reads(), f.num_writes()));
        let log = self.log.lock();
        DatabaseStats {
            cache: guard.cache.stats(),
            resident_rows: guard.cache.len(),
            resident_bytes: guard.cache.resident_bytes(),
            data_reads,
            data_writes,
            log_size: log.as_ref().map_or(0, LogWriter::size),
            log_records: log.as_ref().map_or(0, LogWriter::records_written),
            log_syncs: log.as_ref().map_or(0, LogWriter::sync_count),
            mutation_count: guard.catalog.mutation_count(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn path(&self) -> &Path {
        self.files.base()
    }

    pub fn files(&self) -> &DatabaseFiles {
        &self.files
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies one script or log record to the in-memory state. Row inserts
/// must land at the offset they were logged with.
fn apply_record(state: &mut DatabaseState, record: LogRecord, from_log: bool) -> Result<()> {
    match &record {
        LogRecord::CreateTable {
            table,
            name,
            columns,
            index_count,
            ..
        } => {
            state.catalog.insert_table(Arc::new(Table::new(
                *table,
                name.clone(),
                columns.clone(),
                *index_count as usize,
            )));
        }
        LogRecord::DropTable { table, .. } => {
            state.catalog.drop_table(*table);
            state.cache.remove_table(*table);
        }
        LogRecord::IndexRoots { table, roots, .. } => state.catalog.table(*table)?.set_index_roots(roots),
        LogRecord::TableRows { table, rows, .. } => state.catalog.table(*table)?.set_rows(rows.iter().copied()),
        LogRecord::MutationCount { count, .. } => state.catalog.set_mutation_count(*count),
        LogRecord::Insert {
            table, pos, values, ..
        } => {
            let target = state.catalog.table(*table)?;
            let row = CachedRow::new(Arc::clone(&target), values.clone())?;
            let handle = state.cache.add(row)?;
            let actual = state.cache.row(handle).map_or(RowPos::NONE, |r| r.pos());
            if actual != *pos {
                return Err(Error::PositionMismatch {
                    expected: *pos,
                    actual,
                });
            }
            target.register_row(actual);
            state.catalog.record_mutation();
        }
        LogRecord::Delete { table, pos, .. } => {
            let target = state.catalog.table(*table)?;
            state.cache.free(*pos)?;
            forget_row(&target, *pos);
            state.catalog.record_mutation();
        }
        LogRecord::Sequence { name, value, .. } => {
            state.catalog.set_sequence(name, *value);
            if from_log {
                state.catalog.record_mutation();
            }
        }
        LogRecord::Statement { .. } => {
            if from_log {
                state.catalog.record_mutation();
            }
        }
        LogRecord::AutoCommit { session, enabled } => state.sessions.set_auto_commit(*session, *enabled),
        LogRecord::Commit { .. } => {}
    }
    if from_log {
        state.sessions.route(record);
    }
    Ok(())
}

/// Removes a deleted row from its table, clearing any index root at it.
fn forget_row(table: &Table, pos: RowPos) {
    table.unregister_row(pos);
    for (index, root) in table.index_roots().into_iter().enumerate() {
        if root == pos {
            table.set_index_root(index, RowPos::NONE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> DatabaseOptions {
        DatabaseOptions::new()
            .cache_scale(8)
            .cache_size_scale(8)
            .write_delay_secs(0)
            .sync_tick(Duration::from_millis(10))
    }

    fn columns() -> Vec<DataType> {
        vec![DataType::Integer, DataType::VarChar(32)]
    }

    fn values(i: i32) -> Vec<Value> {
        vec![Value::Integer(i), Value::String(format!("row-{i}"))]
    }

    /// Every table's rows in offset order, with their values.
    fn contents(db: &Database) -> Vec<(String, Vec<(RowPos, Vec<Value>)>)> {
        db.tables()
            .unwrap()
            .into_iter()
            .map(|t| {
                let rows = t
                    .row_positions()
                    .into_iter()
                    .map(|pos| (pos, db.fetch(t.id(), pos).unwrap().unwrap()))
                    .collect();
                (t.name().to_string(), rows)
            })
            .collect()
    }

    /// Builds a baseline, checkpoints, then applies a second batch of work.
    fn populate(db: &Database) -> TableId {
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        let mut rows = Vec::new();
        for i in 0..20 {
            rows.push(db.insert(s, t, values(i)).unwrap());
        }
        db.next_sequence(s, "ids").unwrap();
        db.checkpoint(false).unwrap();

        for pos in rows.iter().step_by(3) {
            db.delete(s, t, *pos).unwrap();
        }
        for i in 100..110 {
            db.insert(s, t, values(i)).unwrap();
        }
        db.next_sequence(s, "ids").unwrap();
        db.write_mutation(s, "SET PROPERTY x 1").unwrap();
        t
    }

    #[test]
    fn test_new_database_lifecycle() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        assert_eq!(db.state(), ModificationState::Modified);
        assert!(db.files().log().exists());

        db.close().unwrap();
        assert_eq!(db.state(), ModificationState::NotModified);
        assert!(!db.files().log().exists());
        assert!(!db.files().data().exists());
        assert!(matches!(db.insert(SessionId::SYSTEM, TableId::new(1), vec![]), Err(Error::Closed)));
    }

    #[test]
    fn test_reopen_after_clean_close() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let expected = {
            let db = Database::open(&base, options()).unwrap();
            populate(&db);
            let expected = contents(&db);
            db.close().unwrap();
            expected
        };
        assert_eq!(expected[0].1.len(), 20 - 7 + 10);

        let db = Database::open(&base, options()).unwrap();
        assert_eq!(contents(&db), expected);
        assert_eq!(db.sequence("ids").unwrap(), Some(2));
        assert_eq!(db.mutation_count().unwrap(), 20 + 1 + 7 + 10 + 1 + 1);
    }

    #[test]
    fn test_recover_after_crash() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let (expected, count) = {
            let db = Database::open(&base, options()).unwrap();
            populate(&db);
            let snapshot = (contents(&db), db.mutation_count().unwrap());
            db.shutdown();
            snapshot
        };

        let db = Database::open(&base, options()).unwrap();
        assert_eq!(contents(&db), expected);
        assert_eq!(db.mutation_count().unwrap(), count);
        assert_eq!(db.state(), ModificationState::Modified);
        assert!(!db.files().backup_new().exists());
    }

    #[test]
    fn test_crash_points_recover_identically() {
        let dir = TempDir::new().unwrap();

        // stops after the backup is written, before the state changes
        let early = dir.path().join("early");
        {
            let db = Database::open(&early, options()).unwrap();
            populate(&db);
            {
                let mut guard = db.inner.lock();
                db.write_checkpoint_files(&mut guard, false).unwrap();
            }
            db.shutdown();
        }
        assert!(DatabaseFiles::new(&early).script_new().exists());

        // stops after the whole checkpoint, before the log is reopened
        let late = dir.path().join("late");
        {
            let db = Database::open(&late, options()).unwrap();
            populate(&db);
            {
                let mut guard = db.inner.lock();
                db.checkpoint_locked(&mut guard, false, false).unwrap();
            }
            db.shutdown();
        }

        let a = Database::open(&early, options()).unwrap();
        let b = Database::open(&late, options()).unwrap();
        assert_eq!(contents(&a), contents(&b));
        assert_eq!(a.mutation_count().unwrap(), b.mutation_count().unwrap());
        assert_eq!(a.sequence("ids").unwrap(), b.sequence("ids").unwrap());
    }

    #[test]
    fn test_interrupted_renames_are_finished() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let expected = {
            let db = Database::open(&base, options()).unwrap();
            populate(&db);
            let expected = contents(&db);
            {
                let mut guard = db.inner.lock();
                let state = &mut *guard;
                let backup = db.write_checkpoint_files(state, false).unwrap();
                assert_eq!(backup, BackupChange::Replace);
                state.props.set_state(ModificationState::ModifiedNew).unwrap();
            }
            db.shutdown();
            expected
        };

        let db = Database::open(&base, options()).unwrap();
        assert!(!db.files().script_new().exists());
        assert!(!db.files().backup_new().exists());
        assert_eq!(contents(&db), expected);
    }

    #[test]
    fn test_damaged_log_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        {
            let db = Database::open(&base, options()).unwrap();
            let s = db.open_session().unwrap();
            let t = db.create_table(s, "items", columns(), 1).unwrap();
            db.insert(s, t, values(1)).unwrap();
            db.insert(s, t, values(2)).unwrap();
            db.commit(s).unwrap();
            db.shutdown();
        }
        let log = DatabaseFiles::new(&base).log();
        let mut bytes = fs::read(&log).unwrap();
        bytes.extend_from_slice(b"deadbeef INS 1 1 garbage");
        fs::write(&log, bytes).unwrap();

        let db = Database::open(&base, options()).unwrap();
        let t = db.table_id("items").unwrap().unwrap();
        assert_eq!(db.table_rows(t).unwrap().len(), 2);
    }

    #[test]
    fn test_sessions_rebuilt_from_log() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let (s1, s2) = {
            let db = Database::open(&base, options()).unwrap();
            let s1 = db.open_session().unwrap();
            let s2 = db.open_session().unwrap();
            let t = db.create_table(s1, "items", columns(), 1).unwrap();
            db.set_auto_commit(s2, false).unwrap();
            db.insert(s1, t, values(1)).unwrap();
            db.insert(s2, t, values(2)).unwrap();
            db.write_mutation(s2, "UPDATE items SET b = 'x'").unwrap();
            db.shutdown();
            (s1, s2)
        };

        let db = Database::open(&base, options()).unwrap();
        assert!(db.is_auto_commit(s1).unwrap());
        assert!(!db.is_auto_commit(s2).unwrap());
        let history = db.replay_history(s2).unwrap();
        assert_eq!(history.len(), 3);
        assert!(matches!(history[0], LogRecord::AutoCommit { enabled: false, .. }));
        assert!(matches!(history[2], LogRecord::Statement { .. }));
        assert_eq!(db.replay_history(s1).unwrap().len(), 2);
    }

    #[test]
    fn test_defragment_checkpoint() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        let rows: Vec<RowPos> = (0..10).map(|i| db.insert(s, t, values(i)).unwrap()).collect();
        db.set_index_roots(s, t, vec![rows[9]]).unwrap();
        for pos in &rows[..5] {
            db.delete(s, t, *pos).unwrap();
        }
        let before: Vec<Vec<Value>> = contents(&db)[0].1.iter().map(|(_, v)| v.clone()).collect();

        db.checkpoint(true).unwrap();
        let after = contents(&db);
        let positions: Vec<RowPos> = after[0].1.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions[0], RowPos::new(crate::common::INITIAL_FREE_POS));
        let values_after: Vec<Vec<Value>> = after[0].1.iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(values_after, before);
        assert_eq!(db.index_roots(t).unwrap(), vec![positions[4]]);
        db.close().unwrap();

        let db = Database::open(&base, options()).unwrap();
        assert_eq!(contents(&db), after);
    }

    #[test]
    fn test_log_size_triggers_checkpoint() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        db.inner.lock().max_log_bytes = 512;
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        for i in 0..50 {
            db.insert(s, t, values(i)).unwrap();
        }
        assert!(db.stats().log_size <= 512 + 128);
        assert!(db.files().script().exists());
        db.shutdown();

        let db = Database::open(&base, options()).unwrap();
        assert_eq!(db.table_rows(t).unwrap().len(), 50);
    }

    #[test]
    fn test_switch_log_format() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        db.insert(s, t, values(1)).unwrap();
        db.set_log_format(LogFormat::Binary).unwrap();
        db.insert(s, t, values(2)).unwrap();
        db.shutdown();

        let db = Database::open(&base, DatabaseOptions::new()).unwrap();
        assert_eq!(db.log_format(), LogFormat::Binary);
        assert_eq!(db.table_rows(t).unwrap().len(), 2);
    }

    #[test]
    fn test_read_only() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        {
            let db = Database::open(&base, options()).unwrap();
            let s = db.open_session().unwrap();
            let t = db.create_table(s, "items", columns(), 1).unwrap();
            db.insert(s, t, values(7)).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&base, options().read_only(true)).unwrap();
        let t = db.table_id("items").unwrap().unwrap();
        let pos = db.table_rows(t).unwrap()[0];
        assert_eq!(db.fetch(t, pos).unwrap(), Some(values(7)));
        assert!(matches!(db.insert(SessionId::SYSTEM, t, values(8)), Err(Error::ReadOnly)));
        assert!(matches!(db.checkpoint(false), Err(Error::ReadOnly)));
        db.close().unwrap();
        assert_eq!(db.state(), ModificationState::NotModified);
    }

    #[test]
    fn test_read_only_refuses_unclean_files() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        {
            let db = Database::open(&base, options()).unwrap();
            db.shutdown();
        }
        let result = Database::open(&base, options().read_only(true));
        assert!(matches!(result, Err(Error::NeedsRecovery)));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let dir = TempDir::new().unwrap();
        let result = Database::open(dir.path().join("db"), DatabaseOptions::new().cache_scale(40));
        assert!(matches!(result, Err(Error::InvalidConfig { name: "cache_scale", .. })));
        assert!(!dir.path().join("db.properties").exists());
    }

    #[test]
    fn test_node_links_survive_eviction() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 2).unwrap();
        let a = db.insert(s, t, values(1)).unwrap();
        let b = db.insert(s, t, values(2)).unwrap();
        let links = NodeLinks {
            left: b,
            right: RowPos::NONE,
            parent: RowPos::NONE,
            balance: -1,
        };
        db.set_node_links(t, a, 1, links).unwrap();

        // 768 resident rows at most with scale 8
        for i in 0..2000 {
            db.insert(s, t, values(i)).unwrap();
        }
        assert!(db.stats().cache.rows_evicted > 0);
        assert_eq!(db.node_links(t, a, 1).unwrap(), Some(links));
    }

    #[test]
    fn test_failed_backup_is_rewritten_by_next_checkpoint() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        db.insert(s, t, values(1)).unwrap();
        db.checkpoint(false).unwrap();

        db.insert(s, t, values(2)).unwrap();
        db.inner.lock().fail_next_backup = true;
        assert!(matches!(db.checkpoint(false), Err(Error::Io(_))));
        assert!(!db.is_closed());
        assert_eq!(db.state(), ModificationState::Modified);

        db.checkpoint(false).unwrap();
        db.insert(s, t, values(3)).unwrap();
        let expected = contents(&db);
        db.shutdown();
        drop(db);

        let db = Database::open(&base, options()).unwrap();
        assert_eq!(contents(&db), expected);
        assert_eq!(db.table_rows(t).unwrap().len(), 3);
    }

    #[test]
    fn test_link_changes_reach_backup() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("db");
        let db = Database::open(&base, options()).unwrap();
        let s = db.open_session().unwrap();
        let t = db.create_table(s, "items", columns(), 1).unwrap();
        let a = db.insert(s, t, values(1)).unwrap();
        let b = db.insert(s, t, values(2)).unwrap();
        db.checkpoint(false).unwrap();

        let links = NodeLinks {
            left: b,
            right: RowPos::NONE,
            parent: RowPos::NONE,
            balance: 1,
        };
        db.set_node_links(t, a, 0, links).unwrap();
        db.checkpoint(false).unwrap();
        db.shutdown();
        drop(db);

        let db = Database::open(&base, options()).unwrap();
        assert_eq!(db.node_links(t, a, 0).unwrap(), Some(links));
    }

    #[test]
    fn test_unlogged_sequence_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db"), options()).unwrap();
        let s = db.open_session().unwrap();
        assert_eq!(db.next_sequence(s, "ids").unwrap(), 1);

        db.log.lock().take();
        assert!(matches!(db.next_sequence(s, "ids"), Err(Error::Closed)));
        assert!(matches!(db.next_sequence(s, "fresh"), Err(Error::Closed)));
        assert_eq!(db.sequence("ids").unwrap(), Some(1));
        assert_eq!(db.sequence("fresh").unwrap(), None);
    }
}
