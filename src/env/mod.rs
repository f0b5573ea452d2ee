//! Environment wrapper: owns the store handle, the shared read
//! transaction and the write-lock protocol state.

pub mod registry;
pub mod txn;

use std::os::raw::{c_int, c_uint};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use lmdb_sys as ffi;

use crate::base::signal::Signal;
use crate::compress::{self, Compression, CompressionOptions};
use crate::error::{Error, Result};
use crate::store::{self, RawEnv};
use crate::write::{self, BatchHandle, WorkerCtl, WriteBatch};

use self::txn::TxnTracked;

/// Handle of a named database inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dbi(pub(crate) ffi::MDB_dbi);

/// Options for opening a database.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbOptions {
    pub create: bool,
    pub dup_sort: bool,
}

impl DbOptions {
    /// Options that create the database when it does not exist yet.
    pub fn create() -> Self {
        DbOptions {
            create: true,
            dup_sort: false,
        }
    }
}

/// Interruption state of the write worker, guarded by the writing lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    /// Worker is running or parked without special obligations.
    Idle,
    /// Worker is parked at a batch boundary and may be interrupted for a
    /// synchronous commit.
    AllowCommit,
    /// A caller holds the writing lock and may be reusing the worker txn.
    UserHasLock,
    /// A caller asked the worker to commit its transaction and yield.
    InterruptBatch,
    /// Worker committed and parked; the interrupting caller runs now.
    RestartingTxn,
}

/// State guarded by the writing lock.
pub(crate) struct WriterState {
    pub interruption: Interruption,
    pub worker: Option<Arc<WorkerCtl>>,
    pub worker_txn: *mut ffi::MDB_txn,
    pub txn_stack: Option<Box<TxnTracked>>,
}

unsafe impl Send for WriterState {}

impl WriterState {
    fn new() -> Self {
        WriterState {
            interruption: Interruption::Idle,
            worker: None,
            worker_txn: ptr::null_mut(),
            txn_stack: None,
        }
    }
}

struct ReadTxnState {
    txn: *mut ffi::MDB_txn,
    renewed: bool,
}

unsafe impl Send for ReadTxnState {}

pub(crate) struct EnvInner {
    pub env: RawEnv,
    pub path: PathBuf,
    pub env_flags: c_uint,
    pub separate_flushed: bool,
    pub compression: Option<Arc<Compression>>,
    pub writing: Signal<WriterState>,
    // top of the tracked write-txn stack, readable without the writing
    // lock (which its owner holds); null when no write txn is open
    current_write_txn: AtomicPtr<ffi::MDB_txn>,
    read_txn: Mutex<ReadTxnState>,
    max_key_size: c_int,
}

impl EnvInner {
    /// Publish the top of the write-txn frame stack so reads can route
    /// through it. Called after every frame push and pop, under the
    /// writing lock.
    pub(crate) fn note_write_txn(&self, state: &WriterState) {
        let txn = match state.txn_stack {
            Some(ref frame) => frame.txn,
            None => ptr::null_mut(),
        };
        self.current_write_txn.store(txn, Ordering::Release);
    }

    /// Run `f` against this wrapper's read view: the open write
    /// transaction when one exists (its uncommitted writes are visible),
    /// otherwise the shared read-only transaction, renewed first if a
    /// write committed since the last read.
    pub(crate) fn with_read_txn<T>(
        &self,
        f: impl FnOnce(*mut ffi::MDB_txn) -> Result<T>,
    ) -> Result<T> {
        let write_txn = self.current_write_txn.load(Ordering::Acquire);
        if !write_txn.is_null() {
            return f(write_txn);
        }
        let mut state = self.read_txn.lock().unwrap();
        if state.txn.is_null() {
            state.txn =
                store::txn_begin(self.env, ptr::null_mut(), ffi::MDB_RDONLY)?;
            state.renewed = true;
        } else if !state.renewed {
            store::txn_renew(state.txn)?;
            state.renewed = true;
        }
        f(state.txn)
    }

    /// Mark the shared read snapshot stale; the next read renews it.
    pub(crate) fn invalidate_read_txn(&self) {
        let mut state = self.read_txn.lock().unwrap();
        if !state.txn.is_null() && state.renewed {
            store::txn_reset(state.txn);
            state.renewed = false;
        }
    }

    pub(crate) fn decode_value(&self, raw: &[u8]) -> Result<Vec<u8>> {
        if let Some(ref compression) = self.compression {
            if !raw.is_empty() && raw[0] >= compress::SENTINEL_MIN {
                return compression.decompress(raw);
            }
        }
        Ok(raw.to_vec())
    }

    pub(crate) fn is_writemap(&self) -> bool {
        self.env_flags & ffi::MDB_WRITEMAP != 0
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        {
            let mut state = self.read_txn.lock().unwrap();
            if !state.txn.is_null() {
                store::txn_abort(state.txn);
                state.txn = ptr::null_mut();
            }
        }
        registry::release(self.env);
    }
}

/// An opened environment. Cloning the handle shares the environment.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

impl Env {
    /// Open a database, creating it when `opts.create` is set.
    pub fn open_db(
        &self,
        name: Option<&str>,
        opts: &DbOptions,
    ) -> Result<Dbi> {
        let mut flags: c_uint = 0;
        if opts.create {
            flags |= ffi::MDB_CREATE;
        }
        if opts.dup_sort {
            flags |= ffi::MDB_DUPSORT;
        }

        if self.inner.env_flags & ffi::MDB_RDONLY != 0 {
            let txn = store::txn_begin(
                self.inner.env,
                ptr::null_mut(),
                ffi::MDB_RDONLY,
            )?;
            let dbi = store::dbi_open(txn, name, flags & !ffi::MDB_CREATE);
            match dbi {
                Ok(dbi) => {
                    store::txn_commit(txn)?;
                    Ok(Dbi(dbi))
                }
                Err(err) => {
                    store::txn_abort(txn);
                    Err(err)
                }
            }
        } else {
            let write = self.begin_write_txn(txn::TXN_ABORTABLE)?;
            let dbi = store::dbi_open(write.raw_txn(), name, flags)?;
            write.commit()?;
            Ok(Dbi(dbi))
        }
    }

    /// Look up `key`. While a write transaction is open on this
    /// environment the lookup goes through it and sees its uncommitted
    /// writes; otherwise the shared read transaction serves it.
    /// Compressed records are transparently decompressed.
    pub fn get(&self, db: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        inner.with_read_txn(|txn| {
            let mut k = store::val(key);
            let mut v = store::empty_val();
            let rc = store::get_rc(txn, db.0, &mut k, &mut v);
            if rc == store::NOTFOUND {
                return Ok(None);
            }
            store::check(rc)?;
            let raw = unsafe { store::val_bytes(&v) };
            inner.decode_value(raw).map(Some)
        })
    }

    /// Look up a versioned record: the stored value carries an 8-byte
    /// version prefix which is split off and returned alongside the data.
    pub fn get_versioned(
        &self,
        db: Dbi,
        key: &[u8],
    ) -> Result<Option<(f64, Vec<u8>)>> {
        let inner = &self.inner;
        inner.with_read_txn(|txn| {
            let mut k = store::val(key);
            let mut v = store::empty_val();
            let rc = store::get_rc(txn, db.0, &mut k, &mut v);
            if rc == store::NOTFOUND {
                return Ok(None);
            }
            store::check(rc)?;
            let raw = unsafe { store::val_bytes(&v) };
            if raw.len() < 8 {
                return Err(Error::Corrupted);
            }
            let mut bits = [0u8; 8];
            bits.copy_from_slice(&raw[..8]);
            let version = f64::from_bits(u64::from_ne_bytes(bits));
            let data = inner.decode_value(&raw[8..])?;
            Ok(Some((version, data)))
        })
    }

    /// Release the pages held by the shared read transaction; the next
    /// read renews it against the latest committed state.
    pub fn reset_read_txn(&self) {
        self.inner.invalidate_read_txn();
    }

    /// Start a write worker draining `batch` in the background.
    pub fn start_writing(&self, batch: WriteBatch) -> Result<BatchHandle> {
        write::start_writing(self, batch)
    }

    /// Flush the store's buffers to disk.
    pub fn sync(&self, force: bool) -> Result<()> {
        store::env_sync(self.inner.env, force)
    }

    /// Change the memory map size. Refused while any write transaction or
    /// worker is active.
    pub fn resize(&self, map_size: usize) -> Result<()> {
        let state = self.inner.writing.try_lock().ok_or(Error::TxnActive)?;
        if state.worker.is_some() || state.txn_stack.is_some() {
            return Err(Error::TxnActive);
        }
        // the shared read txn counts as active until it is reset
        self.inner.invalidate_read_txn();
        let mut rc = store::env_set_mapsize(self.inner.env, map_size);
        if rc == libc::EINVAL {
            // a stale reader can block the resize; cycling a write txn
            // clears it
            let txn =
                store::txn_begin(self.inner.env, ptr::null_mut(), 0)?;
            store::txn_commit(txn)?;
            rc = store::env_set_mapsize(self.inner.env, map_size);
        }
        store::check(rc)
    }

    pub fn stat(&self) -> Result<EnvStat> {
        store::env_stat(self.inner.env).map(EnvStat::from)
    }

    pub fn db_stat(&self, db: Dbi) -> Result<EnvStat> {
        self.inner
            .with_read_txn(|txn| store::db_stat(txn, db.0))
            .map(EnvStat::from)
    }

    pub fn info(&self) -> Result<EnvInfo> {
        store::env_info(self.inner.env).map(EnvInfo::from)
    }

    /// Clear stale entries from the store's reader lock table. Returns the
    /// number of dead readers removed.
    pub fn reader_check(&self) -> Result<u32> {
        store::reader_check(self.inner.env)
    }

    /// Largest key size the store accepts.
    pub fn max_key_size(&self) -> usize {
        self.inner.max_key_size as usize
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn compression(&self) -> Option<&Compression> {
        self.inner.compression.as_deref()
    }
}

pub(crate) struct OpenConfig {
    pub map_size: Option<usize>,
    pub max_dbs: u32,
    pub max_readers: u32,
    pub flags: c_uint,
}

/// A builder used to open an [`Env`] in various manners.
///
/// Generally speaking you'll first call [`new`], then chain calls to
/// methods to set each option, then call [`open`] with the path of the
/// environment.
///
/// # Examples
///
/// ```no_run
/// # #![allow(unused_variables)]
/// use batchdb::{init_env, EnvOpener};
///
/// # fn main() -> batchdb::Result<()> {
/// init_env();
/// let env = EnvOpener::new()
///     .map_size(1 << 26)
///     .max_dbs(4)
///     .open("/tmp/data.db")?;
/// # Ok(())
/// # }
/// ```
///
/// [`Env`]: struct.Env.html
/// [`new`]: struct.EnvOpener.html#method.new
/// [`open`]: struct.EnvOpener.html#method.open
#[derive(Debug, Clone)]
pub struct EnvOpener {
    map_size: Option<usize>,
    max_dbs: u32,
    max_readers: u32,
    no_subdir: bool,
    read_only: bool,
    use_writemap: bool,
    no_mem_init: bool,
    no_read_ahead: bool,
    no_meta_sync: bool,
    safe_no_sync: bool,
    no_sync: bool,
    map_async: bool,
    separate_flushed: bool,
    compression: Option<CompressionOptions>,
}

impl Default for EnvOpener {
    fn default() -> Self {
        EnvOpener {
            map_size: None,
            max_dbs: 1,
            max_readers: 126,
            no_subdir: true,
            read_only: false,
            use_writemap: false,
            no_mem_init: false,
            no_read_ahead: false,
            no_meta_sync: false,
            safe_no_sync: false,
            no_sync: false,
            map_async: false,
            separate_flushed: false,
            compression: None,
        }
    }
}

impl EnvOpener {
    /// Creates a blank new set of options ready for configuration. The
    /// environment is opened as a single data file (`no_subdir`) by
    /// default.
    pub fn new() -> Self {
        EnvOpener::default()
    }

    /// Sets the size of the memory map in bytes.
    pub fn map_size(&mut self, map_size: usize) -> &mut Self {
        self.map_size = Some(map_size);
        self
    }

    /// Sets the maximum number of named databases. `1` is the default.
    pub fn max_dbs(&mut self, max_dbs: u32) -> &mut Self {
        self.max_dbs = max_dbs;
        self
    }

    /// Sets the maximum number of reader slots. `126` is the default.
    pub fn max_readers(&mut self, max_readers: u32) -> &mut Self {
        self.max_readers = max_readers;
        self
    }

    /// Store the environment in a single file instead of a directory.
    /// Enabled by default.
    pub fn no_subdir(&mut self, no_subdir: bool) -> &mut Self {
        self.no_subdir = no_subdir;
        self
    }

    /// Opens the environment read-only.
    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    /// Use a writeable memory map. Aborting transactions is impossible in
    /// this mode, so nested transactions reuse their parent directly.
    pub fn use_writemap(&mut self, use_writemap: bool) -> &mut Self {
        self.use_writemap = use_writemap;
        self
    }

    /// Skip zero-initialisation of malloc'd pages before writing.
    pub fn no_mem_init(&mut self, no_mem_init: bool) -> &mut Self {
        self.no_mem_init = no_mem_init;
        self
    }

    /// Disable readahead on the memory map.
    pub fn no_read_ahead(&mut self, no_read_ahead: bool) -> &mut Self {
        self.no_read_ahead = no_read_ahead;
        self
    }

    /// Commit without flushing the meta page.
    pub fn no_meta_sync(&mut self, no_meta_sync: bool) -> &mut Self {
        self.no_meta_sync = no_meta_sync;
        self
    }

    /// Commit without flushing data pages; durability moves to explicit
    /// [`sync`] calls while the file stays recoverable.
    ///
    /// [`sync`]: struct.Env.html#method.sync
    pub fn safe_no_sync(&mut self, safe_no_sync: bool) -> &mut Self {
        self.safe_no_sync = safe_no_sync;
        self
    }

    /// Skip all flushing on commit.
    pub fn no_sync(&mut self, no_sync: bool) -> &mut Self {
        self.no_sync = no_sync;
        self
    }

    /// Use asynchronous flushes of the writeable memory map.
    pub fn map_async(&mut self, map_async: bool) -> &mut Self {
        self.map_async = map_async;
        self
    }

    /// Report batch commit and disk flush separately: the batch status
    /// word gains `TXN_FLUSHED` once the data hit disk.
    pub fn separate_flushed(&mut self, separate_flushed: bool) -> &mut Self {
        self.separate_flushed = separate_flushed;
        self
    }

    /// Enable LZ4 value compression with the given options.
    pub fn compression(&mut self, opts: CompressionOptions) -> &mut Self {
        self.compression = Some(opts);
        self
    }

    /// Open the environment at `path`. When the same path is already open
    /// in this process the existing environment is shared and the options
    /// given here are ignored.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Env> {
        let path = path.as_ref();
        let mut flags: c_uint = ffi::MDB_NOTLS;
        if self.no_subdir {
            flags |= ffi::MDB_NOSUBDIR;
        }
        if self.read_only {
            flags |= ffi::MDB_RDONLY;
        }
        if self.use_writemap {
            flags |= ffi::MDB_WRITEMAP;
        }
        if self.no_mem_init {
            flags |= ffi::MDB_NOMEMINIT;
        }
        if self.no_read_ahead {
            flags |= ffi::MDB_NORDAHEAD;
        }
        if self.no_meta_sync {
            flags |= ffi::MDB_NOMETASYNC;
        }
        if self.safe_no_sync {
            flags |= ffi::MDB_NOSYNC;
        }
        if self.no_sync {
            flags |= ffi::MDB_NOSYNC | ffi::MDB_NOMETASYNC;
        }
        if self.map_async {
            flags |= ffi::MDB_MAPASYNC;
        }

        let compression = match self.compression {
            Some(ref opts) => Some(Arc::new(Compression::new(opts)?)),
            None => None,
        };

        let config = OpenConfig {
            map_size: self.map_size,
            max_dbs: self.max_dbs,
            max_readers: self.max_readers,
            flags,
        };
        let (env, _existing) = registry::acquire(path, &config)?;
        let env_flags = store::env_flags(env);
        let max_key_size = store::env_max_key_size(env);
        debug!(
            "env ready at {:?}, max key size {}",
            path, max_key_size
        );

        Ok(Env {
            inner: Arc::new(EnvInner {
                env,
                path: path.to_path_buf(),
                env_flags,
                separate_flushed: self.separate_flushed,
                compression,
                writing: Signal::new(WriterState::new()),
                current_write_txn: AtomicPtr::new(ptr::null_mut()),
                read_txn: Mutex::new(ReadTxnState {
                    txn: ptr::null_mut(),
                    renewed: false,
                }),
                max_key_size,
            }),
        })
    }
}

/// Page statistics of an environment or a single database.
#[derive(Debug, Clone, Copy)]
pub struct EnvStat {
    pub page_size: u32,
    pub tree_depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

impl From<ffi::MDB_stat> for EnvStat {
    fn from(stat: ffi::MDB_stat) -> Self {
        EnvStat {
            page_size: stat.ms_psize as u32,
            tree_depth: stat.ms_depth as u32,
            branch_pages: stat.ms_branch_pages as usize,
            leaf_pages: stat.ms_leaf_pages as usize,
            overflow_pages: stat.ms_overflow_pages as usize,
            entries: stat.ms_entries as usize,
        }
    }
}

/// Runtime information about an environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_page_number: usize,
    pub last_txn_id: usize,
    pub max_readers: u32,
    pub num_readers: u32,
}

impl From<ffi::MDB_envinfo> for EnvInfo {
    fn from(info: ffi::MDB_envinfo) -> Self {
        EnvInfo {
            map_size: info.me_mapsize as usize,
            last_page_number: info.me_last_pgno as usize,
            last_txn_id: info.me_last_txnid as usize,
            max_readers: info.me_maxreaders as u32,
            num_readers: info.me_numreaders as u32,
        }
    }
}
