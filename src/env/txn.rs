//! Write transaction tracking: the LIFO frame stack and the caller side
//! of the worker handoff protocol.

use std::ptr;
use std::sync::MutexGuard;

use lmdb_sys as ffi;

use crate::error::{Error, Result};
use crate::store;
use crate::write::{self, WriteBatch};

use super::{Dbi, Env, Interruption, WriterState};

/// The frame owns its transaction and commits/aborts it on pop.
pub const TXN_ABORTABLE: u32 = 1;
/// Ask a running worker to commit its batch first so this transaction gets
/// its own top-level store transaction.
pub const TXN_SYNCHRONOUS_COMMIT: u32 = 2;
/// Set on transactions that run inside, or instead of, a worker batch.
pub const TXN_FROM_WORKER: u32 = 4;

/// One frame of the write transaction stack. A frame owns its `txn` only
/// when `TXN_ABORTABLE` is set; otherwise it is a borrowed view of a
/// parent or worker transaction.
pub(crate) struct TxnTracked {
    pub txn: *mut ffi::MDB_txn,
    pub flags: u32,
    pub parent: Option<Box<TxnTracked>>,
}

impl Env {
    /// Begin a write transaction. There is at most one write transaction
    /// per environment; this blocks until the writing lock is available,
    /// cooperating with a running write worker through the handoff
    /// protocol.
    ///
    /// Beginning a second write transaction from the thread that already
    /// holds one deadlocks; use [`WriteTxn::begin_nested`] instead.
    ///
    /// [`WriteTxn::begin_nested`]: struct.WriteTxn.html#method.begin_nested
    pub fn begin_write_txn(&self, flags: u32) -> Result<WriteTxn<'_>> {
        let inner = &*self.inner;
        let mut flags = flags;
        let mut guard = inner.writing.lock();

        // an in-flight handoff settles before anyone else may enter
        while guard.interruption == Interruption::InterruptBatch
            || guard.interruption == Interruption::RestartingTxn
        {
            guard = inner.writing.wait(guard);
        }

        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        if guard.worker.is_some() && !guard.worker_txn.is_null() {
            if flags & TXN_SYNCHRONOUS_COMMIT != 0
                && guard.interruption == Interruption::AllowCommit
            {
                // interrupt the batch: the worker commits, parks, and we
                // get a top-level transaction of our own
                guard.interruption = Interruption::InterruptBatch;
                inner.writing.notify_all();
                while !(guard.worker_txn.is_null()
                    && (guard.interruption == Interruption::RestartingTxn
                        || guard.worker.is_none()))
                {
                    guard = inner.writing.wait(guard);
                }
                flags |= TXN_FROM_WORKER;
            } else {
                guard.interruption = Interruption::UserHasLock;
                flags |= TXN_FROM_WORKER;
                txn = guard.worker_txn;
            }
        }

        let result = if !txn.is_null() {
            if flags & TXN_ABORTABLE != 0 {
                if inner.is_writemap() {
                    // aborts are impossible with a writeable map; reuse
                    // the worker txn directly
                    flags &= !TXN_ABORTABLE;
                    Ok(txn)
                } else {
                    store::txn_begin(inner.env, txn, 0)
                }
            } else {
                Ok(txn)
            }
        } else {
            flags |= TXN_ABORTABLE;
            store::txn_begin(inner.env, ptr::null_mut(), 0)
        };

        let txn = match result {
            Ok(txn) => txn,
            Err(err) => {
                // unwind the protocol so a parked worker can resume
                if guard.worker.is_some() {
                    guard.interruption = Interruption::Idle;
                    inner.writing.notify_all();
                }
                return Err(err);
            }
        };

        debug!("begin write txn, flags {:#x}", flags);
        guard.txn_stack = Some(Box::new(TxnTracked {
            txn,
            flags,
            parent: guard.txn_stack.take(),
        }));
        inner.note_write_txn(&guard);
        Ok(WriteTxn {
            env: self,
            guard: Some(guard),
        })
    }
}

/// An exclusive write transaction.
///
/// The guard holds the environment's writing lock for its whole lifetime.
/// Dropping it without calling [`commit`] aborts all abortable frames.
///
/// [`commit`]: struct.WriteTxn.html#method.commit
pub struct WriteTxn<'e> {
    pub(crate) env: &'e Env,
    pub(crate) guard: Option<MutexGuard<'e, WriterState>>,
}

impl<'e> WriteTxn<'e> {
    pub(crate) fn from_guard(
        env: &'e Env,
        guard: MutexGuard<'e, WriterState>,
    ) -> WriteTxn<'e> {
        WriteTxn {
            env,
            guard: Some(guard),
        }
    }

    fn state(&self) -> &WriterState {
        self.guard.as_ref().unwrap()
    }

    fn top(&self) -> &TxnTracked {
        self.state().txn_stack.as_ref().unwrap()
    }

    pub(crate) fn raw_txn(&self) -> *mut ffi::MDB_txn {
        self.top().txn
    }

    /// Whether this transaction runs inside a worker batch.
    pub fn is_from_worker(&self) -> bool {
        self.top().flags & TXN_FROM_WORKER != 0
    }

    pub fn put(
        &mut self,
        db: Dbi,
        key: &[u8],
        value: &[u8],
        flags: u32,
    ) -> Result<()> {
        let mut k = store::val(key);
        let mut v = store::val(value);
        store::check(store::put_rc(self.raw_txn(), db.0, &mut k, &mut v, flags))
    }

    /// Store `value` prefixed with an 8-byte version number.
    pub fn put_with_version(
        &mut self,
        db: Dbi,
        key: &[u8],
        value: &[u8],
        version: f64,
        flags: u32,
    ) -> Result<()> {
        let mut k = store::val(key);
        let v = store::val(value);
        store::check(store::put_with_version_rc(
            self.raw_txn(),
            db.0,
            &mut k,
            &v,
            flags,
            version,
        ))
    }

    /// Read through this transaction; sees writes of the transaction
    /// itself.
    pub fn get(&self, db: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut k = store::val(key);
        let mut v = store::empty_val();
        let rc = store::get_rc(self.raw_txn(), db.0, &mut k, &mut v);
        if rc == store::NOTFOUND {
            return Ok(None);
        }
        store::check(rc)?;
        let raw = unsafe { store::val_bytes(&v) };
        self.env.inner.decode_value(raw).map(Some)
    }

    /// Delete `key`, or only the exact `(key, value)` pair when a value is
    /// given. Returns whether anything was deleted.
    pub fn del(
        &mut self,
        db: Dbi,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        let mut k = store::val(key);
        let mut v = value.map(store::val);
        let rc = store::del_rc(self.raw_txn(), db.0, &mut k, v.as_mut());
        if rc == store::NOTFOUND {
            return Ok(false);
        }
        store::check(rc)?;
        Ok(true)
    }

    /// Empty a database, or delete it entirely.
    pub fn drop_db(&mut self, db: Dbi, delete: bool) -> Result<()> {
        store::check(store::drop_db_rc(self.raw_txn(), db.0, delete))
    }

    /// Remove every record of a database, keeping the database itself.
    pub fn clear_db(&mut self, db: Dbi) -> Result<()> {
        self.drop_db(db, false)
    }

    /// Execute a pre-built instruction batch on this thread, inside this
    /// transaction.
    pub fn write_batch(&mut self, batch: &WriteBatch) -> Result<()> {
        write::write_batch_sync(self, batch)
    }

    /// Push a nested transaction frame. In writemap mode the parent is
    /// reused directly, so the nested frame cannot be aborted.
    pub fn begin_nested(&mut self) -> Result<()> {
        let parent_txn = self.raw_txn();
        let (txn, flags) = if self.env.inner.is_writemap() {
            (parent_txn, TXN_FROM_WORKER & self.top().flags)
        } else {
            (
                store::txn_begin(self.env.inner.env, parent_txn, 0)?,
                TXN_ABORTABLE,
            )
        };
        let guard = self.guard.as_mut().unwrap();
        guard.txn_stack = Some(Box::new(TxnTracked {
            txn,
            flags,
            parent: guard.txn_stack.take(),
        }));
        self.env.inner.note_write_txn(guard);
        Ok(())
    }

    /// Pop the innermost nested frame, committing it into its parent.
    pub fn commit_nested(&mut self) -> Result<()> {
        let frame = self.pop_nested()?;
        if frame.flags & TXN_ABORTABLE != 0 {
            store::txn_commit(frame.txn)?;
        }
        Ok(())
    }

    /// Pop the innermost nested frame, discarding its writes.
    pub fn abort_nested(&mut self) -> Result<()> {
        let frame = self.pop_nested()?;
        if frame.flags & TXN_ABORTABLE != 0 {
            store::txn_abort(frame.txn);
            Ok(())
        } else {
            Err(Error::NotAbortable)
        }
    }

    fn pop_nested(&mut self) -> Result<Box<TxnTracked>> {
        let guard = self.guard.as_mut().unwrap();
        if guard.txn_stack.as_ref().unwrap().parent.is_none() {
            return Err(Error::NotNested);
        }
        let mut frame = guard.txn_stack.take().unwrap();
        guard.txn_stack = frame.parent.take();
        self.env.inner.note_write_txn(guard);
        Ok(frame)
    }

    /// Commit the transaction. Nested frames must be closed first.
    pub fn commit(mut self) -> Result<()> {
        if self.top().parent.is_some() {
            return Err(Error::Uncompleted);
        }
        let frame = {
            let guard = self.guard.as_mut().unwrap();
            let frame = guard.txn_stack.take().unwrap();
            self.env.inner.note_write_txn(guard);
            frame
        };
        let rc = if frame.flags & TXN_ABORTABLE != 0 {
            store::txn_commit_rc(frame.txn)
        } else {
            0
        };
        self.finish();
        store::check(rc)
    }

    /// Abort the transaction, discarding all frames. Fails when the base
    /// frame borrows a worker transaction and cannot be aborted (its
    /// writes stay in the worker batch).
    pub fn abort(mut self) -> Result<()> {
        let skipped = self.abort_all();
        self.finish();
        if skipped {
            Err(Error::NotAbortable)
        } else {
            Ok(())
        }
    }

    fn abort_all(&mut self) -> bool {
        let guard = self.guard.as_mut().unwrap();
        let mut frame_opt = guard.txn_stack.take();
        self.env.inner.note_write_txn(guard);
        let mut skipped = false;
        while let Some(mut frame) = frame_opt {
            if frame.flags & TXN_ABORTABLE != 0 {
                store::txn_abort(frame.txn);
            } else {
                skipped = true;
            }
            frame_opt = frame.parent.take();
        }
        skipped
    }

    fn finish(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            if guard.worker.is_some() {
                // a parked worker resumes once we reset the state; an
                // interruption another caller already requested stays
                // pending
                match guard.interruption {
                    Interruption::UserHasLock
                    | Interruption::RestartingTxn => {
                        guard.interruption = Interruption::Idle;
                    }
                    _ => {}
                }
                self.env.inner.writing.notify_all();
            }
            drop(guard);
            self.env.inner.invalidate_read_txn();
            debug!("write txn finished");
        }
    }
}

impl<'e> Drop for WriteTxn<'e> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            self.abort_all();
            self.finish();
        }
    }
}
