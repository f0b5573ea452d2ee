//! The instruction-stream executor and the background write worker.
//!
//! The worker owns the environment's writing lock while it runs and
//! releases it only inside condition-variable waits, which is exactly
//! where callers can enter: to publish more instructions, to borrow the
//! worker's transaction, or to interrupt the batch for a synchronous
//! commit of their own.

use std::ops::Deref;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};
use std::sync::{Arc, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use lmdb_sys as ffi;

use crate::compress::{self, Compression};
use crate::env::txn::{TxnTracked, WriteTxn, TXN_FROM_WORKER};
use crate::env::{Env, EnvInner, Interruption, WriterState};
use crate::error::{Error, Result};
use crate::store;

use super::instr::*;
use super::{BatchInner, WriteBatch};

/// Shared control block of one running write worker.
pub(crate) struct WorkerCtl {
    /// False while a user callback is outstanding; the worker will not
    /// delimit the batch until it flips back.
    pub finished_progress: AtomicBool,
    pub done: AtomicBool,
    /// Address of the word carrying the batch outcome bits.
    pub final_word: AtomicUsize,
    pub events: Sender<WorkerEvent>,
}

pub(crate) enum WorkerEvent {
    Progress,
    Done(Result<()>),
}

/// The writing lock, held across executor calls and released inside
/// condvar waits.
pub(crate) struct LockSession<'a> {
    env: &'a EnvInner,
    guard: Option<MutexGuard<'a, WriterState>>,
}

impl<'a> LockSession<'a> {
    pub fn new(env: &'a EnvInner) -> LockSession<'a> {
        LockSession {
            env,
            guard: Some(env.writing.lock()),
        }
    }

    pub fn from_guard(
        env: &'a EnvInner,
        guard: MutexGuard<'a, WriterState>,
    ) -> LockSession<'a> {
        LockSession {
            env,
            guard: Some(guard),
        }
    }

    pub fn state(&mut self) -> &mut WriterState {
        self.guard.as_mut().unwrap()
    }

    pub fn wait(&mut self) {
        let guard = self.guard.take().unwrap();
        self.guard = Some(self.env.writing.wait(guard));
    }

    pub fn wait_timeout(&mut self, timeout: Duration) {
        let guard = self.guard.take().unwrap();
        self.guard = Some(self.env.writing.wait_timeout(guard, timeout));
    }

    pub fn notify(&self) {
        self.env.writing.notify_all();
    }

    pub fn into_guard(mut self) -> MutexGuard<'a, WriterState> {
        self.guard.take().unwrap()
    }
}

/// Execute the instruction stream at `cursor` inside `txn`.
///
/// With a worker control block this is the background mode: the executor
/// parks on exhausted streams, delimits the transaction when the batch is
/// caught up, and cooperates with callers through the handoff protocol.
/// Without one it is the synchronous fast path: the first empty word ends
/// the stream and the first fatal rc returns immediately.
///
/// Returns the first fatal rc (`KEYEXIST` and `NOTFOUND` only fail the
/// instruction's condition), or a protocol error for a malformed stream.
pub(crate) fn do_writes(
    session: &mut LockSession,
    env: &EnvInner,
    txn: &mut *mut ffi::MDB_txn,
    cursor: &mut *mut u32,
    worker: Option<&WorkerCtl>,
) -> Result<c_int> {
    let mut first_fatal: c_int = 0;
    let mut condition_depth: i32 = 0;
    let mut validated_depth: i32 = 0;

    loop {
        let start = *cursor;
        let word = unsafe { &*(start as *const AtomicU32) };
        let flags = word.load(Ordering::Acquire);
        let mut validated = condition_depth == validated_depth;

        if flags & UNKNOWN_FLAG_BITS != 0 {
            error!("unknown flag bits {:#x} at {:p}", flags, start);
            return Err(Error::Protocol("unknown flag bits"));
        }

        let opcode = flags & OPCODE_MASK;
        let mut instr = unsafe { start.add(1) };
        let mut dbi: ffi::MDB_dbi = 0;
        let mut key = store::empty_val();
        let mut value = store::empty_val();
        let mut compressed: Option<(*mut u8, usize)> = None;
        let mut set_version: Option<f64> = None;

        if flags & HAS_KEY != 0 {
            unsafe {
                dbi = *instr;
                instr = instr.add(1);
                let key_len = *instr as usize;
                instr = instr.add(1);
                key = ffi::MDB_val {
                    mv_size: key_len,
                    mv_data: instr as *mut _,
                };
                instr = ((instr as usize + key_len + 16) & !7) as *mut u32;
                if flags & HAS_VALUE != 0 {
                    if flags & COMPRESSIBLE != 0 {
                        let slot = instr.add(2) as *mut u64;
                        wait_for_compression(session, slot);
                        let value_len = *instr.offset(-1) as usize;
                        let value_ptr =
                            *(instr as *const u64) as usize as *mut u8;
                        value = ffi::MDB_val {
                            mv_size: value_len,
                            mv_data: value_ptr as *mut _,
                        };
                        compressed = Some((value_ptr, value_len));
                        instr = instr.add(4);
                    } else {
                        let value_len = *instr.offset(-1) as usize;
                        let value_ptr = *(instr as *const u64) as usize;
                        value = ffi::MDB_val {
                            mv_size: value_len,
                            mv_data: value_ptr as *mut _,
                        };
                        instr = instr.add(2);
                    }
                }
                if flags & CONDITIONAL_VERSION != 0 {
                    let wanted = *(instr as *const f64);
                    instr = instr.add(2);
                    let mut found = store::empty_val();
                    let rc = store::get_rc(*txn, dbi, &mut key, &mut found);
                    validated = rc == 0
                        && validated
                        && found.mv_size >= 8
                        && wanted
                            == (found.mv_data as *const f64).read_unaligned();
                }
                if flags & SET_VERSION != 0 {
                    set_version = Some(*(instr as *const f64));
                    instr = instr.add(2);
                }
                if opcode == START_CONDITION_BLOCK
                    && flags & IF_NO_EXISTS != 0
                {
                    let mut found = store::empty_val();
                    let rc = store::get_rc(*txn, dbi, &mut key, &mut found);
                    validated = validated && rc == store::NOTFOUND;
                }
            }
        } else {
            instr = unsafe { instr.add(1) };
        }

        let status;
        if validated || flags & CONDITIONAL == 0 {
            let mut rc: c_int = 0;
            match opcode {
                NO_INSTRUCTION_YET => {
                    let ctl = match worker {
                        // synchronous execution: the stream ends here
                        None => return Ok(first_fatal),
                        Some(ctl) => ctl,
                    };
                    if !ctl.finished_progress.load(Ordering::Acquire)
                        || condition_depth > 0
                    {
                        // more work has to arrive before this transaction
                        // can end; park until it does
                        if word
                            .compare_exchange(
                                flags,
                                WAITING_OPERATION,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            let wrc = wait_for_callbacks(
                                session,
                                env,
                                ctl,
                                txn,
                                condition_depth == 0,
                                Some(start),
                            );
                            if wrc != 0 {
                                return Ok(wrc);
                            }
                        }
                        continue;
                    } else if word
                        .compare_exchange(
                            flags,
                            TXN_DELIMITER,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // batch is caught up; the worker commits here
                        return Ok(first_fatal);
                    } else {
                        continue;
                    }
                }
                BLOCK_END => {
                    condition_depth -= 1;
                    if validated_depth > condition_depth {
                        validated_depth -= 1;
                    }
                    if condition_depth < 0 {
                        error!("negative condition depth at {:p}", start);
                        return Err(Error::Protocol(
                            "negative condition depth",
                        ));
                    }
                    *cursor = instr;
                    continue;
                }
                POINTER_NEXT => {
                    *cursor = unsafe { *(instr as *const u64) } as usize
                        as *mut u32;
                    continue;
                }
                START_BLOCK | START_CONDITION_BLOCK => {
                    rc = if validated {
                        validated_depth += 1;
                        0
                    } else {
                        store::NOTFOUND
                    };
                    condition_depth += 1;
                }
                PUT => {
                    rc = match set_version {
                        Some(version) => store::put_with_version_rc(
                            *txn,
                            dbi,
                            &mut key,
                            &value,
                            flags & PUT_FLAG_MASK,
                            version,
                        ),
                        None => store::put_rc(
                            *txn,
                            dbi,
                            &mut key,
                            &mut value,
                            flags & PUT_FLAG_MASK,
                        ),
                    };
                    if let Some((ptr, len)) = compressed.take() {
                        unsafe { compress::free_compressed(ptr, len) };
                    }
                }
                DEL => {
                    rc = store::del_rc(*txn, dbi, &mut key, None);
                }
                DEL_VALUE => {
                    rc = store::del_rc(*txn, dbi, &mut key, Some(&mut value));
                    if let Some((ptr, len)) = compressed.take() {
                        unsafe { compress::free_compressed(ptr, len) };
                    }
                }
                USER_CALLBACK => {
                    if let Some(ctl) = worker {
                        ctl.finished_progress.store(false, Ordering::Release);
                        ctl.events.send(WorkerEvent::Progress).ok();
                        if flags & USER_CALLBACK_STRICT_ORDER != 0 {
                            // mark it finished up front so the waiting
                            // thread processes it, then hold the line
                            word.fetch_or(
                                FINISHED_OPERATION,
                                Ordering::AcqRel,
                            );
                            while !ctl
                                .finished_progress
                                .load(Ordering::Acquire)
                            {
                                let wrc = wait_for_callbacks(
                                    session,
                                    env,
                                    ctl,
                                    txn,
                                    condition_depth == 0,
                                    None,
                                );
                                if wrc != 0 {
                                    return Ok(wrc);
                                }
                            }
                        }
                    }
                }
                DROP_DB => {
                    rc = store::drop_db_rc(
                        *txn,
                        dbi,
                        flags & DELETE_DATABASE != 0,
                    );
                }
                _ => {
                    error!("unknown opcode {} at {:p}", opcode, start);
                    return Err(Error::Protocol("unknown opcode"));
                }
            }
            if rc != 0 {
                if store::is_fatal(rc) {
                    if worker.is_none() {
                        return Ok(rc);
                    }
                    warn!(
                        "write instruction failed: {}",
                        store::strerror(rc)
                    );
                    if first_fatal == 0 {
                        first_fatal = rc;
                    }
                }
                status = FINISHED_OPERATION | FAILED_CONDITION;
            } else {
                status = FINISHED_OPERATION;
            }
        } else {
            // the condition failed; a compressed value that will never be
            // written still has to go
            if let Some((ptr, len)) = compressed.take() {
                unsafe { compress::free_compressed(ptr, len) };
            }
            status = FINISHED_OPERATION | FAILED_CONDITION;
        }
        word.fetch_or(status, Ordering::AcqRel);
        *cursor = instr;
    }
}

/// Resolve a compressible instruction's status slot before its value
/// pointer may be read: claim and compress it ourselves, or wait for the
/// compression worker that owns it.
fn wait_for_compression(session: &mut LockSession, slot_ptr: *mut u64) {
    let slot = unsafe { &*(slot_ptr as *const AtomicU64) };
    let status = slot.load(Ordering::Acquire);
    if status == 0 {
        return;
    }
    let status = slot.swap(1, Ordering::AcqRel);
    if status == 2 {
        // a compression worker owns the instruction; it signals once the
        // slot reaches 0
        while slot.load(Ordering::Acquire) != 0 {
            session.wait();
        }
    } else if status > 2 {
        // still unclaimed: the slot held the compressor address
        let compression = unsafe { &*(status as usize as *const Compression) };
        unsafe { compression.compress_instruction(None, slot_ptr) };
    } else if status == 0 {
        // lost the race against the compression worker's completion
        slot.store(0, Ordering::Release);
    }
}

/// Park the worker until new work arrives, handling batch interruption.
///
/// With a `target` word the wait polls it under an exponential backoff
/// (starting at 1ms) until its opcode nibble becomes non-zero; otherwise
/// a plain wait until signalled. When a caller requested a synchronous
/// commit, the worker commits its transaction here, parks while the
/// caller runs, and restarts a fresh transaction afterwards.
fn wait_for_callbacks(
    session: &mut LockSession,
    env: &EnvInner,
    ctl: &WorkerCtl,
    txn: &mut *mut ffi::MDB_txn,
    allow_commit: bool,
    target: Option<*const u32>,
) -> c_int {
    session.notify();
    session.state().interruption = if allow_commit {
        Interruption::AllowCommit
    } else {
        Interruption::Idle
    };

    match target {
        Some(target) => {
            let word = unsafe { &*(target as *const AtomicU32) };
            let mut delay_ms: u64 = 1;
            loop {
                session.wait_timeout(Duration::from_millis(delay_ms));
                delay_ms = delay_ms.saturating_mul(2);
                if word.load(Ordering::Acquire) & OPCODE_MASK != 0 {
                    break;
                }
                let interruption = session.state().interruption;
                if allow_commit
                    && (interruption == Interruption::InterruptBatch
                        || ctl.finished_progress.load(Ordering::Acquire))
                {
                    break;
                }
            }
        }
        None => session.wait(),
    }

    if session.state().interruption == Interruption::InterruptBatch {
        // a caller wants a synchronous transaction of its own
        session.state().interruption = Interruption::RestartingTxn;
        let mut rc = store::txn_commit_rc(*txn);
        if rc == 0 {
            debug!("worker committed for synchronous caller");
            *txn = ptr::null_mut();
            session.state().worker_txn = ptr::null_mut();
            env.invalidate_read_txn();
            session.notify();
            while session.state().interruption == Interruption::RestartingTxn
            {
                session.wait();
            }
            rc = store::txn_begin_rc(env.env, ptr::null_mut(), 0, txn);
            if rc == 0 {
                session.state().worker_txn = *txn;
                session.state().interruption = Interruption::Idle;
                session.notify();
                debug!("worker restarted its transaction");
            }
        }
        if rc != 0 {
            warn!("batch interruption failed: {}", store::strerror(rc));
            return rc;
        }
    } else {
        session.state().interruption = Interruption::Idle;
    }
    0
}

/// Spawn the background worker draining `batch`.
pub(crate) fn start_writing(
    env: &Env,
    batch: WriteBatch,
) -> Result<BatchHandle> {
    if !Arc::ptr_eq(&batch.inner.env, &env.inner) {
        return Err(Error::InvalidOption("batch"));
    }
    if batch.inner.started.swap(true, Ordering::AcqRel) {
        return Err(Error::InUse);
    }

    let (events_tx, events_rx) = unbounded();
    let ctl = Arc::new(WorkerCtl {
        finished_progress: AtomicBool::new(true),
        done: AtomicBool::new(false),
        final_word: AtomicUsize::new(0),
        events: events_tx,
    });

    {
        let mut state = env.inner.writing.lock();
        if state.worker.is_some() {
            batch.inner.started.store(false, Ordering::Release);
            return Err(Error::InUse);
        }
        state.worker = Some(ctl.clone());
    }

    let thread_env = env.inner.clone();
    let thread_batch = batch.inner.clone();
    let thread_ctl = ctl.clone();
    let spawned = thread::Builder::new()
        .name("batchdb-writer".into())
        .spawn(move || run_worker(thread_env, thread_batch, thread_ctl));
    if let Err(err) = spawned {
        env.inner.writing.lock().worker = None;
        batch.inner.started.store(false, Ordering::Release);
        return Err(Error::Io(err));
    }
    debug!("write worker started");

    Ok(BatchHandle {
        env: env.clone(),
        batch,
        ctl,
        events: events_rx,
    })
}

fn run_worker(
    env: Arc<EnvInner>,
    batch: Arc<BatchInner>,
    ctl: Arc<WorkerCtl>,
) {
    let mut session = LockSession::new(&env);
    let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
    let rc = store::txn_begin_rc(env.env, ptr::null_mut(), 0, &mut txn);
    if rc != 0 {
        session.state().worker = None;
        ctl.done.store(true, Ordering::Release);
        session.notify();
        drop(session);
        ctl.events
            .send(WorkerEvent::Done(Err(Error::Store(rc))))
            .ok();
        return;
    }
    session.state().worker_txn = txn;

    let mut cursor = batch.head;
    let result =
        do_writes(&mut session, &env, &mut txn, &mut cursor, Some(&*ctl));

    let outcome: Result<()> = match result {
        Err(err) => {
            store::txn_abort(txn);
            Err(err)
        }
        Ok(rc) if store::is_fatal(rc) => {
            store::txn_abort(txn);
            Err(Error::Store(rc))
        }
        Ok(_) => store::check(store::txn_commit_rc(txn)),
    };

    // the batch outcome lands on the delimiter word before anyone can
    // observe the worker as done
    ctl.final_word.store(cursor as usize, Ordering::Release);
    let delimiter = unsafe { &*(cursor as *const AtomicU32) };
    delimiter.fetch_or(
        if outcome.is_ok() {
            TXN_COMMITTED
        } else {
            TXN_HAD_ERROR
        },
        Ordering::AcqRel,
    );

    {
        let state = session.state();
        state.worker_txn = ptr::null_mut();
        state.worker = None;
        state.interruption = Interruption::Idle;
    }
    ctl.done.store(true, Ordering::Release);
    session.notify();
    drop(session);

    match outcome {
        Ok(()) => {
            if env.separate_flushed {
                store::env_sync(env.env, true).ok();
                delimiter.fetch_or(TXN_FLUSHED, Ordering::AcqRel);
            }
            env.invalidate_read_txn();
            debug!("write batch committed");
            ctl.events.send(WorkerEvent::Done(Ok(()))).ok();
        }
        Err(err) => {
            warn!("write batch failed: {}", err);
            ctl.events.send(WorkerEvent::Done(Err(err))).ok();
        }
    }
}

/// Execute `batch` synchronously inside an open write transaction.
pub(crate) fn write_batch_sync<'e>(
    txn: &mut WriteTxn<'e>,
    batch: &WriteBatch,
) -> Result<()> {
    let env: &'e Env = txn.env;
    if !Arc::ptr_eq(&batch.inner.env, &env.inner) {
        return Err(Error::InvalidOption("batch"));
    }
    if batch.inner.started.swap(true, Ordering::AcqRel) {
        return Err(Error::InUse);
    }

    let mut raw = txn.raw_txn();
    let guard = txn.guard.take().unwrap();
    let mut session = LockSession::from_guard(&env.inner, guard);
    let mut cursor = batch.inner.head;
    let result =
        do_writes(&mut session, &env.inner, &mut raw, &mut cursor, None);
    txn.guard = Some(session.into_guard());

    match result {
        Err(err) => Err(err),
        Ok(rc) if store::is_fatal(rc) => Err(Error::Store(rc)),
        Ok(_) => Ok(()),
    }
}

/// Handle of a running worker batch.
///
/// Dereferences to the underlying [`WriteBatch`], so more instructions
/// can be appended while the worker drains the stream.
///
/// [`WriteBatch`]: struct.WriteBatch.html
pub struct BatchHandle {
    pub(crate) env: Env,
    pub(crate) batch: WriteBatch,
    pub(crate) ctl: Arc<WorkerCtl>,
    pub(crate) events: Receiver<WorkerEvent>,
}

impl Deref for BatchHandle {
    type Target = WriteBatch;

    fn deref(&self) -> &WriteBatch {
        &self.batch
    }
}

impl BatchHandle {
    /// Wait for the batch to commit or fail, servicing user callbacks on
    /// this thread as the worker reaches them.
    pub fn wait(self) -> Result<()> {
        let mut callback_err: Option<Error> = None;
        loop {
            match self.events.recv() {
                Ok(WorkerEvent::Progress) => {
                    if let Err(err) = self.service_progress() {
                        if callback_err.is_none() {
                            callback_err = Some(err);
                        }
                    }
                }
                Ok(WorkerEvent::Done(result)) => {
                    result?;
                    return match callback_err {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                Err(_) => {
                    return Err(Error::Protocol("write worker disappeared"))
                }
            }
        }
    }

    /// Whether the worker finished the batch.
    pub fn is_done(&self) -> bool {
        self.ctl.done.load(Ordering::Acquire)
    }

    /// Status bits of the word delimiting the batch transaction: after
    /// completion it carries exactly one of [`TXN_COMMITTED`] or
    /// [`TXN_HAD_ERROR`] (plus [`TXN_FLUSHED`] with `separate_flushed`).
    /// Zero while the batch still runs.
    ///
    /// [`TXN_COMMITTED`]: constant.TXN_COMMITTED.html
    /// [`TXN_HAD_ERROR`]: constant.TXN_HAD_ERROR.html
    /// [`TXN_FLUSHED`]: constant.TXN_FLUSHED.html
    pub fn txn_status(&self) -> u32 {
        let word = self.ctl.final_word.load(Ordering::Acquire);
        if word == 0 {
            return 0;
        }
        unsafe { (*(word as *const AtomicU32)).load(Ordering::Acquire) }
    }

    // Run the next queued user callback against the worker's open
    // transaction: push a frame exposing it, invoke the callback under
    // the writing lock, then let the worker resume.
    fn service_progress(&self) -> Result<()> {
        let callback = self.batch.inner.callbacks.lock().unwrap().pop_front();
        let inner = &self.env.inner;

        let mut guard = inner.writing.lock();
        while guard.worker_txn.is_null()
            && !self.ctl.done.load(Ordering::Acquire)
        {
            guard = inner.writing.wait(guard);
        }
        if guard.worker_txn.is_null() {
            // the batch ended before the callback could run against it
            self.ctl.finished_progress.store(true, Ordering::Release);
            inner.writing.notify_all();
            return Ok(());
        }

        guard.txn_stack = Some(Box::new(TxnTracked {
            txn: guard.worker_txn,
            flags: TXN_FROM_WORKER,
            parent: guard.txn_stack.take(),
        }));
        inner.note_write_txn(&guard);
        self.ctl.finished_progress.store(true, Ordering::Release);

        let mut txn = WriteTxn::from_guard(&self.env, guard);
        let result = match callback {
            Some(mut callback) => callback(&mut txn),
            None => Ok(()),
        };
        txn.commit()?;
        result
    }
}
