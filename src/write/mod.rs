//! The batched write engine: instruction encoding, the stream executor
//! and the background write worker.

mod instr;
mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::compress;
use crate::env::txn::WriteTxn;
use crate::env::{Dbi, Env, EnvInner};
use crate::error::{Error, Result};

pub use self::instr::{
    APPEND, APPEND_DUP, FAILED_CONDITION, FINISHED_OPERATION, NO_DUP_DATA,
    NO_OVERWRITE, TXN_COMMITTED, TXN_DELIMITER, TXN_FLUSHED, TXN_HAD_ERROR,
    WAITING_OPERATION,
};
pub use self::worker::BatchHandle;

pub(crate) use self::worker::{start_writing, write_batch_sync, WorkerCtl};

use self::instr::{Encoder, KeyedOp};

pub(crate) type ProgressCallback =
    Box<dyn FnMut(&mut WriteTxn) -> Result<()> + Send>;

/// Identifies one instruction of a batch; used to observe its status
/// bits.
#[derive(Debug, Clone, Copy)]
pub struct OpToken(usize);

pub(crate) struct EncoderState {
    enc: Encoder,
    values: Vec<Box<[u8]>>,
}

pub(crate) struct BatchInner {
    pub env: Arc<EnvInner>,
    pub state: Mutex<EncoderState>,
    pub head: *mut u32,
    pub started: AtomicBool,
    pub callbacks: Mutex<VecDeque<ProgressCallback>>,
}

unsafe impl Send for BatchInner {}
unsafe impl Sync for BatchInner {}

/// A batch of write instructions.
///
/// Operations are encoded into the packed instruction stream as they are
/// added. The batch is then either drained by a background worker
/// ([`Env::start_writing`]) or executed on the caller's thread inside an
/// open transaction ([`WriteTxn::write_batch`]). Instructions may keep
/// being added through the returned [`BatchHandle`] while the worker
/// runs; once the worker catches up and commits, further additions fail
/// with [`Error::BatchCommitted`].
///
/// [`Env::start_writing`]: struct.Env.html#method.start_writing
/// [`WriteTxn::write_batch`]: struct.WriteTxn.html#method.write_batch
/// [`BatchHandle`]: struct.BatchHandle.html
/// [`Error::BatchCommitted`]: enum.Error.html
pub struct WriteBatch {
    pub(crate) inner: Arc<BatchInner>,
}

impl WriteBatch {
    pub fn new(env: &Env) -> WriteBatch {
        let enc = Encoder::new();
        let head = enc.head();
        WriteBatch {
            inner: Arc::new(BatchInner {
                env: env.inner.clone(),
                state: Mutex::new(EncoderState {
                    enc,
                    values: Vec::new(),
                }),
                head,
                started: AtomicBool::new(false),
                callbacks: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Store `value` under `key`. `flags` may combine [`NO_OVERWRITE`],
    /// [`NO_DUP_DATA`], [`APPEND`] and [`APPEND_DUP`].
    ///
    /// [`NO_OVERWRITE`]: constant.NO_OVERWRITE.html
    /// [`NO_DUP_DATA`]: constant.NO_DUP_DATA.html
    /// [`APPEND`]: constant.APPEND.html
    /// [`APPEND_DUP`]: constant.APPEND_DUP.html
    pub fn put(
        &self,
        db: Dbi,
        key: &[u8],
        value: &[u8],
        flags: u32,
    ) -> Result<OpToken> {
        check_put_flags(flags)?;
        self.encode_keyed(instr::PUT | flags, db, key, Some(value), None, None)
    }

    /// Store `value` under `key`, prefixed with an 8-byte version number.
    pub fn put_with_version(
        &self,
        db: Dbi,
        key: &[u8],
        value: &[u8],
        version: f64,
        flags: u32,
    ) -> Result<OpToken> {
        check_put_flags(flags)?;
        self.encode_keyed(
            instr::PUT | instr::SET_VERSION | flags,
            db,
            key,
            Some(value),
            None,
            Some(version),
        )
    }

    /// Store `value` under `key` only when the existing record carries
    /// version `if_version`; otherwise the instruction finishes with
    /// [`FAILED_CONDITION`].
    ///
    /// [`FAILED_CONDITION`]: constant.FAILED_CONDITION.html
    pub fn put_if_version(
        &self,
        db: Dbi,
        key: &[u8],
        value: &[u8],
        if_version: f64,
        set_version: Option<f64>,
        flags: u32,
    ) -> Result<OpToken> {
        check_put_flags(flags)?;
        let mut word_flags = instr::PUT | instr::CONDITIONAL_VERSION | flags;
        if set_version.is_some() {
            word_flags |= instr::SET_VERSION;
        }
        self.encode_keyed(
            word_flags,
            db,
            key,
            Some(value),
            Some(if_version),
            set_version,
        )
    }

    /// Delete `key`.
    pub fn del(&self, db: Dbi, key: &[u8]) -> Result<OpToken> {
        self.encode_keyed(instr::DEL, db, key, None, None, None)
    }

    /// Delete `key` only when its record carries version `if_version`.
    pub fn del_if_version(
        &self,
        db: Dbi,
        key: &[u8],
        if_version: f64,
    ) -> Result<OpToken> {
        self.encode_keyed(
            instr::DEL | instr::CONDITIONAL_VERSION,
            db,
            key,
            None,
            Some(if_version),
            None,
        )
    }

    /// Delete the exact `(key, value)` pair; used with duplicate-key
    /// databases.
    pub fn del_value(
        &self,
        db: Dbi,
        key: &[u8],
        value: &[u8],
    ) -> Result<OpToken> {
        self.encode_keyed(instr::DEL_VALUE, db, key, Some(value), None, None)
    }

    /// Open an unconditional instruction block. Blocks nest.
    pub fn start_block(&self) -> Result<OpToken> {
        self.encode_keyless(instr::START_BLOCK, None)
    }

    /// Open a condition block: the instructions inside run only when the
    /// predicate holds. With `if_no_exists`, `key` must be absent; with
    /// `if_version`, the record's version must match.
    pub fn start_condition_block(
        &self,
        db: Dbi,
        key: &[u8],
        if_no_exists: bool,
        if_version: Option<f64>,
    ) -> Result<OpToken> {
        let mut flags = instr::START_CONDITION_BLOCK;
        if if_no_exists {
            flags |= instr::IF_NO_EXISTS;
        }
        if if_version.is_some() {
            flags |= instr::CONDITIONAL_VERSION;
        }
        self.encode_keyed(flags, db, key, None, if_version, None)
    }

    /// Close the innermost block.
    pub fn end_block(&self) -> Result<OpToken> {
        self.encode_keyless(instr::BLOCK_END, None)
    }

    /// Empty a database, or delete it entirely.
    pub fn drop_db(&self, db: Dbi, delete: bool) -> Result<OpToken> {
        let mut flags = instr::DROP_DB;
        if delete {
            flags |= instr::DELETE_DATABASE;
        }
        self.encode_keyed(flags, db, &[], None, None, None)
    }

    /// Run `callback` on the thread that waits on the batch, with access
    /// to the worker's open transaction. With `strict`, the worker stops
    /// issuing further instructions until the callback returned.
    ///
    /// Batches containing callbacks must be waited on through
    /// [`BatchHandle::wait`], which services them.
    ///
    /// [`BatchHandle::wait`]: struct.BatchHandle.html#method.wait
    pub fn user_callback<F>(&self, strict: bool, callback: F) -> Result<OpToken>
    where
        F: FnMut(&mut WriteTxn) -> Result<()> + Send + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .push_back(Box::new(callback));
        let mut flags = instr::USER_CALLBACK;
        if strict {
            flags |= instr::USER_CALLBACK_STRICT_ORDER;
        }
        self.encode_keyless(flags, None)
    }

    /// Current status bits of one instruction, as ORed in by the
    /// executor: [`FINISHED_OPERATION`], [`FAILED_CONDITION`].
    ///
    /// [`FINISHED_OPERATION`]: constant.FINISHED_OPERATION.html
    /// [`FAILED_CONDITION`]: constant.FAILED_CONDITION.html
    pub fn op_status(&self, token: OpToken) -> u32 {
        unsafe { (*(token.0 as *const AtomicU32)).load(Ordering::Acquire) }
    }

    fn encode_keyed(
        &self,
        flags: u32,
        db: Dbi,
        key: &[u8],
        value: Option<&[u8]>,
        cond_version: Option<f64>,
        set_version: Option<f64>,
    ) -> Result<OpToken> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();

        let mut slot_seed = None;
        let value_entry = match value {
            Some(value) => {
                if value.len() > u32::max_value() as usize {
                    return Err(Error::InvalidOption("value"));
                }
                if let Some(ref compression) = inner.env.compression {
                    if compression.wants_compression(value) {
                        slot_seed = Some(
                            Arc::as_ptr(compression) as usize as u64
                        );
                    }
                }
                let boxed: Box<[u8]> = value.to_vec().into_boxed_slice();
                let entry = (boxed.as_ptr() as u64, boxed.len() as u32);
                state.values.push(boxed);
                Some(entry)
            }
            None => None,
        };
        let mut flags = flags;
        if slot_seed.is_some() {
            flags |= instr::COMPRESSIBLE;
        }

        let (base, slot) = state.enc.push_keyed(&KeyedOp {
            flags,
            dbi: db.0,
            key,
            value: value_entry,
            slot_seed,
            cond_version,
            set_version,
        })?;
        let wake = state.enc.take_wake();
        drop(state);

        if wake {
            inner.env.writing.notify_all();
        }
        if let Some(slot) = slot {
            compress::queue_compression(&inner.env, slot, self.inner.clone());
        }
        Ok(OpToken(base as usize))
    }

    fn encode_keyless(
        &self,
        flags: u32,
        payload: Option<u64>,
    ) -> Result<OpToken> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        let base = state.enc.push_keyless(flags, payload)?;
        let wake = state.enc.take_wake();
        drop(state);
        if wake {
            inner.env.writing.notify_all();
        }
        Ok(OpToken(base as usize))
    }
}

fn check_put_flags(flags: u32) -> Result<()> {
    if flags & !instr::PUT_FLAG_MASK != 0 {
        Err(Error::InvalidOption("flags"))
    } else {
        Ok(())
    }
}
