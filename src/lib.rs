//! Batchdb is an embedded key-value store built around a batched write
//! engine.
//!
//! Writes are encoded into a packed instruction stream and drained by a
//! background write worker inside a single long-lived write transaction on
//! the underlying memory-mapped B-tree store. Large values can be
//! compressed off-thread with dictionary-based LZ4, and records can carry
//! an 8-byte floating point version that conditional writes are checked
//! against.
//!
//! The most core parts of this crate are [`Env`] and [`WriteBatch`]:
//!
//! - [`Env`] opens an environment (deduplicated process-wide by path) and
//!   provides transactions and reads
//! - [`WriteBatch`] accumulates write instructions that either a write
//!   worker ([`Env::start_writing`]) or a synchronous transaction
//!   ([`WriteTxn::write_batch`]) executes
//!
//! [`init_env`] initialises the environment and should be called before
//! any other methods provided by batchdb.
//!
//! # Examples
//!
//! Open an environment and write through a worker batch.
//!
//! ```no_run
//! # #![allow(unused_variables)]
//! use batchdb::{init_env, DbOptions, EnvOpener, WriteBatch};
//!
//! # fn main() -> batchdb::Result<()> {
//! init_env();
//!
//! let env = EnvOpener::new()
//!     .map_size(1 << 24)
//!     .open("/tmp/my.db")?;
//! let db = env.open_db(None, &DbOptions::create())?;
//!
//! let batch = WriteBatch::new(&env);
//! batch.put(db, b"hello", b"world", 0)?;
//! env.start_writing(batch)?.wait()?;
//!
//! assert_eq!(env.get(db, b"hello")?, Some(b"world".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! Synchronous transactions take the same instruction streams and also
//! expose direct operations:
//!
//! ```no_run
//! # use batchdb::{init_env, DbOptions, EnvOpener, TXN_ABORTABLE};
//! # fn main() -> batchdb::Result<()> {
//! # init_env();
//! # let env = EnvOpener::new().open("/tmp/my.db")?;
//! # let db = env.open_db(None, &DbOptions::create())?;
//! let mut txn = env.begin_write_txn(TXN_ABORTABLE)?;
//! txn.put(db, b"k", b"v", 0)?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Env`]: struct.Env.html
//! [`Env::start_writing`]: struct.Env.html#method.start_writing
//! [`WriteBatch`]: struct.WriteBatch.html
//! [`WriteTxn::write_batch`]: struct.WriteTxn.html#method.write_batch
//! [`init_env`]: fn.init_env.html

extern crate crossbeam_channel;
extern crate env_logger;
#[macro_use]
extern crate lazy_static;
extern crate libc;
extern crate lmdb_sys;
#[macro_use]
extern crate log;
extern crate lzzzz;
extern crate num_cpus;

mod base;
mod compress;
mod env;
mod error;
mod store;
mod write;

pub use self::base::init_env;
pub use self::compress::{Compression, CompressionOptions};
pub use self::env::txn::{
    WriteTxn, TXN_ABORTABLE, TXN_FROM_WORKER, TXN_SYNCHRONOUS_COMMIT,
};
pub use self::env::{DbOptions, Dbi, Env, EnvInfo, EnvOpener, EnvStat};
pub use self::error::{Error, Result};
pub use self::write::{
    BatchHandle, OpToken, WriteBatch, APPEND, APPEND_DUP, FAILED_CONDITION,
    FINISHED_OPERATION, NO_DUP_DATA, NO_OVERWRITE, TXN_COMMITTED,
    TXN_DELIMITER, TXN_FLUSHED, TXN_HAD_ERROR, WAITING_OPERATION,
};
