//! Thin wrapper over the C API of the underlying memory-mapped B-tree
//! store.
//!
//! Everything here deals in raw environment and transaction pointers; the
//! `env` module layers the locking discipline on top. Functions whose
//! return code the write engine inspects (`KEYEXIST` and `NOTFOUND` are
//! condition outcomes, not failures) come in `_rc` form and return the
//! store's rc unchanged.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint};
use std::path::Path;
use std::ptr;
use std::slice;

use lmdb_sys as ffi;

use crate::error::{Error, Result};

pub use lmdb_sys::{MDB_dbi, MDB_env, MDB_txn, MDB_val};

pub const KEYEXIST: c_int = ffi::MDB_KEYEXIST;
pub const NOTFOUND: c_int = ffi::MDB_NOTFOUND;

/// Raw environment pointer, shared between the registry, the worker and
/// the caller threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEnv(pub *mut MDB_env);

unsafe impl Send for RawEnv {}
unsafe impl Sync for RawEnv {}

#[inline]
pub fn check(rc: c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Store(rc))
    }
}

/// Anything other than success or a condition outcome.
#[inline]
pub fn is_fatal(rc: c_int) -> bool {
    rc != 0 && rc != KEYEXIST && rc != NOTFOUND
}

pub fn strerror(rc: c_int) -> String {
    unsafe {
        let msg = ffi::mdb_strerror(rc);
        if msg.is_null() {
            format!("store error {}", rc)
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

#[inline]
pub fn val(bytes: &[u8]) -> MDB_val {
    MDB_val {
        mv_size: bytes.len(),
        mv_data: bytes.as_ptr() as *mut _,
    }
}

#[inline]
pub fn empty_val() -> MDB_val {
    MDB_val {
        mv_size: 0,
        mv_data: ptr::null_mut(),
    }
}

/// View the bytes a store-owned `MDB_val` points at. Only valid while the
/// transaction that produced it is live.
#[inline]
pub unsafe fn val_bytes<'a>(v: &MDB_val) -> &'a [u8] {
    if v.mv_size == 0 {
        &[]
    } else {
        slice::from_raw_parts(v.mv_data as *const u8, v.mv_size)
    }
}

pub fn env_create() -> Result<RawEnv> {
    let mut env: *mut MDB_env = ptr::null_mut();
    check(unsafe { ffi::mdb_env_create(&mut env) })?;
    Ok(RawEnv(env))
}

pub fn env_open(
    env: RawEnv,
    path: &Path,
    flags: c_uint,
    mode: u32,
) -> Result<()> {
    let path = path
        .to_str()
        .ok_or(Error::InvalidOption("path"))
        .and_then(|p| {
            CString::new(p).map_err(|_| Error::InvalidOption("path"))
        })?;
    check(unsafe {
        ffi::mdb_env_open(env.0, path.as_ptr(), flags, mode as ffi::mdb_mode_t)
    })
}

pub fn env_close(env: RawEnv) {
    unsafe { ffi::mdb_env_close(env.0) }
}

pub fn env_set_mapsize(env: RawEnv, size: usize) -> c_int {
    unsafe { ffi::mdb_env_set_mapsize(env.0, size) }
}

pub fn env_set_maxdbs(env: RawEnv, dbs: u32) -> Result<()> {
    check(unsafe { ffi::mdb_env_set_maxdbs(env.0, dbs) })
}

pub fn env_set_maxreaders(env: RawEnv, readers: u32) -> Result<()> {
    check(unsafe { ffi::mdb_env_set_maxreaders(env.0, readers) })
}

pub fn env_max_key_size(env: RawEnv) -> c_int {
    unsafe { ffi::mdb_env_get_maxkeysize(env.0) }
}

pub fn env_flags(env: RawEnv) -> c_uint {
    let mut flags: c_uint = 0;
    unsafe { ffi::mdb_env_get_flags(env.0, &mut flags) };
    flags
}

pub fn env_sync(env: RawEnv, force: bool) -> Result<()> {
    check(unsafe { ffi::mdb_env_sync(env.0, force as c_int) })
}

pub fn env_stat(env: RawEnv) -> Result<ffi::MDB_stat> {
    let mut stat: ffi::MDB_stat = unsafe { std::mem::zeroed() };
    check(unsafe { ffi::mdb_env_stat(env.0, &mut stat) })?;
    Ok(stat)
}

pub fn env_info(env: RawEnv) -> Result<ffi::MDB_envinfo> {
    let mut info: ffi::MDB_envinfo = unsafe { std::mem::zeroed() };
    check(unsafe { ffi::mdb_env_info(env.0, &mut info) })?;
    Ok(info)
}

pub fn db_stat(txn: *mut MDB_txn, dbi: MDB_dbi) -> Result<ffi::MDB_stat> {
    let mut stat: ffi::MDB_stat = unsafe { std::mem::zeroed() };
    check(unsafe { ffi::mdb_stat(txn, dbi, &mut stat) })?;
    Ok(stat)
}

pub fn reader_check(env: RawEnv) -> Result<u32> {
    let mut dead: c_int = 0;
    check(unsafe { ffi::mdb_reader_check(env.0, &mut dead) })?;
    Ok(dead as u32)
}

pub fn txn_begin(
    env: RawEnv,
    parent: *mut MDB_txn,
    flags: c_uint,
) -> Result<*mut MDB_txn> {
    let mut txn: *mut MDB_txn = ptr::null_mut();
    check(unsafe { ffi::mdb_txn_begin(env.0, parent, flags, &mut txn) })?;
    Ok(txn)
}

pub fn txn_begin_rc(
    env: RawEnv,
    parent: *mut MDB_txn,
    flags: c_uint,
    txn: &mut *mut MDB_txn,
) -> c_int {
    unsafe { ffi::mdb_txn_begin(env.0, parent, flags, txn) }
}

pub fn txn_commit_rc(txn: *mut MDB_txn) -> c_int {
    unsafe { ffi::mdb_txn_commit(txn) }
}

pub fn txn_commit(txn: *mut MDB_txn) -> Result<()> {
    check(txn_commit_rc(txn))
}

pub fn txn_abort(txn: *mut MDB_txn) {
    unsafe { ffi::mdb_txn_abort(txn) }
}

pub fn txn_reset(txn: *mut MDB_txn) {
    unsafe { ffi::mdb_txn_reset(txn) }
}

pub fn txn_renew(txn: *mut MDB_txn) -> Result<()> {
    check(unsafe { ffi::mdb_txn_renew(txn) })
}

pub fn dbi_open(
    txn: *mut MDB_txn,
    name: Option<&str>,
    flags: c_uint,
) -> Result<MDB_dbi> {
    let name_c = match name {
        Some(n) => {
            Some(CString::new(n).map_err(|_| Error::InvalidOption("name"))?)
        }
        None => None,
    };
    let name_ptr = name_c
        .as_ref()
        .map(|n| n.as_ptr())
        .unwrap_or(ptr::null::<c_char>());
    let mut dbi: MDB_dbi = 0;
    check(unsafe { ffi::mdb_dbi_open(txn, name_ptr, flags, &mut dbi) })?;
    Ok(dbi)
}

pub fn get_rc(
    txn: *mut MDB_txn,
    dbi: MDB_dbi,
    key: &mut MDB_val,
    data: &mut MDB_val,
) -> c_int {
    unsafe { ffi::mdb_get(txn, dbi, key, data) }
}

pub fn put_rc(
    txn: *mut MDB_txn,
    dbi: MDB_dbi,
    key: &mut MDB_val,
    data: &mut MDB_val,
    flags: c_uint,
) -> c_int {
    unsafe { ffi::mdb_put(txn, dbi, key, data, flags) }
}

/// Store `data` prefixed with an 8-byte version number in host byte
/// order, using a reserved put so the value is assembled directly in the
/// store's pages.
pub fn put_with_version_rc(
    txn: *mut MDB_txn,
    dbi: MDB_dbi,
    key: &mut MDB_val,
    data: &MDB_val,
    flags: c_uint,
    version: f64,
) -> c_int {
    let mut reserved = MDB_val {
        mv_size: data.mv_size + 8,
        mv_data: ptr::null_mut(),
    };
    let rc = unsafe {
        ffi::mdb_put(txn, dbi, key, &mut reserved, flags | ffi::MDB_RESERVE)
    };
    if rc == 0 {
        unsafe {
            let dst = reserved.mv_data as *mut u8;
            ptr::copy_nonoverlapping(
                version.to_bits().to_ne_bytes().as_ptr(),
                dst,
                8,
            );
            if data.mv_size > 0 {
                ptr::copy_nonoverlapping(
                    data.mv_data as *const u8,
                    dst.add(8),
                    data.mv_size,
                );
            }
        }
    }
    rc
}

pub fn del_rc(
    txn: *mut MDB_txn,
    dbi: MDB_dbi,
    key: &mut MDB_val,
    data: Option<&mut MDB_val>,
) -> c_int {
    let data_ptr = match data {
        Some(v) => v as *mut MDB_val,
        None => ptr::null_mut(),
    };
    unsafe { ffi::mdb_del(txn, dbi, key, data_ptr) }
}

pub fn drop_db_rc(txn: *mut MDB_txn, dbi: MDB_dbi, delete: bool) -> c_int {
    unsafe { ffi::mdb_drop(txn, dbi, delete as c_int) }
}
