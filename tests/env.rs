mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use batchdb::{
    init_env, DbOptions, EnvOpener, Error, WriteBatch, TXN_ABORTABLE,
};
use tempdir::TempDir;

use common::{raw_view, setup, setup_compressed};

#[test]
fn put_and_get_roundtrip() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"v", 0).unwrap();
    txn.commit().unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(env.get(db, b"missing").unwrap(), None);
}

#[test]
fn reads_route_through_the_open_write_txn() {
    let (env, db, _dir) = setup();

    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"1", 0).unwrap();
    // environment reads see the uncommitted write while the txn is open
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"1".to_vec()));
    assert_eq!(txn.get(db, b"k").unwrap(), Some(b"1".to_vec()));
    txn.commit().unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"1".to_vec()));

    // an aborted write never becomes visible once the txn is gone
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"2", 0).unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"2".to_vec()));
    txn.abort().unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn read_txn_snapshot_survives_until_reset() {
    init_env();
    let dir = TempDir::new("batchdb_test").unwrap();
    let path = dir.path().join("data.db");
    let env = EnvOpener::new().map_size(1 << 26).open(&path).unwrap();
    let db = env.open_db(None, &DbOptions::create()).unwrap();

    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"1", 0).unwrap();
    txn.commit().unwrap();

    // a second handle on the same path keeps its own shared read txn
    let other = EnvOpener::new().open(&path).unwrap();
    assert_eq!(other.get(db, b"k").unwrap(), Some(b"1".to_vec()));

    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"2", 0).unwrap();
    txn.commit().unwrap();

    // the writer's own snapshot was renewed by the commit; the other
    // handle stays pinned on its older snapshot until it resets
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"2".to_vec()));
    assert_eq!(other.get(db, b"k").unwrap(), Some(b"1".to_vec()));
    other.reset_read_txn();
    assert_eq!(other.get(db, b"k").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn at_most_one_write_txn() {
    let (env, db, _dir) = setup();
    let entered = Arc::new(AtomicBool::new(false));

    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"a", b"1", 0).unwrap();

    let thread_env = env.clone();
    let thread_entered = entered.clone();
    let second = thread::spawn(move || {
        let mut txn = thread_env.begin_write_txn(TXN_ABORTABLE).unwrap();
        thread_entered.store(true, Ordering::SeqCst);
        txn.put(db, b"b", b"2", 0).unwrap();
        txn.commit().unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!entered.load(Ordering::SeqCst));
    txn.commit().unwrap();

    second.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
    assert_eq!(env.get(db, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(env.get(db, b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn nested_txns_commit_and_abort() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"a", b"1", 0).unwrap();

    txn.begin_nested().unwrap();
    txn.put(db, b"a", b"2", 0).unwrap();
    txn.abort_nested().unwrap();
    assert_eq!(txn.get(db, b"a").unwrap(), Some(b"1".to_vec()));

    txn.begin_nested().unwrap();
    txn.put(db, b"a", b"3", 0).unwrap();
    txn.commit_nested().unwrap();
    assert_eq!(txn.get(db, b"a").unwrap(), Some(b"3".to_vec()));

    assert_eq!(txn.commit_nested().unwrap_err(), Error::NotNested);
    txn.commit().unwrap();
    assert_eq!(env.get(db, b"a").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn commit_with_open_nested_txn_is_refused() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"a", b"1", 0).unwrap();
    txn.begin_nested().unwrap();
    assert_eq!(txn.commit().unwrap_err(), Error::Uncompleted);
    // the failed commit aborted everything
    assert_eq!(env.get(db, b"a").unwrap(), None);
}

#[test]
fn dropped_txn_aborts() {
    let (env, db, _dir) = setup();
    {
        let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
        txn.put(db, b"gone", b"1", 0).unwrap();
    }
    assert_eq!(env.get(db, b"gone").unwrap(), None);
}

#[test]
fn versioned_records() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put_with_version(db, b"k", b"payload", 5.25, 0).unwrap();
    txn.commit().unwrap();

    let (version, data) = env.get_versioned(db, b"k").unwrap().unwrap();
    assert_eq!(version, 5.25);
    assert_eq!(data, b"payload");

    // the raw record is the value prefixed with the 8-byte version
    let raw = env.get(db, b"k").unwrap().unwrap();
    assert_eq!(raw.len(), 8 + 7);
    assert_eq!(&raw[8..], b"payload");
}

#[test]
fn compressed_values_roundtrip() {
    let (env, db, dir) = setup_compressed(16);
    let value = vec![b'A'; 8192];

    let batch = WriteBatch::new(&env);
    batch.put(db, b"x", &value, 0).unwrap();
    env.start_writing(batch).unwrap().wait().unwrap();

    assert_eq!(env.get(db, b"x").unwrap(), Some(value.clone()));

    // through a handle without the compression config the stored bytes
    // are visible: shorter than the value and marked with the sentinel
    let (raw_env, raw_db) = raw_view(&dir);
    let stored = raw_env.get(raw_db, b"x").unwrap().unwrap();
    assert!(stored.len() < value.len());
    assert_eq!(stored[0], 0xfe);
}

#[test]
fn reserved_first_byte_is_always_compressed() {
    let (env, db, dir) = setup_compressed(1000);
    let value = vec![0xfbu8, 0x01, 0x02];

    let batch = WriteBatch::new(&env);
    batch.put(db, b"r", &value, 0).unwrap();
    env.start_writing(batch).unwrap().wait().unwrap();

    assert_eq!(env.get(db, b"r").unwrap(), Some(value));

    let (raw_env, raw_db) = raw_view(&dir);
    let stored = raw_env.get(raw_db, b"r").unwrap().unwrap();
    assert!(stored[0] == 0xfe || stored[0] == 0xff);
}

#[test]
fn same_path_shares_the_environment() {
    init_env();
    let dir = TempDir::new("batchdb_test").unwrap();
    let path = dir.path().join("data.db");

    let first = EnvOpener::new().map_size(1 << 24).open(&path).unwrap();
    let db = first.open_db(None, &DbOptions::create()).unwrap();
    let second = EnvOpener::new().open(&path).unwrap();

    let mut txn = first.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"shared", b"yes", 0).unwrap();
    txn.commit().unwrap();

    assert_eq!(second.get(db, b"shared").unwrap(), Some(b"yes".to_vec()));

    // dropping one handle keeps the environment usable via the other
    drop(first);
    assert_eq!(second.get(db, b"shared").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn stat_and_info_report_state() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    for i in 0..10u32 {
        txn.put(db, format!("k{}", i).as_bytes(), b"v", 0).unwrap();
    }
    txn.commit().unwrap();

    assert_eq!(env.db_stat(db).unwrap().entries, 10);
    assert!(env.stat().unwrap().page_size > 0);
    assert_eq!(env.info().unwrap().map_size, 1 << 26);
    assert!(env.max_key_size() > 0);
    env.sync(true).unwrap();
    env.reader_check().unwrap();
}

#[test]
fn resize_refused_while_txn_active() {
    let (env, db, _dir) = setup();
    {
        let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
        txn.put(db, b"k", b"v", 0).unwrap();
        let env2 = env.clone();
        let handle = thread::spawn(move || env2.resize(1 << 27));
        assert_eq!(handle.join().unwrap().unwrap_err(), Error::TxnActive);
        txn.commit().unwrap();
    }
    env.resize(1 << 27).unwrap();
    assert_eq!(env.info().unwrap().map_size, 1 << 27);
}

#[test]
fn drop_db_empties_the_database() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"v", 0).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.clear_db(db).unwrap();
    txn.commit().unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), None);
    assert_eq!(env.db_stat(db).unwrap().entries, 0);
}

#[test]
fn read_only_env_refuses_writes() {
    init_env();
    let dir = TempDir::new("batchdb_test").unwrap();
    let path = dir.path().join("data.db");
    {
        let env = EnvOpener::new().open(&path).unwrap();
        let db = env.open_db(None, &DbOptions::create()).unwrap();
        let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
        txn.put(db, b"k", b"v", 0).unwrap();
        txn.commit().unwrap();
    }

    let env = EnvOpener::new().read_only(true).open(&path).unwrap();
    let db = env.open_db(None, &DbOptions::default()).unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), Some(b"v".to_vec()));
    let err = env
        .begin_write_txn(TXN_ABORTABLE)
        .err()
        .expect("write txn on read-only env must fail");
    match err {
        Error::Store(_) => {}
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn del_removes_records() {
    let (env, db, _dir) = setup();
    let mut txn = env.begin_write_txn(TXN_ABORTABLE).unwrap();
    txn.put(db, b"k", b"v", 0).unwrap();
    assert!(txn.del(db, b"k", None).unwrap());
    assert!(!txn.del(db, b"k", None).unwrap());
    txn.commit().unwrap();
    assert_eq!(env.get(db, b"k").unwrap(), None);
}
