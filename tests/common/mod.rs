#![allow(dead_code)]

use batchdb::{
    init_env, CompressionOptions, DbOptions, Dbi, Env, EnvOpener,
};
use tempdir::TempDir;

pub fn setup() -> (Env, Dbi, TempDir) {
    init_env();
    let tmpdir = TempDir::new("batchdb_test").expect("create temp dir");
    let env = EnvOpener::new()
        .map_size(1 << 26)
        .open(tmpdir.path().join("data.db"))
        .unwrap();
    let db = env.open_db(None, &DbOptions::create()).unwrap();
    (env, db, tmpdir)
}

pub fn setup_compressed(threshold: usize) -> (Env, Dbi, TempDir) {
    init_env();
    let tmpdir = TempDir::new("batchdb_test").expect("create temp dir");
    let env = EnvOpener::new()
        .map_size(1 << 26)
        .compression(CompressionOptions {
            dictionary: vec![0u8; 4096],
            threshold,
            ..Default::default()
        })
        .open(tmpdir.path().join("data.db"))
        .unwrap();
    let db = env.open_db(None, &DbOptions::create()).unwrap();
    (env, db, tmpdir)
}

/// A second handle on the same path, without the compression config, so
/// tests can observe the raw stored bytes.
pub fn raw_view(dir: &TempDir) -> (Env, Dbi) {
    let env = EnvOpener::new()
        .open(dir.path().join("data.db"))
        .unwrap();
    let db = env.open_db(None, &DbOptions::default()).unwrap();
    (env, db)
}

pub fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("condition not reached within 5s");
}
