//! Process-wide registry of open environments.
//!
//! The store forbids opening the same data file twice within one process,
//! so environments are deduplicated by path and refcounted. Options of a
//! second opener on the same path are ignored; it shares the environment
//! exactly as the first opener configured it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::store::{self, RawEnv};

use super::OpenConfig;

struct EnvEntry {
    path: PathBuf,
    env: RawEnv,
    count: u32,
}

lazy_static! {
    static ref OPEN_ENVS: Mutex<Vec<EnvEntry>> = Mutex::new(Vec::new());
}

/// Open the environment at `path`, or join the one already open there.
/// Returns the raw handle and whether an existing environment was reused.
pub fn acquire(path: &Path, config: &OpenConfig) -> Result<(RawEnv, bool)> {
    let mut envs = OPEN_ENVS.lock().unwrap();

    for entry in envs.iter_mut() {
        if entry.path == path {
            entry.count += 1;
            debug!(
                "joined open env at {:?} (count {})",
                entry.path, entry.count
            );
            return Ok((entry.env, true));
        }
    }

    let env = store::env_create()?;
    let result = (|| {
        store::env_set_maxdbs(env, config.max_dbs)?;
        store::env_set_maxreaders(env, config.max_readers)?;
        if let Some(size) = config.map_size {
            store::check(store::env_set_mapsize(env, size))?;
        }
        store::env_open(env, path, config.flags, 0o664)
    })();
    if let Err(err) = result {
        store::env_close(env);
        return Err(err);
    }

    envs.push(EnvEntry {
        path: path.to_path_buf(),
        env,
        count: 1,
    });
    debug!("opened env at {:?}", path);
    Ok((env, false))
}

/// Drop one reference to `env`; the store environment is closed when the
/// last reference goes away.
pub fn release(env: RawEnv) {
    let mut envs = OPEN_ENVS.lock().unwrap();
    for i in 0..envs.len() {
        if envs[i].env == env {
            envs[i].count -= 1;
            if envs[i].count == 0 {
                let entry = envs.remove(i);
                store::env_close(entry.env);
                debug!("closed env at {:?}", entry.path);
            }
            break;
        }
    }
}
