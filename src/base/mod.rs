//! Cross-cutting primitives used by the rest of the crate.

pub mod signal;

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise the batchdb environment.
///
/// This function should be called before any other functions provided by
/// batchdb. It can be called more than one time.
pub fn init_env() {
    // only call the initialisation code once globally
    INIT.call_once(|| {
        env_logger::try_init().ok();
    });
}
