#![no_main]

use std::fs;

use indexmirror_state::StateStore;
use indexmirror_storage::FileStorage;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

/// Arbitrary bytes should never panic `load_todofile`: an unparseable todo
/// file is discarded silently, not propagated as an error.
fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(td.path().join("todo"), data).is_err() {
        return;
    }

    let storage = FileStorage::new(td.path());
    let state = StateStore::new(&storage);
    let _ = state.load_todofile();
});
