#![no_main]

use std::fs;

use gantry::state::load_receipt;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("receipt.json");
    if fs::write(path, data).is_ok() {
        let _ = load_receipt(td.path());
    }
});
