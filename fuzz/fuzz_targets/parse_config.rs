#![no_main]

use std::fs;

use gantry::config::load_config;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join(".gantry.toml");
    if fs::write(path, data).is_ok() {
        let _ = load_config(td.path());
    }
});
