#![no_main]

use gantry::pipeline::deploy_allowed;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let (ref_name, release_ref) = match text.split_once('\n') {
        Some(pair) => pair,
        None => (text, text),
    };

    let allowed = deploy_allowed(ref_name, release_ref);
    assert_eq!(allowed, ref_name == release_ref);

    // A ref always matches itself.
    assert!(deploy_allowed(release_ref, release_ref));
});
