//! The worker parses its options from the command line; bad payloads must be
//! rejected cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use plugcheck::config::ValidationOptions;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = std::str::from_utf8(data) {
        if let Ok(options) = ValidationOptions::from_payload(payload) {
            assert!(options.validate().is_ok());
        }
    }
});
