//! Arbitrary worker output must decode to a message or an error, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use plugcheck::supervisor::protocol::decode_line;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = decode_line(line);
    }
});
