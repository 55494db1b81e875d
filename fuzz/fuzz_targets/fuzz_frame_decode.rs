#![no_main]

use libfuzzer_sys::fuzz_target;
use rfcomm_link::core::frame::decode;

fuzz_target!(|data: &[u8]| {
    // Fuzz frame decoding - test for panics, crashes, infinite loops
    let _ = decode(data);
});
