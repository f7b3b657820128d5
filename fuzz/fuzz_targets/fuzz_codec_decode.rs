//! Fuzz target for the wire codec.
//!
//! `decode` sees whatever a broker hands back, so it must never panic.

#![no_main]

use dual_write_engine::codec::{content_hash, decode, maybe_decompress};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);
    let _ = decode(data, None);
    let _ = decode(data, Some(&content_hash(data)));
});
