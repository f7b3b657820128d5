//! Fuzz target for call classification and mode parsing.

#![no_main]

use dual_write_engine::classifier::{classify, CallMetadata};
use dual_write_engine::routing::select_first_target_raw;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (&str, &str)| {
    let (name, statement) = input;
    let _ = classify(&CallMetadata::named(name).with_statement(statement));
    let _ = select_first_target_raw(name);
});
