//! Fuzz target for delta application.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    base: &'a [u8],
    delta: &'a [u8],
}

fuzz_target!(|input: Input<'_>| {
    let _ = smartfetch_git::apply_delta(input.base, input.delta);
});
