//! Fuzz target for pkt-line framing.
//!
//! The reader must reject malformed input with an error, never panic.

#![no_main]

use futures::executor::block_on;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = smartfetch_git::PktLineReader::new(data);

    // Bounded so crafted input cannot loop forever on empty packets.
    block_on(async {
        for _ in 0..100 {
            match reader.read().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    });
});
