//! Fuzz target for `info/refs` advertisement parsing.

#![no_main]

use futures::executor::block_on;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = block_on(smartfetch_git::parse_advertisement(
        data,
        smartfetch_git::UPLOAD_PACK,
    ));

    if let Ok(s) = std::str::from_utf8(data) {
        let capabilities = smartfetch_git::Capabilities::parse(s);
        let _ = capabilities.fetch_tokens(true, false);
    }
});
