//! Fuzz target for pack ingestion.
//!
//! The first byte selects the framing so side-band and shallow-info paths
//! are reached as well as raw packs.

#![no_main]

use futures::executor::block_on;
use libfuzzer_sys::fuzz_target;
use smartfetch_git::{PackIngestOptions, PackIngestor};
use smartfetch_storage::MemoryRepository;

fuzz_target!(|data: &[u8]| {
    let Some((&mode, body)) = data.split_first() else {
        return;
    };
    let options = PackIngestOptions {
        expects_shallow_info: mode & 1 != 0,
        side_band: mode & 2 != 0,
        progress: None,
    };
    let store = MemoryRepository::new();

    block_on(async {
        let Ok(mut ingestor) = PackIngestor::start(body, options).await else {
            return;
        };
        while let Ok(Some(_)) = ingestor.next_object(&store).await {}
    });
});
