#![no_main]

use binwatch_binlog::BinlogDecoder;
use libfuzzer_sys::fuzz_target;

// First byte picks checksum mode, the rest is split into events on 0xFF
// separators so table maps can be followed by row events.
fuzz_target!(|data: &[u8]| {
    let Some((&mode, rest)) = data.split_first() else {
        return;
    };
    let mut decoder = BinlogDecoder::new();
    decoder.reset(mode & 1 == 1);
    for event in rest.split(|b| *b == 0xFF).take(64) {
        let _ = decoder.decode(event);
    }
});
