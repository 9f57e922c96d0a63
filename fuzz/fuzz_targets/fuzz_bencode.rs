#![no_main]
use libfuzzer_sys::fuzz_target;
use torc::torrent::{raw_slice, BencodeValue};

fuzz_target!(|data: &[u8]| {
    // parse() should never panic on arbitrary input
    let _ = BencodeValue::parse(data);

    // A value that parses must re-encode, and any raw slice handed out
    // must be a view into the original buffer
    if let Ok(value) = BencodeValue::parse_exact(data) {
        let _ = value.encode();
        if let Ok(slice) = raw_slice(data, &["info"]) {
            assert!(!slice.is_empty());
        }
    }
});
