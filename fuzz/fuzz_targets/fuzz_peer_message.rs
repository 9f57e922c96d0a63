#![no_main]
use libfuzzer_sys::fuzz_target;
use torc::torrent::PeerMessage;

fuzz_target!(|data: &[u8]| {
    // decode() should never panic, and anything it accepts must survive a
    // round trip through encode()
    if let Ok(msg) = PeerMessage::decode(data) {
        let encoded = msg.encode();
        let decoded = PeerMessage::decode(&encoded[4..]).expect("re-decode of encoded message");
        assert_eq!(msg, decoded);
    }
});
