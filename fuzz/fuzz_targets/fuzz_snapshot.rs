#![no_main]

use libfuzzer_sys::fuzz_target;
use peernet::reputation::persistence;

fuzz_target!(|data: &[u8]| {
    // Decoded records survive a re-encode
    if let Ok(records) = persistence::decode(data) {
        let encoded = persistence::encode(&records);
        assert_eq!(persistence::decode(&encoded).ok(), Some(records));
    }
});
