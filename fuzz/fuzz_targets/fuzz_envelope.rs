#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peernet::core::codec::EnvelopeCodec;
use peernet::protocol::bitcoin::MAGIC;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Decode an arbitrary stream until it stalls; framing errors are expected
    let mut codec = EnvelopeCodec::new(MAGIC, 64 * 1024);
    let mut buf = BytesMut::from(data);
    loop {
        let before = buf.len();
        match codec.decode(&mut buf) {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => assert!(buf.len() < before, "error without progress"),
        }
    }
});
