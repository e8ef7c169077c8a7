#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use peernet::core::codec::Frame;
use peernet::protocol::bitcoin::{BitcoinProtocol, CMD_ADDR, CMD_GETADDR, CMD_VERACK, CMD_VERSION};
use peernet::protocol::Protocol;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };
    let Ok(protocol) = BitcoinProtocol::new() else {
        return;
    };
    let command = [CMD_VERSION, CMD_VERACK, CMD_ADDR, CMD_GETADDR][usize::from(selector % 4)];
    let version = if selector & 0x80 != 0 { 31402 } else { 209 };
    let _ = protocol
        .registry()
        .decode(Frame::new(command, Bytes::copy_from_slice(payload)), version);
});
