#![no_main]
use libfuzzer_sys::fuzz_target;

use mdns_types::protocol::types::{Message, MAX_PACKET_SIZE};

// parsing must never panic, for any datagram-sized input
fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len().min(MAX_PACKET_SIZE)];
    let _ = Message::from_octets(data);
});
