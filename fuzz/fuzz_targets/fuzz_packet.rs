#![no_main]

use arena_protocol::core::packet::{try_extract_packet, Frame};
use arena_protocol::protocol::message::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Walk the input as a stream of frames; never panic, never over-consume
    let mut rest = data;
    while let Ok(Some((frame, consumed))) = try_extract_packet(rest, 64 * 1024) {
        assert!(consumed <= rest.len());
        if let Frame::Packet(packet) = frame {
            let _ = Message::from_packet(&packet);
        }
        rest = &rest[consumed..];
    }
});
