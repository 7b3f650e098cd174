#![no_main]

use arena_protocol::core::packet::Packet;
use arena_protocol::protocol::handshake::{ClientAuth, ClientIdentity, Credentials};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary server packets into the login state machine
    let identity = ClientIdentity {
        skin: "classic".into(),
        version_label: "2.0.0".into(),
        version: 200,
        build: "fuzz".into(),
        did: None,
    };
    let mut auth = ClientAuth::new(identity, Credentials::new("fuzz", "fuzz"));
    if auth.on_connected().is_err() || auth.on_token_sent().is_err() {
        return;
    }

    let mut rest = data;
    while rest.len() >= 2 {
        let size = (u16::from_le_bytes([rest[0], rest[1]]) as usize).clamp(2, rest.len());
        if let Ok(packet) = Packet::from_bytes(&rest[..size]) {
            let _ = auth.on_packet(&packet);
        }
        rest = &rest[size..];
    }
});
