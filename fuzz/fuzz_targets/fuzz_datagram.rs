#![no_main]

use arena_protocol::transport::nat::datagram::PeerDatagram;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(datagram) = PeerDatagram::decode(data) {
        let again = PeerDatagram::decode(&datagram.to_bytes()).expect("re-encoded datagram decodes");
        assert_eq!(again, datagram);
    }
});
