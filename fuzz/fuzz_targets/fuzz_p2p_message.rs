//! Fuzz target for peer message parsing.
//!
//! Tests that the peer message decoder handles arbitrary input without
//! panicking, and that anything it accepts encodes back to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = keel_p2p::Message::decode(data) {
        assert_eq!(msg.encode().as_ref(), data);
    }

    // Individual body decoders take the payload without the type byte.
    if !data.is_empty() {
        let _ = keel_p2p::GetBlock::decode(data);
        let _ = keel_p2p::BlockMessage::decode(data);
        let _ = keel_p2p::SignedResult::decode(data);
    }
});
