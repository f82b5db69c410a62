//! Fuzz target for the block codec.
//!
//! Decoding must never panic, and a decoded block is always well formed:
//! it re-encodes to the input and its essence hash is stable.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(block) = keel_state::Block::decode(data) else {
        return;
    };
    assert!(block.index() > 0);
    assert!(!block.updates().is_empty());
    assert_eq!(block.encode().as_ref(), data);

    let again = keel_state::Block::decode(&block.encode()).expect("re-decode");
    assert_eq!(again.essence_hash(), block.essence_hash());
});
