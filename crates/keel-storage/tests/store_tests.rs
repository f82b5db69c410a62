//! Integration tests for the chain store trait.

use keel_state::{Block, Mutation, StateUpdate, VirtualState};
use keel_storage::{ChainStore, MemoryStore};
use keel_types::{ChainAddress, HashValue, RequestId, TransactionId};
use std::sync::Arc;

fn advance(store: &dyn ChainStore, state: &VirtualState) -> VirtualState {
    let index = state.index() + 1;
    let id = RequestId::new(TransactionId(HashValue::digest(&index.to_be_bytes())), 0);
    let block = Block::new(
        index,
        index as u64,
        vec![StateUpdate::for_request(id, 0, vec![Mutation::set(format!("k{index}"), "v")])],
    )
    .unwrap();
    let next = state.apply_block(&block).unwrap();
    store.commit(&next, &block).unwrap();
    next
}

#[test]
fn test_store_shared_through_arc() {
    let chain = ChainAddress::from_seed("shared");
    let store = Arc::new(MemoryStore::new());
    let writer: Arc<dyn ChainStore> = store.clone();

    let mut state = VirtualState::origin(chain);
    for _ in 0..5 {
        state = advance(writer.as_ref(), &state);
    }

    let (loaded, block) = store.load(&chain).unwrap();
    assert_eq!(loaded.index(), 5);
    assert_eq!(loaded.hash(), state.hash());
    assert_eq!(block.index(), 5);
    for index in 1..=5 {
        assert!(store.load_block(&chain, index).unwrap().is_some());
    }
}

#[test]
fn test_chains_are_isolated() {
    let store = MemoryStore::new();
    let a = ChainAddress::from_seed("a");
    let b = ChainAddress::from_seed("b");
    advance(&store, &VirtualState::origin(a));

    assert!(store.exists(&a).unwrap());
    assert!(!store.exists(&b).unwrap());
    assert!(store.load_block(&b, 1).unwrap().is_none());
}
