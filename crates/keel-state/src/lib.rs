//! Virtual state and blocks.
//!
//! A chain's state is an append-only sequence of [`VirtualState`] values. Each
//! one is derived from its predecessor by applying exactly one [`Block`]. Both
//! types have a deterministic binary encoding so that every committee member
//! computes byte-identical hashes.

mod block;
mod codec;
mod error;
mod state;

pub use block::{Block, Mutation, StateUpdate};
pub use error::{Result, StateError};
pub use state::VirtualState;

/// Version byte prefixed to every encoded block and state.
pub const ENCODING_VERSION: u8 = 1;
