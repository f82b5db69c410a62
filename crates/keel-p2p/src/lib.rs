//! Committee peer protocol for keel.
//!
//! Members of a committee exchange three kinds of messages:
//!
//! - [`GetBlock`]: ask a peer for the block producing a state index
//! - [`BlockMessage`]: a block, sent in reply or after local execution
//! - [`SignedResult`]: a partial signature over a round's transaction essence
//!
//! Transport is out of scope; messages are plain byte buffers with a one-byte
//! type discriminator followed by big-endian fields.

mod error;
mod message;

pub use error::{P2PError, Result};
pub use message::{BlockMessage, GetBlock, Message, MessageType, SignedResult};
