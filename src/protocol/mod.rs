//! Wire-level vocabulary: addresses, messages, routing table, framing.

pub mod codec;
pub mod id;
pub mod message;
pub mod routing;

pub use id::{Identity, PeerId};
pub use message::{Body, Message, MessageKind};
