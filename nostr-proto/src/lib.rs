//! Wire codec, event model and filter model for the Nostr protocol.
//!
//! This crate is the pure, I/O-free half of the client runtime: it knows how
//! to shape and parse events, filters and relay frames, but nothing about
//! networking, cryptography, or storage. Those live in `nostr-client-core`,
//! layered on top.

pub mod event;
pub mod filter;
pub mod message;
pub mod value;

pub use event::{Event, EventId, EventKind, Tag};
pub use filter::Filter;
pub use message::{ClientMessage, RelayMessage};
pub use value::RpcValue;
