//! Client-side runtime for the Nostr protocol.
//!
//! This crate layers networking, cryptography, caching and storage on
//! top of the pure wire/data model in `nostr-proto`: a per-relay
//! connection state machine, a multi-relay pool with health scoring, a
//! subscription multiplexer, an indexed event cache with optional disk
//! spill, a correlated request/response overlay for NIP-46 and NIP-47,
//! and a key store with derivation and backup.
//!
//! External collaborators (`Crypto`, `SecretStore`, `RelayTransport`,
//! `LogSink`) are narrow traits; concrete implementations are chosen at
//! construction, never reached for through a global.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod log_sink;
pub mod overlay;
pub mod pool;
pub mod secret_store;
pub mod subscription_manager;
pub mod transport;

pub use error::{Error, Result};

pub use nostr_proto::{ClientMessage, Event, EventId, EventKind, Filter, RelayMessage, Tag};
