//! Wire codec (§4.A): the three client→relay frames and five relay→client
//! frames, encoded as JSON arrays over WebSocket text frames.

pub mod client;
pub mod relay;

pub use client::ClientMessage;
pub use relay::RelayMessage;

/// Wire codec error. Decoding never panics (§4.A); a frame that fails to
/// parse becomes an `Err` the caller counts and drops.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  #[error("unrecognized or malformed frame")]
  UnknownFrame,
}
