//! The `RelayTransport` capability (§9): `connect`, `disconnect`,
//! `send(frame)`, `messages() -> stream`. Grounded in the teacher's
//! `client/src/pool.rs` `RelayData::connect`, generalized from a
//! hardcoded single relay to one transport instance per relay url and
//! from fire-and-forget sends to a `Result`-returning contract the
//! connection state machine can react to.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Error, TransportError};

#[async_trait]
pub trait RelayTransport: Send + Sync {
  async fn connect(&self) -> crate::Result<()>;
  async fn disconnect(&self);
  async fn send(&self, frame: String) -> crate::Result<()>;
  /// Pulls the next inbound text frame, or `None` once the socket has
  /// closed and no more frames will ever arrive.
  async fn next_message(&self) -> Option<String>;
}

/// Default transport over `tokio-tungstenite`, one WebSocket per relay
/// url. Mirrors the teacher's split-sink/split-stream pump pair, each
/// driven by its own spawned task. `connect` may be called again after a
/// prior socket closed (reconnection): each call replaces both the
/// outbound and inbound channels so a fresh pump pair takes over and
/// `next_message` reliably yields `None` once the old socket is gone,
/// rather than hanging on a channel kept alive by a stray sender clone.
pub struct TungsteniteTransport {
  url: String,
  outbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
  inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl TungsteniteTransport {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      outbound_tx: Mutex::new(None),
      inbound_rx: Mutex::new(None),
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}

#[async_trait]
impl RelayTransport for TungsteniteTransport {
  async fn connect(&self) -> crate::Result<()> {
    debug!("connecting to {}", self.url);
    let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.url)
      .await
      .map_err(|e| Error::Transport(TransportError::SocketClosed(e.to_string())))?;
    info!("connected to {}", self.url);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    *self.outbound_tx.lock().await = Some(outbound_tx);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    *self.inbound_rx.lock().await = Some(inbound_rx);

    let write_url = self.url.clone();
    tokio::spawn(async move {
      while let Some(frame) = outbound_rx.recv().await {
        if let Err(err) = ws_tx.send(WsMessage::Text(frame)).await {
          error!("write failed on {write_url}: {err}");
          break;
        }
      }
      debug!("write pump exiting for {write_url}");
    });

    let read_url = self.url.clone();
    tokio::spawn(async move {
      while let Some(frame) = ws_rx.next().await {
        match frame {
          Ok(WsMessage::Text(text)) => {
            if inbound_tx.send(text).is_err() {
              break;
            }
          }
          Ok(WsMessage::Close(_)) => {
            debug!("relay {read_url} closed the socket");
            break;
          }
          Ok(_) => continue,
          Err(err) => {
            error!("read failed on {read_url}: {err}");
            break;
          }
        }
      }
      debug!("read pump exiting for {read_url}");
    });

    Ok(())
  }

  async fn disconnect(&self) {
    // Dropping the outbound sender ends the write pump; the read pump
    // exits on its own once the relay notices the half-close.
    *self.outbound_tx.lock().await = None;
  }

  async fn send(&self, frame: String) -> crate::Result<()> {
    let guard = self.outbound_tx.lock().await;
    let sender = guard
      .as_ref()
      .ok_or_else(|| Error::Transport(TransportError::SocketClosed(self.url.clone())))?;
    sender
      .send(frame)
      .map_err(|_| Error::Transport(TransportError::SocketClosed(self.url.clone())))
  }

  async fn next_message(&self) -> Option<String> {
    match self.inbound_rx.lock().await.as_mut() {
      Some(rx) => rx.recv().await,
      None => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn construction_captures_the_relay_url() {
    let transport = TungsteniteTransport::new("wss://relay.example.com");
    assert_eq!(transport.url(), "wss://relay.example.com");
  }

  #[tokio::test]
  async fn send_before_connect_reports_socket_closed() {
    let transport = TungsteniteTransport::new("wss://relay.example.com");
    let err = transport.send("[\"CLOSE\",\"x\"]".to_string()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::SocketClosed(_))));
  }
}
