//! In-process relay over Tokio broadcast channels.

use super::{RelayBackend, RelayStream};
use crate::error::RelayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tokio_stream::{
  wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
  StreamExt,
};

/// Relay using one Tokio `broadcast` channel per channel name.
///
/// Clones share the same channels. Each channel has a fixed-size ring
/// buffer; a subscriber that falls behind skips the overwritten payloads.
#[derive(Clone)]
pub struct InMemoryRelay {
  channels: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
  buffer: usize,
}

impl InMemoryRelay {
  /// Create a relay with a default per-channel buffer of 1024 payloads.
  pub fn new() -> Self {
    Self::with_buffer(1024)
  }

  /// Create with a custom per-channel buffer. Minimum size is 1.
  pub fn with_buffer(buffer: usize) -> Self {
    Self {
      channels: Arc::new(Mutex::new(HashMap::new())),
      buffer: buffer.max(1),
    }
  }

  fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
    self
      .channels
      .lock()
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(self.buffer).0)
      .clone()
  }

  /// Number of live subscribers on `channel`.
  pub fn subscriber_count(&self, channel: &str) -> usize {
    self
      .channels
      .lock()
      .get(channel)
      .map(|tx| tx.receiver_count())
      .unwrap_or(0)
  }
}

impl Default for InMemoryRelay {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl RelayBackend for InMemoryRelay {
  async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError> {
    // No subscribers is not a failure: nobody else is listening yet.
    let _ = self.sender(channel).send(payload);
    Ok(())
  }

  async fn subscribe(&self, channel: &str) -> Result<RelayStream, RelayError> {
    let rx = self.sender(channel).subscribe();
    let channel = channel.to_string();

    let stream = BroadcastStream::new(rx).filter_map(move |res| match res {
      Ok(payload) => Some(payload),
      Err(BroadcastStreamRecvError::Lagged(skipped)) => {
        tracing::warn!("Relay subscriber on '{}' lagged, skipped {} payloads", channel, skipped);
        None
      }
    });
    Ok(Box::pin(stream))
  }
}
