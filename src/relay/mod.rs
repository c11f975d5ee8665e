//! Broadcast channel linking hub instances, with in-memory and Redis backends.
//!
//! The distributed lifetime manager only needs two operations from its
//! backend: publish an opaque payload to a channel, and subscribe to a
//! channel as a stream of payloads. [`InMemoryRelay`] shares a Tokio
//! [`broadcast`](tokio::sync::broadcast) channel per channel name between
//! clones, so several hubs in one process form one broadcast domain.
//! [`RedisRelay`] (feature `redis-backend`) uses Redis `PUBLISH`/`SUBSCRIBE`
//! and reconnects with exponential backoff.
//!
//! Backends are assumed to deliver at least once and may reorder across
//! publishers; consumers must tolerate duplicates.
//!
//! ## Example Usage
//! ```no_run
//! use futures::StreamExt;
//! use relayhub::relay::{InMemoryRelay, RelayBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = InMemoryRelay::new();
//!     let mut stream = relay.subscribe("hub").await.unwrap();
//!
//!     relay.publish("hub", b"hello".to_vec()).await.unwrap();
//!     assert_eq!(stream.next().await, Some(b"hello".to_vec()));
//! }
//! ```

use crate::error::RelayError;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use tokio::{sync::oneshot, task::JoinHandle};

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::InMemoryRelay;
#[cfg(feature = "redis-backend")]
pub use redis::{BackoffConfig, RedisRelay};

/// Stream of raw payloads received on a relay channel.
pub type RelayStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Handle to a background task consuming a relay stream.
///
/// `stop()` it gracefully or `abort()` it immediately.
pub struct Subscription {
  handle: JoinHandle<()>,
  stop_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
  pub(crate) fn new(handle: JoinHandle<()>, stop_tx: oneshot::Sender<()>) -> Self {
    Self {
      handle,
      stop_tx: Some(stop_tx),
    }
  }

  /// Request a graceful stop. Waits until the underlying task exits.
  pub async fn stop(mut self) {
    if let Some(tx) = self.stop_tx.take() {
      let _ = tx.send(());
    }
    let _ = self.handle.await;
  }

  /// Abort immediately.
  pub fn abort(self) {
    self.handle.abort();
  }

  pub fn is_active(&self) -> bool {
    !self.handle.is_finished()
  }
}

/// External publish/subscribe channel used to relay invocations between instances.
#[async_trait]
pub trait RelayBackend: Send + Sync {
  /// Publish raw bytes to `channel`.
  ///
  /// ## Returns
  /// - `Ok(())` if the payload was handed to the backend.
  /// - `Err(RelayError)` if the backend is unreachable or rejects it.
  async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError>;

  /// Subscribe to `channel`.
  ///
  /// The returned stream yields every payload published after the
  /// subscription was established, including this instance's own.
  async fn subscribe(&self, channel: &str) -> Result<RelayStream, RelayError>;
}

/// Convenience methods for JSON payloads.
#[async_trait]
pub trait RelayExt: RelayBackend {
  /// Serialize `msg` to JSON and publish it.
  async fn publish_json<T: Serialize + Send + Sync>(
    &self,
    channel: &str,
    msg: &T,
  ) -> Result<(), RelayError> {
    let payload = serde_json::to_vec(msg)?;
    self.publish(channel, payload).await
  }
}

impl<T: RelayBackend + ?Sized> RelayExt for T {}
