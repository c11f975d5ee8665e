//! Redis relay with automatic reconnection.

use super::{RelayBackend, RelayStream};
use crate::error::RelayError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::{
  aio::{MultiplexedConnection, PubSub},
  Client,
};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio_stream::wrappers::ReceiverStream;

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 5_000;
const MAX_EXPONENT: u32 = 6;
const JITTER_RANGE: u64 = 50;
const STREAM_BUFFER: usize = 1024;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_exponent: u32,
  pub jitter_range: u64,
  pub max_retries: u32,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: BASE_DELAY_MS,
      max_delay_ms: MAX_DELAY_MS,
      max_exponent: MAX_EXPONENT,
      jitter_range: JITTER_RANGE,
      max_retries: 10,
    }
  }
}

impl BackoffConfig {
  fn delay(&self, attempt: u32) -> std::time::Duration {
    let exp = attempt.min(self.max_exponent);
    let base_ms = self.base_delay_ms.saturating_mul(2u64.saturating_pow(exp));
    let jitter_ms = (attempt as u64 % self.jitter_range.max(1)) + 1;
    std::time::Duration::from_millis((base_ms + jitter_ms).min(self.max_delay_ms))
  }
}

/// Redis-backed relay for hubs running in separate processes or machines.
///
/// Publishes over one lazily opened multiplexed connection shared by clones,
/// and receives over a dedicated `SUBSCRIBE` connection that is re-established
/// with exponential backoff when it drops.
#[derive(Clone)]
pub struct RedisRelay {
  client: Client,
  publisher: Arc<OnceCell<MultiplexedConnection>>,
  backoff_config: BackoffConfig,
}

impl RedisRelay {
  /// Example: `RedisRelay::new("redis://127.0.0.1/")?`
  pub fn new(addr: &str) -> Result<Self, RelayError> {
    Self::with_config(addr, BackoffConfig::default())
  }

  pub fn with_config(addr: &str, config: BackoffConfig) -> Result<Self, RelayError> {
    Ok(Self {
      client: Client::open(addr)?,
      publisher: Arc::new(OnceCell::new()),
      backoff_config: config,
    })
  }

  /// The shared publish connection, opened on first use.
  async fn publisher(&self) -> Result<MultiplexedConnection, RelayError> {
    let conn = self
      .publisher
      .get_or_try_init(|| self.client.get_multiplexed_async_connection())
      .await?;
    Ok(conn.clone())
  }

  async fn connect(client: &Client, channel: &str) -> Result<PubSub, RelayError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
  }
}

#[async_trait]
impl RelayBackend for RedisRelay {
  async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError> {
    let mut conn = self.publisher().await?;
    redis::AsyncCommands::publish::<&str, Vec<u8>, ()>(&mut conn, channel, payload).await?;
    Ok(())
  }

  async fn subscribe(&self, channel: &str) -> Result<RelayStream, RelayError> {
    // Fail fast if Redis is unreachable; later drops are retried in the background.
    let first = Self::connect(&self.client, channel).await?;
    tracing::info!("Subscribed to Redis relay channel '{}'", channel);

    let client = self.client.clone();
    let channel = channel.to_string();
    let cfg = self.backoff_config.clone();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
      let mut current = Some(first);
      let mut attempt: u32 = 0;

      loop {
        let pubsub = match current.take() {
          Some(pubsub) => pubsub,
          None => match Self::connect(&client, &channel).await {
            Ok(pubsub) => {
              attempt = 0;
              tracing::info!("Resubscribed to Redis relay channel '{}'", channel);
              pubsub
            }
            Err(e) => {
              attempt += 1;
              if attempt >= cfg.max_retries {
                tracing::error!(
                  "Redis relay: exceeded max retries ({}) for channel '{}', giving up.",
                  cfg.max_retries,
                  channel
                );
                return;
              }
              tracing::error!("Redis relay connection error: {e}. Retrying…");
              tokio::time::sleep(cfg.delay(attempt)).await;
              continue;
            }
          },
        };

        let mut stream = pubsub.into_on_message();
        while let Some(msg) = stream.next().await {
          match msg.get_payload::<Vec<u8>>() {
            Ok(payload) => {
              if tx.send(payload).await.is_err() {
                tracing::debug!("Redis relay stream for '{}' dropped, unsubscribing", channel);
                return;
              }
            }
            Err(e) => tracing::error!("Redis payload decode error on '{}': {e}", channel),
          }
        }

        if tx.is_closed() {
          return;
        }
        tracing::warn!("Redis relay stream ended for '{}', will reconnect…", channel);
        attempt += 1;
        tokio::time::sleep(cfg.delay(attempt)).await;
      }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
  }
}
