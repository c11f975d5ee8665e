//! Hub configuration with defaults and `HUB_*` environment overrides.

use anyhow::{bail, Context};
use dotenv::dotenv;
use std::{str::FromStr, time::Duration};

/// What to do with a connection after a recoverable protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
  /// Send the error, then end the connection.
  Close,
  /// Send the error and keep reading.
  Continue,
}

impl FromStr for ErrorPolicy {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "close" => Ok(ErrorPolicy::Close),
      "continue" => Ok(ErrorPolicy::Continue),
      other => bail!("unknown error policy '{}', expected 'close' or 'continue'", other),
    }
  }
}

/// Backend carrying relay envelopes between instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayBackendConfig {
  /// Hubs in the same process sharing one in-memory relay.
  Memory { buffer: usize },
  /// Redis pub/sub at `url`. Needs the `redis-backend` feature.
  Redis { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
  /// Channel every instance of one logical hub publishes to.
  pub channel: String,
  pub backend: RelayBackendConfig,
  /// Upper bound on a single publish before it is logged and abandoned.
  pub publish_timeout: Duration,
  /// How many recent envelope ids are remembered to drop duplicates.
  pub dedup_window: usize,
}

impl Default for RelaySettings {
  fn default() -> Self {
    Self {
      channel: "relayhub".to_string(),
      backend: RelayBackendConfig::Memory { buffer: 1024 },
      publish_timeout: Duration::from_millis(2_000),
      dedup_window: 4096,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifetimeConfig {
  Local,
  Distributed(RelaySettings),
}

/// Settings for a [`Hub`](crate::hub::Hub).
#[derive(Debug, Clone)]
pub struct HubConfig {
  /// Capacity of each connection's outbound queue
  pub outbound_capacity: usize,
  /// Largest message the codec will buffer, in bytes
  pub max_message_size: usize,
  /// Bytes requested per transport read
  pub read_buffer_size: usize,
  /// Upper bound on one hub method invocation
  pub handler_timeout: Duration,
  /// How long to wait for queued messages to flush on disconnect
  pub close_timeout: Duration,
  pub frame_error_policy: ErrorPolicy,
  pub invalid_invocation_policy: ErrorPolicy,
  pub lifetime: LifetimeConfig,
}

impl Default for HubConfig {
  fn default() -> Self {
    Self {
      outbound_capacity: 256,
      max_message_size: crate::codec::DEFAULT_MAX_MESSAGE_SIZE,
      read_buffer_size: 4 * 1024,
      handler_timeout: Duration::from_secs(60),
      close_timeout: Duration::from_secs(5),
      frame_error_policy: ErrorPolicy::Close,
      invalid_invocation_policy: ErrorPolicy::Continue,
      lifetime: LifetimeConfig::Local,
    }
  }
}

impl HubConfig {
  /// Load from the process environment (and a `.env` file, if present).
  pub fn from_env() -> anyhow::Result<Self> {
    dotenv().ok();
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Build a config from `lookup`, starting from the defaults.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
    let mut config = Self::default();

    if let Some(v) = lookup("HUB_OUTBOUND_CAPACITY") {
      config.outbound_capacity = parse(&v, "HUB_OUTBOUND_CAPACITY")?;
    }
    if let Some(v) = lookup("HUB_MAX_MESSAGE_SIZE") {
      config.max_message_size = parse(&v, "HUB_MAX_MESSAGE_SIZE")?;
    }
    if let Some(v) = lookup("HUB_HANDLER_TIMEOUT_SECS") {
      config.handler_timeout = Duration::from_secs(parse(&v, "HUB_HANDLER_TIMEOUT_SECS")?);
    }
    if let Some(v) = lookup("HUB_CLOSE_TIMEOUT_SECS") {
      config.close_timeout = Duration::from_secs(parse(&v, "HUB_CLOSE_TIMEOUT_SECS")?);
    }
    if let Some(v) = lookup("HUB_FRAME_ERROR_POLICY") {
      config.frame_error_policy = parse(&v, "HUB_FRAME_ERROR_POLICY")?;
    }
    if let Some(v) = lookup("HUB_INVALID_INVOCATION_POLICY") {
      config.invalid_invocation_policy = parse(&v, "HUB_INVALID_INVOCATION_POLICY")?;
    }

    let lifetime = lookup("HUB_LIFETIME").unwrap_or_else(|| String::from("local"));
    config.lifetime = match lifetime.trim().to_ascii_lowercase().as_str() {
      "local" => LifetimeConfig::Local,
      "distributed" => LifetimeConfig::Distributed(relay_settings(&lookup)?),
      other => bail!("HUB_LIFETIME must be 'local' or 'distributed', got '{}'", other),
    };

    Ok(config)
  }
}

fn relay_settings(lookup: &impl Fn(&str) -> Option<String>) -> anyhow::Result<RelaySettings> {
  let mut settings = RelaySettings::default();

  if let Some(channel) = lookup("HUB_RELAY_CHANNEL") {
    settings.channel = channel;
  }
  if let Some(v) = lookup("HUB_RELAY_PUBLISH_TIMEOUT_MS") {
    settings.publish_timeout = Duration::from_millis(parse(&v, "HUB_RELAY_PUBLISH_TIMEOUT_MS")?);
  }

  let relay = lookup("HUB_RELAY").unwrap_or_else(|| String::from("memory"));
  settings.backend = match relay.trim().to_ascii_lowercase().as_str() {
    "memory" => settings.backend,
    "redis" => RelayBackendConfig::Redis {
      url: lookup("HUB_RELAY_URL").context("HUB_RELAY=redis requires HUB_RELAY_URL")?,
    },
    other => bail!("HUB_RELAY must be 'memory' or 'redis', got '{}'", other),
  };

  Ok(settings)
}

fn parse<T>(value: &str, key: &str) -> anyhow::Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  value
    .trim()
    .parse::<T>()
    .map_err(|e| anyhow::anyhow!("{}", e))
    .with_context(|| format!("invalid value '{}' for {}", value, key))
}
