#[cfg(feature = "redis-backend")]
use redis::RedisError;
use std::time::Duration;
use thiserror::Error;

/// Malformed frame on the wire.
#[derive(Debug, Error)]
pub enum FrameError {
  #[error("there was an error parsing the message type")]
  InvalidTypeLine,

  #[error("unknown message type: '{0}'")]
  UnknownMessageType(char),

  #[error("expected the message prefix 'data: '")]
  MissingDataPrefix,

  #[error("unexpected '\\n' in message; line endings must be '\\r\\n'")]
  BareLineFeed,

  #[error("unexpected data after line ending")]
  UnexpectedDataAfterLineEnding,

  #[error("invalid base64 in binary payload: {0}")]
  InvalidBinaryPayload(#[from] base64::DecodeError),

  #[error("message exceeds the maximum size of {0} bytes")]
  MessageTooLarge(usize),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Failure talking to the distributed relay channel.
#[derive(Debug, Error)]
pub enum RelayError {
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[cfg(feature = "redis-backend")]
  #[error("Backend error: {0}")]
  Backend(#[from] RedisError),

  #[error("Relay unavailable: {0}")]
  Unavailable(String),

  #[error("Relay publish timed out after {0:?}")]
  Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum HubError {
  #[error(transparent)]
  Frame(#[from] FrameError),

  #[error("Invalid invocation: {0}")]
  InvalidInvocation(String),

  #[error("Unknown hub method '{0}'")]
  UnknownMethod(String),

  #[error("Failed to invoke '{target}': {source}")]
  Handler {
    target: String,
    #[source]
    source: anyhow::Error,
  },

  #[error("Invocation of '{target}' timed out after {timeout:?}")]
  HandlerTimeout { target: String, timeout: Duration },

  #[error(transparent)]
  Relay(#[from] RelayError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}
