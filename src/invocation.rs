//! Invocation envelopes and the adapters that turn them into message payloads.
//!
//! A decoded payload always resolves to `{ target, arguments }`. How those
//! are serialized is up to an [`InvocationAdapter`]; the connection's
//! [`FORMAT_KEY`](crate::connection::FORMAT_KEY) metadata picks the adapter,
//! falling back to JSON.

use crate::{
  codec::{Message, MessageKind},
  connection::{Connection, FORMAT_KEY},
  error::HubError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// A call to a named method or client-side handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
  /// Correlation id; when present the caller expects an [`InvocationResult`].
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub target: String,
  #[serde(default)]
  pub arguments: Vec<Value>,
}

impl InvocationDescriptor {
  pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
    Self {
      id: None,
      target: target.into(),
      arguments,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }
}

/// Successful completion of an invocation that carried an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
  pub id: String,
  pub result: Value,
}

/// Serialization format for invocation envelopes.
pub trait InvocationAdapter: Send + Sync {
  /// Name matched against the connection's `format` metadata.
  fn name(&self) -> &str;

  fn decode_invocation(&self, message: &Message) -> Result<InvocationDescriptor, HubError>;

  fn encode_invocation(&self, invocation: &InvocationDescriptor) -> Result<Message, HubError>;

  fn encode_result(&self, result: &InvocationResult) -> Result<Message, HubError>;
}

/// JSON envelopes carried in Text messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAdapter;

impl InvocationAdapter for JsonAdapter {
  fn name(&self) -> &str {
    "json"
  }

  fn decode_invocation(&self, message: &Message) -> Result<InvocationDescriptor, HubError> {
    match message.kind() {
      MessageKind::Text | MessageKind::Binary => serde_json::from_slice(message.payload())
        .map_err(|e| HubError::InvalidInvocation(e.to_string())),
      other => Err(HubError::InvalidInvocation(format!(
        "{other:?} messages do not carry invocations"
      ))),
    }
  }

  fn encode_invocation(&self, invocation: &InvocationDescriptor) -> Result<Message, HubError> {
    let json =
      serde_json::to_string(invocation).map_err(|e| HubError::InvalidInvocation(e.to_string()))?;
    Ok(Message::text(json))
  }

  fn encode_result(&self, result: &InvocationResult) -> Result<Message, HubError> {
    let json =
      serde_json::to_string(result).map_err(|e| HubError::InvalidInvocation(e.to_string()))?;
    Ok(Message::text(json))
  }
}

/// Adapters by name, with a default used when a connection names none or an unknown one.
#[derive(Clone)]
pub struct AdapterRegistry {
  adapters: HashMap<String, Arc<dyn InvocationAdapter>>,
  default: Arc<dyn InvocationAdapter>,
}

impl AdapterRegistry {
  /// Registry containing only the JSON adapter.
  pub fn new() -> Self {
    let json: Arc<dyn InvocationAdapter> = Arc::new(JsonAdapter);
    let mut adapters = HashMap::new();
    adapters.insert(json.name().to_string(), json.clone());
    Self {
      adapters,
      default: json,
    }
  }

  pub fn with_adapter(mut self, adapter: impl InvocationAdapter + 'static) -> Self {
    self
      .adapters
      .insert(adapter.name().to_string(), Arc::new(adapter));
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn InvocationAdapter>> {
    self.adapters.get(name).cloned()
  }

  /// Adapter for `connection`, chosen by its `format` metadata.
  pub fn for_connection(&self, connection: &Connection) -> Arc<dyn InvocationAdapter> {
    connection
      .metadata(FORMAT_KEY)
      .and_then(|name| self.get(&name))
      .unwrap_or_else(|| self.default.clone())
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.adapters.keys().cloned().collect();
    names.sort();
    names
  }
}

impl Default for AdapterRegistry {
  fn default() -> Self {
    Self::new()
  }
}
