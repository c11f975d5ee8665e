//! Lifetime managers: who is connected, and how to reach them.
//!
//! [`LifetimeManager`] is the broadcast-dispatch capability the hub talks
//! to. [`LocalLifetimeManager`] resolves targets against this instance's
//! [`ConnectionRegistry`](crate::connection::ConnectionRegistry) and
//! [`GroupTable`](crate::group::GroupTable). [`DistributedLifetimeManager`]
//! does the same and additionally relays each operation over a
//! [`RelayBackend`] so sibling instances reach the connections they own.
//!
//! Invoking a target that does not exist is never an error: absent
//! connections, empty groups and unknown users are silently skipped, and a
//! failing relay is logged without failing the call.

use crate::{
  config::{LifetimeConfig, RelayBackendConfig},
  connection::Connection,
  error::RelayError,
  invocation::AdapterRegistry,
  relay::{InMemoryRelay, RelayBackend},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

mod distributed;
mod local;

pub use distributed::DistributedLifetimeManager;
pub use local::LocalLifetimeManager;

/// Who an invocation is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipients {
  All,
  Connection(String),
  Group(String),
  User(String),
}

#[async_trait]
pub trait LifetimeManager: Send + Sync {
  /// Register a connection that just became connected.
  async fn on_connected(&self, connection: Arc<Connection>);

  /// Forget a connection and drop it from every group.
  async fn on_disconnected(&self, connection: Arc<Connection>);

  async fn add_group(&self, connection_id: &str, group: &str);

  async fn remove_group(&self, connection_id: &str, group: &str);

  async fn invoke_all(&self, target: &str, arguments: &[Value]);

  async fn invoke_connection(&self, connection_id: &str, target: &str, arguments: &[Value]);

  async fn invoke_group(&self, group: &str, target: &str, arguments: &[Value]);

  async fn invoke_user(&self, user_id: &str, target: &str, arguments: &[Value]);

  /// Route to the matching `invoke_*` operation.
  async fn invoke(&self, recipients: &Recipients, target: &str, arguments: &[Value]) {
    match recipients {
      Recipients::All => self.invoke_all(target, arguments).await,
      Recipients::Connection(id) => self.invoke_connection(id, target, arguments).await,
      Recipients::Group(group) => self.invoke_group(group, target, arguments).await,
      Recipients::User(user_id) => self.invoke_user(user_id, target, arguments).await,
    }
  }

  /// Release background resources (relay subscriptions).
  async fn shutdown(&self) {}
}

/// Construct the lifetime manager named by `config`.
pub async fn build(
  config: &LifetimeConfig,
  adapters: AdapterRegistry,
) -> Result<Arc<dyn LifetimeManager>, RelayError> {
  match config {
    LifetimeConfig::Local => Ok(Arc::new(LocalLifetimeManager::new(adapters))),
    LifetimeConfig::Distributed(settings) => {
      let relay: Arc<dyn RelayBackend> = match &settings.backend {
        RelayBackendConfig::Memory { buffer } => Arc::new(InMemoryRelay::with_buffer(*buffer)),
        #[cfg(feature = "redis-backend")]
        RelayBackendConfig::Redis { url } => Arc::new(crate::relay::RedisRelay::new(url)?),
        #[cfg(not(feature = "redis-backend"))]
        RelayBackendConfig::Redis { .. } => {
          return Err(RelayError::Unavailable(
            "the redis relay requires the `redis-backend` feature".to_string(),
          ))
        }
      };
      let manager = DistributedLifetimeManager::new(relay, settings, adapters).await?;
      Ok(Arc::new(manager))
    }
  }
}
