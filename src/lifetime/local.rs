//! Single-instance lifetime manager.

use super::{LifetimeManager, Recipients};
use crate::{
  codec::Message,
  connection::{Connection, ConnectionRegistry},
  group::GroupTable,
  invocation::{AdapterRegistry, InvocationDescriptor},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Fans invocations out to the connections registered on this instance.
///
/// Each target gets the message through its own bounded outbound queue
/// with a non-blocking send, so one slow client never holds up a broadcast.
#[derive(Clone)]
pub struct LocalLifetimeManager {
  connections: ConnectionRegistry,
  groups: GroupTable,
  adapters: AdapterRegistry,
}

impl LocalLifetimeManager {
  pub fn new(adapters: AdapterRegistry) -> Self {
    Self {
      connections: ConnectionRegistry::new(),
      groups: GroupTable::new(),
      adapters,
    }
  }

  pub fn connections(&self) -> &ConnectionRegistry {
    &self.connections
  }

  pub fn groups(&self) -> &GroupTable {
    &self.groups
  }

  /// Deliver `invocation` to the local connections matching `recipients`.
  ///
  /// Returns how many connections accepted the message.
  pub async fn deliver(&self, recipients: &Recipients, invocation: &InvocationDescriptor) -> usize {
    let targets = match recipients {
      Recipients::All => self.connections.all().await,
      Recipients::Connection(id) => self.connections.get(id).await.into_iter().collect(),
      Recipients::Group(group) => {
        let mut targets = Vec::new();
        for id in self.groups.members_of(group).await {
          // Members that have since disconnected no longer resolve.
          if let Some(connection) = self.connections.get(&id).await {
            targets.push(connection);
          }
        }
        targets
      }
      Recipients::User(user_id) => self.connections.for_user(user_id).await,
    };

    self.fan_out(targets, invocation)
  }

  fn fan_out(&self, targets: Vec<Arc<Connection>>, invocation: &InvocationDescriptor) -> usize {
    let mut encoded: HashMap<String, Message> = HashMap::new();
    let mut delivered = 0;

    for connection in targets {
      let adapter = self.adapters.for_connection(&connection);
      let message = match encoded.get(adapter.name()) {
        Some(message) => message.clone(),
        None => match adapter.encode_invocation(invocation) {
          Ok(message) => {
            encoded.insert(adapter.name().to_string(), message.clone());
            message
          }
          Err(e) => {
            tracing::warn!(
              "Failed to encode '{}' for {} connections: {}",
              invocation.target,
              adapter.name(),
              e
            );
            continue;
          }
        },
      };

      if connection.send(message) {
        delivered += 1;
      } else {
        tracing::debug!(
          "Dropped '{}' for connection {} (outbound queue full or closed)",
          invocation.target,
          connection.id()
        );
      }
    }
    delivered
  }

  /// Add a local connection to a group. Unknown connections are ignored.
  pub async fn add_local_group(&self, connection_id: &str, group: &str) -> bool {
    let Some(connection) = self.connections.get(connection_id).await else {
      return false;
    };
    self.groups.add_to_group(group, connection_id).await;

    // A disconnect between the lookup and the insert has already swept the
    // groups, so the membership just added would outlive the connection.
    if !self.connections.holds(&connection).await {
      self.groups.remove_from_group(group, connection_id).await;
      return false;
    }
    true
  }

  pub async fn remove_local_group(&self, connection_id: &str, group: &str) -> bool {
    self.groups.remove_from_group(group, connection_id).await
  }
}

impl Default for LocalLifetimeManager {
  fn default() -> Self {
    Self::new(AdapterRegistry::new())
  }
}

#[async_trait]
impl LifetimeManager for LocalLifetimeManager {
  async fn on_connected(&self, connection: Arc<Connection>) {
    let id = self.connections.add(connection).await;
    tracing::debug!("Registered connection {}", id);
  }

  async fn on_disconnected(&self, connection: Arc<Connection>) {
    if self.connections.remove_connection(&connection).await {
      let left = self.groups.remove_from_all(connection.id()).await;
      tracing::debug!(
        "Unregistered connection {} (left {} groups)",
        connection.id(),
        left.len()
      );
    }
  }

  async fn add_group(&self, connection_id: &str, group: &str) {
    self.add_local_group(connection_id, group).await;
  }

  async fn remove_group(&self, connection_id: &str, group: &str) {
    self.remove_local_group(connection_id, group).await;
  }

  async fn invoke_all(&self, target: &str, arguments: &[Value]) {
    let invocation = InvocationDescriptor::new(target, arguments.to_vec());
    self.deliver(&Recipients::All, &invocation).await;
  }

  async fn invoke_connection(&self, connection_id: &str, target: &str, arguments: &[Value]) {
    let invocation = InvocationDescriptor::new(target, arguments.to_vec());
    self
      .deliver(&Recipients::Connection(connection_id.to_string()), &invocation)
      .await;
  }

  async fn invoke_group(&self, group: &str, target: &str, arguments: &[Value]) {
    let invocation = InvocationDescriptor::new(target, arguments.to_vec());
    self
      .deliver(&Recipients::Group(group.to_string()), &invocation)
      .await;
  }

  async fn invoke_user(&self, user_id: &str, target: &str, arguments: &[Value]) {
    let invocation = InvocationDescriptor::new(target, arguments.to_vec());
    self
      .deliver(&Recipients::User(user_id.to_string()), &invocation)
      .await;
  }
}
