use crate::{
  connection::Connection,
  lifetime::{LifetimeManager, Recipients},
};
use serde_json::Value;
use std::sync::Arc;

/// Context handed to hub methods and lifecycle events for one connection.
#[derive(Clone)]
pub struct HubContext {
  connection: Arc<Connection>,
  lifetime: Arc<dyn LifetimeManager>,
}

impl HubContext {
  pub fn new(connection: Arc<Connection>, lifetime: Arc<dyn LifetimeManager>) -> Self {
    Self {
      connection,
      lifetime,
    }
  }

  /// The connection this context belongs to.
  pub fn connection(&self) -> &Arc<Connection> {
    &self.connection
  }

  pub fn connection_id(&self) -> &str {
    self.connection.id()
  }

  pub fn user_id(&self) -> Option<String> {
    self.connection.user_id()
  }

  pub fn lifetime(&self) -> &Arc<dyn LifetimeManager> {
    &self.lifetime
  }

  /// Clients behind the calling connection.
  pub fn caller(&self) -> ClientProxy {
    self.client(self.connection.id())
  }

  /// Every connected client, across instances when distributed.
  pub fn all(&self) -> ClientProxy {
    self.proxy(Recipients::All)
  }

  pub fn client(&self, connection_id: &str) -> ClientProxy {
    self.proxy(Recipients::Connection(connection_id.to_string()))
  }

  pub fn group(&self, name: &str) -> ClientProxy {
    self.proxy(Recipients::Group(name.to_string()))
  }

  /// Every connection authenticated as `user_id`.
  pub fn user(&self, user_id: &str) -> ClientProxy {
    self.proxy(Recipients::User(user_id.to_string()))
  }

  /// Add the calling connection to `group`.
  pub async fn add_to_group(&self, group: &str) {
    self.lifetime.add_group(self.connection.id(), group).await;
  }

  /// Remove the calling connection from `group`.
  pub async fn remove_from_group(&self, group: &str) {
    self.lifetime.remove_group(self.connection.id(), group).await;
  }

  /// End the calling connection. Pending reads are cancelled; queued
  /// messages are still flushed.
  pub fn abort(&self) {
    self.connection.dispose();
  }

  fn proxy(&self, recipients: Recipients) -> ClientProxy {
    ClientProxy {
      recipients,
      lifetime: self.lifetime.clone(),
    }
  }
}

/// A set of clients that can be invoked as one.
#[derive(Clone)]
pub struct ClientProxy {
  recipients: Recipients,
  lifetime: Arc<dyn LifetimeManager>,
}

impl ClientProxy {
  pub fn recipients(&self) -> &Recipients {
    &self.recipients
  }

  /// Invoke `target` on every client in this set. Missing clients are skipped.
  pub async fn invoke(&self, target: &str, arguments: Vec<Value>) {
    self
      .lifetime
      .invoke(&self.recipients, target, &arguments)
      .await;
  }
}
