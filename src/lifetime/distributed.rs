//! Lifetime manager spanning several hub instances through a relay channel.

use super::{local::LocalLifetimeManager, LifetimeManager, Recipients};
use crate::{
  config::RelaySettings,
  connection::Connection,
  error::RelayError,
  invocation::{AdapterRegistry, InvocationDescriptor},
  relay::{RelayBackend, RelayExt, RelayStream, Subscription},
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
  collections::{HashSet, VecDeque},
  sync::Arc,
  time::Duration,
};
use tokio::sync::oneshot;

/// Operation relayed to sibling instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayCommand {
  Invoke {
    recipients: Recipients,
    invocation: InvocationDescriptor,
  },
  AddGroup {
    connection_id: String,
    group: String,
  },
  RemoveGroup {
    connection_id: String,
    group: String,
  },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayEnvelope {
  id: String,
  origin: String,
  command: RelayCommand,
}

/// Bounded memory of recently applied envelope ids.
struct RecentIds {
  order: VecDeque<String>,
  seen: HashSet<String>,
  capacity: usize,
}

impl RecentIds {
  fn new(capacity: usize) -> Self {
    Self {
      order: VecDeque::with_capacity(capacity),
      seen: HashSet::with_capacity(capacity),
      capacity: capacity.max(1),
    }
  }

  /// Returns `false` if `id` was already recorded.
  fn insert(&mut self, id: &str) -> bool {
    if self.seen.contains(id) {
      return false;
    }
    if self.order.len() >= self.capacity {
      if let Some(oldest) = self.order.pop_front() {
        self.seen.remove(&oldest);
      }
    }
    self.order.push_back(id.to_string());
    self.seen.insert(id.to_string());
    true
  }
}

/// Delivers locally, then publishes the same operation so sibling instances
/// deliver to the connections they own.
///
/// Envelopes received from the relay are only ever applied locally, never
/// republished. Envelopes this instance published itself are skipped (they
/// were delivered locally before publishing), and envelope ids seen within
/// the dedup window are dropped, so at-least-once relays do not cause double
/// delivery.
pub struct DistributedLifetimeManager {
  local: Arc<LocalLifetimeManager>,
  relay: Arc<dyn RelayBackend>,
  channel: String,
  instance_id: String,
  publish_timeout: Duration,
  subscription: Mutex<Option<Subscription>>,
}

impl DistributedLifetimeManager {
  /// Subscribe to the relay channel and start applying relayed operations.
  pub async fn new(
    relay: Arc<dyn RelayBackend>,
    settings: &RelaySettings,
    adapters: AdapterRegistry,
  ) -> Result<Self, RelayError> {
    let local = Arc::new(LocalLifetimeManager::new(adapters));
    let instance_id = uuid::Uuid::new_v4().to_string();
    let stream = relay.subscribe(&settings.channel).await?;

    let subscription = spawn_receiver(
      stream,
      local.clone(),
      instance_id.clone(),
      settings.dedup_window,
    );
    tracing::info!(
      "Hub instance {} relaying on channel '{}'",
      instance_id,
      settings.channel
    );

    Ok(Self {
      local,
      relay,
      channel: settings.channel.clone(),
      instance_id,
      publish_timeout: settings.publish_timeout,
      subscription: Mutex::new(Some(subscription)),
    })
  }

  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// The local half, holding this instance's connections and groups.
  pub fn local(&self) -> &LocalLifetimeManager {
    &self.local
  }

  pub fn is_subscribed(&self) -> bool {
    self
      .subscription
      .lock()
      .as_ref()
      .map(Subscription::is_active)
      .unwrap_or(false)
  }

  async fn publish(&self, command: RelayCommand) {
    let envelope = RelayEnvelope {
      id: uuid::Uuid::new_v4().to_string(),
      origin: self.instance_id.clone(),
      command,
    };

    let res = match tokio::time::timeout(
      self.publish_timeout,
      self.relay.publish_json(&self.channel, &envelope),
    )
    .await
    {
      Ok(res) => res,
      Err(_) => Err(RelayError::Timeout(self.publish_timeout)),
    };

    if let Err(e) = res {
      tracing::warn!("Relay publish on '{}' failed: {}", self.channel, e);
    }
  }

  async fn invoke_everywhere(&self, recipients: Recipients, target: &str, arguments: &[Value]) {
    let invocation = InvocationDescriptor::new(target, arguments.to_vec());
    self.local.deliver(&recipients, &invocation).await;
    self
      .publish(RelayCommand::Invoke {
        recipients,
        invocation,
      })
      .await;
  }
}

fn spawn_receiver(
  mut stream: RelayStream,
  local: Arc<LocalLifetimeManager>,
  instance_id: String,
  dedup_window: usize,
) -> Subscription {
  let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

  let handle = tokio::spawn(async move {
    let mut recent = RecentIds::new(dedup_window);
    loop {
      tokio::select! {
        payload = stream.next() => {
          match payload {
            Some(payload) => apply(&local, &instance_id, &mut recent, &payload).await,
            None => {
              tracing::warn!("Relay stream for hub instance {} ended", instance_id);
              break;
            }
          }
        }
        _ = &mut stop_rx => {
          break;
        }
      }
    }
  });

  Subscription::new(handle, stop_tx)
}

async fn apply(
  local: &LocalLifetimeManager,
  instance_id: &str,
  recent: &mut RecentIds,
  payload: &[u8],
) {
  let envelope: RelayEnvelope = match serde_json::from_slice(payload) {
    Ok(envelope) => envelope,
    Err(e) => {
      tracing::warn!("Discarding malformed relay envelope: {}", e);
      return;
    }
  };

  if envelope.origin == instance_id || !recent.insert(&envelope.id) {
    return;
  }

  match envelope.command {
    RelayCommand::Invoke {
      recipients,
      invocation,
    } => {
      let delivered = local.deliver(&recipients, &invocation).await;
      tracing::trace!(
        "Relayed '{}' from {} to {} local connections",
        invocation.target,
        envelope.origin,
        delivered
      );
    }
    RelayCommand::AddGroup {
      connection_id,
      group,
    } => {
      local.add_local_group(&connection_id, &group).await;
    }
    RelayCommand::RemoveGroup {
      connection_id,
      group,
    } => {
      local.remove_local_group(&connection_id, &group).await;
    }
  }
}

#[async_trait]
impl LifetimeManager for DistributedLifetimeManager {
  async fn on_connected(&self, connection: Arc<Connection>) {
    self.local.on_connected(connection).await;
  }

  async fn on_disconnected(&self, connection: Arc<Connection>) {
    self.local.on_disconnected(connection).await;
  }

  async fn add_group(&self, connection_id: &str, group: &str) {
    if !self.local.add_local_group(connection_id, group).await {
      self
        .publish(RelayCommand::AddGroup {
          connection_id: connection_id.to_string(),
          group: group.to_string(),
        })
        .await;
    }
  }

  async fn remove_group(&self, connection_id: &str, group: &str) {
    if self.local.connections().contains(connection_id).await {
      self.local.remove_local_group(connection_id, group).await;
    } else {
      self
        .publish(RelayCommand::RemoveGroup {
          connection_id: connection_id.to_string(),
          group: group.to_string(),
        })
        .await;
    }
  }

  async fn invoke_all(&self, target: &str, arguments: &[Value]) {
    self
      .invoke_everywhere(Recipients::All, target, arguments)
      .await;
  }

  async fn invoke_connection(&self, connection_id: &str, target: &str, arguments: &[Value]) {
    let recipients = Recipients::Connection(connection_id.to_string());
    if self.local.connections().contains(connection_id).await {
      let invocation = InvocationDescriptor::new(target, arguments.to_vec());
      self.local.deliver(&recipients, &invocation).await;
    } else {
      self.invoke_everywhere(recipients, target, arguments).await;
    }
  }

  async fn invoke_group(&self, group: &str, target: &str, arguments: &[Value]) {
    self
      .invoke_everywhere(Recipients::Group(group.to_string()), target, arguments)
      .await;
  }

  async fn invoke_user(&self, user_id: &str, target: &str, arguments: &[Value]) {
    self
      .invoke_everywhere(Recipients::User(user_id.to_string()), target, arguments)
      .await;
  }

  async fn shutdown(&self) {
    let subscription = self.subscription.lock().take();
    if let Some(subscription) = subscription {
      subscription.stop().await;
    }
  }
}

impl Drop for DistributedLifetimeManager {
  fn drop(&mut self) {
    if let Some(subscription) = self.subscription.get_mut().take() {
      subscription.abort();
    }
  }
}
