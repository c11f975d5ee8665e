//! Live connections and the registry that tracks them.

use crate::codec::Message;
use parking_lot::RwLock as SyncRwLock;
use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
  },
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Metadata key holding the authenticated user identity.
pub const USER_ID_KEY: &str = "user_id";
/// Metadata key naming the invocation adapter (e.g. `json`).
pub const FORMAT_KEY: &str = "format";

/// Receiving half of a connection's outbound queue, drained by the transport writer.
pub type Outbound = mpsc::Receiver<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Connecting,
  Connected,
  Disconnected,
}

impl ConnectionState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => ConnectionState::Connecting,
      1 => ConnectionState::Connected,
      _ => ConnectionState::Disconnected,
    }
  }
}

/// One client connection.
///
/// Messages are pushed with [`send`](Connection::send), which never waits:
/// a full or closed outbound queue drops the message and bumps
/// [`dropped_messages`](Connection::dropped_messages).
pub struct Connection {
  id: String,
  metadata: SyncRwLock<HashMap<String, String>>,
  state: AtomicU8,
  tx: mpsc::Sender<Message>,
  closed: CancellationToken,
  dropped_messages: AtomicU64,
}

impl Connection {
  /// Create a connection with a fresh UUID and a bounded outbound queue.
  pub fn new(metadata: HashMap<String, String>, capacity: usize) -> (Arc<Self>, Outbound) {
    Self::with_id(uuid::Uuid::new_v4().to_string(), metadata, capacity)
  }

  /// Create a connection with a caller-chosen id.
  pub fn with_id(
    id: impl Into<String>,
    metadata: HashMap<String, String>,
    capacity: usize,
  ) -> (Arc<Self>, Outbound) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let connection = Self {
      id: id.into(),
      metadata: SyncRwLock::new(metadata),
      state: AtomicU8::new(ConnectionState::Connecting as u8),
      tx,
      closed: CancellationToken::new(),
      dropped_messages: AtomicU64::new(0),
    };
    (Arc::new(connection), rx)
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn state(&self) -> ConnectionState {
    ConnectionState::from_u8(self.state.load(Ordering::Acquire))
  }

  /// Connecting → Connected. Returns `false` if the connection already left `Connecting`.
  pub fn mark_connected(&self) -> bool {
    self.transition(ConnectionState::Connecting, ConnectionState::Connected)
  }

  /// Connected → Disconnected. Returns `true` for exactly one caller.
  pub fn mark_disconnected(&self) -> bool {
    self.transition(ConnectionState::Connected, ConnectionState::Disconnected)
  }

  /// Connecting → Disconnected, for a connection closed before it was served.
  pub fn abandon(&self) -> bool {
    self.transition(ConnectionState::Connecting, ConnectionState::Disconnected)
  }

  fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
    self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub fn metadata(&self, key: &str) -> Option<String> {
    self.metadata.read().get(key).cloned()
  }

  pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
    self.metadata.write().insert(key.into(), value.into());
  }

  pub fn metadata_snapshot(&self) -> HashMap<String, String> {
    self.metadata.read().clone()
  }

  pub fn user_id(&self) -> Option<String> {
    self.metadata(USER_ID_KEY)
  }

  /// Queue a message for this connection without waiting.
  ///
  /// Returns `false` if the queue is full or the writer has gone away.
  pub fn send(&self, message: Message) -> bool {
    if self.tx.try_send(message).is_ok() {
      true
    } else {
      self.dropped_messages.fetch_add(1, Ordering::Relaxed);
      false
    }
  }

  pub fn dropped_messages(&self) -> u64 {
    self.dropped_messages.load(Ordering::Relaxed)
  }

  /// Tear the connection down: pending reads are cancelled immediately.
  pub fn dispose(&self) {
    self.closed.cancel();
  }

  pub fn is_disposed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Token cancelled when the connection is disposed.
  pub fn closed(&self) -> &CancellationToken {
    &self.closed
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("state", &self.state())
      .field("dropped_messages", &self.dropped_messages())
      .finish()
  }
}

/// Registry of every live connection, keyed by id.
///
/// The map lock is only held to look up or snapshot entries; sending happens
/// after it is released.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
  connections: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a connection and return its id. Replaces a stale entry with the same id.
  pub async fn add(&self, connection: Arc<Connection>) -> String {
    let id = connection.id().to_string();
    self.connections.write().await.insert(id.clone(), connection);
    id
  }

  pub async fn remove(&self, id: &str) -> Option<Arc<Connection>> {
    self.connections.write().await.remove(id)
  }

  /// Remove `connection` only if the registry still holds that same object under its id.
  pub async fn remove_connection(&self, connection: &Arc<Connection>) -> bool {
    let mut connections = self.connections.write().await;
    match connections.get(connection.id()) {
      Some(current) if Arc::ptr_eq(current, connection) => {
        connections.remove(connection.id());
        true
      }
      _ => false,
    }
  }

  /// Whether the registry still holds this exact connection under its id.
  pub async fn holds(&self, connection: &Arc<Connection>) -> bool {
    match self.connections.read().await.get(connection.id()) {
      Some(current) => Arc::ptr_eq(current, connection),
      None => false,
    }
  }

  pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
    self.connections.read().await.get(id).cloned()
  }

  pub async fn contains(&self, id: &str) -> bool {
    self.connections.read().await.contains_key(id)
  }

  /// Point-in-time snapshot of all connections.
  pub async fn all(&self) -> Vec<Arc<Connection>> {
    self.connections.read().await.values().cloned().collect()
  }

  /// Snapshot of the connections whose metadata names `user_id`.
  pub async fn for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
    self
      .connections
      .read()
      .await
      .values()
      .filter(|c| c.user_id().as_deref() == Some(user_id))
      .cloned()
      .collect()
  }

  pub async fn len(&self) -> usize {
    self.connections.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.connections.read().await.is_empty()
  }
}
