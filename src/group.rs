//! Group membership: group name → set of connection ids.

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};
use tokio::sync::RwLock;

type Members = Arc<RwLock<HashSet<String>>>;

/// Table of all groups on this instance.
///
/// Groups are created lazily on first add and may stay around empty;
/// [`prune_empty`](GroupTable::prune_empty) drops empty records. Every
/// operation is idempotent. Members are plain ids, so a member that has since
/// disconnected simply fails to resolve in the connection registry.
#[derive(Clone, Default)]
pub struct GroupTable {
  groups: Arc<RwLock<HashMap<String, Members>>>,
}

impl GroupTable {
  pub fn new() -> Self {
    Self::default()
  }

  async fn get_group(&self, group: &str) -> Option<Members> {
    self.groups.read().await.get(group).cloned()
  }

  /// Add `connection_id` to `group`. Returns `true` if it was not already a member.
  ///
  /// The insert happens while the map lock is still held, so a concurrent
  /// [`prune_empty`](GroupTable::prune_empty) cannot drop the record in between.
  pub async fn add_to_group(&self, group: &str, connection_id: &str) -> bool {
    {
      let groups = self.groups.read().await;
      if let Some(members) = groups.get(group) {
        let added = members.write().await.insert(connection_id.to_string());
        return added;
      }
    }

    let mut groups = self.groups.write().await;
    // Another task may have created it while we waited for the write lock.
    let members = groups
      .entry(group.to_string())
      .or_insert_with(|| Arc::new(RwLock::new(HashSet::new())));
    let added = members.write().await.insert(connection_id.to_string());
    added
  }

  /// Remove `connection_id` from `group`. Returns `true` if it was a member.
  pub async fn remove_from_group(&self, group: &str, connection_id: &str) -> bool {
    match self.get_group(group).await {
      Some(members) => {
        let removed = members.write().await.remove(connection_id);
        removed
      }
      None => false,
    }
  }

  /// Snapshot of the members of `group` (empty if the group does not exist).
  pub async fn members_of(&self, group: &str) -> Vec<String> {
    match self.get_group(group).await {
      Some(members) => {
        let snapshot = members.read().await.iter().cloned().collect();
        snapshot
      }
      None => Vec::new(),
    }
  }

  pub async fn is_member(&self, group: &str, connection_id: &str) -> bool {
    match self.get_group(group).await {
      Some(members) => {
        let is_member = members.read().await.contains(connection_id);
        is_member
      }
      None => false,
    }
  }

  /// Remove `connection_id` from every group. Returns the groups it was removed from.
  pub async fn remove_from_all(&self, connection_id: &str) -> Vec<String> {
    let groups: Vec<(String, Members)> = self
      .groups
      .read()
      .await
      .iter()
      .map(|(name, members)| (name.clone(), members.clone()))
      .collect();

    let mut left = Vec::new();
    for (name, members) in groups {
      if members.write().await.remove(connection_id) {
        left.push(name);
      }
    }
    left
  }

  pub async fn group_names(&self) -> Vec<String> {
    self.groups.read().await.keys().cloned().collect()
  }

  /// Drop group records that currently have no members.
  pub async fn prune_empty(&self) -> usize {
    let mut groups = self.groups.write().await;
    let mut empty = Vec::new();
    for (name, members) in groups.iter() {
      if members.read().await.is_empty() {
        empty.push(name.clone());
      }
    }

    for name in &empty {
      groups.remove(name);
      tracing::debug!("Pruned empty group: {}", name);
    }
    empty.len()
  }
}
