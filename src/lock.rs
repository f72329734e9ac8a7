//! Exclusive device control. `device -> client` and `client -> device` are
//! kept as a strict bijection: acquiring a lock for a client that already
//! holds another device releases the old one in the same step.

use std::collections::HashMap;

use crate::NodeId;

#[derive(Default)]
pub struct ClientLocks {
    by_node: HashMap<NodeId, u32>,
    by_client: HashMap<u32, NodeId>,
}

impl ClientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the device is unlocked or already held by this client.
    /// On success the client's previous lock (if any) is gone.
    pub fn try_acquire(&mut self, node: NodeId, client: u32) -> bool {
        match self.by_node.get(&node) {
            Some(&holder) if holder != client => return false,
            _ => {}
        }
        if let Some(previous) = self.by_client.insert(client, node) {
            if previous != node {
                self.by_node.remove(&previous);
            }
        }
        self.by_node.insert(node, client);
        true
    }

    pub fn release_node(&mut self, node: NodeId) {
        if let Some(client) = self.by_node.remove(&node) {
            self.by_client.remove(&client);
        }
    }

    /// Drop everything a client holds (disconnect path). Idempotent.
    pub fn release_client(&mut self, client: u32) {
        if let Some(node) = self.by_client.remove(&client) {
            self.by_node.remove(&node);
        }
    }

    pub fn is_locked(&self, node: NodeId) -> bool {
        self.by_node.contains_key(&node)
    }

    pub fn holder(&self, node: NodeId) -> Option<u32> {
        self.by_node.get(&node).copied()
    }

    pub fn node_of(&self, client: u32) -> Option<NodeId> {
        self.by_client.get(&client).copied()
    }

    /// May this client mutate this device? Allowed when the device is
    /// unlocked or held by the same client.
    pub fn may_mutate(&self, node: NodeId, client: u32) -> bool {
        match self.by_node.get(&node) {
            Some(&holder) => holder == client,
            None => true,
        }
    }
}
