//! Node-local directory mapping partitions to the shard hosting them.

use crate::cluster::SubscriptionId;
use crate::types::{Ntp, ShardId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type ShardUpdateCallback = Arc<dyn Fn(&Ntp, Option<ShardId>) + Send + Sync>;

#[derive(Default)]
struct SubscriptionRegistry {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, ShardUpdateCallback)>,
}

/// The shard assignment of every partition replica hosted on this node.
/// A replica without an entry has not been placed on a shard yet.
#[derive(Default)]
pub struct ShardDirectory {
    shards: RwLock<HashMap<Ntp, ShardId>>,
    subscriptions: Mutex<SubscriptionRegistry>,
}

impl ShardDirectory {
    /// Create an empty shard directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shard hosting `ntp` on this node, if assigned.
    pub fn shard_of(&self, ntp: &Ntp) -> Option<ShardId> {
        self.shards.read().get(ntp).copied()
    }

    /// Record a shard assignment change and notify subscribers. `None`
    /// means the replica left this node or lost its shard.
    pub fn set_shard(&self, ntp: &Ntp, shard: Option<ShardId>) {
        {
            let mut shards = self.shards.write();
            match shard {
                Some(shard) => {
                    shards.insert(ntp.clone(), shard);
                }
                None => {
                    shards.remove(ntp);
                }
            }
        }
        let callbacks: Vec<ShardUpdateCallback> = {
            let registry = self.subscriptions.lock();
            registry
                .subscribers
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in callbacks {
            callback(ntp, shard);
        }
    }

    /// Subscribe to shard assignment updates. The callback must be short
    /// and non-blocking.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Ntp, Option<ShardId>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut registry = self.subscriptions.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Deregister a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .subscribers
            .retain(|(sub_id, _)| *sub_id != id);
    }
}

impl fmt::Debug for ShardDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardDirectory")
            .field("replicas", &self.shards.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_and_removal() {
        let directory = ShardDirectory::new();
        let ntp = Ntp::new("t", 0);
        assert_eq!(directory.shard_of(&ntp), None);
        directory.set_shard(&ntp, Some(2));
        assert_eq!(directory.shard_of(&ntp), Some(2));
        directory.set_shard(&ntp, None);
        assert_eq!(directory.shard_of(&ntp), None);
    }

    #[test]
    fn test_updates_notify_subscribers() {
        let directory = ShardDirectory::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let id = directory.subscribe(move |ntp, shard| {
            seen_cb.lock().push((ntp.clone(), shard));
        });

        let ntp = Ntp::new("t", 1);
        directory.set_shard(&ntp, Some(0));
        directory.set_shard(&ntp, None);
        directory.unsubscribe(id);
        directory.set_shard(&ntp, Some(1));

        let updates = seen.lock();
        assert_eq!(updates.as_slice(), &[(ntp.clone(), Some(0)), (ntp, None)]);
    }
}
