//! Partition-leadership table and change notifications.

use crate::cluster::SubscriptionId;
use crate::types::{NodeId, Ntp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type LeadershipCallback = Arc<dyn Fn(&Ntp, Option<NodeId>) + Send + Sync>;

#[derive(Default)]
struct SubscriptionRegistry {
    next_id: SubscriptionId,
    by_ntp: HashMap<Ntp, Vec<(SubscriptionId, LeadershipCallback)>>,
}

/// Tracks the current leader of every partition and notifies per-ntp
/// subscribers on change.
#[derive(Default)]
pub struct LeadersTable {
    leaders: RwLock<HashMap<Ntp, NodeId>>,
    subscriptions: Mutex<SubscriptionRegistry>,
}

impl LeadersTable {
    /// Create an empty leaders table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current leader of `ntp`, if one is known.
    pub fn leader_of(&self, ntp: &Ntp) -> Option<NodeId> {
        self.leaders.read().get(ntp).copied()
    }

    /// Record a leadership change and notify subscribers of that ntp.
    pub fn set_leader(&self, ntp: &Ntp, leader: Option<NodeId>) {
        {
            let mut leaders = self.leaders.write();
            match leader {
                Some(node) => {
                    leaders.insert(ntp.clone(), node);
                }
                None => {
                    leaders.remove(ntp);
                }
            }
        }
        tracing::debug!(%ntp, ?leader, "partition leadership changed");
        let callbacks: Vec<LeadershipCallback> = {
            let registry = self.subscriptions.lock();
            registry
                .by_ntp
                .get(ntp)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(ntp, leader);
        }
    }

    /// Subscribe to leadership changes of a single ntp. The callback must be
    /// short and non-blocking.
    pub fn subscribe(
        &self,
        ntp: Ntp,
        callback: impl Fn(&Ntp, Option<NodeId>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut registry = self.subscriptions.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .by_ntp
            .entry(ntp)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Deregister a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.subscriptions.lock();
        registry.by_ntp.retain(|_, subs| {
            subs.retain(|(sub_id, _)| *sub_id != id);
            !subs.is_empty()
        });
    }
}

impl fmt::Debug for LeadersTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadersTable")
            .field("partitions", &self.leaders.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_leader_lookup() {
        let table = LeadersTable::new();
        let ntp = Ntp::new("t", 0);
        assert_eq!(table.leader_of(&ntp), None);
        table.set_leader(&ntp, Some(3));
        assert_eq!(table.leader_of(&ntp), Some(3));
        table.set_leader(&ntp, None);
        assert_eq!(table.leader_of(&ntp), None);
    }

    #[test]
    fn test_subscription_fires_for_its_ntp_only() {
        let table = LeadersTable::new();
        let hits = Arc::new(AtomicU64::new(0));
        let hits_cb = Arc::clone(&hits);
        let watched = Ntp::new("t", 0);
        let id = table.subscribe(watched.clone(), move |_, _| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });

        table.set_leader(&watched, Some(1));
        table.set_leader(&Ntp::new("other", 0), Some(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        table.unsubscribe(id);
        table.set_leader(&watched, Some(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
