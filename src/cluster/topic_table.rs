//! Topic table: partition assignments per topic and delta notifications.

use crate::cluster::SubscriptionId;
use crate::types::{NodeId, Ntp, PartitionId, TopicName};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// The replica set of one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition: PartitionId,
    pub replicas: Vec<NodeId>,
}

/// A change to the topic table, delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicDelta {
    /// A partition appeared (topic creation or partition growth).
    PartitionAdded { ntp: Ntp, replicas: Vec<NodeId> },
    /// A partition disappeared (topic deletion).
    PartitionRemoved { ntp: Ntp },
    /// A partition's replica set changed.
    ReplicasMoved { ntp: Ntp, replicas: Vec<NodeId> },
}

impl TopicDelta {
    /// The partition this delta concerns.
    pub fn ntp(&self) -> &Ntp {
        match self {
            TopicDelta::PartitionAdded { ntp, .. } => ntp,
            TopicDelta::PartitionRemoved { ntp } => ntp,
            TopicDelta::ReplicasMoved { ntp, .. } => ntp,
        }
    }
}

type DeltaCallback = Arc<dyn Fn(&TopicDelta) + Send + Sync>;

#[derive(Default)]
struct SubscriptionRegistry {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, DeltaCallback)>,
}

/// Partition assignments for every topic in the cluster.
#[derive(Default)]
pub struct TopicTable {
    topics: RwLock<HashMap<TopicName, BTreeMap<PartitionId, Vec<NodeId>>>>,
    subscriptions: Mutex<SubscriptionRegistry>,
}

impl TopicTable {
    /// Create an empty topic table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with the given assignments, replacing any previous
    /// definition. Fires one `PartitionAdded` delta per partition.
    pub fn create_topic(&self, topic: impl Into<TopicName>, assignments: Vec<PartitionAssignment>) {
        let topic = topic.into();
        {
            let mut topics = self.topics.write();
            let partitions = topics.entry(topic.clone()).or_default();
            partitions.clear();
            for assignment in &assignments {
                partitions.insert(assignment.partition, assignment.replicas.clone());
            }
        }
        tracing::debug!(topic = %topic, partitions = assignments.len(), "topic created");
        for assignment in assignments {
            self.notify(&TopicDelta::PartitionAdded {
                ntp: Ntp::new(topic.clone(), assignment.partition),
                replicas: assignment.replicas,
            });
        }
    }

    /// Remove a topic. Fires one `PartitionRemoved` delta per partition.
    pub fn drop_topic(&self, topic: &str) {
        let removed = self.topics.write().remove(topic);
        let Some(partitions) = removed else { return };
        tracing::debug!(topic, partitions = partitions.len(), "topic dropped");
        for partition in partitions.into_keys() {
            self.notify(&TopicDelta::PartitionRemoved {
                ntp: Ntp::new(topic.to_string(), partition),
            });
        }
    }

    /// Replace the replica set of one partition. Fires a `ReplicasMoved`
    /// delta; unknown partitions are ignored.
    pub fn set_replicas(&self, ntp: &Ntp, replicas: Vec<NodeId>) {
        {
            let mut topics = self.topics.write();
            let Some(partitions) = topics.get_mut(&ntp.topic) else {
                return;
            };
            let Some(current) = partitions.get_mut(&ntp.partition) else {
                return;
            };
            *current = replicas.clone();
        }
        self.notify(&TopicDelta::ReplicasMoved {
            ntp: ntp.clone(),
            replicas,
        });
    }

    /// The partition assignments of a topic; empty if the topic is unknown.
    pub fn partitions(&self, topic: &str) -> Vec<PartitionAssignment> {
        self.topics
            .read()
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .map(|(partition, replicas)| PartitionAssignment {
                        partition: *partition,
                        replicas: replicas.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the topic exists.
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }

    /// Subscribe to topic deltas. The callback must be short and
    /// non-blocking.
    pub fn subscribe(&self, callback: impl Fn(&TopicDelta) + Send + Sync + 'static) -> SubscriptionId {
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

    fn notify(&self, delta: &TopicDelta) {
        let callbacks: Vec<DeltaCallback> = {
            let registry = self.subscriptions.lock();
            registry
                .subscribers
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in callbacks {
            callback(delta);
        }
    }
}

impl fmt::Debug for TopicTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicTable")
            .field("topics", &self.topics.read().len())
            .finish()
    }
}
