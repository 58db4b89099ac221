//! Core identifiers and migration lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// CPU-bound execution context index within a node. A partition replica
/// lives on exactly one shard of its node.
pub type ShardId = u32;

/// Cluster-unique migration identifier, assigned by the migration table.
pub type MigrationId = u64;

/// Partition index within a topic.
pub type PartitionId = u32;

/// Topic name.
pub type TopicName = String;

/// Identifies one partition of one topic (an "ntp").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ntp {
    pub topic: TopicName,
    pub partition: PartitionId,
}

/// Name of the cluster-controller topic. The node leading its single
/// partition coordinates migration advances for the whole cluster.
pub const CONTROLLER_TOPIC: &str = "_cluster_controller";

impl Ntp {
    /// Create an ntp from a topic name and partition index.
    pub fn new(topic: impl Into<TopicName>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// The cluster-controller partition.
    pub fn controller() -> Self {
        Self::new(CONTROLLER_TOPIC, 0)
    }

    /// Whether this ntp is the cluster-controller partition.
    pub fn is_controller(&self) -> bool {
        self.topic == CONTROLLER_TOPIC && self.partition == 0
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Lifecycle state sought for every replica of a migration.
///
/// The recorded sought state only ever moves forward along this chain; the
/// transitional phases of a migration ("preparing", "executing") are the
/// condition that the table's sought state is ahead of replica progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MigrationState {
    /// Migration exists but no work has been requested yet.
    Planned,
    /// Every replica has staged the data needed for the migration.
    Prepared,
    /// Every replica has carried out the data movement.
    Executed,
    /// Traffic has been cut over to the migrated data.
    CutOver,
    /// Terminal state; the migration record may be removed.
    Finished,
}

impl MigrationState {
    /// The next state in the lifecycle, if any.
    pub fn next(&self) -> Option<MigrationState> {
        match self {
            MigrationState::Planned => Some(MigrationState::Prepared),
            MigrationState::Prepared => Some(MigrationState::Executed),
            MigrationState::Executed => Some(MigrationState::CutOver),
            MigrationState::CutOver => Some(MigrationState::Finished),
            MigrationState::Finished => None,
        }
    }

    /// Check if this is the terminal lifecycle state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Finished)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Planned => write!(f, "planned"),
            MigrationState::Prepared => write!(f, "prepared"),
            MigrationState::Executed => write!(f, "executed"),
            MigrationState::CutOver => write!(f, "cut_over"),
            MigrationState::Finished => write!(f, "finished"),
        }
    }
}

/// Direction of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationKind {
    /// External data is replicated into the cluster.
    Inbound,
    /// Local data is prepared and exported out of the cluster.
    Outbound,
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKind::Inbound => write!(f, "inbound"),
            MigrationKind::Outbound => write!(f, "outbound"),
        }
    }
}

/// An inbound migration: replicate the listed topics from an external
/// location into the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMigration {
    /// Topics participating in the migration.
    pub topics: Vec<TopicName>,
    /// External location the data is replicated from.
    pub source: Option<String>,
}

/// An outbound migration: prepare and export the listed topics to an
/// external location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMigration {
    /// Topics participating in the migration.
    pub topics: Vec<TopicName>,
    /// External location the data is exported to.
    pub target: Option<String>,
}

/// A migration as declared in the migration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Migration {
    Inbound(InboundMigration),
    Outbound(OutboundMigration),
}

impl Migration {
    /// Create an inbound migration over `topics`.
    pub fn inbound(topics: Vec<TopicName>, source: Option<String>) -> Self {
        Self::Inbound(InboundMigration { topics, source })
    }

    /// Create an outbound migration over `topics`.
    pub fn outbound(topics: Vec<TopicName>, target: Option<String>) -> Self {
        Self::Outbound(OutboundMigration { topics, target })
    }

    /// The direction of this migration.
    pub fn kind(&self) -> MigrationKind {
        match self {
            Migration::Inbound(_) => MigrationKind::Inbound,
            Migration::Outbound(_) => MigrationKind::Outbound,
        }
    }

    /// Topics participating in this migration.
    pub fn topics(&self) -> &[TopicName] {
        match self {
            Migration::Inbound(inbound) => &inbound.topics,
            Migration::Outbound(outbound) => &outbound.topics,
        }
    }

    /// Whether reaching `sought` requires per-partition work on replica
    /// nodes. Inbound migrations only do partition work towards `Prepared`;
    /// outbound migrations towards `Prepared` and `Executed`.
    pub fn requires_partition_work(&self, sought: MigrationState) -> bool {
        match self {
            Migration::Inbound(_) => sought == MigrationState::Prepared,
            Migration::Outbound(_) => {
                matches!(sought, MigrationState::Prepared | MigrationState::Executed)
            }
        }
    }
}

/// A migration record as stored in the migration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMetadata {
    /// Cluster-unique identifier.
    pub id: MigrationId,
    /// The declared migration.
    pub migration: Migration,
    /// The state the cluster currently wants every replica to reach.
    pub sought_state: MigrationState,
}
