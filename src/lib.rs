//! Data-migration reconciliation core for a distributed, partitioned log
//! cluster.
//!
//! A migration is a cluster-wide, multi-phase lifecycle applied to a set of
//! topics: inbound migrations replicate external data in, outbound
//! migrations prepare and export local data. This crate drives every
//! partition replica of every active migration to the state the cluster
//! currently seeks, reports progress to a cluster-wide authority, and
//! retries under partial failure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MigrationTable                         │
//! │      migrations + sought states (single source of truth)     │
//! └──────────────────────────────────────────────────────────────┘
//!            │ notifications              ▲ advance writes
//!            ▼                            │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Backend (per node)                      │
//! │   local reconciler        +        coordinator (controller   │
//! │   per-ntp work states              leader only): status      │
//! │   start/stop worker jobs           fan-out and advances      │
//! └──────────────────────────────────────────────────────────────┘
//!            │ perform / abort            │ check_ntp_states RPC
//!            ▼                            ▼
//! ┌────────────────────────┐   ┌─────────────────────────────────┐
//! │    Worker (per node)   │   │         peer backends           │
//! └────────────────────────┘   └─────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use caravan::{
//!     Backend, BackendConfig, LeadersTable, Migration, MigrationState,
//!     MigrationTable, NoOpPartitionWorkRunner, Worker, WorkerConfig,
//! };
//!
//! // wire one node (tables, worker, backend) and start reconciling
//! let backend = Backend::new(
//!     node_id, BackendConfig::default(), table.clone(), topics, leaders,
//!     shards, worker, rpc_client, metrics, &shutdown,
//! );
//! backend.start();
//!
//! // declare a migration and ask the cluster to prepare it
//! let id = table.create(Migration::inbound(vec!["orders".into()], None))?;
//! table.advance(id, MigrationState::Prepared).await?;
//! // ... the coordinator advances it once every replica has prepared
//! ```
//!
//! # Concurrency model
//!
//! Each backend runs a single loop fiber: wait on a wakeup or the poll
//! timer, take the backend mutex, perform one work cycle, repeat. Event
//! handlers (table notifications, topic deltas, leadership and shard
//! updates, completions) only enqueue and wake. The worker serializes jobs
//! per ntp and only spawns while this node leads the partition. A single
//! abort signal threads through every await; `stop` resolves every pending
//! completion and waits for the task gate to close.

pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod testing;
pub mod types;

// Re-export the main types for convenience
pub use cluster::{
    LeadersTable, MigrationTable, PartitionAssignment, ShardDirectory, SubscriptionId,
    TopicDelta, TopicTable,
};
pub use config::{BackendConfig, WorkerConfig};
pub use error::{Error, Result, WorkError, WorkResult};
pub use metrics::{Counter, Gauge, MigrationMetrics, MigrationMetricsSnapshot};
pub use types::{
    InboundMigration, Migration, MigrationId, MigrationKind, MigrationMetadata, MigrationState,
    NodeId, Ntp, OutboundMigration, PartitionId, ShardId, TopicName,
};

// Re-export the core components
pub use migration::{
    Backend, CheckNtpStatesReply, CheckNtpStatesRequest, InMemoryStatusRouter,
    InboundPartitionWorkInfo, NoOpPartitionWorkRunner, NtpStateEntry, NtpStateReplyEntry,
    OutboundPartitionWorkInfo, PartitionWork, PartitionWorkInfo, PartitionWorkRunner,
    ReplicaStatus, StatusRpcClient, StatusRpcHandler, WorkCompletion, Worker,
};

// Re-export the testing toolkit
pub use testing::{eventually, ScriptedWorkRunner, TestCluster, TestNode};
