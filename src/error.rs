//! Error types for the migration core.

use crate::types::{MigrationId, MigrationState, NodeId, TopicName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for migration-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for migration-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Migration does not exist in the table.
    #[error("migration not found: {0}")]
    MigrationNotFound(MigrationId),

    /// A topic may participate in at most one active migration.
    #[error("topic {topic} already participates in migration {migration}")]
    TopicAlreadyMigrating {
        topic: TopicName,
        migration: MigrationId,
    },

    /// An advance write did not match the table's current sought state.
    /// The writer must re-read the table and re-derive its intent.
    #[error(
        "advance conflict for migration {migration}: table sought state is {current}, \
         requested {requested}"
    )]
    AdvanceConflict {
        migration: MigrationId,
        current: MigrationState,
        requested: MigrationState,
    },

    /// A status RPC failed at the transport level.
    #[error("rpc to node {node} failed: {error}")]
    Rpc {
        node: NodeId,
        #[source]
        error: WorkError,
    },

    /// No route to the node.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeId),

    /// The component is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome taxonomy for partition work and status checks.
///
/// Carried inside [`WorkResult`] completion values and RPC reply entries.
/// `ShuttingDown` and `InvalidMigrationState` are terminal for a work item;
/// every other value is retried while the replica remains locally led and
/// the migration still seeks the same state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkError {
    /// The owning component is stopping.
    #[error("shutting down")]
    ShuttingDown,

    /// The work no longer matches the migration state it was scheduled for.
    #[error("invalid data migration state")]
    InvalidMigrationState,

    /// The partition operation failed; retryable.
    #[error("partition operation failed")]
    PartitionOperationFailed,

    /// No leader is known for the partition; retryable.
    #[error("leader not found")]
    LeaderNotFound,

    /// The operation did not complete in time; retryable.
    #[error("operation timed out")]
    Timeout,

    /// The RPC transport could not deliver the request; retryable.
    #[error("rpc transport unavailable")]
    RpcUnavailable,
}

impl WorkError {
    /// Whether a work item that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WorkError::ShuttingDown | WorkError::InvalidMigrationState
        )
    }
}

/// Result of one partition work attempt. `Ok(())` is the success outcome.
pub type WorkResult = std::result::Result<(), WorkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!WorkError::ShuttingDown.is_retryable());
        assert!(!WorkError::InvalidMigrationState.is_retryable());
        assert!(WorkError::PartitionOperationFailed.is_retryable());
        assert!(WorkError::LeaderNotFound.is_retryable());
        assert!(WorkError::Timeout.is_retryable());
        assert!(WorkError::RpcUnavailable.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::AdvanceConflict {
            migration: 7,
            current: MigrationState::Prepared,
            requested: MigrationState::CutOver,
        };
        let text = err.to_string();
        assert!(text.contains("migration 7"));
        assert!(text.contains("prepared"));
        assert!(text.contains("cut_over"));
    }
}
