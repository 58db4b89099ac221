//! Partition work descriptors and the work-routine seam.
//!
//! The actual disk and network operations behind a work item are external
//! collaborators; the core only cares that they eventually produce a
//! [`WorkResult`](crate::error::WorkResult). Implementations must copy
//! anything they need out of their arguments before suspending: the worker
//! entry that issued the call may be superseded while the routine runs.

use crate::error::WorkResult;
use crate::types::{MigrationId, MigrationState, Ntp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Context for inbound partition work: replicate the partition's data in
/// from an external location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundPartitionWorkInfo {
    /// External location the data is replicated from.
    pub source: Option<String>,
}

/// Context for outbound partition work: prepare or export the partition's
/// local data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPartitionWorkInfo {
    /// External location the data is exported to.
    pub target: Option<String>,
}

/// The kind-specific half of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionWorkInfo {
    Inbound(InboundPartitionWorkInfo),
    Outbound(OutboundPartitionWorkInfo),
}

/// One unit of partition work handed to the worker: drive this replica to
/// `sought_state` on behalf of `migration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWork {
    pub migration: MigrationId,
    pub sought_state: MigrationState,
    pub info: PartitionWorkInfo,
}

/// The work routines invoked by the worker, one per migration direction.
///
/// Valid `(kind, sought_state)` pairs are part of the worker's contract:
/// inbound work is only ever requested towards `Prepared`; outbound work
/// towards `Prepared` or `Executed`. Anything else is a bug in the caller,
/// not a runtime condition.
#[async_trait::async_trait]
pub trait PartitionWorkRunner: Send + Sync + fmt::Debug {
    /// Replicate `ntp` in from the external source.
    async fn run_inbound(&self, ntp: &Ntp, info: &InboundPartitionWorkInfo) -> WorkResult;

    /// Prepare or export `ntp`, depending on the sought state.
    async fn run_outbound(
        &self,
        ntp: &Ntp,
        info: &OutboundPartitionWorkInfo,
        sought_state: MigrationState,
    ) -> WorkResult;
}

/// Runner that completes every work item immediately.
#[derive(Debug, Default)]
pub struct NoOpPartitionWorkRunner;

#[async_trait::async_trait]
impl PartitionWorkRunner for NoOpPartitionWorkRunner {
    async fn run_inbound(&self, ntp: &Ntp, _info: &InboundPartitionWorkInfo) -> WorkResult {
        tracing::debug!(%ntp, "noop inbound partition work");
        Ok(())
    }

    async fn run_outbound(
        &self,
        ntp: &Ntp,
        _info: &OutboundPartitionWorkInfo,
        sought_state: MigrationState,
    ) -> WorkResult {
        tracing::debug!(%ntp, sought_state = %sought_state, "noop outbound partition work");
        Ok(())
    }
}
