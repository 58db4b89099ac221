//! Status RPC surface between the coordinator and peer nodes.
//!
//! One request/reply pair: the coordinator asks a node which of the listed
//! ntps have reached their sought state, the node answers from its local
//! replica work states. Transport is an ordered best-effort node-to-node
//! channel; timeouts are the caller's responsibility.

use crate::error::{Error, Result, WorkError};
use crate::types::{MigrationId, MigrationState, NodeId, Ntp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// One ntp the coordinator is awaiting from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpStateEntry {
    pub ntp: Ntp,
    pub migration: MigrationId,
    pub sought_state: MigrationState,
}

/// Request: which of these ntps have reached their sought state?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckNtpStatesRequest {
    pub entries: Vec<NtpStateEntry>,
}

impl CheckNtpStatesRequest {
    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from the wire.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Reply entry for one requested ntp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpStateReplyEntry {
    pub ntp: Ntp,
    pub migration: MigrationId,
    /// Whether this node's replica has reached the sought state.
    pub reached: bool,
    /// Set when the node could not evaluate the entry.
    pub error: Option<WorkError>,
}

/// Reply to a [`CheckNtpStatesRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckNtpStatesReply {
    pub entries: Vec<NtpStateReplyEntry>,
}

impl CheckNtpStatesReply {
    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from the wire.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Client side of the status RPC: deliver a request to a peer node.
#[async_trait::async_trait]
pub trait StatusRpcClient: Send + Sync + fmt::Debug {
    /// Send a status request to `node` and await its reply.
    async fn check_ntp_states(
        &self,
        node: NodeId,
        request: CheckNtpStatesRequest,
    ) -> Result<CheckNtpStatesReply>;
}

/// Server side of the status RPC, implemented by the backend.
#[async_trait::async_trait]
pub trait StatusRpcHandler: Send + Sync {
    /// Answer a status request from the local replica work states.
    async fn check_ntp_states(&self, request: CheckNtpStatesRequest) -> CheckNtpStatesReply;
}

#[derive(Default)]
struct RouterStats {
    in_flight: HashMap<NodeId, usize>,
    max_in_flight: HashMap<NodeId, usize>,
    requests: HashMap<NodeId, u64>,
}

/// In-process transport routing status requests to registered handlers.
///
/// Supports unreachable-node fault injection and tracks per-node in-flight
/// request counts, which cluster tests use to check the one-RPC-per-node
/// rule.
#[derive(Default)]
pub struct InMemoryStatusRouter {
    handlers: RwLock<HashMap<NodeId, Arc<dyn StatusRpcHandler>>>,
    unreachable: RwLock<HashSet<NodeId>>,
    stats: Mutex<RouterStats>,
}

impl InMemoryStatusRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler answering requests addressed to `node`.
    pub fn register(&self, node: NodeId, handler: Arc<dyn StatusRpcHandler>) {
        self.handlers.write().insert(node, handler);
    }

    /// Remove a node's handler.
    pub fn deregister(&self, node: NodeId) {
        self.handlers.write().remove(&node);
    }

    /// Make requests to `node` fail with a transport error.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        if unreachable {
            self.unreachable.write().insert(node);
        } else {
            self.unreachable.write().remove(&node);
        }
    }

    /// Highest number of concurrently outstanding requests seen for `node`.
    pub fn max_in_flight(&self, node: NodeId) -> usize {
        self.stats
            .lock()
            .max_in_flight
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    /// Total requests dispatched towards `node`, including failed ones.
    pub fn requests_to(&self, node: NodeId) -> u64 {
        self.stats.lock().requests.get(&node).copied().unwrap_or(0)
    }

    fn begin_request(&self, node: NodeId) {
        let mut stats = self.stats.lock();
        *stats.requests.entry(node).or_default() += 1;
        let in_flight = stats.in_flight.entry(node).or_default();
        *in_flight += 1;
        let current = *in_flight;
        let max = stats.max_in_flight.entry(node).or_default();
        *max = (*max).max(current);
    }

    fn end_request(&self, node: NodeId) {
        let mut stats = self.stats.lock();
        if let Some(in_flight) = stats.in_flight.get_mut(&node) {
            *in_flight = in_flight.saturating_sub(1);
        }
    }
}

#[async_trait::async_trait]
impl StatusRpcClient for InMemoryStatusRouter {
    async fn check_ntp_states(
        &self,
        node: NodeId,
        request: CheckNtpStatesRequest,
    ) -> Result<CheckNtpStatesReply> {
        self.begin_request(node);
        let result = self.dispatch(node, request).await;
        self.end_request(node);
        result
    }
}

impl InMemoryStatusRouter {
    async fn dispatch(
        &self,
        node: NodeId,
        request: CheckNtpStatesRequest,
    ) -> Result<CheckNtpStatesReply> {
        if self.unreachable.read().contains(&node) {
            return Err(Error::Rpc {
                node,
                error: WorkError::RpcUnavailable,
            });
        }
        let handler = self
            .handlers
            .read()
            .get(&node)
            .cloned()
            .ok_or(Error::NodeUnreachable(node))?;
        Ok(handler.check_ntp_states(request).await)
    }
}

impl fmt::Debug for InMemoryStatusRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStatusRouter")
            .field("nodes", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct EchoHandler;

    #[async_trait::async_trait]
    impl StatusRpcHandler for EchoHandler {
        async fn check_ntp_states(&self, request: CheckNtpStatesRequest) -> CheckNtpStatesReply {
            CheckNtpStatesReply {
                entries: request
                    .entries
                    .into_iter()
                    .map(|entry| NtpStateReplyEntry {
                        ntp: entry.ntp,
                        migration: entry.migration,
                        reached: true,
                        error: None,
                    })
                    .collect(),
            }
        }
    }

    fn request() -> CheckNtpStatesRequest {
        CheckNtpStatesRequest {
            entries: vec![NtpStateEntry {
                ntp: Ntp::new("t", 0),
                migration: 1,
                sought_state: MigrationState::Prepared,
            }],
        }
    }

    #[test]
    fn test_request_wire_format() {
        let original = request();
        let decoded = CheckNtpStatesRequest::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(original, decoded);
    }

    #[tokio::test]
    async fn test_router_dispatches_to_handler() {
        let router = InMemoryStatusRouter::new();
        router.register(2, Arc::new(EchoHandler));

        let reply = router.check_ntp_states(2, request()).await.unwrap();
        assert_eq!(reply.entries.len(), 1);
        assert!(reply.entries[0].reached);
        assert_eq!(router.requests_to(2), 1);
        assert_eq!(router.max_in_flight(2), 1);
    }

    #[tokio::test]
    async fn test_router_fault_injection() {
        let router = InMemoryStatusRouter::new();
        router.register(2, Arc::new(EchoHandler));
        router.set_unreachable(2, true);

        let err = router.check_ntp_states(2, request()).await;
        assert!(matches!(
            err,
            Err(Error::Rpc {
                node: 2,
                error: WorkError::RpcUnavailable,
            })
        ));

        router.set_unreachable(2, false);
        assert!(router.check_ntp_states(2, request()).await.is_ok());

        let err = router.check_ntp_states(9, request()).await;
        assert!(matches!(err, Err(Error::NodeUnreachable(9))));
    }
}
