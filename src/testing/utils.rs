//! Cluster fixture and scripted work runner.

use crate::cluster::{LeadersTable, MigrationTable, ShardDirectory, TopicTable};
use crate::cluster::PartitionAssignment;
use crate::config::{BackendConfig, WorkerConfig};
use crate::error::WorkResult;
use crate::metrics::MigrationMetrics;
use crate::migration::rpc::{InMemoryStatusRouter, StatusRpcClient};
use crate::migration::work::{
    InboundPartitionWorkInfo, OutboundPartitionWorkInfo, PartitionWorkRunner,
};
use crate::migration::worker::Worker;
use crate::migration::Backend;
use crate::types::{MigrationId, MigrationState, NodeId, Ntp};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Work runner with per-ntp scripted results and hold/release gating.
///
/// Every call is counted; without a script or a gate it succeeds
/// immediately, so the default behaves like the no-op runner.
#[derive(Default)]
pub struct ScriptedWorkRunner {
    results: Mutex<HashMap<Ntp, VecDeque<WorkResult>>>,
    calls: Mutex<HashMap<Ntp, u64>>,
    outbound_log: Mutex<HashMap<Ntp, Vec<MigrationState>>>,
    gates: Mutex<HashMap<Ntp, Arc<Semaphore>>>,
}

impl ScriptedWorkRunner {
    /// Create a runner that succeeds by default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next unscripted call for `ntp`.
    pub fn push_result(&self, ntp: &Ntp, result: WorkResult) {
        self.results
            .lock()
            .entry(ntp.clone())
            .or_default()
            .push_back(result);
    }

    /// Block calls for `ntp` until permits are released.
    pub fn hold(&self, ntp: &Ntp) {
        self.gates
            .lock()
            .insert(ntp.clone(), Arc::new(Semaphore::new(0)));
    }

    /// Let `permits` held calls for `ntp` proceed.
    pub fn release(&self, ntp: &Ntp, permits: usize) {
        if let Some(gate) = self.gates.lock().get(ntp) {
            gate.add_permits(permits);
        }
    }

    /// Number of work attempts seen for `ntp`.
    pub fn calls(&self, ntp: &Ntp) -> u64 {
        self.calls.lock().get(ntp).copied().unwrap_or(0)
    }

    /// Total work attempts across all ntps.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Sought states of the outbound attempts seen for `ntp`, in order.
    pub fn outbound_states(&self, ntp: &Ntp) -> Vec<MigrationState> {
        self.outbound_log
            .lock()
            .get(ntp)
            .cloned()
            .unwrap_or_default()
    }

    async fn run(&self, ntp: &Ntp) -> WorkResult {
        *self.calls.lock().entry(ntp.clone()).or_default() += 1;
        let gate = self.gates.lock().get(ntp).cloned();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate semaphore closed");
            permit.forget();
        }
        let scripted = self
            .results
            .lock()
            .get_mut(ntp)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or(Ok(()))
    }
}

#[async_trait::async_trait]
impl PartitionWorkRunner for ScriptedWorkRunner {
    async fn run_inbound(&self, ntp: &Ntp, _info: &InboundPartitionWorkInfo) -> WorkResult {
        self.run(ntp).await
    }

    async fn run_outbound(
        &self,
        ntp: &Ntp,
        _info: &OutboundPartitionWorkInfo,
        sought_state: MigrationState,
    ) -> WorkResult {
        self.outbound_log
            .lock()
            .entry(ntp.clone())
            .or_default()
            .push(sought_state);
        self.run(ntp).await
    }
}

impl fmt::Debug for ScriptedWorkRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedWorkRunner")
            .field("total_calls", &self.total_calls())
            .finish()
    }
}

/// One node of the in-process cluster.
pub struct TestNode {
    pub node_id: NodeId,
    pub shards: Arc<ShardDirectory>,
    pub runner: Arc<ScriptedWorkRunner>,
    pub worker: Arc<Worker>,
    pub backend: Backend,
}

/// A fully wired in-process cluster: shared tables, per-node backends and
/// workers, and the in-memory router as transport. Node 1 starts as the
/// controller leader.
pub struct TestCluster {
    pub table: Arc<MigrationTable>,
    pub topics: Arc<TopicTable>,
    pub leaders: Arc<LeadersTable>,
    pub router: Arc<InMemoryStatusRouter>,
    pub shutdown: CancellationToken,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start a cluster of `node_count` nodes with test-speed intervals.
    pub async fn start(node_count: usize) -> Self {
        let table = Arc::new(MigrationTable::new());
        let topics = Arc::new(TopicTable::new());
        let leaders = Arc::new(LeadersTable::new());
        let router = Arc::new(InMemoryStatusRouter::new());
        let shutdown = CancellationToken::new();
        let config = BackendConfig::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_retry_backoff(Duration::from_millis(50))
            .with_rpc_timeout(Duration::from_secs(1));

        let mut nodes = Vec::with_capacity(node_count);
        for node_id in 1..=node_count as NodeId {
            let shards = Arc::new(ShardDirectory::new());
            let runner = Arc::new(ScriptedWorkRunner::new());
            let metrics = Arc::new(MigrationMetrics::new());
            let worker = Arc::new(Worker::new(
                node_id,
                WorkerConfig::new().with_operation_timeout(Duration::from_secs(1)),
                Arc::clone(&leaders),
                Arc::clone(&runner) as Arc<dyn PartitionWorkRunner>,
                Arc::clone(&metrics),
                &shutdown,
            ));
            let backend = Backend::new(
                node_id,
                config.clone(),
                Arc::clone(&table),
                Arc::clone(&topics),
                Arc::clone(&leaders),
                Arc::clone(&shards),
                Arc::clone(&worker),
                Arc::clone(&router) as Arc<dyn StatusRpcClient>,
                metrics,
                &shutdown,
            );
            router.register(node_id, backend.rpc_handler());
            backend.start();
            nodes.push(TestNode {
                node_id,
                shards,
                runner,
                worker,
                backend,
            });
        }
        leaders.set_leader(&Ntp::controller(), Some(1));

        Self {
            table,
            topics,
            leaders,
            router,
            shutdown,
            nodes,
        }
    }

    /// Look up a node by id.
    pub fn node(&self, node_id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.node_id == node_id)
            .expect("unknown test node")
    }

    /// Create a topic whose every partition is replicated on `replicas`,
    /// assign each replica a shard, and elect the first replica as leader.
    pub fn create_topic(&self, topic: &str, partitions: u32, replicas: &[NodeId]) {
        let assignments = (0..partitions)
            .map(|partition| PartitionAssignment {
                partition,
                replicas: replicas.to_vec(),
            })
            .collect();
        self.topics.create_topic(topic, assignments);
        for partition in 0..partitions {
            let ntp = Ntp::new(topic, partition);
            for &node in replicas {
                self.node(node).shards.set_shard(&ntp, Some(0));
            }
            self.leaders.set_leader(&ntp, Some(replicas[0]));
        }
    }

    /// Move the coordinator role to `node`.
    pub fn set_controller_leader(&self, node: NodeId) {
        self.leaders.set_leader(&Ntp::controller(), Some(node));
    }

    /// The table's current sought state for `migration`.
    pub fn sought_state(&self, migration: MigrationId) -> Option<MigrationState> {
        self.table.get(migration).map(|metadata| metadata.sought_state)
    }

    /// Stop every backend and worker.
    pub async fn stop(&self) {
        for node in &self.nodes {
            node.backend.stop().await;
            node.worker.stop().await;
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Opt-in tracing output for debugging a failing test:
/// `RUST_LOG=caravan=debug cargo test -- --nocapture`.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
