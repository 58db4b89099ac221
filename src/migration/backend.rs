//! The migration backend: per-node local reconciler and cluster coordinator.
//!
//! On every node the backend translates declared migrations into per-ntp
//! work items and hands them to the worker. On the node that currently
//! leads the cluster-controller partition it additionally acts as the
//! coordinator: it polls every node for per-partition status and writes an
//! advance to the migration table once a migration's sought state has been
//! reached everywhere.
//!
//! A single loop fiber performs work cycles under the backend mutex; event
//! handlers only enqueue and wake. Coordinator-side invariants (the ntp
//! sets tracked in `migration_states` and `node_states` mirror each other,
//! at most one status RPC per node in flight, retry deadlines only for
//! nodes still awaited) therefore hold between cycles.

use crate::cluster::{
    LeadersTable, MigrationTable, ShardDirectory, SubscriptionId, TopicDelta, TopicTable,
};
use crate::config::BackendConfig;
use crate::error::{Error, Result, WorkError, WorkResult};
use crate::metrics::MigrationMetrics;
use crate::migration::rpc::{
    CheckNtpStatesReply, CheckNtpStatesRequest, NtpStateEntry, NtpStateReplyEntry,
    StatusRpcClient, StatusRpcHandler,
};
use crate::migration::work::{
    InboundPartitionWorkInfo, OutboundPartitionWorkInfo, PartitionWork, PartitionWorkInfo,
};
use crate::migration::worker::Worker;
use crate::types::{
    Migration, MigrationId, MigrationMetadata, MigrationState, NodeId, Ntp, PartitionId, ShardId,
    TopicName,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Progress of one locally-hosted replica towards its sought state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// The replica has not been located on a shard yet.
    WaitingForRpc,
    /// The replica has a shard and work can be scheduled.
    CanRun,
    /// A work item has been handed to the worker.
    Running,
    /// The replica has reached the sought state.
    Done,
}

/// Node-local work state for one replica. `shard` is set iff the status is
/// not `WaitingForRpc`.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaWorkState {
    pub(crate) migration: MigrationId,
    pub(crate) sought_state: MigrationState,
    pub(crate) shard: Option<ShardId>,
    pub(crate) status: ReplicaStatus,
}

impl ReplicaWorkState {
    fn new(migration: MigrationId, sought_state: MigrationState) -> Self {
        Self {
            migration,
            sought_state,
            shard: None,
            status: ReplicaStatus::WaitingForRpc,
        }
    }
}

/// Partitions of one topic still awaiting confirmation, and from which
/// replica nodes.
#[derive(Debug, Default)]
struct TopicReconciliationState {
    outstanding_partitions: HashMap<PartitionId, HashSet<NodeId>>,
}

#[derive(Debug)]
struct MigrationReconciliationState {
    sought_state: MigrationState,
    outstanding_topics: HashMap<TopicName, TopicReconciliationState>,
}

#[derive(Debug, Clone, Copy)]
struct AdvanceInfo {
    to: MigrationState,
    sent: bool,
}

/// Coordinator-side tracking, rebuilt from the migration table whenever
/// this node gains the coordinator role and dropped when it loses it.
#[derive(Debug, Default)]
pub(crate) struct CoordinatorState {
    migration_states: HashMap<MigrationId, MigrationReconciliationState>,
    /// Reverse index over the topics in `migration_states`.
    topic_migration_map: HashMap<TopicName, MigrationId>,
    /// Which ntps are currently awaited from each node.
    node_states: HashMap<NodeId, HashMap<Ntp, MigrationId>>,
    /// Nodes whose status RPC failed, and when to re-query them.
    nodes_to_retry: HashMap<NodeId, Instant>,
    /// Nodes with a status RPC currently in flight.
    in_flight: HashSet<NodeId>,
    /// Migrations cleared to advance; each is written at most once.
    advance_requests: HashMap<MigrationId, AdvanceInfo>,
}

pub(crate) struct BackendState {
    is_controller_leader: bool,
    pub(crate) work_states: HashMap<TopicName, HashMap<PartitionId, ReplicaWorkState>>,
    coordinator: Option<CoordinatorState>,
}

enum BackendEvent {
    MigrationUpdated(MigrationId),
    ControllerLeadership(Option<NodeId>),
    TopicDelta(TopicDelta),
    ShardUpdated {
        ntp: Ntp,
        shard: Option<ShardId>,
    },
    WorkCompleted {
        ntp: Ntp,
        migration: MigrationId,
        sought_state: MigrationState,
        result: WorkResult,
    },
    RpcCompleted {
        node: NodeId,
        request: CheckNtpStatesRequest,
        result: Result<CheckNtpStatesReply>,
    },
    AdvanceCompleted {
        migration: MigrationId,
        to: MigrationState,
        result: Result<()>,
    },
}

struct BackendSubscriptions {
    table: SubscriptionId,
    controller: SubscriptionId,
    topics: SubscriptionId,
    shards: SubscriptionId,
}

struct BackendInner {
    node_id: NodeId,
    config: BackendConfig,
    table: Arc<MigrationTable>,
    topics: Arc<TopicTable>,
    leaders: Arc<LeadersTable>,
    shards: Arc<ShardDirectory>,
    worker: Arc<Worker>,
    rpc: Arc<dyn StatusRpcClient>,
    metrics: Arc<MigrationMetrics>,
    state: tokio::sync::Mutex<BackendState>,
    ingress: parking_lot::Mutex<Vec<BackendEvent>>,
    wakeup: Notify,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    subscriptions: parking_lot::Mutex<Option<BackendSubscriptions>>,
}

/// The per-node migration backend.
pub struct Backend {
    inner: Arc<BackendInner>,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Create a backend. `shutdown` is the process-wide abort signal; the
    /// backend derives a child token so `stop` is scoped to itself.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        config: BackendConfig,
        table: Arc<MigrationTable>,
        topics: Arc<TopicTable>,
        leaders: Arc<LeadersTable>,
        shards: Arc<ShardDirectory>,
        worker: Arc<Worker>,
        rpc: Arc<dyn StatusRpcClient>,
        metrics: Arc<MigrationMetrics>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                node_id,
                config,
                table,
                topics,
                leaders,
                shards,
                worker,
                rpc,
                metrics,
                state: tokio::sync::Mutex::new(BackendState {
                    is_controller_leader: false,
                    work_states: HashMap::new(),
                    coordinator: None,
                }),
                ingress: parking_lot::Mutex::new(Vec::new()),
                wakeup: Notify::new(),
                shutdown: shutdown.child_token(),
                tasks: TaskTracker::new(),
                subscriptions: parking_lot::Mutex::new(None),
            }),
            loop_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Register the event subscriptions and spawn the loop fiber.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut loop_handle = self.loop_handle.lock();
        if loop_handle.is_some() {
            return;
        }

        inner.enqueue(BackendEvent::ControllerLeadership(
            inner.leaders.leader_of(&Ntp::controller()),
        ));

        let weak = Arc::downgrade(inner);
        let table_sub = inner.table.subscribe(move |migration| {
            if let Some(inner) = weak.upgrade() {
                inner.enqueue(BackendEvent::MigrationUpdated(migration));
            }
        });
        let weak = Arc::downgrade(inner);
        let controller_sub = inner
            .leaders
            .subscribe(Ntp::controller(), move |_ntp, leader| {
                if let Some(inner) = weak.upgrade() {
                    inner.enqueue(BackendEvent::ControllerLeadership(leader));
                }
            });
        let weak = Arc::downgrade(inner);
        let topic_sub = inner.topics.subscribe(move |delta| {
            if let Some(inner) = weak.upgrade() {
                inner.enqueue(BackendEvent::TopicDelta(delta.clone()));
            }
        });
        let weak = Arc::downgrade(inner);
        let shard_sub = inner.shards.subscribe(move |ntp, shard| {
            if let Some(inner) = weak.upgrade() {
                inner.enqueue(BackendEvent::ShardUpdated {
                    ntp: ntp.clone(),
                    shard,
                });
            }
        });
        *inner.subscriptions.lock() = Some(BackendSubscriptions {
            table: table_sub,
            controller: controller_sub,
            topics: topic_sub,
            shards: shard_sub,
        });

        let inner = Arc::clone(&self.inner);
        *loop_handle = Some(tokio::spawn(async move { inner.run_loop().await }));
    }

    /// Stop the loop fiber, cancel outstanding work, and deregister the
    /// event subscriptions. Returns once every spawned task has settled.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.wakeup.notify_one();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        let subscriptions = self.inner.subscriptions.lock().take();
        if let Some(subs) = subscriptions {
            self.inner.table.unsubscribe(subs.table);
            self.inner.leaders.unsubscribe(subs.controller);
            self.inner.topics.unsubscribe(subs.topics);
            self.inner.shards.unsubscribe(subs.shards);
        }
        tracing::debug!(node = self.inner.node_id, "migration backend stopped");
    }

    /// The handler answering status RPCs addressed to this node.
    pub fn rpc_handler(&self) -> Arc<dyn StatusRpcHandler> {
        Arc::clone(&self.inner) as Arc<dyn StatusRpcHandler>
    }

    /// This node's migration metrics.
    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.inner.metrics
    }

    /// Wake the loop for an immediate work cycle.
    pub fn wakeup(&self) {
        self.inner.wakeup.notify_one();
    }

    /// Whether this node currently acts as the coordinator.
    pub async fn is_coordinator(&self) -> bool {
        self.inner.state.lock().await.coordinator.is_some()
    }

    /// Progress of the locally-hosted replica of `ntp`, if tracked.
    pub async fn replica_status(
        &self,
        ntp: &Ntp,
    ) -> Option<(MigrationId, MigrationState, ReplicaStatus)> {
        let state = self.inner.state.lock().await;
        state
            .work_states
            .get(&ntp.topic)
            .and_then(|partitions| partitions.get(&ntp.partition))
            .map(|replica| (replica.migration, replica.sought_state, replica.status))
    }

    /// Migrations currently tracked by the coordinator role, if held.
    pub async fn tracked_migrations(&self) -> Vec<MigrationId> {
        let state = self.inner.state.lock().await;
        state
            .coordinator
            .as_ref()
            .map(|coord| {
                let mut ids: Vec<MigrationId> = coord.migration_states.keys().copied().collect();
                ids.sort_unstable();
                ids
            })
            .unwrap_or_default()
    }

    /// Stable rendering of the node-local reconciliation state, used by
    /// idempotence checks.
    pub(crate) async fn state_fingerprint(&self) -> String {
        let state = self.inner.state.lock().await;
        let mut replicas: BTreeMap<String, String> = BTreeMap::new();
        for (topic, partitions) in &state.work_states {
            for (partition, replica) in partitions {
                replicas.insert(
                    format!("{topic}/{partition}"),
                    format!(
                        "{}@{}:{:?}/{:?}",
                        replica.migration, replica.sought_state, replica.shard, replica.status
                    ),
                );
            }
        }
        format!("{replicas:?}|{:?}", self.coordinator_fingerprint_locked(&state))
    }

    /// Stable rendering of the coordinator tracking, if the role is held.
    pub(crate) async fn coordinator_fingerprint(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        self.coordinator_fingerprint_locked(&state)
    }

    fn coordinator_fingerprint_locked(&self, state: &BackendState) -> Option<String> {
        let coord = state.coordinator.as_ref()?;
        let mut outstanding: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
        for (migration, ms) in &coord.migration_states {
            for (topic, ts) in &ms.outstanding_topics {
                for (partition, nodes) in &ts.outstanding_partitions {
                    outstanding.insert(
                        format!("{migration}@{}:{topic}/{partition}", ms.sought_state),
                        nodes.iter().copied().collect(),
                    );
                }
            }
        }
        let mut node_states: BTreeMap<NodeId, BTreeMap<String, MigrationId>> = BTreeMap::new();
        for (node, ntps) in &coord.node_states {
            let entries = ntps
                .iter()
                .map(|(ntp, migration)| (ntp.to_string(), *migration))
                .collect();
            node_states.insert(*node, entries);
        }
        let mut advances: BTreeMap<MigrationId, MigrationState> = BTreeMap::new();
        for (migration, info) in &coord.advance_requests {
            advances.insert(*migration, info.to);
        }
        Some(format!("{outstanding:?}|{node_states:?}|{advances:?}"))
    }

    /// Assert the coordinator-side structural invariants. No-op when this
    /// node does not hold the role.
    pub(crate) async fn assert_coordinator_invariants(&self) {
        let state = self.inner.state.lock().await;
        let Some(coord) = state.coordinator.as_ref() else {
            return;
        };
        let mut from_migrations: HashSet<(NodeId, Ntp, MigrationId)> = HashSet::new();
        for (migration, ms) in &coord.migration_states {
            for (topic, ts) in &ms.outstanding_topics {
                assert_eq!(
                    coord.topic_migration_map.get(topic),
                    Some(migration),
                    "topic {topic} missing from the reverse map"
                );
                for (partition, nodes) in &ts.outstanding_partitions {
                    assert!(!nodes.is_empty(), "empty replica set for {topic}/{partition}");
                    for node in nodes {
                        from_migrations.insert((
                            *node,
                            Ntp::new(topic.clone(), *partition),
                            *migration,
                        ));
                    }
                }
            }
        }
        let mut from_nodes: HashSet<(NodeId, Ntp, MigrationId)> = HashSet::new();
        for (node, ntps) in &coord.node_states {
            for (ntp, migration) in ntps {
                from_nodes.insert((*node, ntp.clone(), *migration));
            }
        }
        assert_eq!(
            from_migrations, from_nodes,
            "migration_states and node_states must track the same ntp set"
        );
        for node in coord.nodes_to_retry.keys() {
            assert!(
                coord.node_states.contains_key(node),
                "retry deadline for node {node} that is not awaited"
            );
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("node_id", &self.inner.node_id)
            .finish()
    }
}

#[async_trait::async_trait]
impl StatusRpcHandler for BackendInner {
    async fn check_ntp_states(&self, request: CheckNtpStatesRequest) -> CheckNtpStatesReply {
        self.check_ntp_states_locally(request).await
    }
}

impl BackendInner {
    fn enqueue(&self, event: BackendEvent) {
        self.ingress.lock().push(event);
        self.wakeup.notify_one();
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::debug!(node = self.node_id, "migration backend loop started");
        loop {
            self.work_cycle().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(node = self.node_id, "migration backend loop exited");
    }

    /// One end-to-end pass: drain queued events, reconcile local work
    /// against the table snapshot, then run the coordinator side if this
    /// node holds the role.
    async fn work_cycle(self: &Arc<Self>) {
        let events: Vec<BackendEvent> = std::mem::take(&mut *self.ingress.lock());
        let mut state = self.state.lock().await;
        for event in events {
            self.apply_event(&mut state, event);
        }

        let migrations = self.table.snapshot();
        self.reconcile_local(&mut state, &migrations);

        if state.is_controller_leader {
            if state.coordinator.is_none() {
                tracing::info!(node = self.node_id, "acquired coordinator role");
                self.metrics.coordinator_active.set(1);
            }
            let coord = state.coordinator.get_or_insert_with(CoordinatorState::default);
            self.refresh_coordinator(coord, &migrations);
            self.send_status_rpcs(coord);
            self.spawn_advances(coord);
        } else if state.coordinator.take().is_some() {
            tracing::info!(node = self.node_id, "lost coordinator role, dropping state");
            self.metrics.coordinator_active.set(0);
        }
    }

    fn apply_event(self: &Arc<Self>, state: &mut BackendState, event: BackendEvent) {
        match event {
            BackendEvent::MigrationUpdated(migration) => {
                // The cycle re-derives from the table snapshot; the
                // notification only needs to wake the loop.
                tracing::debug!(migration, "migration table notification");
            }
            BackendEvent::ControllerLeadership(leader) => {
                state.is_controller_leader = leader == Some(self.node_id);
            }
            BackendEvent::TopicDelta(delta) => self.apply_topic_delta(state, delta),
            BackendEvent::ShardUpdated { ntp, shard } => {
                self.apply_shard_update(state, &ntp, shard);
            }
            BackendEvent::WorkCompleted {
                ntp,
                migration,
                sought_state,
                result,
            } => {
                self.on_partition_work_completed(state, &ntp, migration, sought_state, result);
            }
            BackendEvent::RpcCompleted {
                node,
                request,
                result,
            } => {
                self.on_rpc_completed(state, node, request, result);
            }
            BackendEvent::AdvanceCompleted {
                migration,
                to,
                result,
            } => {
                self.on_advance_completed(state, migration, to, result);
            }
        }
    }

    /// Deltas are buffered and applied at the top of the cycle so the shard
    /// directory and work states never diverge mid-cycle.
    fn apply_topic_delta(&self, state: &mut BackendState, delta: TopicDelta) {
        match delta {
            TopicDelta::PartitionAdded { ntp, replicas } => {
                if let Some(coord) = state.coordinator.as_mut() {
                    if let Some(&migration) = coord.topic_migration_map.get(&ntp.topic) {
                        if let Some(ms) = coord.migration_states.get_mut(&migration) {
                            let ts = ms.outstanding_topics.entry(ntp.topic.clone()).or_default();
                            ts.outstanding_partitions
                                .insert(ntp.partition, replicas.iter().copied().collect());
                            for node in &replicas {
                                coord
                                    .node_states
                                    .entry(*node)
                                    .or_default()
                                    .insert(ntp.clone(), migration);
                            }
                        }
                    }
                }
                // The local side is picked up by the next reconcile pass.
            }
            TopicDelta::PartitionRemoved { ntp } => {
                self.drop_local_replica(state, &ntp);
                if let Some(coord) = state.coordinator.as_mut() {
                    Self::drop_partition_tracking(coord, &ntp, &self.metrics);
                }
            }
            TopicDelta::ReplicasMoved { ntp, replicas } => {
                if !replicas.contains(&self.node_id) {
                    self.drop_local_replica(state, &ntp);
                }
                if let Some(coord) = state.coordinator.as_mut() {
                    if replicas.is_empty() {
                        // a partition with no replicas has nothing left to confirm
                        Self::drop_partition_tracking(coord, &ntp, &self.metrics);
                    } else {
                        Self::reset_partition_replicas(coord, &ntp, &replicas);
                    }
                }
            }
        }
    }

    /// Drop the local work state for `ntp`, aborting any worker job.
    fn drop_local_replica(&self, state: &mut BackendState, ntp: &Ntp) {
        let Some(partitions) = state.work_states.get_mut(&ntp.topic) else {
            return;
        };
        let Some(replica) = partitions.remove(&ntp.partition) else {
            return;
        };
        if partitions.is_empty() {
            state.work_states.remove(&ntp.topic);
        }
        tracing::debug!(%ntp, migration = replica.migration, "dropping local replica work state");
        self.worker
            .abort_partition_work(ntp, replica.migration, replica.sought_state);
    }

    /// Remove a partition from coordinator tracking entirely, advancing the
    /// migration if it was the last outstanding one.
    fn drop_partition_tracking(
        coord: &mut CoordinatorState,
        ntp: &Ntp,
        metrics: &MigrationMetrics,
    ) {
        for ntps in coord.node_states.values_mut() {
            ntps.remove(ntp);
        }
        coord.node_states.retain(|_, ntps| !ntps.is_empty());
        let awaited: HashSet<NodeId> = coord.node_states.keys().copied().collect();
        coord.nodes_to_retry.retain(|node, _| awaited.contains(node));

        let Some(&migration) = coord.topic_migration_map.get(&ntp.topic) else {
            return;
        };
        let Some(ms) = coord.migration_states.get_mut(&migration) else {
            return;
        };
        let Some(ts) = ms.outstanding_topics.get_mut(&ntp.topic) else {
            return;
        };
        ts.outstanding_partitions.remove(&ntp.partition);
        if ts.outstanding_partitions.is_empty() {
            ms.outstanding_topics.remove(&ntp.topic);
            coord.topic_migration_map.remove(&ntp.topic);
        }
        if ms.outstanding_topics.is_empty() {
            let sought_state = ms.sought_state;
            coord.migration_states.remove(&migration);
            Self::queue_advance(coord, migration, sought_state, metrics);
        }
    }

    /// Re-confirm a moved partition against its new replica set.
    fn reset_partition_replicas(coord: &mut CoordinatorState, ntp: &Ntp, replicas: &[NodeId]) {
        let Some(&migration) = coord.topic_migration_map.get(&ntp.topic) else {
            return;
        };
        for ntps in coord.node_states.values_mut() {
            if ntps.get(ntp) == Some(&migration) {
                ntps.remove(ntp);
            }
        }
        coord.node_states.retain(|_, ntps| !ntps.is_empty());
        let awaited: HashSet<NodeId> = coord.node_states.keys().copied().collect();
        coord.nodes_to_retry.retain(|node, _| awaited.contains(node));

        let Some(ms) = coord.migration_states.get_mut(&migration) else {
            return;
        };
        let Some(ts) = ms.outstanding_topics.get_mut(&ntp.topic) else {
            return;
        };
        if !ts.outstanding_partitions.contains_key(&ntp.partition) {
            // already confirmed before the move
            return;
        }
        ts.outstanding_partitions
            .insert(ntp.partition, replicas.iter().copied().collect());
        for node in replicas {
            coord
                .node_states
                .entry(*node)
                .or_default()
                .insert(ntp.clone(), migration);
        }
    }

    fn apply_shard_update(&self, state: &mut BackendState, ntp: &Ntp, shard: Option<ShardId>) {
        let Some(replica) = state
            .work_states
            .get_mut(&ntp.topic)
            .and_then(|partitions| partitions.get_mut(&ntp.partition))
        else {
            return;
        };
        match shard {
            Some(shard) => {
                replica.shard = Some(shard);
                if replica.status == ReplicaStatus::WaitingForRpc {
                    replica.status = ReplicaStatus::CanRun;
                }
            }
            None => {
                if replica.status == ReplicaStatus::Running {
                    self.worker
                        .abort_partition_work(ntp, replica.migration, replica.sought_state);
                }
                replica.shard = None;
                replica.status = ReplicaStatus::WaitingForRpc;
            }
        }
    }

    /// Completion callback: the worker resolved a work item for `ntp`.
    fn on_partition_work_completed(
        &self,
        state: &mut BackendState,
        ntp: &Ntp,
        migration: MigrationId,
        sought_state: MigrationState,
        result: WorkResult,
    ) {
        let Some(replica) = state
            .work_states
            .get_mut(&ntp.topic)
            .and_then(|partitions| partitions.get_mut(&ntp.partition))
        else {
            return;
        };
        if replica.migration != migration
            || replica.sought_state != sought_state
            || replica.status != ReplicaStatus::Running
        {
            return;
        }
        match result {
            Ok(()) => {
                tracing::debug!(%ntp, migration, sought_state = %sought_state, "partition work done");
                replica.status = ReplicaStatus::Done;
            }
            Err(error) => {
                // Terminal non-success: leave the replica runnable so a
                // later cycle can schedule it again if still wanted.
                tracing::debug!(%ntp, migration, %error, "partition work ended without success");
                replica.status = ReplicaStatus::CanRun;
            }
        }
    }

    /// Local reconciliation: make `work_states` mirror the replicas this
    /// node hosts for migrations that currently need partition work, and
    /// push runnable ones to the worker.
    fn reconcile_local(
        self: &Arc<Self>,
        state: &mut BackendState,
        migrations: &[MigrationMetadata],
    ) {
        let mut desired: HashMap<Ntp, (MigrationId, MigrationState)> = HashMap::new();
        let mut by_id: HashMap<MigrationId, &MigrationMetadata> = HashMap::new();
        for metadata in migrations {
            by_id.insert(metadata.id, metadata);
            if !metadata
                .migration
                .requires_partition_work(metadata.sought_state)
            {
                continue;
            }
            for topic in metadata.migration.topics() {
                for assignment in self.topics.partitions(topic) {
                    if assignment.replicas.contains(&self.node_id) {
                        desired.insert(
                            Ntp::new(topic.clone(), assignment.partition),
                            (metadata.id, metadata.sought_state),
                        );
                    }
                }
            }
        }

        let mut stale: Vec<Ntp> = Vec::new();
        for (topic, partitions) in &state.work_states {
            for (partition, replica) in partitions {
                let ntp = Ntp::new(topic.clone(), *partition);
                if desired.get(&ntp) != Some(&(replica.migration, replica.sought_state)) {
                    stale.push(ntp);
                }
            }
        }
        for ntp in stale {
            self.drop_local_replica(state, &ntp);
        }

        for (ntp, (migration, sought_state)) in desired {
            let replica = state
                .work_states
                .entry(ntp.topic.clone())
                .or_default()
                .entry(ntp.partition)
                .or_insert_with(|| {
                    tracing::debug!(
                        %ntp,
                        migration,
                        sought_state = %sought_state,
                        "tracking local replica"
                    );
                    ReplicaWorkState::new(migration, sought_state)
                });
            if replica.status == ReplicaStatus::WaitingForRpc {
                if let Some(shard) = self.shards.shard_of(&ntp) {
                    replica.shard = Some(shard);
                    replica.status = ReplicaStatus::CanRun;
                }
            }
            if replica.status == ReplicaStatus::CanRun {
                let Some(metadata) = by_id.get(&migration) else {
                    continue;
                };
                self.start_partition_work(&ntp, replica, metadata);
            }
        }
    }

    /// Hand one work item to the worker and watch its completion.
    fn start_partition_work(
        self: &Arc<Self>,
        ntp: &Ntp,
        replica: &mut ReplicaWorkState,
        metadata: &MigrationMetadata,
    ) {
        replica.status = ReplicaStatus::Running;
        let work = PartitionWork {
            migration: replica.migration,
            sought_state: replica.sought_state,
            info: Self::partition_work_info(&metadata.migration),
        };
        tracing::debug!(
            %ntp,
            migration = replica.migration,
            sought_state = %replica.sought_state,
            shard = ?replica.shard,
            "starting partition work"
        );
        let completion = self.worker.perform_partition_work(ntp.clone(), work);
        let inner = Arc::clone(self);
        let ntp = ntp.clone();
        let migration = replica.migration;
        let sought_state = replica.sought_state;
        self.tasks.spawn(async move {
            let result = tokio::select! {
                _ = inner.shutdown.cancelled() => Err(WorkError::ShuttingDown),
                result = completion => result.unwrap_or(Err(WorkError::ShuttingDown)),
            };
            inner.enqueue(BackendEvent::WorkCompleted {
                ntp,
                migration,
                sought_state,
                result,
            });
        });
    }

    fn partition_work_info(migration: &Migration) -> PartitionWorkInfo {
        match migration {
            Migration::Inbound(inbound) => PartitionWorkInfo::Inbound(InboundPartitionWorkInfo {
                source: inbound.source.clone(),
            }),
            Migration::Outbound(outbound) => {
                PartitionWorkInfo::Outbound(OutboundPartitionWorkInfo {
                    target: outbound.target.clone(),
                })
            }
        }
    }

    /// Answer a status request from the local replica work states.
    ///
    /// Partition work is executed by the leader replica, so a node that
    /// does not lead the partition has nothing of its own to confirm: it
    /// reports reached as long as some other node holds the leadership.
    /// With no leader at all nothing vouches for the work, and the entry
    /// stays unreached until one is elected.
    pub(crate) async fn check_ntp_states_locally(
        &self,
        request: CheckNtpStatesRequest,
    ) -> CheckNtpStatesReply {
        let state = self.state.lock().await;
        let entries = request
            .entries
            .iter()
            .map(|entry| {
                let done = state
                    .work_states
                    .get(&entry.ntp.topic)
                    .and_then(|partitions| partitions.get(&entry.ntp.partition))
                    .map(|replica| {
                        replica.migration == entry.migration
                            && replica.sought_state == entry.sought_state
                            && replica.status == ReplicaStatus::Done
                    })
                    .unwrap_or(false);
                let led_elsewhere = matches!(
                    self.leaders.leader_of(&entry.ntp),
                    Some(leader) if leader != self.node_id
                );
                NtpStateReplyEntry {
                    ntp: entry.ntp.clone(),
                    migration: entry.migration,
                    reached: done || led_elsewhere,
                    error: None,
                }
            })
            .collect();
        CheckNtpStatesReply { entries }
    }

    /// Bring coordinator tracking in line with the table snapshot: drop
    /// migrations the table no longer lists at the tracked sought state,
    /// start tracking new ones.
    fn refresh_coordinator(
        self: &Arc<Self>,
        coord: &mut CoordinatorState,
        migrations: &[MigrationMetadata],
    ) {
        let tracked: Vec<MigrationId> = coord.migration_states.keys().copied().collect();
        for migration in tracked {
            let keep = migrations.iter().any(|metadata| {
                metadata.id == migration
                    && metadata.sought_state == coord.migration_states[&migration].sought_state
                    && metadata
                        .migration
                        .requires_partition_work(metadata.sought_state)
            });
            if !keep {
                tracing::debug!(migration, "dropping stale coordinator tracking");
                Self::drop_migration_tracking(coord, migration);
            }
        }

        coord.advance_requests.retain(|migration, info| {
            migrations
                .iter()
                .any(|metadata| {
                    metadata.id == *migration && metadata.sought_state.next() == Some(info.to)
                })
        });

        for metadata in migrations {
            if !metadata
                .migration
                .requires_partition_work(metadata.sought_state)
            {
                continue;
            }
            if coord.migration_states.contains_key(&metadata.id)
                || coord.advance_requests.contains_key(&metadata.id)
            {
                continue;
            }
            let mut ms = MigrationReconciliationState {
                sought_state: metadata.sought_state,
                outstanding_topics: HashMap::new(),
            };
            for topic in metadata.migration.topics() {
                let mut ts = TopicReconciliationState::default();
                for assignment in self.topics.partitions(topic) {
                    if assignment.replicas.is_empty() {
                        continue;
                    }
                    let ntp = Ntp::new(topic.clone(), assignment.partition);
                    ts.outstanding_partitions
                        .insert(assignment.partition, assignment.replicas.iter().copied().collect());
                    for node in &assignment.replicas {
                        coord
                            .node_states
                            .entry(*node)
                            .or_default()
                            .insert(ntp.clone(), metadata.id);
                    }
                }
                if !ts.outstanding_partitions.is_empty() {
                    coord.topic_migration_map.insert(topic.clone(), metadata.id);
                    ms.outstanding_topics.insert(topic.clone(), ts);
                }
            }
            tracing::info!(
                migration = metadata.id,
                sought_state = %metadata.sought_state,
                topics = ms.outstanding_topics.len(),
                "coordinator tracking migration"
            );
            if ms.outstanding_topics.is_empty() {
                // nothing to confirm, clear to advance immediately
                Self::queue_advance(coord, metadata.id, metadata.sought_state, &self.metrics);
            } else {
                coord.migration_states.insert(metadata.id, ms);
            }
        }
    }

    /// Drop every trace of a migration from coordinator tracking.
    fn drop_migration_tracking(coord: &mut CoordinatorState, migration: MigrationId) {
        let Some(ms) = coord.migration_states.remove(&migration) else {
            return;
        };
        for topic in ms.outstanding_topics.keys() {
            coord.topic_migration_map.remove(topic);
        }
        coord.node_states.retain(|_, ntps| {
            ntps.retain(|_, tracked| *tracked != migration);
            !ntps.is_empty()
        });
        let awaited: HashSet<NodeId> = coord.node_states.keys().copied().collect();
        coord.nodes_to_retry.retain(|node, _| awaited.contains(node));
    }

    /// Fan out one status RPC per awaited node, respecting retry deadlines
    /// and the one-in-flight-per-node rule.
    fn send_status_rpcs(self: &Arc<Self>, coord: &mut CoordinatorState) {
        let now = Instant::now();
        let candidates: Vec<NodeId> = coord.node_states.keys().copied().collect();
        for node in candidates {
            if coord.in_flight.contains(&node) {
                continue;
            }
            if coord
                .nodes_to_retry
                .get(&node)
                .is_some_and(|deadline| *deadline > now)
            {
                continue;
            }
            coord.nodes_to_retry.remove(&node);
            let entries: Vec<NtpStateEntry> = coord.node_states[&node]
                .iter()
                .filter_map(|(ntp, migration)| {
                    coord
                        .migration_states
                        .get(migration)
                        .map(|ms| NtpStateEntry {
                            ntp: ntp.clone(),
                            migration: *migration,
                            sought_state: ms.sought_state,
                        })
                })
                .collect();
            if entries.is_empty() {
                continue;
            }
            coord.in_flight.insert(node);
            self.metrics.status_rpcs_sent.inc();
            let request = CheckNtpStatesRequest { entries };
            tracing::debug!(node, entries = request.entries.len(), "querying ntp states");
            let inner = Arc::clone(self);
            self.tasks.spawn(async move {
                let result = tokio::select! {
                    _ = inner.shutdown.cancelled() => Err(Error::ShuttingDown),
                    result = inner.dispatch_status_request(node, request.clone()) => result,
                };
                inner.enqueue(BackendEvent::RpcCompleted {
                    node,
                    request,
                    result,
                });
            });
        }
    }

    /// Send a status request to `node`, answering locally for self.
    async fn dispatch_status_request(
        &self,
        node: NodeId,
        request: CheckNtpStatesRequest,
    ) -> Result<CheckNtpStatesReply> {
        if node == self.node_id {
            return Ok(self.check_ntp_states_locally(request).await);
        }
        match tokio::time::timeout(
            self.config.rpc_timeout,
            self.rpc.check_ntp_states(node, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Rpc {
                node,
                error: WorkError::Timeout,
            }),
        }
    }

    fn on_rpc_completed(
        &self,
        state: &mut BackendState,
        node: NodeId,
        request: CheckNtpStatesRequest,
        result: Result<CheckNtpStatesReply>,
    ) {
        let Some(coord) = state.coordinator.as_mut() else {
            return;
        };
        coord.in_flight.remove(&node);
        match result {
            Ok(reply) => {
                let mut needs_retry = false;
                let mut replied: HashSet<&Ntp> = HashSet::new();
                for entry in &reply.entries {
                    replied.insert(&entry.ntp);
                    if let Some(error) = entry.error {
                        tracing::debug!(node, ntp = %entry.ntp, %error, "ntp state check failed");
                        needs_retry = true;
                        continue;
                    }
                    if entry.reached {
                        Self::mark_step_done(coord, node, &entry.ntp, entry.migration, &self.metrics);
                    }
                }
                if request
                    .entries
                    .iter()
                    .any(|entry| !replied.contains(&entry.ntp))
                {
                    tracing::debug!(node, "status reply omitted awaited ntps");
                    needs_retry = true;
                }
                if needs_retry && coord.node_states.contains_key(&node) {
                    coord
                        .nodes_to_retry
                        .insert(node, Instant::now() + self.config.retry_backoff);
                }
            }
            Err(error) => {
                tracing::warn!(node, %error, "status rpc failed");
                self.metrics.status_rpcs_failed.inc();
                if coord.node_states.contains_key(&node) {
                    coord
                        .nodes_to_retry
                        .insert(node, Instant::now() + self.config.retry_backoff);
                }
            }
        }
    }

    /// A node confirmed its replica of `ntp` reached the sought state.
    /// Cascades: empty partition set drops the partition, empty topic drops
    /// the topic, empty migration queues the advance.
    fn mark_step_done(
        coord: &mut CoordinatorState,
        node: NodeId,
        ntp: &Ntp,
        migration: MigrationId,
        metrics: &MigrationMetrics,
    ) {
        match coord.node_states.get_mut(&node) {
            Some(ntps) if ntps.get(ntp) == Some(&migration) => {
                ntps.remove(ntp);
                if ntps.is_empty() {
                    coord.node_states.remove(&node);
                    coord.nodes_to_retry.remove(&node);
                }
            }
            // stale or duplicate confirmation
            _ => return,
        }
        let Some(ms) = coord.migration_states.get_mut(&migration) else {
            return;
        };
        let Some(ts) = ms.outstanding_topics.get_mut(&ntp.topic) else {
            return;
        };
        if let Some(nodes) = ts.outstanding_partitions.get_mut(&ntp.partition) {
            nodes.remove(&node);
            if nodes.is_empty() {
                ts.outstanding_partitions.remove(&ntp.partition);
            }
        }
        if ts.outstanding_partitions.is_empty() {
            ms.outstanding_topics.remove(&ntp.topic);
            coord.topic_migration_map.remove(&ntp.topic);
        }
        if ms.outstanding_topics.is_empty() {
            let sought_state = ms.sought_state;
            coord.migration_states.remove(&migration);
            tracing::info!(
                migration,
                sought_state = %sought_state,
                "migration reached sought state on all replicas"
            );
            Self::queue_advance(coord, migration, sought_state, metrics);
        }
    }

    /// Queue an advance to the state after `sought_state`; idempotent per
    /// migration.
    fn queue_advance(
        coord: &mut CoordinatorState,
        migration: MigrationId,
        sought_state: MigrationState,
        metrics: &MigrationMetrics,
    ) {
        let Some(to) = sought_state.next() else {
            return;
        };
        coord.advance_requests.entry(migration).or_insert_with(|| {
            metrics.advances_requested.inc();
            AdvanceInfo { to, sent: false }
        });
    }

    /// Write queued advances to the migration table, each at most once.
    fn spawn_advances(self: &Arc<Self>, coord: &mut CoordinatorState) {
        for (&migration, info) in coord.advance_requests.iter_mut() {
            if info.sent {
                continue;
            }
            info.sent = true;
            let to = info.to;
            tracing::info!(migration, to = %to, "writing migration advance");
            let inner = Arc::clone(self);
            self.tasks.spawn(async move {
                let result = tokio::select! {
                    _ = inner.shutdown.cancelled() => Err(Error::ShuttingDown),
                    result = inner.table.advance(migration, to) => result,
                };
                inner.enqueue(BackendEvent::AdvanceCompleted {
                    migration,
                    to,
                    result,
                });
            });
        }
    }

    fn on_advance_completed(
        &self,
        state: &mut BackendState,
        migration: MigrationId,
        to: MigrationState,
        result: Result<()>,
    ) {
        let Some(coord) = state.coordinator.as_mut() else {
            return;
        };
        match result {
            Ok(()) => {
                self.metrics.advances_written.inc();
                coord.advance_requests.remove(&migration);
            }
            Err(error) => {
                // The table is the source of truth: drop the request and
                // re-derive intent from the next snapshot.
                tracing::warn!(migration, to = %to, %error, "advance write rejected");
                self.metrics.advance_conflicts.inc();
                coord.advance_requests.remove(&migration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator_with_one_migration() -> CoordinatorState {
        let mut coord = CoordinatorState::default();
        let mut ts = TopicReconciliationState::default();
        ts.outstanding_partitions
            .insert(0, HashSet::from([1, 2]));
        ts.outstanding_partitions.insert(1, HashSet::from([2]));
        let mut ms = MigrationReconciliationState {
            sought_state: MigrationState::Prepared,
            outstanding_topics: HashMap::new(),
        };
        ms.outstanding_topics.insert("t".to_string(), ts);
        coord.migration_states.insert(7, ms);
        coord.topic_migration_map.insert("t".to_string(), 7);
        for (node, partition) in [(1u64, 0u32), (2, 0), (2, 1)] {
            coord
                .node_states
                .entry(node)
                .or_default()
                .insert(Ntp::new("t", partition), 7);
        }
        coord
    }

    #[test]
    fn test_mark_step_done_cascades_to_advance() {
        let metrics = MigrationMetrics::new();
        let mut coord = coordinator_with_one_migration();

        BackendInner::mark_step_done(&mut coord, 1, &Ntp::new("t", 0), 7, &metrics);
        assert!(coord.advance_requests.is_empty());
        assert!(!coord.node_states.contains_key(&1));

        BackendInner::mark_step_done(&mut coord, 2, &Ntp::new("t", 0), 7, &metrics);
        BackendInner::mark_step_done(&mut coord, 2, &Ntp::new("t", 1), 7, &metrics);

        assert!(coord.migration_states.is_empty());
        assert!(coord.topic_migration_map.is_empty());
        assert!(coord.node_states.is_empty());
        let info = coord.advance_requests.get(&7).expect("advance queued");
        assert_eq!(info.to, MigrationState::Executed);
        assert!(!info.sent);
        assert_eq!(metrics.advances_requested.get(), 1);
    }

    #[test]
    fn test_mark_step_done_ignores_stale_confirmations() {
        let metrics = MigrationMetrics::new();
        let mut coord = coordinator_with_one_migration();

        // wrong migration id
        BackendInner::mark_step_done(&mut coord, 1, &Ntp::new("t", 0), 99, &metrics);
        // node that is not a replica of the partition
        BackendInner::mark_step_done(&mut coord, 1, &Ntp::new("t", 1), 7, &metrics);

        assert_eq!(coord.migration_states.len(), 1);
        assert_eq!(coord.node_states.len(), 2);
        assert!(coord.advance_requests.is_empty());
    }

    #[test]
    fn test_drop_migration_tracking_clears_every_index() {
        let mut coord = coordinator_with_one_migration();
        coord.nodes_to_retry.insert(2, Instant::now());

        BackendInner::drop_migration_tracking(&mut coord, 7);

        assert!(coord.migration_states.is_empty());
        assert!(coord.topic_migration_map.is_empty());
        assert!(coord.node_states.is_empty());
        assert!(coord.nodes_to_retry.is_empty());
    }

    #[test]
    fn test_queue_advance_is_idempotent() {
        let metrics = MigrationMetrics::new();
        let mut coord = CoordinatorState::default();
        BackendInner::queue_advance(&mut coord, 3, MigrationState::Prepared, &metrics);
        coord.advance_requests.get_mut(&3).unwrap().sent = true;
        BackendInner::queue_advance(&mut coord, 3, MigrationState::Prepared, &metrics);

        let info = coord.advance_requests.get(&3).unwrap();
        assert!(info.sent, "re-queue must not reset a sent request");
        assert_eq!(metrics.advances_requested.get(), 1);

        // terminal sought state has nothing to advance to
        BackendInner::queue_advance(&mut coord, 4, MigrationState::Finished, &metrics);
        assert!(!coord.advance_requests.contains_key(&4));
    }
}
