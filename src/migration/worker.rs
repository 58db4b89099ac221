//! Per-node executor for partition migration work.
//!
//! The worker owns the in-progress work for each locally-led partition.
//! At most one job runs per ntp, and a job is only spawned while this node
//! leads the partition. Losing leadership does not cancel an in-flight job;
//! the job completes and the worker re-evaluates. Transient failures are
//! retried for as long as the replica stays locally led and the work has
//! not been superseded.

use crate::cluster::{LeadersTable, SubscriptionId};
use crate::config::WorkerConfig;
use crate::error::{WorkError, WorkResult};
use crate::metrics::MigrationMetrics;
use crate::migration::work::{PartitionWork, PartitionWorkInfo, PartitionWorkRunner};
use crate::types::{MigrationId, MigrationState, NodeId, Ntp};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Resolves exactly once, when the work item terminates: success,
/// non-retryable failure, shutdown, or supersession by newer work.
pub type WorkCompletion = oneshot::Receiver<WorkResult>;

struct NtpState {
    is_leader: bool,
    is_running: bool,
    work: PartitionWork,
    leadership_subscription: SubscriptionId,
    promise: Option<oneshot::Sender<WorkResult>>,
}

struct WorkerInner {
    node_id: NodeId,
    config: WorkerConfig,
    leaders: Arc<LeadersTable>,
    runner: Arc<dyn PartitionWorkRunner>,
    metrics: Arc<MigrationMetrics>,
    managed: Mutex<HashMap<Ntp, NtpState>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// The per-node partition work executor.
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker. `shutdown` is the process-wide abort signal; the
    /// worker derives its own child token from it so that `stop` does not
    /// tear down unrelated components.
    pub fn new(
        node_id: NodeId,
        config: WorkerConfig,
        leaders: Arc<LeadersTable>,
        runner: Arc<dyn PartitionWorkRunner>,
        metrics: Arc<MigrationMetrics>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                node_id,
                config,
                leaders,
                runner,
                metrics,
                managed: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown: shutdown.child_token(),
            }),
        }
    }

    /// Take ownership of `work` for `ntp` and drive it until it terminates.
    ///
    /// If the ntp is already managed, the prior completion promise is
    /// resolved with `InvalidMigrationState` and its work replaced.
    /// Otherwise a new entry is created, current leadership queried, and a
    /// leadership-change subscription registered. The returned completion
    /// resolves exactly once.
    pub fn perform_partition_work(&self, ntp: Ntp, work: PartitionWork) -> WorkCompletion {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;
        let mut managed = inner.managed.lock();
        match managed.entry(ntp.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                tracing::debug!(
                    %ntp,
                    old_migration = state.work.migration,
                    new_migration = work.migration,
                    new_sought_state = %work.sought_state,
                    "superseding partition work"
                );
                if let Some(promise) = state.promise.take() {
                    let _ = promise.send(Err(WorkError::InvalidMigrationState));
                }
                state.promise = Some(tx);
                state.is_running = false;
                state.work = work;
            }
            Entry::Vacant(entry) => {
                let is_leader = inner.leaders.leader_of(&ntp) == Some(inner.node_id);
                let weak = Arc::downgrade(inner);
                let self_id = inner.node_id;
                let subscription = inner.leaders.subscribe(ntp.clone(), move |ntp, leader| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_leadership_update(ntp, leader == Some(self_id));
                    }
                });
                tracing::debug!(
                    %ntp,
                    migration = work.migration,
                    sought_state = %work.sought_state,
                    is_leader,
                    "managing partition work"
                );
                entry.insert(NtpState {
                    is_leader,
                    is_running: false,
                    work,
                    leadership_subscription: subscription,
                    promise: Some(tx),
                });
                inner.metrics.managed_ntps.inc();
            }
        }
        inner.spawn_work_if_leader(&mut managed, &ntp);
        rx
    }

    /// Abort the managed work for `ntp` if it matches exactly on both the
    /// migration and the sought state; stale aborts are ignored.
    pub fn abort_partition_work(
        &self,
        ntp: &Ntp,
        migration: MigrationId,
        sought_state: MigrationState,
    ) {
        let inner = &self.inner;
        let mut managed = inner.managed.lock();
        let matches = managed
            .get(ntp)
            .map(|state| {
                state.work.migration == migration && state.work.sought_state == sought_state
            })
            .unwrap_or(false);
        if matches {
            inner.unmanage(&mut managed, ntp, Err(WorkError::InvalidMigrationState));
        }
    }

    /// Tear down every managed ntp with `ShuttingDown` and wait for all
    /// in-flight jobs to settle.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut managed = inner.managed.lock();
            let ntps: Vec<Ntp> = managed.keys().cloned().collect();
            for ntp in ntps {
                inner.unmanage(&mut managed, &ntp, Err(WorkError::ShuttingDown));
            }
        }
        inner.shutdown.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;
        tracing::debug!(node = inner.node_id, "worker stopped");
    }

    /// Whether `ntp` is currently managed.
    pub fn is_managed(&self, ntp: &Ntp) -> bool {
        self.inner.managed.lock().contains_key(ntp)
    }

    /// Number of currently managed ntps.
    pub fn managed_count(&self) -> usize {
        self.inner.managed.lock().len()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("node_id", &self.inner.node_id)
            .field("managed", &self.inner.managed.lock().len())
            .finish()
    }
}

impl WorkerInner {
    /// Spawn a job for `ntp` if this node leads it and nothing is running.
    /// The map entry may be invalidated once the current task suspends;
    /// everything the job needs is copied out before spawning.
    fn spawn_work_if_leader(self: &Arc<Self>, managed: &mut HashMap<Ntp, NtpState>, ntp: &Ntp) {
        let Some(state) = managed.get_mut(ntp) else {
            return;
        };
        assert!(!state.is_running, "partition work already running on {ntp}");
        if !state.is_leader || self.shutdown.is_cancelled() {
            return;
        }
        state.is_running = true;
        let work = state.work.clone();
        let ntp = ntp.clone();
        let inner = Arc::clone(self);
        self.metrics.work_started.inc();
        self.tasks.spawn(async move {
            let result = inner.do_work(&ntp, &work).await;
            inner.handle_operation_result(&ntp, work.migration, work.sought_state, result);
        });
    }

    /// Run the work routine for one attempt, bounded by the operation
    /// timeout and the shutdown signal.
    async fn do_work(&self, ntp: &Ntp, work: &PartitionWork) -> WorkResult {
        let sought_state = work.sought_state;
        let attempt = async {
            match &work.info {
                PartitionWorkInfo::Inbound(info) => {
                    assert!(
                        sought_state == MigrationState::Prepared,
                        "inbound partition work requested on {ntp} towards {sought_state} state"
                    );
                    self.runner.run_inbound(ntp, info).await
                }
                PartitionWorkInfo::Outbound(info) => match sought_state {
                    MigrationState::Prepared | MigrationState::Executed => {
                        self.runner.run_outbound(ntp, info, sought_state).await
                    }
                    other => panic!(
                        "outbound partition work requested on {ntp} towards {other} state"
                    ),
                },
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(WorkError::ShuttingDown),
            result = tokio::time::timeout(self.config.operation_timeout, attempt) => {
                result.unwrap_or(Err(WorkError::Timeout))
            }
        }
    }

    fn handle_operation_result(
        self: &Arc<Self>,
        ntp: &Ntp,
        migration: MigrationId,
        sought_state: MigrationState,
        result: WorkResult,
    ) {
        let mut managed = self.managed.lock();
        let Some(state) = managed.get_mut(ntp) else {
            tracing::debug!(
                %ntp,
                migration,
                sought_state = %sought_state,
                ?result,
                "partition work finished but is no longer managed"
            );
            return;
        };
        if state.work.migration != migration || state.work.sought_state != sought_state {
            tracing::debug!(
                %ntp,
                migration,
                sought_state = %sought_state,
                ?result,
                "partition work finished but was superseded"
            );
            return;
        }
        state.is_running = false;
        match result {
            Ok(()) => {
                self.metrics.work_succeeded.inc();
                self.unmanage(&mut managed, ntp, Ok(()));
            }
            Err(WorkError::ShuttingDown) => {
                self.unmanage(&mut managed, ntp, Err(WorkError::ShuttingDown));
            }
            Err(error) => {
                tracing::info!(
                    %ntp,
                    migration,
                    sought_state = %sought_state,
                    %error,
                    "partition work failed, retrying"
                );
                self.metrics.work_retried.inc();
                self.spawn_work_if_leader(&mut managed, ntp);
            }
        }
    }

    fn handle_leadership_update(self: &Arc<Self>, ntp: &Ntp, is_leader: bool) {
        let mut managed = self.managed.lock();
        let Some(state) = managed.get_mut(ntp) else {
            return;
        };
        if state.is_leader == is_leader {
            return;
        }
        state.is_leader = is_leader;
        tracing::debug!(%ntp, is_leader, "leadership changed for managed ntp");
        if !state.is_running {
            self.spawn_work_if_leader(&mut managed, ntp);
        }
    }

    /// Remove an entry, releasing its leadership subscription and resolving
    /// its completion promise with `result`.
    fn unmanage(&self, managed: &mut HashMap<Ntp, NtpState>, ntp: &Ntp, result: WorkResult) {
        let Some(mut state) = managed.remove(ntp) else {
            return;
        };
        self.leaders.unsubscribe(state.leadership_subscription);
        if let Some(promise) = state.promise.take() {
            let _ = promise.send(result);
        }
        self.metrics.managed_ntps.dec();
        tracing::debug!(%ntp, migration = state.work.migration, ?result, "unmanaged ntp");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::work::{InboundPartitionWorkInfo, OutboundPartitionWorkInfo};
    use crate::testing::utils::ScriptedWorkRunner;
    use std::time::Duration;

    fn inbound_work(migration: MigrationId) -> PartitionWork {
        PartitionWork {
            migration,
            sought_state: MigrationState::Prepared,
            info: PartitionWorkInfo::Inbound(InboundPartitionWorkInfo { source: None }),
        }
    }

    fn outbound_work(migration: MigrationId, sought_state: MigrationState) -> PartitionWork {
        PartitionWork {
            migration,
            sought_state,
            info: PartitionWorkInfo::Outbound(OutboundPartitionWorkInfo { target: None }),
        }
    }

    struct Fixture {
        leaders: Arc<LeadersTable>,
        runner: Arc<ScriptedWorkRunner>,
        worker: Worker,
        shutdown: CancellationToken,
    }

    fn fixture() -> Fixture {
        let leaders = Arc::new(LeadersTable::new());
        let runner = Arc::new(ScriptedWorkRunner::new());
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            1,
            WorkerConfig::new().with_operation_timeout(Duration::from_secs(5)),
            Arc::clone(&leaders),
            Arc::clone(&runner) as Arc<dyn PartitionWorkRunner>,
            Arc::new(MigrationMetrics::new()),
            &shutdown,
        );
        Fixture {
            leaders,
            runner,
            worker,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_work_completes_when_leader() {
        let fx = fixture();
        let ntp = Ntp::new("t", 0);
        fx.leaders.set_leader(&ntp, Some(1));

        let completion = fx.worker.perform_partition_work(ntp.clone(), inbound_work(1));
        assert_eq!(completion.await.unwrap(), Ok(()));
        assert!(!fx.worker.is_managed(&ntp));
        assert_eq!(fx.runner.calls(&ntp), 1);
    }

    #[tokio::test]
    async fn test_non_leader_sits_idle_until_elected() {
        let fx = fixture();
        let ntp = Ntp::new("t", 0);
        fx.leaders.set_leader(&ntp, Some(2));

        let completion = fx.worker.perform_partition_work(ntp.clone(), inbound_work(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.runner.calls(&ntp), 0);
        assert!(fx.worker.is_managed(&ntp));

        fx.leaders.set_leader(&ntp, Some(1));
        assert_eq!(completion.await.unwrap(), Ok(()));
        assert_eq!(fx.runner.calls(&ntp), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = fixture();
        let ntp = Ntp::new("t", 0);
        fx.leaders.set_leader(&ntp, Some(1));
        fx.runner
            .push_result(&ntp, Err(WorkError::PartitionOperationFailed));
        fx.runner
            .push_result(&ntp, Err(WorkError::PartitionOperationFailed));

        let completion = fx.worker.perform_partition_work(ntp.clone(), inbound_work(1));
        assert_eq!(completion.await.unwrap(), Ok(()));
        assert_eq!(fx.runner.calls(&ntp), 3);
    }

    #[tokio::test]
    async fn test_supersession_resolves_prior_promise() {
        let fx = fixture();
        let ntp = Ntp::new("t", 0);
        fx.leaders.set_leader(&ntp, Some(1));
        fx.runner.hold(&ntp);

        let first = fx
            .worker
            .perform_partition_work(ntp.clone(), outbound_work(1, MigrationState::Prepared));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.runner.calls(&ntp), 1);

        let second = fx
            .worker
            .perform_partition_work(ntp.clone(), outbound_work(1, MigrationState::Executed));
        assert_eq!(first.await.unwrap(), Err(WorkError::InvalidMigrationState));

        fx.runner.release(&ntp, 2);
        assert_eq!(second.await.unwrap(), Ok(()));
        let states = fx.runner.outbound_states(&ntp);
        assert_eq!(
            states,
            vec![MigrationState::Prepared, MigrationState::Executed]
        );
    }

    #[tokio::test]
    async fn test_abort_requires_exact_match() {
        let fx = fixture();
        let ntp = Ntp::new("t", 0);
        fx.leaders.set_leader(&ntp, Some(2));

        let completion = fx
            .worker
            .perform_partition_work(ntp.clone(), outbound_work(4, MigrationState::Prepared));

        // stale aborts are ignored
        fx.worker
            .abort_partition_work(&ntp, 4, MigrationState::Executed);
        fx.worker
            .abort_partition_work(&ntp, 5, MigrationState::Prepared);
        assert!(fx.worker.is_managed(&ntp));

        fx.worker
            .abort_partition_work(&ntp, 4, MigrationState::Prepared);
        assert!(!fx.worker.is_managed(&ntp));
        assert_eq!(
            completion.await.unwrap(),
            Err(WorkError::InvalidMigrationState)
        );
    }

    #[tokio::test]
    async fn test_stop_resolves_every_promise() {
        let fx = fixture();
        let mut completions = Vec::new();
        for partition in 0..5 {
            let ntp = Ntp::new("t", partition);
            fx.runner.hold(&ntp);
            fx.leaders.set_leader(&ntp, Some(1));
            let migration = u64::from(partition % 2) + 1;
            completions.push(
                fx.worker
                    .perform_partition_work(ntp, inbound_work(migration)),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.worker.stop().await;
        assert_eq!(fx.worker.managed_count(), 0);
        for completion in completions {
            assert_eq!(completion.await.unwrap(), Err(WorkError::ShuttingDown));
        }
        assert!(!fx.shutdown.is_cancelled(), "stop only cancels the child");
    }

    #[tokio::test]
    async fn test_operation_timeout_is_retryable() {
        let leaders = Arc::new(LeadersTable::new());
        let runner = Arc::new(ScriptedWorkRunner::new());
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            1,
            WorkerConfig::new().with_operation_timeout(Duration::from_millis(30)),
            Arc::clone(&leaders),
            Arc::clone(&runner) as Arc<dyn PartitionWorkRunner>,
            Arc::new(MigrationMetrics::new()),
            &shutdown,
        );

        let ntp = Ntp::new("t", 0);
        runner.hold(&ntp);
        leaders.set_leader(&ntp, Some(1));
        let completion = worker.perform_partition_work(ntp.clone(), inbound_work(1));

        // first attempt times out and is retried; release the second one
        tokio::time::sleep(Duration::from_millis(60)).await;
        runner.release(&ntp, 2);
        assert_eq!(completion.await.unwrap(), Ok(()));
        assert!(runner.calls(&ntp) >= 2);
    }

    #[tokio::test]
    #[should_panic(expected = "inbound partition work requested")]
    async fn test_inbound_towards_wrong_state_is_fatal() {
        let fx = fixture();
        let ntp = Ntp::new("t", 0);
        let work = PartitionWork {
            migration: 1,
            sought_state: MigrationState::Executed,
            info: PartitionWorkInfo::Inbound(InboundPartitionWorkInfo { source: None }),
        };
        let _ = fx.worker.inner.do_work(&ntp, &work).await;
    }
}
