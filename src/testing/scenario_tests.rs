//! End-to-end migration lifecycle scenarios.
//!
//! Each test wires a small in-process cluster and drives one migration
//! story through the real backend/worker/coordinator path: happy path,
//! transient failures, leadership movement, supersession, shutdown, and
//! coordinator hand-off.

#[cfg(test)]
mod tests {
    use crate::error::WorkError;
    use crate::testing::utils::{eventually, init_tracing, TestCluster};
    use crate::types::{Migration, MigrationState, Ntp};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_single_partition_inbound_happy_path() {
        init_tracing();
        let cluster = TestCluster::start(1).await;
        let cluster = &cluster;
        cluster.create_topic("orders", 1, &[1]);
        let ntp = &Ntp::new("orders", 0);

        let id = cluster
            .table
            .create(Migration::inbound(vec!["orders".into()], None))
            .unwrap();
        cluster
            .table
            .advance(id, MigrationState::Prepared)
            .await
            .unwrap();

        assert!(
            eventually(WAIT, || async move {
                cluster.sought_state(id) == Some(MigrationState::Executed)
            })
            .await,
            "coordinator should advance prepared -> executed"
        );

        let node = cluster.node(1);
        assert_eq!(node.runner.calls(ntp), 1);
        assert!(
            eventually(WAIT, || async move {
                node.backend.metrics().snapshot().advances_written == 1
            })
            .await
        );
        assert_eq!(node.backend.metrics().snapshot().advance_conflicts, 0);

        // inbound migrations need no partition work towards executed; the
        // local work state is released
        assert!(
            eventually(WAIT, || async move {
                node.backend.replica_status(ntp).await.is_none()
            })
            .await
        );
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        init_tracing();
        let cluster = TestCluster::start(1).await;
        let cluster = &cluster;
        cluster.create_topic("orders", 1, &[1]);
        let ntp = &Ntp::new("orders", 0);
        let node = cluster.node(1);
        node.runner
            .push_result(ntp, Err(WorkError::PartitionOperationFailed));
        node.runner
            .push_result(ntp, Err(WorkError::PartitionOperationFailed));

        let id = cluster
            .table
            .create(Migration::inbound(vec!["orders".into()], None))
            .unwrap();
        cluster
            .table
            .advance(id, MigrationState::Prepared)
            .await
            .unwrap();

        assert!(
            eventually(WAIT, || async move {
                cluster.sought_state(id) == Some(MigrationState::Executed)
            })
            .await
        );

        assert_eq!(node.runner.calls(ntp), 3, "two failures then one success");
        assert_eq!(node.backend.metrics().snapshot().work_retried, 2);
        assert!(
            eventually(WAIT, || async move {
                node.backend.metrics().snapshot().advances_written == 1
            })
            .await
        );
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_leadership_flap_mid_execution() {
        init_tracing();
        let cluster = TestCluster::start(2).await;
        let cluster = &cluster;
        cluster.create_topic("logs", 1, &[1, 2]);
        let ntp = &Ntp::new("logs", 0);
        cluster.node(1).runner.hold(ntp);

        let id = cluster
            .table
            .create(Migration::inbound(vec!["logs".into()], None))
            .unwrap();
        cluster
            .table
            .advance(id, MigrationState::Prepared)
            .await
            .unwrap();

        // node 1 leads and starts the work, which hangs on the gate
        assert!(
            eventually(WAIT, || async move { cluster.node(1).runner.calls(ntp) == 1 }).await
        );

        // leadership moves mid-execution; node 2 picks the work up on its
        // next evaluation and completes it
        cluster.leaders.set_leader(ntp, Some(2));
        assert!(
            eventually(WAIT, || async move { cluster.node(2).runner.calls(ntp) >= 1 }).await
        );
        assert!(
            eventually(WAIT, || async move {
                cluster.sought_state(id) == Some(MigrationState::Executed)
            })
            .await
        );

        // node 1's job may still be in flight; letting it finish changes
        // nothing once leadership is gone
        cluster.node(1).runner.release(ntp, 1);
        assert_eq!(cluster.sought_state(id), Some(MigrationState::Executed));
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_supersession_replaces_in_flight_work() {
        init_tracing();
        let cluster = TestCluster::start(1).await;
        let cluster = &cluster;
        cluster.create_topic("exports", 1, &[1]);
        let ntp = &Ntp::new("exports", 0);
        let node = cluster.node(1);
        node.runner.hold(ntp);

        let id = cluster
            .table
            .create(Migration::outbound(vec!["exports".into()], None))
            .unwrap();
        cluster
            .table
            .advance(id, MigrationState::Prepared)
            .await
            .unwrap();

        assert!(eventually(WAIT, || async move { node.runner.calls(ntp) == 1 }).await);

        // the sought state moves on while the prepared-work is mid-flight
        cluster
            .table
            .advance(id, MigrationState::Executed)
            .await
            .unwrap();

        // a fresh job starts for the new sought state
        assert!(eventually(WAIT, || async move { node.runner.calls(ntp) >= 2 }).await);
        node.runner.release(ntp, 2);

        assert!(
            eventually(WAIT, || async move {
                cluster.sought_state(id) == Some(MigrationState::CutOver)
            })
            .await,
            "outbound executed-work completes and advances to cut_over"
        );
        assert_eq!(
            node.runner.outbound_states(ntp),
            vec![MigrationState::Prepared, MigrationState::Executed]
        );
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_settles_all_outstanding_work() {
        init_tracing();
        let cluster = TestCluster::start(1).await;
        let cluster = &cluster;
        cluster.create_topic("a", 3, &[1]);
        cluster.create_topic("b", 2, &[1]);
        let node = cluster.node(1);
        for partition in 0..3 {
            node.runner.hold(&Ntp::new("a", partition));
        }
        for partition in 0..2 {
            node.runner.hold(&Ntp::new("b", partition));
        }

        let first = cluster
            .table
            .create(Migration::inbound(vec!["a".into()], None))
            .unwrap();
        let second = cluster
            .table
            .create(Migration::outbound(vec!["b".into()], None))
            .unwrap();
        cluster
            .table
            .advance(first, MigrationState::Prepared)
            .await
            .unwrap();
        cluster
            .table
            .advance(second, MigrationState::Prepared)
            .await
            .unwrap();

        assert!(
            eventually(WAIT, || async move { node.worker.managed_count() == 5 }).await,
            "five ntps across two migrations should be managed"
        );

        cluster.stop().await;
        assert_eq!(node.worker.managed_count(), 0);

        // no further status RPCs once stopped, and no advance was written
        let rpcs_sent = node.backend.metrics().snapshot().status_rpcs_sent;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.backend.metrics().snapshot().status_rpcs_sent, rpcs_sent);
        assert_eq!(cluster.sought_state(first), Some(MigrationState::Prepared));
        assert_eq!(cluster.sought_state(second), Some(MigrationState::Prepared));
    }

    #[tokio::test]
    async fn test_coordinator_handoff_rebuilds_and_advances_once() {
        init_tracing();
        let cluster = TestCluster::start(2).await;
        let cluster = &cluster;
        cluster.create_topic("t", 2, &[1, 2]);
        for partition in 0..2 {
            cluster.node(1).runner.hold(&Ntp::new("t", partition));
        }

        let id = cluster
            .table
            .create(Migration::outbound(vec!["t".into()], None))
            .unwrap();
        cluster
            .table
            .advance(id, MigrationState::Prepared)
            .await
            .unwrap();

        assert!(
            eventually(WAIT, || async move {
                cluster.node(1).backend.is_coordinator().await
            })
            .await
        );
        assert!(
            eventually(WAIT, || async move {
                cluster.node(1).backend.tracked_migrations().await == vec![id]
            })
            .await
        );

        // the controller partition moves; node 1 drops its coordinator
        // state, node 2 rebuilds from the table
        cluster.set_controller_leader(2);
        assert!(
            eventually(WAIT, || async move {
                !cluster.node(1).backend.is_coordinator().await
                    && cluster.node(2).backend.is_coordinator().await
            })
            .await
        );
        assert!(
            eventually(WAIT, || async move {
                cluster.node(2).backend.tracked_migrations().await == vec![id]
            })
            .await
        );

        // release everything; the migration runs to its stable end state
        // (outbound: prepared work, executed work, then cut_over)
        for partition in 0..2 {
            cluster.node(1).runner.release(&Ntp::new("t", partition), 4);
        }
        assert!(
            eventually(WAIT, || async move {
                cluster.sought_state(id) == Some(MigrationState::CutOver)
            })
            .await
        );

        assert!(
            eventually(WAIT, || async move {
                cluster.node(2).backend.metrics().snapshot().advances_written == 2
            })
            .await,
            "one advance per completed step, none duplicated"
        );
        assert_eq!(
            cluster.node(1).backend.metrics().snapshot().advances_written,
            0,
            "the old coordinator must not write"
        );
        assert_eq!(
            cluster.node(2).backend.metrics().snapshot().advance_conflicts,
            0
        );
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_node_is_retried_with_backoff() {
        init_tracing();
        let cluster = TestCluster::start(2).await;
        let cluster = &cluster;
        cluster.create_topic("t", 1, &[2, 1]);
        // node 2 leads and does the work, but its status cannot be queried
        cluster.router.set_unreachable(2, true);

        let id = cluster
            .table
            .create(Migration::inbound(vec!["t".into()], None))
            .unwrap();
        cluster
            .table
            .advance(id, MigrationState::Prepared)
            .await
            .unwrap();

        assert!(
            eventually(WAIT, || async move {
                cluster.node(1).backend.metrics().snapshot().status_rpcs_failed >= 2
            })
            .await,
            "the coordinator keeps retrying the unreachable node"
        );
        assert_eq!(cluster.sought_state(id), Some(MigrationState::Prepared));

        cluster.router.set_unreachable(2, false);
        assert!(
            eventually(WAIT, || async move {
                cluster.sought_state(id) == Some(MigrationState::Executed)
            })
            .await
        );
        cluster.stop().await;
    }
}
