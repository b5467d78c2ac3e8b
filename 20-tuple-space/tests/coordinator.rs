//! Coordinator behaviour against in-process replicas.
//!
//! Replicas are real [`ReplicaService`]s reached through [`LocalReplica`], so
//! every store, lock table and collector path runs as in production, minus
//! the sockets.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tuple_space::{
    collector::{GroupKey, OpKind},
    config::{CoordinatorConfig, TakeRetryPolicy},
    coordinator::{Coordinator, CoordinatorError, SharedReplica},
    replica::ReplicaService,
    store::{LockState, TupleStore},
    transport::{LocalReplica, RemoteReplica},
    tuple::Pattern,
};

/// Upper bound for any single test body; a hang is a failure.
const TEST_LIMIT: Duration = Duration::from_secs(15);

struct TestCluster {
    services: Vec<Arc<ReplicaService>>,
    coordinator: Arc<Coordinator>,
}

impl TestCluster {
    fn start(n: usize, config: CoordinatorConfig) -> Result<Self> {
        let services: Vec<Arc<ReplicaService>> =
            (0..n).map(|id| Arc::new(ReplicaService::new(id))).collect();
        let replicas = services
            .iter()
            .map(|service| Arc::new(LocalReplica::new(Arc::clone(service))) as SharedReplica)
            .collect();
        let coordinator = Arc::new(Coordinator::new(replicas, config)?);
        Ok(Self {
            services,
            coordinator,
        })
    }

    fn store(&self, id: usize) -> &TupleStore {
        self.services[id].store()
    }

    fn spawn_take(
        &self,
        client_id: u64,
        pattern: &str,
    ) -> tokio::task::JoinHandle<Result<String, CoordinatorError>> {
        let coordinator = Arc::clone(&self.coordinator);
        let pattern = pattern.to_string();
        tokio::spawn(async move { coordinator.take(client_id, &pattern, &[]).await })
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        take_retry: TakeRetryPolicy {
            backoff: Duration::from_millis(20),
            jitter: Duration::from_millis(30),
            max_rounds: None,
        },
        wait_timeout: None,
    }
}

async fn within<T>(body: impl Future<Output = T>) -> T {
    match timeout(TEST_LIMIT, body).await {
        Ok(value) => value,
        Err(_) => panic!("test did not finish within {TEST_LIMIT:?}"),
    }
}

fn tuples(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn put_wakes_a_read_issued_before_it() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    within(async {
        let coordinator = Arc::clone(&cluster.coordinator);
        let reader = tokio::spawn(async move { coordinator.read("<a,.*>", &[]).await });

        sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        cluster.coordinator.put("<a,1>", &[]).await?;
        assert_eq!(reader.await??, "<a,1>");

        for id in 0..3 {
            assert_eq!(cluster.store(id).snapshot(), tuples(&["<a,1>"]));
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn put_read_take_round_trip() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    within(async {
        cluster.coordinator.put("<job,1>", &[]).await?;
        cluster.coordinator.put("<job,2>", &[]).await?;

        assert_eq!(cluster.coordinator.read("<job,1>", &[]).await?, "<job,1>");
        assert_eq!(cluster.coordinator.take(2, "<job,2>", &[]).await?, "<job,2>");
        assert_eq!(cluster.coordinator.dump().await?, tuples(&["<job,1>", "<job,1>", "<job,1>"]));

        for id in 0..3 {
            assert_eq!(
                cluster.store(id).lock_table(),
                vec![("<job,1>".to_string(), LockState::Free)]
            );
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn read_answers_with_the_first_replica() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    within(async {
        cluster.coordinator.put("<a>", &[]).await?;

        let started = Instant::now();
        let tuple = cluster.coordinator.read("<a>", &[3, 0, 0]).await?;
        assert_eq!(tuple, "<a>");
        assert!(started.elapsed() < Duration::from_secs(3));
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn clients_sharing_voters_never_take_the_same_tuple() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;
    assert_eq!(cluster.coordinator.voters(1), cluster.coordinator.voters(4));

    within(async {
        cluster.coordinator.put("<a,1>", &[]).await?;

        let first = cluster.spawn_take(1, "<a,.*>");
        let second = cluster.spawn_take(4, "<a,.*>");

        // Only one tuple exists; the loser keeps waiting for the next put.
        sleep(Duration::from_millis(300)).await;
        cluster.coordinator.put("<a,2>", &[]).await?;

        let mut taken = vec![first.await??, second.await??];
        taken.sort();
        assert_eq!(taken, tuples(&["<a,1>", "<a,2>"]));

        assert!(cluster.coordinator.dump().await?.is_empty());
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn clients_with_overlapping_voters_never_take_the_same_tuple() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;
    assert_eq!(cluster.coordinator.voters(7).ids(), [1, 2]);
    assert_eq!(cluster.coordinator.voters(8).ids(), [2, 0]);

    within(async {
        cluster.coordinator.put("<keep>", &[]).await?;
        cluster.coordinator.put("<t,1>", &[]).await?;

        let first = cluster.spawn_take(7, "<t,.*>");
        let second = cluster.spawn_take(8, "<t,.*>");

        while !first.is_finished() && !second.is_finished() {
            sleep(Duration::from_millis(10)).await;
        }
        // The loser finds nothing left to reserve and parks until the next put.
        sleep(Duration::from_millis(200)).await;
        assert!(first.is_finished() != second.is_finished());

        cluster.coordinator.put("<t,2>", &[]).await?;
        let mut taken = vec![first.await??, second.await??];
        taken.sort();
        assert_eq!(taken, tuples(&["<t,1>", "<t,2>"]));

        for id in 0..3 {
            assert_eq!(
                cluster.store(id).lock_table(),
                vec![("<keep>".to_string(), LockState::Free)]
            );
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn takes_on_disjoint_patterns_both_complete() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    within(async {
        cluster.coordinator.put("<a>", &[]).await?;
        cluster.coordinator.put("<b>", &[]).await?;

        let first = cluster.spawn_take(1, "<a>");
        let second = cluster.spawn_take(4, "<b>");
        assert_eq!(first.await??, "<a>");
        assert_eq!(second.await??, "<b>");

        assert!(cluster.coordinator.dump().await?.is_empty());
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn take_agrees_on_the_tuple_both_voters_hold() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;
    assert_eq!(cluster.coordinator.voters(7).ids(), [1, 2]);

    within(async {
        cluster.store(1).put("<x,1>");
        cluster.store(1).put("<x,2>");
        cluster.store(2).put("<x,2>");

        let take = cluster.spawn_take(7, "<x,.*>");

        // Replica 0 has no copy yet; its removal waits until one arrives.
        sleep(Duration::from_millis(100)).await;
        assert!(!take.is_finished());
        cluster.store(0).put("<x,2>");

        assert_eq!(take.await??, "<x,2>");
        assert!(cluster.store(0).snapshot().is_empty());
        assert_eq!(
            cluster.store(1).lock_table(),
            vec![("<x,1>".to_string(), LockState::Free)]
        );
        assert!(cluster.store(2).snapshot().is_empty());
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn dump_concatenates_replicas_in_order() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    within(async {
        cluster.store(2).put("<c>");
        cluster.store(1).put("<b>");
        cluster.store(0).put("<a>");
        cluster.store(0).put("<d>");
        cluster.store(2).put("<d>");

        assert_eq!(
            cluster.coordinator.dump().await?,
            tuples(&["<a>", "<d>", "<b>", "<c>", "<d>"])
        );
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn take_gives_up_after_max_rounds_and_releases_its_locks() -> Result<()> {
    let config = CoordinatorConfig {
        take_retry: TakeRetryPolicy {
            max_rounds: Some(2),
            ..fast_config().take_retry
        },
        wait_timeout: None,
    };
    let cluster = TestCluster::start(3, config)?;
    assert_eq!(cluster.coordinator.voters(5).ids(), [2, 0]);

    within(async {
        cluster.coordinator.put("<a,1>", &[]).await?;

        // Another client already holds the tuple at one of client 5's voters.
        let held = cluster.store(2).acquire_lock(99, &Pattern::new("<a,1>")?).await;
        assert_eq!(held, tuples(&["<a,1>"]));

        let err = cluster
            .coordinator
            .take(5, "<a,.*>", &[])
            .await
            .expect_err("take must fail while the tuple is held");
        assert!(
            matches!(err, CoordinatorError::TakeContended { client_id: 5, rounds: 2, .. }),
            "unexpected error: {err:?}"
        );

        assert_eq!(
            cluster.store(0).lock_table(),
            vec![("<a,1>".to_string(), LockState::Free)]
        );
        assert_eq!(
            cluster.store(2).lock_table(),
            vec![("<a,1>".to_string(), LockState::OwnedBy(99))]
        );
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn read_without_a_match_hits_the_deadline() -> Result<()> {
    let config = CoordinatorConfig {
        wait_timeout: Some(Duration::from_millis(200)),
        ..fast_config()
    };
    let cluster = TestCluster::start(2, config)?;

    let err = within(cluster.coordinator.read("<missing>", &[]))
        .await
        .expect_err("nothing matches");
    assert!(
        matches!(err, CoordinatorError::DeadlineExceeded { wanted: 1, .. }),
        "unexpected error: {err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn lock_round_deadline_leaves_no_reservation_behind() -> Result<()> {
    let config = CoordinatorConfig {
        take_retry: TakeRetryPolicy {
            max_rounds: Some(5),
            ..fast_config().take_retry
        },
        wait_timeout: Some(Duration::from_millis(200)),
    };
    let cluster = TestCluster::start(3, config)?;

    within(async {
        let err = cluster
            .coordinator
            .take(7, "<z>", &[])
            .await
            .expect_err("nothing to take yet");
        assert!(
            matches!(err, CoordinatorError::DeadlineExceeded { key, .. } if key.kind == OpKind::Lock),
            "unexpected error: {err:?}"
        );

        cluster.coordinator.put("<z>", &[]).await?;
        sleep(Duration::from_millis(50)).await;
        for id in 0..3 {
            assert_eq!(
                cluster.store(id).lock_table(),
                vec![("<z>".to_string(), LockState::Free)]
            );
        }

        assert_eq!(cluster.coordinator.take(8, "<z>", &[]).await?, "<z>");
        assert!(cluster.coordinator.dump().await?.is_empty());
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn removal_deadline_cancels_the_pending_removals() -> Result<()> {
    let config = CoordinatorConfig {
        wait_timeout: Some(Duration::from_millis(200)),
        ..fast_config()
    };
    let cluster = TestCluster::start(3, config)?;

    within(async {
        // Both voters of client 7 hold the tuple; replica 0 never gets one.
        cluster.store(1).put("<q>");
        cluster.store(2).put("<q>");

        let err = cluster
            .coordinator
            .take(7, "<q>", &[])
            .await
            .expect_err("replica 0 cannot remove <q>");
        assert!(
            matches!(err, CoordinatorError::DeadlineExceeded { key, .. } if key.kind == OpKind::Take),
            "unexpected error: {err:?}"
        );

        // A late copy at replica 0 is not removed on behalf of the failed take.
        cluster.store(0).put("<q>");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            cluster.store(0).lock_table(),
            vec![("<q>".to_string(), LockState::Free)]
        );
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn delay_lists_must_cover_every_replica() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    let err = cluster
        .coordinator
        .put("<a>", &[1])
        .await
        .expect_err("one delay for three replicas");
    assert!(matches!(
        err,
        CoordinatorError::DelayCount {
            expected: 3,
            got: 1
        }
    ));
    assert!(cluster.store(0).snapshot().is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_arguments_are_rejected_before_any_call() -> Result<()> {
    let cluster = TestCluster::start(3, fast_config())?;

    let err = cluster.coordinator.put("a,1", &[]).await.expect_err("not a tuple");
    assert!(matches!(err, CoordinatorError::InvalidArgument(_)));

    let err = cluster.coordinator.read("<(", &[]).await.expect_err("bad regex");
    assert!(matches!(err, CoordinatorError::InvalidArgument(_)));

    let err = cluster
        .coordinator
        .take(1, "<(", &[])
        .await
        .expect_err("bad regex");
    assert!(matches!(err, CoordinatorError::InvalidArgument(_)));

    assert!(cluster.coordinator.dump().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_replica_fails_the_put() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = listener.local_addr()?;
    drop(listener);

    let live: Vec<Arc<ReplicaService>> =
        (0..2).map(|id| Arc::new(ReplicaService::new(id))).collect();
    let mut replicas: Vec<SharedReplica> = live
        .iter()
        .map(|service| Arc::new(LocalReplica::new(Arc::clone(service))) as SharedReplica)
        .collect();
    replicas.push(Arc::new(RemoteReplica::new(dead_addr.to_string())));
    let coordinator = Coordinator::new(replicas, fast_config())?;

    let err = within(coordinator.put("<a>", &[]))
        .await
        .expect_err("replica 2 is down");
    assert!(
        matches!(err, CoordinatorError::Unreachable { replica: 2, .. }),
        "unexpected error: {err:?}"
    );

    // Replicas that did answer keep the tuple; there is no rollback.
    assert_eq!(live[0].store().snapshot(), tuples(&["<a>"]));
    Ok(())
}

#[tokio::test]
async fn request_ids_are_never_reused() -> Result<()> {
    let cluster = TestCluster::start(2, fast_config())?;

    within(async {
        cluster.coordinator.put("<a>", &[]).await?;
        cluster.coordinator.read("<a>", &[]).await?;
        cluster.coordinator.dump().await?;
        Ok::<_, CoordinatorError>(())
    })
    .await?;

    // One group per operation; each carries its own request id.
    let put = GroupKey::new(1, OpKind::Put);
    let read = GroupKey::new(2, OpKind::Read);
    let dump = GroupKey::new(3, OpKind::Dump);
    assert_eq!(cluster.coordinator.collector().count(put), 2);
    assert!(cluster.coordinator.collector().count(read) >= 1);
    assert_eq!(cluster.coordinator.collector().count(dump), 2);
    Ok(())
}
