
use common::{eventually, fast_config, nodes, start_cluster, wait_running};
use gnsd::consensus::{NodeId, TransitionId};
use gnsd::controller::RemoveOutcome;
use gnsd::network::{DemandReport, Liveness};
use gnsd::storage::ActiveState;
use gnsd::LocalCluster;
use std::collections::BTreeSet;
use std::time::Duration;

/// Waits until exactly `members` serve `name`, all of them for `generation`.
async fn serves_only(
    cluster: &LocalCluster,
    name: &str,
    members: &BTreeSet<NodeId>,
    generation: TransitionId,
) -> bool {
    eventually(Duration::from_secs(5), || async {
        for id in cluster.node_ids() {
            let served = cluster
                .coordinator(id)
                .unwrap()
                .actives()
                .generation(name)
                .await
                .map(|served| served.transition_id);
            let expected = members.contains(&id).then_some(generation);
            if served != expected {
                return false;
            }
        }
        true
    })
    .await
}

#[tokio::test]
async fn new_record_starts_its_initial_actives() {
    let cluster = start_cluster(fast_config(10)).await;
    let coordinator = cluster.coordinator(NodeId(1)).unwrap().clone();

    let outcome = coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 3]))
        .await
        .unwrap();
    assert!(outcome.proposed);
    assert_eq!(outcome.actives.len(), 3);
    assert!(outcome.actives.is_disjoint(&nodes(&[1, 2, 3])));

    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);
    for id in 4..=10 {
        assert!(cluster.record_on(NodeId(id), "alpha").await.unwrap().is_none());
    }

    let record = cluster.record_on(NodeId(1), "alpha").await.unwrap().unwrap();
    assert!(serves_only(&cluster, "alpha", record.active_set(), record.active_transition_id()).await);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn leader_reconfigures_idle_name_to_minimum_set() {
    let cluster = start_cluster(fast_config(10)).await;
    let coordinator = cluster.coordinator(NodeId(1)).unwrap().clone();
    coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 3]))
        .await
        .unwrap();
    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);
    let before = cluster.record_on(NodeId(1), "alpha").await.unwrap().unwrap();

    // Node 2 is a primary but not the leader.
    let follower = cluster.node(NodeId(2)).unwrap().scheduler().run_round().await.unwrap();
    assert_eq!(follower.proposed, 0);
    assert_eq!(follower.not_leader, 1);

    let leader = cluster.node(NodeId(1)).unwrap().scheduler().run_round().await.unwrap();
    assert_eq!(leader.scanned, 1);
    assert_eq!(leader.proposed, 1);

    assert!(
        eventually(Duration::from_secs(5), || async {
            match cluster.record_on(NodeId(1), "alpha").await.unwrap() {
                Some(record) => {
                    record.active_transition_id() != before.active_transition_id()
                        && record.compute_state() == ActiveState::ActiveRunning
                }
                None => false,
            }
        })
        .await
    );
    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);

    let after = cluster.record_on(NodeId(1), "alpha").await.unwrap().unwrap();
    assert_eq!(after.active_set().len(), 3);
    assert!(after.active_set().is_disjoint(&nodes(&[1, 2, 3])));
    assert_eq!(after.old_transition_id(), before.active_transition_id());
    for id in [2, 3] {
        let replica = cluster.record_on(NodeId(id), "alpha").await.unwrap().unwrap();
        assert_eq!(replica.active_transition_id(), after.active_transition_id());
    }

    // The whole old generation stopped and the whole new one serves.
    assert!(serves_only(&cluster, "alpha", after.active_set(), after.active_transition_id()).await);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn unchanged_sets_are_skipped_when_enabled() {
    let mut config = fast_config(10);
    config.controller.skip_unchanged_actives = true;
    let cluster = start_cluster(config).await;
    let coordinator = cluster.coordinator(NodeId(1)).unwrap().clone();
    coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 3]))
        .await
        .unwrap();
    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);
    let before = cluster.record_on(NodeId(1), "alpha").await.unwrap().unwrap();

    // Idle demand keeps the minimum set, which the initial set already is.
    let summary = cluster.node(NodeId(1)).unwrap().scheduler().run_round().await.unwrap();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.proposed, 0);

    let after = cluster.record_on(NodeId(1), "alpha").await.unwrap().unwrap();
    assert_eq!(after.active_transition_id(), before.active_transition_id());
    assert_eq!(after.compute_state(), ActiveState::ActiveRunning);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn read_only_demand_spreads_the_name_everywhere() {
    let cluster = start_cluster(fast_config(6)).await;
    let coordinator = cluster.coordinator(NodeId(1)).unwrap().clone();
    coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 3]))
        .await
        .unwrap();
    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);

    coordinator
        .record_demand(&DemandReport {
            name: "alpha".to_string(),
            reporter: NodeId(5),
            lookups: 500,
            updates: 0,
        })
        .await
        .unwrap();
    let summary = cluster.node(NodeId(1)).unwrap().scheduler().run_round().await.unwrap();
    assert_eq!(summary.proposed, 1);

    assert!(
        eventually(Duration::from_secs(5), || async {
            match cluster.record_on(NodeId(1), "alpha").await.unwrap() {
                Some(record) => {
                    record.active_set().len() == 6
                        && record.compute_state() == ActiveState::ActiveRunning
                }
                None => false,
            }
        })
        .await
    );

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn removal_stops_actives_and_acknowledges_the_request() {
    let cluster = start_cluster(fast_config(10)).await;
    let coordinator = cluster.coordinator(NodeId(1)).unwrap().clone();
    coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 3]))
        .await
        .unwrap();
    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);

    let receiver = coordinator.request_removal("alpha").await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RemoveOutcome::Removed);

    assert!(
        eventually(Duration::from_secs(5), || async {
            for id in 1..=3 {
                if cluster.record_on(NodeId(id), "alpha").await.unwrap().is_some() {
                    return false;
                }
            }
            true
        })
        .await
    );

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn surviving_primaries_finish_a_start_after_a_crash() {
    let mut config = fast_config(10);
    config.controller.max_attempts = 2;
    let cluster = start_cluster(config).await;
    let coordinator = cluster.coordinator(NodeId(1)).unwrap().clone();

    // Every candidate active is cut off, so the first start attempt fails.
    for id in 4..=10 {
        cluster.partition(NodeId(id)).await;
    }
    let outcome = coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 3]))
        .await
        .unwrap();
    assert!(outcome.proposed);

    assert!(
        eventually(Duration::from_secs(5), || async {
            let mut stalled = coordinator.running_drivers() == 0;
            for id in 1..=3 {
                stalled &= matches!(
                    cluster.record_on(NodeId(id), "alpha").await.unwrap(),
                    Some(record) if record.compute_state() == ActiveState::NoActiveRunning
                );
            }
            stalled
        })
        .await
    );

    for id in 4..=10 {
        cluster.heal(NodeId(id)).await;
    }
    assert!(
        eventually(Duration::from_secs(5), || async {
            [2, 3].iter().all(|survivor| {
                let detector = cluster.node(NodeId(*survivor)).unwrap().detector();
                outcome.actives.iter().all(|node| detector.is_reachable(*node))
            })
        })
        .await
    );

    cluster.crash(NodeId(1)).await.unwrap();
    assert!(wait_running(&cluster, "alpha", &[2, 3]).await);

    let record = cluster.record_on(NodeId(2), "alpha").await.unwrap().unwrap();
    assert_eq!(record.active_set(), &outcome.actives);
    assert!(cluster.coordinators().get(&NodeId(1)).is_none());

    cluster.shutdown().await.unwrap();
}
