
use chrono::Utc;
use common::{
    eventually, fast_config, nodes, running_record, standalone_coordinator, start_cluster,
    wait_running, RecordingTransport, StaticLiveness,
};
use gnsd::consensus::{NodeId, TransitionId};
use gnsd::network::{FailureEvent, NetworkMessage, PeerStatus};
use gnsd::storage::{MemoryRecordStore, RecordStore, RemovalRequest};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn restarted_primaries_resume_unfinished_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(10);
    config.storage_path = Some(dir.path().to_path_buf());

    // Snapshots as left by a crash in the middle of a reconfiguration and of
    // a removal.
    let mut alpha = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    alpha
        .begin_transition(nodes(&[7, 8, 9]), TransitionId::generate())
        .unwrap();
    let mut beta = running_record("beta", &[1, 2, 3], &[4, 5]);
    beta.mark_for_removal(RemovalRequest {
        request_id: Uuid::new_v4(),
        requested_by: NodeId(1),
    });
    for id in 1..=3 {
        let store = MemoryRecordStore::open(dir.path().join(format!("node-{}", id)))
            .await
            .unwrap();
        store.put(alpha.clone()).await.unwrap();
        store.put(beta.clone()).await.unwrap();
        store.save_snapshot().await.unwrap();
    }

    let cluster = start_cluster(config).await;

    assert!(wait_running(&cluster, "alpha", &[1, 2, 3]).await);
    let record = cluster.record_on(NodeId(2), "alpha").await.unwrap().unwrap();
    assert_eq!(record.active_set(), &nodes(&[7, 8, 9]));
    assert_eq!(record.active_transition_id(), alpha.active_transition_id());

    assert!(
        eventually(Duration::from_secs(5), || async {
            for id in 1..=3 {
                if cluster.record_on(NodeId(id), "beta").await.unwrap().is_some() {
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
async fn missed_failure_events_trigger_a_rescan() {
    let liveness = Arc::new(StaticLiveness::all_up());
    let transport = Arc::new(RecordingTransport::new(NodeId(1)));
    let coordinator = standalone_coordinator(liveness.clone(), transport.clone()).await;

    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    record
        .begin_transition(nodes(&[7, 8]), TransitionId::generate())
        .unwrap();
    coordinator.store().put(record).await.unwrap();

    let watcher = tokio::spawn(coordinator.clone().watch_failures());
    assert!(eventually(Duration::from_secs(1), || async { liveness.subscribers() > 0 }).await);
    assert!(transport.sent().is_empty());

    // More events than the channel holds, so the watcher falls behind.
    for _ in 0..32 {
        liveness.emit(FailureEvent {
            node: NodeId(9),
            status: PeerStatus::Up,
            at: Utc::now(),
        });
    }

    assert!(
        eventually(Duration::from_secs(2), || async {
            transport.sent().iter().any(|(to, message)| {
                *to == NodeId(4)
                    && matches!(message, NetworkMessage::StopActiveSet(request) if request.name == "alpha")
            })
        })
        .await
    );

    watcher.abort();
    coordinator.shutdown();
}

#[tokio::test]
async fn one_unresumable_record_does_not_block_the_rest() {
    let liveness = Arc::new(StaticLiveness::all_up());
    let transport = Arc::new(RecordingTransport::new(NodeId(1)));
    let coordinator = standalone_coordinator(liveness, transport.clone()).await;

    // alpha's primary group already exists with other members, so rejoining
    // it with the stored membership fails.
    coordinator
        .add_record_with_primaries("alpha", nodes(&[1, 2, 4]))
        .await
        .unwrap();
    let mut alpha = running_record("alpha", &[1, 2, 3], &[5, 6]);
    alpha
        .begin_transition(nodes(&[7, 8]), TransitionId::generate())
        .unwrap();
    let mut beta = running_record("beta", &[1, 2, 3], &[4, 5, 6]);
    beta.begin_transition(nodes(&[7, 8]), TransitionId::generate())
        .unwrap();
    coordinator.store().put(alpha).await.unwrap();
    coordinator.store().put(beta).await.unwrap();

    assert_eq!(coordinator.resume_in_flight().await.unwrap(), 1);

    let stops_for = |name: &str| {
        transport
            .sent()
            .iter()
            .filter(|(_, message)| {
                matches!(message, NetworkMessage::StopActiveSet(request) if request.name == name)
            })
            .count()
    };
    assert!(eventually(Duration::from_secs(2), || async { stops_for("beta") > 0 }).await);
    assert_eq!(stops_for("alpha"), 0);

    coordinator.shutdown();
}
