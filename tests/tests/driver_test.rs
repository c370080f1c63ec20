
use common::{nodes, running_record, RecordingTransport, StaticLiveness};
use gnsd::consensus::{NodeId, TransitionId};
use gnsd::controller::{
    run_periodic, spawn_periodic, Direction, DriverContext, DriverOutcome, PeriodicTask, Poll,
    TransitionDriver,
};
use gnsd::network::NetworkMessage;
use gnsd::storage::{MemoryRecordStore, RecordState, RecordStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<MemoryRecordStore>,
    transport: Arc<RecordingTransport>,
    liveness: Arc<StaticLiveness>,
}

impl Harness {
    fn new(liveness: StaticLiveness) -> Self {
        Self {
            store: Arc::new(MemoryRecordStore::new()),
            transport: Arc::new(RecordingTransport::new(NodeId(1))),
            liveness: Arc::new(liveness),
        }
    }

    fn context(&self, max_attempts: u32) -> DriverContext {
        DriverContext {
            local: NodeId(1),
            store: self.store.clone(),
            transport: self.transport.clone(),
            liveness: self.liveness.clone(),
            max_attempts,
        }
    }
}

fn unstarted_record() -> RecordState {
    RecordState::new(
        "alpha",
        nodes(&[1, 2, 3]),
        nodes(&[4, 5, 6, 7, 8]),
        TransitionId::generate(),
        20,
    )
}

#[tokio::test(start_paused = true)]
async fn driver_gives_up_after_max_attempts() {
    let harness = Harness::new(StaticLiveness::all_up());
    let record = unstarted_record();
    harness.store.put(record.clone()).await.unwrap();

    let driver = TransitionDriver::start_new(&record, harness.context(3));
    let outcome = run_periodic(driver, Duration::from_secs(3), Duration::ZERO).await;

    assert_eq!(outcome, DriverOutcome::Exhausted);
    let recipients = harness.transport.recipients();
    assert_eq!(recipients.len(), 3);
    assert!(recipients.iter().all(|node| record.active_set().contains(node)));

    // Nothing else goes out once the driver has stopped.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.transport.recipients().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn each_candidate_is_tried_once() {
    let harness = Harness::new(StaticLiveness::all_up());
    let record = RecordState::new(
        "alpha",
        nodes(&[1, 2, 3]),
        nodes(&[4, 5]),
        TransitionId::generate(),
        20,
    );
    harness.store.put(record.clone()).await.unwrap();

    let handle = spawn_periodic(
        TransitionDriver::start_new(&record, harness.context(6)),
        Duration::from_secs(1),
        Duration::from_millis(200),
    );

    assert_eq!(handle.await.unwrap(), DriverOutcome::Exhausted);
    let mut recipients = harness.transport.recipients();
    recipients.sort();
    assert_eq!(recipients, vec![NodeId(4), NodeId(5)]);
}

#[tokio::test]
async fn driver_completes_once_the_record_confirms() {
    let harness = Harness::new(StaticLiveness::all_up());
    let mut record = unstarted_record();
    harness.store.put(record.clone()).await.unwrap();

    let mut driver = TransitionDriver::start_new(&record, harness.context(10));
    assert_eq!(driver.poll_once().await, Poll::Continue);
    assert_eq!(driver.attempts(), 1);

    record.confirm_new_running(record.active_transition_id());
    harness.store.put(record).await.unwrap();

    assert_eq!(driver.poll_once().await, Poll::Finished(DriverOutcome::Completed));
    assert_eq!(harness.transport.recipients().len(), 1);
}

#[tokio::test]
async fn driver_stops_when_superseded() {
    let harness = Harness::new(StaticLiveness::all_up());
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    harness.store.put(record.clone()).await.unwrap();

    let mut stale = TransitionDriver::new(
        Direction::Start,
        "alpha",
        TransitionId::generate(),
        nodes(&[7, 8, 9]),
        nodes(&[4, 5, 6]),
        harness.context(10),
    );
    assert_eq!(stale.poll_once().await, Poll::Finished(DriverOutcome::Superseded));

    record
        .begin_transition(nodes(&[7, 8, 9]), TransitionId::generate())
        .unwrap();
    harness.store.put(record.clone()).await.unwrap();
    let mut stop = TransitionDriver::stop_old(&record, harness.context(10));
    assert_eq!(stop.direction(), Direction::Stop);
    assert_eq!(stop.transition_id(), record.old_transition_id());
    assert_eq!(stop.poll_once().await, Poll::Continue);

    let (to, message) = harness.transport.sent().remove(0);
    assert!(record.old_active_set().contains(&to));
    match message {
        NetworkMessage::StopActiveSet(request) => {
            assert_eq!(request.transition_id, record.old_transition_id());
            assert_eq!(request.proposer, NodeId(1));
            assert_eq!(request.target_set, nodes(&[4, 5, 6]));
            assert_eq!(request.prior_set, nodes(&[7, 8, 9]));
        }
        other => panic!("unexpected message {:?}", other),
    }

    // A newer generation replaces the one being stopped.
    record.confirm_old_stopped(record.old_transition_id());
    record.confirm_new_running(record.active_transition_id());
    record
        .begin_transition(nodes(&[2]), TransitionId::generate())
        .unwrap();
    harness.store.put(record).await.unwrap();
    assert_eq!(stop.poll_once().await, Poll::Finished(DriverOutcome::Superseded));
}

#[tokio::test]
async fn driver_cancels_when_the_record_disappears() {
    let harness = Harness::new(StaticLiveness::all_up());
    let record = unstarted_record();

    let mut driver = TransitionDriver::start_new(&record, harness.context(10));
    assert_eq!(driver.poll_once().await, Poll::Finished(DriverOutcome::RecordMissing));
    assert!(harness.transport.sent().is_empty());
}

#[tokio::test]
async fn fastest_reachable_candidate_goes_first() {
    let latencies: HashMap<NodeId, Duration> = [
        (NodeId(4), Duration::from_millis(30)),
        (NodeId(5), Duration::from_millis(5)),
        (NodeId(6), Duration::from_millis(1)),
    ]
    .into_iter()
    .collect();
    let liveness = StaticLiveness::with_latencies(latencies);
    liveness.set_down(NodeId(6));
    let harness = Harness::new(liveness);

    let record = RecordState::new(
        "alpha",
        nodes(&[1, 2, 3]),
        nodes(&[4, 5, 6, 7]),
        TransitionId::generate(),
        20,
    );
    harness.store.put(record.clone()).await.unwrap();

    let mut driver = TransitionDriver::start_new(&record, harness.context(10));
    for _ in 0..4 {
        assert_eq!(driver.poll_once().await, Poll::Continue);
    }

    // 6 is down; 7 has no estimate and comes last.
    assert_eq!(
        harness.transport.recipients(),
        vec![NodeId(5), NodeId(4), NodeId(7)]
    );
    assert_eq!(driver.attempts(), 4);
    assert_eq!(driver.queried().len(), 3);
}
