//! Leader step-down against the in-memory broker

use jetctl::broker::{Broker, ClusterInfo, ConsumerHandle, MemoryBroker, PeerInfo};
use jetctl::consumer::{ConsumerConfig, LeaderStepDown, StepDownOutcome, POLL_INTERVAL, STEP_DOWN_ATTEMPTS};
use jetctl::error::{ConsumerError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn consumer(broker: &Arc<MemoryBroker>, clustered: bool) -> ConsumerHandle {
    broker.add_stream("ORDERS", &["orders.>"]);
    let config = ConsumerConfig {
        durable_name: Some("NEW".into()),
        ..Default::default()
    };
    let info = broker.create_consumer("ORDERS", &config).await.unwrap();

    if clustered {
        let replicas = ["n2", "n3"]
            .iter()
            .map(|name| PeerInfo {
                name: name.to_string(),
                current: true,
                active: Duration::from_millis(5),
            })
            .collect();
        broker
            .set_cluster(
                "ORDERS",
                "NEW",
                ClusterInfo {
                    name: Some("east".into()),
                    leader: "n1".into(),
                    replicas,
                },
            )
            .unwrap();
    }

    ConsumerHandle::new(broker.clone(), &info)
}

#[tokio::test(start_paused = true)]
async fn test_not_clustered_issues_no_request() {
    let broker = Arc::new(MemoryBroker::new());
    let handle = consumer(&broker, false).await;

    let err = LeaderStepDown::new(&handle).run().await.unwrap_err();
    assert!(matches!(err, ConsumerError::NotClustered { .. }));
    assert_eq!(err.kind(), ErrorKind::Cluster);
    assert_eq!(broker.step_down_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stops_on_first_leader_change() {
    let broker = Arc::new(MemoryBroker::new());
    let handle = consumer(&broker, true).await;
    broker.elect_after("ORDERS", "NEW", Some(1)).unwrap();

    let started = Instant::now();
    let report = LeaderStepDown::new(&handle).run().await.unwrap();

    assert!(report.outcome.is_elected());
    assert_eq!(broker.step_down_requests(), 1);
    // precondition read, one poll, final state
    assert_eq!(broker.info_requests(), 3);
    assert_eq!(started.elapsed(), POLL_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_after_all_attempts() {
    let broker = Arc::new(MemoryBroker::new());
    let handle = consumer(&broker, true).await;
    broker.elect_after("ORDERS", "NEW", None).unwrap();

    let report = LeaderStepDown::new(&handle).run().await.unwrap();

    match report.outcome {
        StepDownOutcome::Unchanged { leader, elapsed } => {
            assert_eq!(leader, "n1");
            assert_eq!(elapsed, POLL_INTERVAL * STEP_DOWN_ATTEMPTS as u32);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(broker.info_requests(), 2 + STEP_DOWN_ATTEMPTS);
    assert_eq!(report.state.cluster.unwrap().leader, "n1");
}

#[tokio::test(start_paused = true)]
async fn test_state_errors_count_as_attempts() {
    let broker = Arc::new(MemoryBroker::new());
    let handle = consumer(&broker, true).await;
    broker.elect_after("ORDERS", "NEW", Some(1)).unwrap();

    // the precondition read succeeds, then two polls fail
    let info = handle.state().await.unwrap();
    assert!(info.cluster.is_some());
    let step_down = LeaderStepDown::new(&handle);

    let run = step_down.run();
    tokio::pin!(run);
    tokio::select! {
        biased;
        _ = &mut run => panic!("finished before the first poll"),
        _ = tokio::task::yield_now() => {}
    }
    broker.fail_next_info(2);

    let report = run.await.unwrap();
    match report.outcome {
        StepDownOutcome::Elected { attempts, leader, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(leader, "n2");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_polls_failing_is_still_reported() {
    let broker = Arc::new(MemoryBroker::new());
    let handle = consumer(&broker, true).await;

    let run = LeaderStepDown::new(&handle);
    let fut = run.run();
    tokio::pin!(fut);
    tokio::select! {
        biased;
        _ = &mut fut => panic!("finished before the first poll"),
        _ = tokio::task::yield_now() => {}
    }
    broker.fail_next_info(STEP_DOWN_ATTEMPTS);

    let report = fut.await.unwrap();
    assert!(!report.outcome.is_elected());
    assert_eq!(broker.step_down_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outcome_survives_failed_final_read() {
    let broker = Arc::new(MemoryBroker::new());
    let handle = consumer(&broker, true).await;
    broker.elect_after("ORDERS", "NEW", None).unwrap();

    let step_down = LeaderStepDown::new(&handle);
    let fut = step_down.run();
    tokio::pin!(fut);
    tokio::select! {
        biased;
        _ = &mut fut => panic!("finished before the first poll"),
        _ = tokio::task::yield_now() => {}
    }
    // every poll and the closing state read fail
    broker.fail_next_info(STEP_DOWN_ATTEMPTS + 1);

    let report = fut.await.unwrap();
    match report.outcome {
        StepDownOutcome::Unchanged { ref leader, .. } => assert_eq!(leader, "n1"),
        ref other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.state.name, "NEW");
    assert_eq!(report.state.cluster.unwrap().leader, "n1");
    assert_eq!(broker.info_requests(), 2 + STEP_DOWN_ATTEMPTS);
}
