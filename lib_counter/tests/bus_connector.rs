use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lib_counter::connections::MemoryBroker;
use lib_counter::{
    BusConnector, ConnectorOptions, ConnectorState, CounterError, CounterSink, Disposition, MessageHandler,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (MemoryBroker, Arc<CounterSink>, BusConnector) {
    setup_with_prefetch(1)
}

fn setup_with_prefetch(prefetch: usize) -> (MemoryBroker, Arc<CounterSink>, BusConnector) {
    let broker = MemoryBroker::new();
    let sink = Arc::new(CounterSink::new());
    let bus = BusConnector::new(
        Arc::new(broker.clone()),
        ConnectorOptions {
            topic: "metrics".to_string(),
            prefetch,
            retry_interval: Duration::from_millis(25),
        },
        sink.clone(),
    );
    (broker, sink, bus)
}

/// Handler forwarding every payload, tagged with `name`, to `tx`.
fn recorder(name: &'static str, tx: mpsc::UnboundedSender<(&'static str, Vec<u8>)>) -> impl MessageHandler {
    move |payload: Vec<u8>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((name, payload));
            Disposition::Acknowledge
        }
    }
}

/// Polls `check` until it holds or the wait expires.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn recv_n(rx: &mut mpsc::UnboundedReceiver<(&'static str, Vec<u8>)>, n: usize) -> Vec<(&'static str, Vec<u8>)> {
    let mut out = Vec::new();
    for _ in 0..n {
        out.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    out.sort();
    out
}

#[tokio::test]
async fn test_registered_before_connect_is_realized_on_connect() {
    let (broker, _sink, bus) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.register("first", recorder("first", tx.clone())).await.unwrap();
    bus.register("second", recorder("second", tx.clone())).await.unwrap();
    assert!(broker.consume_log().is_empty());

    bus.connect().await.unwrap();
    assert_eq!(bus.state(), ConnectorState::Connected);
    assert_eq!(broker.consume_log(), vec!["first", "second"]);

    bus.publish(b"hello").await.unwrap();
    let got = recv_n(&mut rx, 2).await;
    assert_eq!(got, vec![("first", b"hello".to_vec()), ("second", b"hello".to_vec())]);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_register_while_connected_binds_immediately() {
    let (broker, _sink, bus) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.connect().await.unwrap();

    bus.register("late", recorder("late", tx)).await.unwrap();
    assert_eq!(broker.consume_log(), vec!["late"]);

    bus.publish(b"x").await.unwrap();
    assert_eq!(recv_n(&mut rx, 1).await, vec![("late", b"x".to_vec())]);
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_handler_requeues_and_success_acks_once() {
    let (broker, sink, bus) = setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let seen = attempts.clone();
    bus.register("flaky", move |payload: Vec<u8>| {
        let tx = tx.clone();
        let attempt = seen.fetch_add(1, Ordering::SeqCst);
        async move {
            let _ = tx.send(payload);
            if attempt == 0 {
                Disposition::Requeue
            } else {
                Disposition::Acknowledge
            }
        }
    })
    .await
    .unwrap();
    bus.connect().await.unwrap();

    bus.publish(b"job").await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"job".to_vec());
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"job".to_vec());

    eventually(|| broker.acked("flaky") == 1).await;
    // Acknowledged messages are never redelivered.
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    assert_eq!(broker.pending("flaky"), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(sink.total_processed(), 2);
    assert_eq!(sink.worker_errors(), 1);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_replays_registrations_in_order() {
    let (broker, _sink, bus) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let names = ["zeta", "alpha", "mid"];
    for name in names {
        bus.register(name, recorder(name, tx.clone())).await.unwrap();
    }
    bus.connect().await.unwrap();
    assert_eq!(broker.consume_log(), names);

    broker.sever_connections();
    eventually(|| broker.consume_log().len() == 6 && bus.state() == ConnectorState::Connected).await;

    let log = broker.consume_log();
    assert_eq!(&log[3..], names);
    assert_eq!(broker.connects(), 2);
    assert_eq!(bus.registrations().await, names);

    bus.publish(b"after").await.unwrap();
    let got = recv_n(&mut rx, 3).await;
    let mut expected: Vec<_> = names.iter().map(|n| (*n, b"after".to_vec())).collect();
    expected.sort();
    assert_eq!(got, expected);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_recovers_from_repeated_outages_and_failed_attempts() {
    let (broker, _sink, bus) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register("only", recorder("only", tx)).await.unwrap();
    bus.connect().await.unwrap();

    for round in 0..3 {
        broker.fail_next_connects(2);
        broker.sever_connections();
        eventually(|| bus.state() != ConnectorState::Connected).await;
        eventually(|| bus.state() == ConnectorState::Connected).await;

        let payload = format!("round-{}", round).into_bytes();
        bus.publish(&payload).await.unwrap();
        assert_eq!(recv_n(&mut rx, 1).await, vec![("only", payload)]);
    }
    assert_eq!(broker.connects(), 4);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_fails_while_disconnected() {
    let (broker, _sink, bus) = setup();
    assert!(matches!(
        bus.publish(b"early").await,
        Err(CounterError::TransportUnavailable(_))
    ));

    bus.connect().await.unwrap();
    broker.set_reachable(false);
    broker.sever_connections();
    eventually(|| bus.state() == ConnectorState::Recovering).await;
    assert!(matches!(
        bus.publish(b"outage").await,
        Err(CounterError::TransportUnavailable(_))
    ));

    broker.set_reachable(true);
    eventually(|| bus.state() == ConnectorState::Connected).await;
    bus.publish(b"back").await.unwrap();
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_register_during_outage_is_realized_by_recovery() {
    let (broker, _sink, bus) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register("early", recorder("early", tx.clone())).await.unwrap();
    bus.connect().await.unwrap();

    broker.set_reachable(false);
    broker.sever_connections();
    eventually(|| bus.state() == ConnectorState::Recovering).await;
    bus.register("during", recorder("during", tx)).await.unwrap();

    broker.set_reachable(true);
    eventually(|| bus.state() == ConnectorState::Connected).await;
    assert_eq!(broker.consume_log(), vec!["early", "early", "during"]);

    bus.publish(b"m").await.unwrap();
    assert_eq!(
        recv_n(&mut rx, 2).await,
        vec![("during", b"m".to_vec()), ("early", b"m".to_vec())]
    );
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_in_flight_handler() {
    let (broker, _sink, bus) = setup();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (started.clone(), finished.clone());
    bus.register("slow", move |_payload: Vec<u8>| {
        let (s, f) = (s.clone(), f.clone());
        async move {
            s.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.store(true, Ordering::SeqCst);
            Disposition::Acknowledge
        }
    })
    .await
    .unwrap();
    bus.connect().await.unwrap();
    bus.publish(b"work").await.unwrap();
    eventually(|| started.load(Ordering::SeqCst)).await;

    let mut states = bus.watch_state();
    timeout(WAIT, bus.close()).await.unwrap().unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(*states.borrow_and_update(), ConnectorState::Closed);
    // Settled after the channel was gone, so it stays queued.
    assert_eq!(broker.pending("slow"), 1);
}

#[tokio::test]
async fn test_prefetch_bounds_unacknowledged_deliveries() {
    let (broker, sink, bus) = setup_with_prefetch(2);
    let gate = Arc::new(Semaphore::new(0));

    let held = gate.clone();
    bus.register("slow", move |_payload: Vec<u8>| {
        let held = held.clone();
        async move {
            if let Ok(permit) = held.acquire().await {
                permit.forget();
            }
            Disposition::Acknowledge
        }
    })
    .await
    .unwrap();
    bus.connect().await.unwrap();

    for i in 0..5 {
        bus.publish(format!("m{}", i).as_bytes()).await.unwrap();
    }
    eventually(|| broker.in_flight("slow") == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.in_flight("slow"), 2);
    assert_eq!(broker.pending("slow"), 5);

    gate.add_permits(5);
    eventually(|| broker.acked("slow") == 5).await;
    assert_eq!(broker.peak_in_flight("slow"), 2);
    assert_eq!(broker.pending("slow"), 0);
    assert_eq!(sink.total_processed(), 5);

    bus.close().await.unwrap();
}
