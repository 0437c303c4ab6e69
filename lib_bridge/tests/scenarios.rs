//! End-to-end runs of the bridge against in-memory fakes, on paused tokio
//! time so interval and backoff timing is exact.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{approx, book, snapshot_at, utc, FakeTransport, MemoryStore};
use lib_bridge::core::offline_buffer::BufferedLine;
use lib_bridge::{
    AnchoredClock, BreakerState, Bridge, BridgeSettings, CircuitBreaker, Clock, EventLog, FlushOutcome, OfflineBuffer,
    Row, SecurityType, Table, TransportMode, WriteOutcome,
};
use tokio::time::sleep;

fn settings(dir: &tempfile::TempDir) -> BridgeSettings {
    BridgeSettings {
        buffer_path: dir.path().join("greeks_buffer.jsonl"),
        ..BridgeSettings::default()
    }
}

async fn buffered_snapshots(breaker: &CircuitBreaker) -> usize {
    breaker
        .buffer()
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|line| matches!(line, BufferedLine::Record(Row::Snapshot(_))))
        .count()
}

#[tokio::test(start_paused = true)]
async fn one_cycle_with_a_reachable_store_writes_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::new(utc("2024-03-12T15:00:00Z")));

    let bridge = Bridge::new(
        BridgeSettings {
            snapshot_interval: Duration::from_secs(3600),
            ..settings(&dir)
        },
        store.clone(),
        clock,
    );
    let transport = Arc::new(FakeTransport::new(bridge.events(), book()));
    let handle = bridge.start(transport.clone()).await.unwrap();

    sleep(Duration::from_secs(1)).await;
    let status = handle.status().await;
    assert!(status.connection.connected);
    assert_eq!(status.breaker, BreakerState::Closed);
    assert_eq!(status.pending, 0);
    handle.shutdown().await;

    assert!(store.has_table(Table::PortfolioGreeks));
    assert!(store.has_table(Table::ApiLog));

    let snapshots = store.snapshots();
    assert_eq!(snapshots.len(), 1);
    let s = &snapshots[0];
    assert_eq!(s.timestamp, utc("2024-03-12T15:00:00Z"));
    assert!(approx(s.delta, 290.0), "delta {}", s.delta);
    assert!(approx(s.gamma, 1.0), "gamma {}", s.gamma);
    assert!(approx(s.vega, -40.0), "vega {}", s.vega);
    assert!(approx(s.theta, 2.0), "theta {}", s.theta);
    assert_eq!(s.underlying_price, Some(500.0));

    let buffer = OfflineBuffer::open(dir.path().join("greeks_buffer.jsonl")).await.unwrap();
    assert!(buffer.is_empty().await.unwrap());

    let logs = store.log_messages();
    assert!(logs.iter().any(|m| m.contains("bridge starting in SOCKET mode")));
}

#[tokio::test(start_paused = true)]
async fn missing_greeks_count_as_zero_and_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::new(utc("2024-03-12T15:00:00Z")));

    let mut positions = book();
    positions[1].greeks = None;
    assert_eq!(positions[1].sec_type, SecurityType::Option);

    let bridge = Bridge::new(
        BridgeSettings {
            snapshot_interval: Duration::from_secs(3600),
            ..settings(&dir)
        },
        store.clone(),
        clock,
    );
    let transport = Arc::new(FakeTransport::new(bridge.events(), positions));
    let handle = bridge.start(transport).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    handle.shutdown().await;

    let snapshots = store.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert!(approx(snapshots[0].delta, 200.0));
    assert!(approx(snapshots[0].gamma, 4.0));
    assert!(store
        .log_messages()
        .iter()
        .any(|m| m.starts_with("greeks missing for 1 of 3 positions") && m.contains("SPY 240621P00490000")));
}

#[tokio::test(start_paused = true)]
async fn store_outage_buffers_cycles_and_recovery_drains_them_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let base = utc("2024-03-12T15:00:00Z");
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::new(base));

    let bridge = Bridge::new(
        BridgeSettings {
            snapshot_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(3600),
            ..settings(&dir)
        },
        store.clone(),
        clock,
    );
    let transport = Arc::new(FakeTransport::new(bridge.events(), book()));
    let handle = bridge.start(transport).await.unwrap();

    // Schema is in place; the store goes away before any loop runs.
    store.set_down(true);
    sleep(Duration::from_secs(119)).await;

    assert!(store.snapshots().is_empty());
    assert_eq!(buffered_snapshots(handle.breaker()).await, 2);
    assert_eq!(handle.status().await.breaker, BreakerState::Open);

    store.set_down(false);
    sleep(Duration::from_secs(6)).await;

    let status = handle.status().await;
    assert_eq!(status.breaker, BreakerState::Closed);
    assert_eq!(status.pending, 0);
    handle.shutdown().await;

    let stamps: Vec<_> = store.snapshots().iter().map(|s| s.timestamp).collect();
    assert_eq!(
        stamps,
        vec![
            base,
            base + chrono::Duration::seconds(60),
            base + chrono::Duration::seconds(120)
        ]
    );
    assert!(store.log_messages().iter().any(|m| m.contains("CLOSED -> OPEN")));
    assert!(store.log_messages().iter().any(|m| m.contains("HALF_OPEN -> CLOSED")));
}

#[tokio::test(start_paused = true)]
async fn hung_store_does_not_stall_snapshots_or_the_watchdog() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::new(utc("2024-03-12T15:00:00Z")));

    let bridge = Bridge::new(
        BridgeSettings {
            snapshot_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(2),
            flush_interval: Duration::from_secs(3600),
            write_timeout: Duration::from_secs(5),
            ..settings(&dir)
        },
        store.clone(),
        clock,
    );
    let transport = Arc::new(FakeTransport::new(bridge.events(), book()));
    let handle = bridge.start(transport.clone()).await.unwrap();
    store.set_hung(true);

    // Three hung writes at 5 s each open the breaker by t=15 s; the loops
    // keep their own cadence meanwhile.
    sleep(Duration::from_millis(10_500)).await;
    assert!(transport.fetches() >= 10, "fetches {}", transport.fetches());
    assert!(transport.liveness_checks() >= 5, "checks {}", transport.liveness_checks());
    assert_eq!(handle.status().await.breaker, BreakerState::Closed);

    sleep(Duration::from_secs(10)).await;
    assert!(transport.fetches() >= 20, "fetches {}", transport.fetches());
    assert!(transport.liveness_checks() >= 10, "checks {}", transport.liveness_checks());
    let status = handle.status().await;
    assert_eq!(status.breaker, BreakerState::Open);
    assert!(status.pending >= 3);
    assert!(store.snapshots().is_empty());

    store.set_hung(false);
    handle.shutdown().await;
}

#[tokio::test]
async fn buffered_writes_survive_restarts_without_loss_or_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeks_buffer.jsonl");
    let store = Arc::new(MemoryStore::default());
    let t0 = utc("2024-03-12T15:00:00Z");
    let t1 = utc("2024-03-12T15:01:00Z");

    let open = |store: Arc<MemoryStore>| {
        let path = path.clone();
        async move {
            let buffer = OfflineBuffer::open(path).await.unwrap();
            CircuitBreaker::new(
                store,
                buffer,
                3,
                Duration::from_secs(1),
                EventLog::detached(TransportMode::Socket),
            )
            .await
            .unwrap()
        }
    };

    store.set_down(true);
    let breaker = open(store.clone()).await;
    assert_eq!(breaker.write(snapshot_at(t0, 1.0)).await.unwrap(), WriteOutcome::Buffered);
    assert_eq!(breaker.write(snapshot_at(t1, 2.0)).await.unwrap(), WriteOutcome::Buffered);
    assert!(store.snapshots().is_empty());
    drop(breaker);

    // The store accepts one row and then drops again mid-drain.
    store.set_down(false);
    store.accept_only(1);
    let breaker = open(store.clone()).await;
    assert_eq!(breaker.state().await, BreakerState::Open);
    assert_eq!(breaker.pending().await, 2);
    assert_eq!(breaker.flush().await.unwrap(), FlushOutcome::Failed { drained: 1 });
    assert_eq!(breaker.pending().await, 1);
    drop(breaker);

    store.accept_only(usize::MAX);
    let breaker = open(store.clone()).await;
    assert_eq!(breaker.pending().await, 1);
    assert_eq!(breaker.flush().await.unwrap(), FlushOutcome::Recovered { drained: 1 });
    assert_eq!(breaker.state().await, BreakerState::Closed);

    let stored: Vec<_> = store.snapshots().iter().map(|s| (s.timestamp, s.delta)).collect();
    assert_eq!(stored, vec![(t0, 1.0), (t1, 2.0)]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_inside_blackout_waits_for_the_resume_instant() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    // 23:40 EST, five minutes before the window opens.
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::new(utc("2024-01-10T04:40:00Z")));

    let bridge = Bridge::new(
        BridgeSettings {
            snapshot_interval: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(30),
            ..settings(&dir)
        },
        store.clone(),
        clock,
    );
    let transport = Arc::new(FakeTransport::new(bridge.events(), book()));
    let handle = bridge.start(transport.clone()).await.unwrap();

    // 23:50:10 EST.
    sleep(Duration::from_secs(610)).await;
    transport.drop_session();

    // 00:46:50 EST: still inside the window plus grace.
    sleep(Duration::from_secs(3400)).await;
    assert_eq!(transport.connect_attempts(), vec![utc("2024-01-10T04:40:00Z")]);
    assert!(!handle.status().await.connection.connected);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(
        transport.connect_attempts(),
        vec![utc("2024-01-10T04:40:00Z"), utc("2024-01-10T05:47:00Z")]
    );
    assert!(handle.status().await.connection.connected);
    handle.shutdown().await;

    let logs = store.log_messages();
    assert!(logs.iter().any(|m| m.contains("reconnect deferred until")));
    assert!(logs.iter().any(|m| m == "reconnected on attempt 1/5"));
}
