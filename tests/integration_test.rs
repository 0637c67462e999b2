//! Integration Tests - End-to-end Router Scenarios
//!
//! Drives the router through its public API with mocked sinks, and runs
//! the consumer loop on a paused tokio clock to exercise failover, drain
//! and overflow without real waiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

use price_feed_router::adapters::sink::BroadcastSink;
use price_feed_router::config::loader::parse_config;
use price_feed_router::config::{RouterConfig, ValidationConfig};
use price_feed_router::domain::health::ConnectivitySignal;
use price_feed_router::domain::price::{DataSource, PriceUpdate, RawMessage};
use price_feed_router::domain::routing::{RoutingState, StateTransition};
use price_feed_router::domain::validator::RejectReason;
use price_feed_router::ports::update_sink::UpdateSink;
use price_feed_router::usecases::ingest;
use price_feed_router::usecases::price_router::{Disposition, PriceRouter};

// ---- Mock Definitions ----

mock! {
    pub Sink {}

    impl UpdateSink for Sink {
        fn forward(&self, update: &PriceUpdate);
        fn on_state_transition(&self, transition: &StateTransition);
    }
}

// ---- Helpers ----

fn trade(symbol: &str, price: Decimal) -> RawMessage {
    RawMessage::Trade {
        symbol: symbol.to_string(),
        price,
        size: dec!(100),
        timestamp: Utc::now(),
        exchange: Some("V".to_string()),
    }
}

fn router_with(sink: MockSink, now: Instant) -> PriceRouter<MockSink> {
    PriceRouter::new(
        &RouterConfig::default(),
        &ValidationConfig::default(),
        Arc::new(sink),
        now,
    )
}

fn connect_both<S: UpdateSink>(router: &mut PriceRouter<S>, now: Instant) {
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Primary), now);
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Fallback), now);
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ---- Router Scenarios ----

#[test]
fn test_primary_trade_with_cached_close_is_forwarded() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition()
        .withf(|t| t.from == RoutingState::Startup && t.to == RoutingState::PrimaryActive)
        .times(1)
        .return_const(());
    sink.expect_forward()
        .withf(|u| {
            u.symbol == "AAPL"
                && u.price == dec!(150.25)
                && u.previous_close() == Some(dec!(150.00))
                && u.price_change() == dec!(0.25)
                && u.price_change_percent() > dec!(0.166)
                && u.price_change_percent() < dec!(0.167)
                && u.source == DataSource::Primary
                && u.quality_score == 100
                && u.warnings.is_empty()
        })
        .times(1)
        .return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    router.seed_previous_close("AAPL", dec!(150.00));
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Primary), t0);

    let outcome = router.process(DataSource::Primary, trade("AAPL", dec!(150.25)), t0);
    assert_eq!(outcome, Disposition::Forwarded { warnings: 0 });
    assert_eq!(router.state(), RoutingState::PrimaryActive);
}

#[test]
fn test_rejected_updates_are_never_forwarded() {
    let mut sink = MockSink::new();
    sink.expect_forward().never();
    sink.expect_on_state_transition().never();

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Primary), t0);

    assert_eq!(
        router.process(DataSource::Primary, trade("AAPL", dec!(0)), t0),
        Disposition::Rejected(RejectReason::NonPositivePrice)
    );
    assert_eq!(
        router.process(DataSource::Primary, trade("AAPL", dec!(-3.5)), t0),
        Disposition::Rejected(RejectReason::NonPositivePrice)
    );

    let inverted = RawMessage::Quote {
        symbol: "MSFT".to_string(),
        bid: dec!(151.00),
        ask: dec!(150.00),
        timestamp: Utc::now(),
    };
    assert_eq!(
        router.process(DataSource::Primary, inverted, t0),
        Disposition::Rejected(RejectReason::InvertedBidAsk)
    );

    // Rejections never end Startup.
    assert_eq!(router.state(), RoutingState::Startup);
    let counters = router.counters();
    assert_eq!(counters.rejected, 3);
    assert_eq!(counters.rejections_by_reason["non_positive_price"], 2);
    assert_eq!(counters.rejections_by_reason["inverted_bid_ask"], 1);
    assert_eq!(counters.forwarded, 0);
}

#[test]
fn test_circuit_breaker_and_large_movement() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition().times(1).return_const(());
    sink.expect_forward()
        .withf(|u| {
            u.price == dec!(165.00)
                && u.warnings.len() == 1
                && u.warnings[0].starts_with("large price movement")
        })
        .times(1)
        .return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Primary), t0);

    for price in [dec!(187.50), dec!(112.50)] {
        router.seed_previous_close("AAPL", dec!(150.00));
        assert_eq!(
            router.process(DataSource::Primary, trade("AAPL", price), t0),
            Disposition::Rejected(RejectReason::CircuitBreaker)
        );
    }

    router.seed_previous_close("AAPL", dec!(150.00));
    assert_eq!(
        router.process(DataSource::Primary, trade("AAPL", dec!(165.00)), t0),
        Disposition::Forwarded { warnings: 1 }
    );
    assert_eq!(router.counters().forwarded_with_warnings, 1);
    assert_eq!(router.counters().warnings_by_kind["large_price_movement"], 1);
}

#[test]
fn test_failover_then_failback_after_grace() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition().times(3).return_const(());
    sink.expect_forward().times(2).return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    connect_both(&mut router, t0);

    // Primary takes over; the fallback is validated but suppressed.
    assert!(matches!(
        router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0),
        Disposition::Forwarded { .. }
    ));
    assert_eq!(
        router.process(DataSource::Fallback, trade("AAPL", dec!(150)), t0 + secs(20)),
        Disposition::Suppressed
    );

    // Primary silent past the 30s message timeout.
    router.tick(t0 + secs(31));
    assert_eq!(router.state(), RoutingState::FallbackActive);
    let latency = router.counters().last_failover_latency_ms;
    assert!(latency.is_some_and(|ms| ms <= 15_000), "latency {latency:?}");

    assert!(matches!(
        router.process(DataSource::Fallback, trade("AAPL", dec!(150)), t0 + secs(32)),
        Disposition::Forwarded { .. }
    ));

    // Primary back, but only healthy for 5s: no failback yet.
    router.apply_signal(
        &ConnectivitySignal::connected(DataSource::Primary),
        t0 + secs(33),
    );
    assert_eq!(
        router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0 + secs(38)),
        Disposition::Suppressed
    );
    assert_eq!(router.state(), RoutingState::FallbackActive);

    // Healthy for 10s: failback.
    router.tick(t0 + secs(43));
    assert_eq!(router.state(), RoutingState::PrimaryActive);

    let snapshot = router.snapshot(t0 + secs(43));
    assert_eq!(snapshot.counters.fallback_activation_count, 1);
    assert_eq!(snapshot.recent_transitions.len(), 3);
    assert!(snapshot.counters.total_fallback_duration_secs >= 11.0);
}

#[test]
fn test_flapping_primary_restarts_failback_grace() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition().times(3).return_const(());
    sink.expect_forward().times(2).return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    connect_both(&mut router, t0);
    router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0);
    router.process(DataSource::Fallback, trade("AAPL", dec!(150)), t0 + secs(20));
    router.tick(t0 + secs(31));
    assert_eq!(router.state(), RoutingState::FallbackActive);
    router.process(DataSource::Fallback, trade("AAPL", dec!(150)), t0 + secs(32));

    // Primary comes back, drops again after 5s, then returns.
    router.apply_signal(
        &ConnectivitySignal::connected(DataSource::Primary),
        t0 + secs(33),
    );
    router.apply_signal(
        &ConnectivitySignal::disconnected(DataSource::Primary, "socket closed"),
        t0 + secs(38),
    );
    router.apply_signal(
        &ConnectivitySignal::connected(DataSource::Primary),
        t0 + secs(39),
    );

    // Ten seconds after the first reconnect the grace has restarted.
    router.tick(t0 + secs(43));
    assert_eq!(router.state(), RoutingState::FallbackActive);
    router.tick(t0 + secs(44));
    assert_eq!(router.state(), RoutingState::FallbackActive);

    router.tick(t0 + secs(49));
    assert_eq!(router.state(), RoutingState::PrimaryActive);
    assert_eq!(router.snapshot(t0 + secs(49)).primary.consecutive_failures, 1);
}

#[test]
fn test_glitch_price_near_zero_does_not_stop_routing() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition().times(1).return_const(());
    sink.expect_forward().times(2).return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Primary), t0);

    let glitch = Decimal::new(1, 28);
    assert!(matches!(
        router.process(DataSource::Primary, trade("AAPL", glitch), t0),
        Disposition::Forwarded { .. }
    ));
    // Movement against the glitch close is out of range: rejected, not a panic.
    assert_eq!(
        router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0),
        Disposition::Rejected(RejectReason::CircuitBreaker)
    );
    // The cache has moved on, so routing resumes.
    assert!(matches!(
        router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0),
        Disposition::Forwarded { .. }
    ));
}

#[test]
fn test_both_unavailable_stops_forwarding_until_recovery() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition().times(3).return_const(());
    sink.expect_forward()
        .withf(|u| u.source == DataSource::Primary)
        .times(2)
        .return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    connect_both(&mut router, t0);
    router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0);

    router.tick(t0 + secs(31));
    assert_eq!(router.state(), RoutingState::BothUnavailable);
    assert!(!router.snapshot(t0 + secs(31)).is_ready());

    // Primary producing again, but not for long enough.
    assert_eq!(
        router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0 + secs(32)),
        Disposition::Suppressed
    );
    assert_eq!(router.state(), RoutingState::BothUnavailable);

    assert!(matches!(
        router.process(DataSource::Primary, trade("AAPL", dec!(150)), t0 + secs(42)),
        Disposition::Forwarded { .. }
    ));
    assert_eq!(router.state(), RoutingState::PrimaryActive);
}

#[test]
fn test_startup_falls_back_after_grace() {
    let mut sink = MockSink::new();
    sink.expect_on_state_transition()
        .withf(|t| t.to == RoutingState::FallbackActive)
        .times(1)
        .return_const(());
    sink.expect_forward()
        .withf(|u| u.source == DataSource::Fallback && u.quality_score == 80)
        .times(1)
        .return_const(());

    let t0 = Instant::now();
    let mut router = router_with(sink, t0);
    router.apply_signal(&ConnectivitySignal::connected(DataSource::Fallback), t0);

    // Inside the startup grace the fallback is not used.
    assert_eq!(
        router.process(DataSource::Fallback, trade("SPY", dec!(500)), t0 + secs(5)),
        Disposition::Suppressed
    );
    router.tick(t0 + secs(10));
    assert_eq!(router.state(), RoutingState::FallbackActive);
    assert!(matches!(
        router.process(DataSource::Fallback, trade("SPY", dec!(500)), t0 + secs(11)),
        Disposition::Forwarded { .. }
    ));
}

#[test]
fn test_independent_routers_do_not_share_caches() {
    let t0 = Instant::now();
    let mut seeded = router_with(MockSink::new(), t0);
    let mut fresh = router_with(MockSink::new(), t0);
    seeded.seed_previous_close("AAPL", dec!(100));

    // Startup with no connected source: nothing is forwarded, so the mocks
    // need no expectations.
    assert_eq!(
        seeded.process(DataSource::Primary, trade("AAPL", dec!(150)), t0),
        Disposition::Rejected(RejectReason::CircuitBreaker)
    );
    assert_eq!(
        fresh.process(DataSource::Primary, trade("AAPL", dec!(150)), t0),
        Disposition::Suppressed
    );
}

// ---- Consumer Loop ----

#[tokio::test(start_paused = true)]
async fn test_router_task_fails_over_when_primary_goes_silent() {
    let sink = Arc::new(BroadcastSink::new(64));
    let mut updates = sink.subscribe();
    let (ingest_handle, receiver) = ingest::channel(16);
    let router = PriceRouter::new(
        &RouterConfig::default(),
        &ValidationConfig::default(),
        Arc::clone(&sink),
        tokio::time::Instant::now().into_std(),
    );
    let handle = router.handle();
    let (shutdown_tx, _) = broadcast::channel(1);
    let task = tokio::spawn(router.run(receiver, shutdown_tx.subscribe()));

    let primary = ingest_handle.for_source(DataSource::Primary);
    let fallback = ingest_handle.for_source(DataSource::Fallback);
    primary.connected();
    fallback.connected();
    primary.push(trade("AAPL", dec!(150)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.state(), RoutingState::PrimaryActive);
    let first = assert_ok!(updates.try_recv());
    assert_eq!(first.source, DataSource::Primary);

    // Only the fallback keeps producing.
    for _ in 0..8 {
        tokio::time::sleep(secs(5)).await;
        fallback.push(trade("AAPL", dec!(150)));
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.state(), RoutingState::FallbackActive);

    let mut forwarded_fallback = 0;
    while let Ok(update) = updates.try_recv() {
        assert_eq!(update.source, DataSource::Fallback);
        forwarded_fallback += 1;
    }
    assert!(forwarded_fallback >= 1);

    assert_ok!(shutdown_tx.send(()));
    let last = assert_ok!(task.await);
    assert!(!last.running);
    assert_eq!(last.state, RoutingState::FallbackActive);
    assert_eq!(last.counters.fallback_activation_count, 1);
    assert!(
        last.counters
            .last_failover_latency_ms
            .is_some_and(|ms| ms <= 15_000)
    );
    assert!(!handle.snapshot().is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_queued_messages() {
    let sink = Arc::new(BroadcastSink::new(64));
    let (ingest_handle, receiver) = ingest::channel(16);
    let router = PriceRouter::new(
        &RouterConfig::default(),
        &ValidationConfig::default(),
        sink,
        tokio::time::Instant::now().into_std(),
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();

    let primary = ingest_handle.for_source(DataSource::Primary);
    primary.connected();
    for _ in 0..5 {
        primary.push(trade("AAPL", dec!(150)));
    }
    assert_ok!(shutdown_tx.send(()));

    let last = router.run(receiver, shutdown_rx).await;
    assert_eq!(last.counters.messages_processed, 5);
    assert_eq!(last.counters.forwarded, 5);
    assert_eq!(last.state, RoutingState::PrimaryActive);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_oldest_and_reports_it() {
    let sink = Arc::new(BroadcastSink::new(64));
    let (ingest_handle, receiver) = ingest::channel(2);
    let router = PriceRouter::new(
        &RouterConfig::default(),
        &ValidationConfig::default(),
        sink,
        tokio::time::Instant::now().into_std(),
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();

    let primary = ingest_handle.for_source(DataSource::Primary);
    for price in [dec!(150), dec!(151), dec!(152), dec!(153), dec!(154)] {
        primary.push(trade("AAPL", price));
    }
    assert_eq!(receiver.primary.dropped(), 3);
    assert_ok!(shutdown_tx.send(()));

    let last = router.run(receiver, shutdown_rx).await;
    assert_eq!(last.counters.messages_processed, 2);
    assert_eq!(last.counters.queue_drops["primary"], 3);
}

// ---- Configuration ----

#[test]
fn test_minimal_config_yields_documented_defaults() {
    let config = assert_ok!(parse_config("[router]\nfailback_grace_secs = 20\n"));
    assert_eq!(config.router.failback_grace_secs, 20);
    assert_eq!(config.router.message_timeout_secs, 30);
    assert_eq!(config.router.failover_latency_target_secs, 15);
    assert_eq!(config.validation.circuit_breaker_movement_pct, dec!(20));
}
