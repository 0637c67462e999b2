//! Prometheus Metrics Registry - Router Observability
//!
//! Registers and exposes Prometheus metrics for the router. Counters are
//! fed from published `HealthSnapshot`s: each observation adds the delta
//! since the previous one, so the router task never touches the registry.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::domain::health::ProviderHealth;
use crate::domain::price::DataSource;
use crate::usecases::price_router::{HealthSnapshot, RouterHandle};

/// Centralized Prometheus metrics for the router.
///
/// All metrics follow the naming convention `price_router_*`.
pub struct MetricsRegistry {
    registry: Registry,
    pub messages_processed: IntCounter,
    pub updates_forwarded: IntCounter,
    /// Valid updates from the inactive source.
    pub updates_suppressed: IntCounter,
    pub updates_rejected: IntCounterVec,
    pub validation_warnings: IntCounterVec,
    pub normalize_errors: IntCounter,
    pub queue_dropped: IntCounterVec,
    pub fallback_activations: IntCounter,
    /// 0 startup, 1 primary, 2 fallback, 3 both unavailable.
    pub routing_state: IntGauge,
    /// 1 = healthy, 0 = unhealthy.
    pub source_healthy: IntGaugeVec,
    pub source_consecutive_failures: IntGaugeVec,
    pub source_messages_per_second: GaugeVec,
    pub primary_uptime_percent: Gauge,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let messages_processed = IntCounter::new(
            "price_router_messages_processed_total",
            "Messages dequeued by the router",
        )?;
        let updates_forwarded = IntCounter::new(
            "price_router_updates_forwarded_total",
            "Updates delivered to the sink",
        )?;
        let updates_suppressed = IntCounter::new(
            "price_router_updates_suppressed_total",
            "Valid updates from the inactive source",
        )?;
        let updates_rejected = IntCounterVec::new(
            Opts::new(
                "price_router_updates_rejected_total",
                "Updates rejected by validation",
            ),
            &["reason"],
        )?;
        let validation_warnings = IntCounterVec::new(
            Opts::new(
                "price_router_validation_warnings_total",
                "Warnings attached to forwardable updates",
            ),
            &["kind"],
        )?;
        let normalize_errors = IntCounter::new(
            "price_router_normalize_errors_total",
            "Messages that could not be normalized",
        )?;
        let queue_dropped = IntCounterVec::new(
            Opts::new(
                "price_router_queue_dropped_total",
                "Messages evicted from full ingest queues",
            ),
            &["source"],
        )?;
        let fallback_activations = IntCounter::new(
            "price_router_fallback_activations_total",
            "Transitions into FALLBACK_ACTIVE",
        )?;
        let routing_state = IntGauge::new(
            "price_router_routing_state",
            "Routing state (0=startup, 1=primary, 2=fallback, 3=both unavailable)",
        )?;
        let source_healthy = IntGaugeVec::new(
            Opts::new(
                "price_router_source_healthy",
                "Source health (1=healthy, 0=unhealthy)",
            ),
            &["source"],
        )?;
        let source_consecutive_failures = IntGaugeVec::new(
            Opts::new(
                "price_router_source_consecutive_failures",
                "Consecutive connectivity failures per source",
            ),
            &["source"],
        )?;
        let source_messages_per_second = GaugeVec::new(
            Opts::new(
                "price_router_source_messages_per_second",
                "Message throughput per source over the sliding window",
            ),
            &["source"],
        )?;
        let primary_uptime_percent = Gauge::new(
            "price_router_primary_uptime_percent",
            "Share of time spent in PRIMARY_ACTIVE",
        )?;

        // Register all metrics
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(updates_forwarded.clone()))?;
        registry.register(Box::new(updates_suppressed.clone()))?;
        registry.register(Box::new(updates_rejected.clone()))?;
        registry.register(Box::new(validation_warnings.clone()))?;
        registry.register(Box::new(normalize_errors.clone()))?;
        registry.register(Box::new(queue_dropped.clone()))?;
        registry.register(Box::new(fallback_activations.clone()))?;
        registry.register(Box::new(routing_state.clone()))?;
        registry.register(Box::new(source_healthy.clone()))?;
        registry.register(Box::new(source_consecutive_failures.clone()))?;
        registry.register(Box::new(source_messages_per_second.clone()))?;
        registry.register(Box::new(primary_uptime_percent.clone()))?;

        Ok(Self {
            registry,
            messages_processed,
            updates_forwarded,
            updates_suppressed,
            updates_rejected,
            validation_warnings,
            normalize_errors,
            queue_dropped,
            fallback_activations,
            routing_state,
            source_healthy,
            source_consecutive_failures,
            source_messages_per_second,
            primary_uptime_percent,
        })
    }

    /// Bring every metric in line with a snapshot.
    pub fn observe(&self, snapshot: &HealthSnapshot) {
        let counters = &snapshot.counters;
        advance(&self.messages_processed, counters.messages_processed);
        advance(&self.updates_forwarded, counters.forwarded);
        advance(&self.updates_suppressed, counters.suppressed_inactive);
        advance(&self.normalize_errors, counters.normalize_errors);
        advance(&self.fallback_activations, counters.fallback_activation_count);

        for (reason, total) in &counters.rejections_by_reason {
            advance(&self.updates_rejected.with_label_values(&[reason.as_str()]), *total);
        }
        for (kind, total) in &counters.warnings_by_kind {
            advance(&self.validation_warnings.with_label_values(&[kind.as_str()]), *total);
        }
        for (source, total) in &counters.queue_drops {
            advance(&self.queue_dropped.with_label_values(&[source.as_str()]), *total);
        }

        self.routing_state.set(snapshot.state.code());
        self.primary_uptime_percent.set(counters.uptime_percent);
        self.observe_source(DataSource::Primary, &snapshot.primary);
        self.observe_source(DataSource::Fallback, &snapshot.fallback);
    }

    fn observe_source(&self, source: DataSource, health: &ProviderHealth) {
        let label = [source.as_str()];
        self.source_healthy
            .with_label_values(&label)
            .set(i64::from(health.healthy));
        self.source_consecutive_failures
            .with_label_values(&label)
            .set(i64::from(health.consecutive_failures));
        self.source_messages_per_second
            .with_label_values(&label)
            .set(health.messages_per_second);
    }

    /// Follow router snapshots until shutdown.
    #[instrument(skip_all)]
    pub async fn observe_router(
        self: Arc<Self>,
        router: RouterHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut snapshots = router.subscribe();
        self.observe(&snapshots.borrow_and_update());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        debug!("Router snapshot channel closed");
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.observe(&snapshot);
                }
            }
        }
        // Pick up the final snapshot published during drain.
        self.observe(&snapshots.borrow());
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

/// Raise a monotonic counter to `total`.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::{RouterConfig, ValidationConfig};
    use crate::domain::health::ConnectivitySignal;
    use crate::domain::price::{PriceUpdate, RawMessage};
    use crate::ports::update_sink::UpdateSink;
    use crate::usecases::price_router::PriceRouter;

    struct NullSink;

    impl UpdateSink for NullSink {
        fn forward(&self, _update: &PriceUpdate) {}
    }

    fn trade(price: rust_decimal::Decimal) -> RawMessage {
        RawMessage::Trade {
            symbol: "AAPL".to_string(),
            price,
            size: dec!(1),
            timestamp: Utc::now(),
            exchange: None,
        }
    }

    #[test]
    fn test_observe_applies_deltas() {
        let metrics = MetricsRegistry::new().unwrap();
        let now = Instant::now();
        let mut router = PriceRouter::new(
            &RouterConfig::default(),
            &ValidationConfig::default(),
            Arc::new(NullSink),
            now,
        );
        router.apply_signal(&ConnectivitySignal::connected(DataSource::Primary), now);
        router.process(DataSource::Primary, trade(dec!(150)), now);
        router.process(DataSource::Primary, trade(dec!(-1)), now);

        let snapshot = router.snapshot(now);
        metrics.observe(&snapshot);
        // Observing the same snapshot twice must not double count.
        metrics.observe(&snapshot);

        assert_eq!(metrics.updates_forwarded.get(), 1);
        assert_eq!(
            metrics
                .updates_rejected
                .with_label_values(&["non_positive_price"])
                .get(),
            1
        );
        assert_eq!(metrics.routing_state.get(), 1);
        assert_eq!(metrics.source_healthy.with_label_values(&["primary"]).get(), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("price_router_updates_forwarded_total 1"));
    }
}
