//! Price Feed Router - Entry Point
//!
//! Initializes configuration and logging, spawns the feed adapters, the
//! router task and the observability servers. Runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config.toml (or the path given as the first argument) + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Create the ingest channel, the broadcast sink and the router
//! 4. Spawn health server (/live, /ready, /health) and Prometheus exporter
//! 5. Spawn the router consumer loop
//! 6. Spawn the stream and poller feeds under the supervisor
//! 7. Wait for SIGINT, then stop feeds, drain the router, stop servers

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use price_feed_router::adapters::feeds::{FeedSupervisor, PollFeed, StreamFeed};
use price_feed_router::adapters::metrics::{HealthServer, HealthState, MetricsRegistry};
use price_feed_router::adapters::sink::BroadcastSink;
use price_feed_router::config::loader::load_config;
use price_feed_router::usecases::ingest;
use price_feed_router::usecases::price_router::PriceRouter;

/// Capacity of the in-process update broadcast.
const SINK_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&path).context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        symbols = config.feeds.symbols.len(),
        stream = config.feeds.stream.enabled,
        poller = config.feeds.poller.enabled,
        "Starting price feed router"
    );

    // ── 3. Shutdown channels, one per stage ─────────────────
    let (feeds_shutdown_tx, _) = broadcast::channel::<()>(1);
    let (router_shutdown_tx, _) = broadcast::channel::<()>(1);
    let (servers_shutdown_tx, _) = broadcast::channel::<()>(1);

    // ── 4. Router core ──────────────────────────────────────
    let sink = Arc::new(BroadcastSink::new(SINK_CAPACITY));
    let (ingest_handle, ingest_receiver) = ingest::channel(config.router.queue_capacity);
    let router = PriceRouter::new(
        &config.router,
        &config.validation,
        Arc::clone(&sink),
        tokio::time::Instant::now().into_std(),
    );
    let router_handle = router.handle();

    // ── 5. Observability ────────────────────────────────────
    let health_state = Arc::new(HealthState::new(router_handle.clone()));
    let health_server = HealthServer::new(Arc::clone(&health_state), config.metrics.health_port);
    let health_task = tokio::spawn({
        let shutdown_rx = servers_shutdown_tx.subscribe();
        async move {
            if let Err(e) = health_server.run(shutdown_rx).await {
                error!(error = %e, "Health server failed");
            }
        }
    });

    let mut metrics_tasks = Vec::new();
    if config.metrics.enabled {
        let metrics = Arc::new(MetricsRegistry::new().context("Failed to register metrics")?);
        metrics_tasks.push(tokio::spawn(
            Arc::clone(&metrics).observe_router(router_handle.clone(), servers_shutdown_tx.subscribe()),
        ));
        let bind_address = config.metrics.bind_address.clone();
        let shutdown_rx = servers_shutdown_tx.subscribe();
        metrics_tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics.serve(bind_address, shutdown_rx).await {
                error!(error = %e, "Metrics server failed");
            }
        }));
    }

    // Downstream consumers subscribe to the sink; this one only traces.
    let log_task = tokio::spawn({
        let mut updates = sink.subscribe();
        let mut transitions = sink.subscribe_transitions();
        let mut shutdown_rx = servers_shutdown_tx.subscribe();
        async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    update = updates.recv() => match update {
                        Ok(update) => debug!(
                            symbol = %update.symbol,
                            price = %update.price,
                            source = %update.source,
                            "Price update"
                        ),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Update logger lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    transition = transitions.recv() => match transition {
                        Ok(transition) => debug!(
                            from = %transition.from,
                            to = %transition.to,
                            reason = %transition.reason,
                            "Routing transition delivered"
                        ),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Transition logger lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    });

    // ── 6. Router consumer loop ─────────────────────────────
    let router_task = tokio::spawn(router.run(ingest_receiver, router_shutdown_tx.subscribe()));

    // ── 7. Feeds under the supervisor ───────────────────────
    let mut supervisor = FeedSupervisor::new(
        ingest_handle,
        feeds_shutdown_tx.clone(),
        Duration::from_millis(config.feeds.restart_backoff_ms),
    );
    if config.feeds.stream.enabled {
        supervisor.add(Arc::new(StreamFeed::new(
            config.feeds.stream.clone(),
            config.feeds.symbols.clone(),
        )));
    }
    if config.feeds.poller.enabled {
        supervisor.add(Arc::new(
            PollFeed::new(config.feeds.poller.clone(), config.feeds.symbols.clone())
                .context("Failed to create fallback poller")?,
        ));
    }
    if supervisor.is_empty() {
        warn!("No feeds enabled, router will stay in STARTUP");
    }
    let feed_tasks = supervisor.spawn();

    info!(feeds = supervisor.len(), "All tasks spawned, router is running");

    // ── 8. Wait for SIGINT ──────────────────────────────────
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for SIGINT");
    }
    info!("SIGINT received, initiating graceful shutdown");
    let started = Instant::now();

    // Readiness goes to 503 before anything stops.
    health_state.begin_shutdown();

    // 1. Stop feeds so nothing new is enqueued
    let _ = feeds_shutdown_tx.send(());
    for task in feed_tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Feed task did not stop within 5s");
        }
    }
    info!(restarts = supervisor.restart_count(), "Feeds stopped");

    // 2. Drain the router
    let _ = router_shutdown_tx.send(());
    let drain_budget = config.router.drain_timeout() + Duration::from_secs(1);
    match tokio::time::timeout(drain_budget, router_task).await {
        Ok(Ok(snapshot)) => info!(
            state = %snapshot.state,
            forwarded = snapshot.counters.forwarded,
            rejected = snapshot.counters.rejected,
            fallback_activations = snapshot.counters.fallback_activation_count,
            uptime_percent = snapshot.counters.uptime_percent,
            "Router drained"
        ),
        Ok(Err(e)) => error!(error = %e, "Router task panicked"),
        Err(_) => warn!("Router did not drain in time"),
    }

    // 3. Stop servers
    let _ = servers_shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), health_task).await;
    for task in metrics_tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    log_task.abort();

    info!(elapsed_ms = started.elapsed().as_millis(), "Shutdown complete");
    Ok(())
}
