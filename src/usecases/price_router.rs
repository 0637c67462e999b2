//! Price Router - Serialized Consumer for Both Sources
//!
//! One task owns the normalizer, validator, health tracker and state
//! machine. Every dequeued message goes through the same pipeline:
//!
//! 1. Record liveness for its source and re-evaluate the routing state
//! 2. Normalize into a `PriceUpdate`
//! 3. Validate; rejects are counted and dropped
//! 4. Let a usable primary update end Startup
//! 5. Forward to the sink if the source is active, otherwise suppress
//!
//! External code never touches this state directly. It reads the
//! `HealthSnapshot` published on a watch channel through `RouterHandle`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::{RouterConfig, ValidationConfig};
use crate::domain::health::{ConnectivitySignal, HealthTracker, HealthView, ProviderHealth};
use crate::domain::normalizer::Normalizer;
use crate::domain::price::{DataSource, RawMessage};
use crate::domain::routing::{RouterStateMachine, RoutingState, StateTransition};
use crate::domain::validator::{RejectReason, Validator};
use crate::ports::update_sink::UpdateSink;
use crate::usecases::ingest::{IngestQueue, IngestReceiver};

/// What happened to one dequeued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// Delivered to the sink, with this many warnings attached.
  Forwarded { warnings: usize },
  /// Valid, but its source is not the active one.
  Suppressed,
  /// Dropped by the validator.
  Rejected(RejectReason),
  /// Could not be normalized.
  Malformed,
}

/// Aggregate counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterCounters {
  pub messages_processed: u64,
  pub forwarded: u64,
  pub forwarded_with_warnings: u64,
  /// Valid updates from the inactive source.
  pub suppressed_inactive: u64,
  pub rejected: u64,
  pub normalize_errors: u64,
  /// Updates that reached the validator, by source.
  pub validated_by_source: BTreeMap<String, u64>,
  pub rejections_by_reason: BTreeMap<String, u64>,
  pub rejections_by_symbol: BTreeMap<String, u64>,
  /// Warnings on forwardable updates, by kind.
  pub warnings_by_kind: BTreeMap<String, u64>,
  /// Ingest queue evictions, by source.
  pub queue_drops: BTreeMap<String, u64>,
  pub fallback_activation_count: u64,
  pub total_fallback_duration_secs: f64,
  pub uptime_percent: f64,
  /// Time from the primary turning unhealthy to leaving PrimaryActive.
  pub last_failover_latency_ms: Option<u64>,
}

/// Read-only view of the router published to the outside.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
  pub state: RoutingState,
  pub time_in_state_secs: f64,
  pub primary: ProviderHealth,
  pub fallback: ProviderHealth,
  pub counters: RouterCounters,
  /// Oldest first.
  pub recent_transitions: Vec<StateTransition>,
  /// False once the consumer loop has stopped.
  pub running: bool,
  pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
  /// Ready to serve traffic: running with an active source.
  pub fn is_ready(&self) -> bool {
    self.running && self.state.active_source().is_some()
  }
}

/// Cheap, cloneable reader of the latest snapshot.
#[derive(Debug, Clone)]
pub struct RouterHandle {
  rx: watch::Receiver<HealthSnapshot>,
}

impl RouterHandle {
  pub fn snapshot(&self) -> HealthSnapshot {
    self.rx.borrow().clone()
  }

  pub fn state(&self) -> RoutingState {
    self.rx.borrow().state
  }

  /// Underlying receiver, for consumers that react to every publication.
  pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
    self.rx.clone()
  }
}

/// Serialized router core plus its consumer loop.
pub struct PriceRouter<S: UpdateSink> {
  normalizer: Normalizer,
  validator: Validator,
  health: HealthTracker,
  machine: RouterStateMachine,
  sink: Arc<S>,
  counters: RouterCounters,
  failover_latency_target: Duration,
  evaluation_interval: Duration,
  drain_timeout: Duration,
  batch_size: usize,
  snapshot_tx: watch::Sender<HealthSnapshot>,
  /// A transition happened since the last publication.
  dirty: bool,
}

impl<S: UpdateSink> PriceRouter<S> {
  /// Create a router in `Startup`.
  pub fn new(
    router: &RouterConfig,
    validation: &ValidationConfig,
    sink: Arc<S>,
    now: Instant,
  ) -> Self {
    let health = HealthTracker::new(router.health_settings(), now);
    let machine = RouterStateMachine::new(
      router.timings(),
      router.transition_history_capacity,
      now,
    );
    let counters = RouterCounters::default();
    let initial = compose_snapshot(&health, &machine, &counters, now, true);
    let (snapshot_tx, _) = watch::channel(initial);

    Self {
      normalizer: Normalizer::new(),
      validator: Validator::new(validation.rules()),
      health,
      machine,
      sink,
      counters,
      failover_latency_target: router.failover_latency_target(),
      evaluation_interval: router.evaluation_interval(),
      drain_timeout: router.drain_timeout(),
      batch_size: router.batch_size.max(1),
      snapshot_tx,
      dirty: false,
    }
  }

  pub fn handle(&self) -> RouterHandle {
    RouterHandle {
      rx: self.snapshot_tx.subscribe(),
    }
  }

  pub const fn state(&self) -> RoutingState {
    self.machine.state()
  }

  pub const fn counters(&self) -> &RouterCounters {
    &self.counters
  }

  /// Seed a reference close, e.g. the prior session's close.
  pub fn seed_previous_close(&mut self, symbol: &str, close: Decimal) {
    self.normalizer.seed_previous_close(symbol, close);
  }

  /// Run one message through the pipeline.
  pub fn process(&mut self, source: DataSource, raw: RawMessage, now: Instant) -> Disposition {
    self.counters.messages_processed += 1;
    self.health.record_message(source, now);
    self.evaluate(now);

    let mut update = match self.normalizer.normalize(source, raw) {
      Ok(update) => update,
      Err(e) => {
        self.counters.normalize_errors += 1;
        debug!(source = %source, error = %e, "Dropping malformed message");
        return Disposition::Malformed;
      }
    };

    let result = self.validator.validate(&update, Utc::now());
    *self
      .counters
      .validated_by_source
      .entry(source.as_str().to_string())
      .or_default() += 1;

    if let Some(rejection) = result.rejection() {
      let reason = rejection.reason;
      self.counters.rejected += 1;
      *self
        .counters
        .rejections_by_reason
        .entry(reason.label().to_string())
        .or_default() += 1;
      *self
        .counters
        .rejections_by_symbol
        .entry(update.symbol.clone())
        .or_default() += 1;
      debug!(
        source = %source,
        symbol = %update.symbol,
        price = %update.price,
        reason = %rejection,
        "Update rejected"
      );
      return Disposition::Rejected(reason);
    }

    for flag in &result.warnings {
      *self
        .counters
        .warnings_by_kind
        .entry(flag.kind.label().to_string())
        .or_default() += 1;
    }

    let view = self.health.view(now);
    if let Some(transition) = self.machine.on_usable_update(source, &view, now) {
      self.on_transition(&transition, &view);
    }

    if !self.machine.should_forward(source) {
      self.counters.suppressed_inactive += 1;
      return Disposition::Suppressed;
    }

    update.warnings = result.warning_messages();
    let warnings = update.warnings.len();
    self.counters.forwarded += 1;
    if warnings > 0 {
      self.counters.forwarded_with_warnings += 1;
      debug!(
        symbol = %update.symbol,
        warnings = ?update.warnings,
        "Forwarding update with warnings"
      );
    }
    self.sink.forward(&update);
    Disposition::Forwarded { warnings }
  }

  /// Apply an adapter connectivity signal and re-evaluate.
  pub fn apply_signal(&mut self, signal: &ConnectivitySignal, now: Instant) {
    self.health.apply(signal, now);
    self.evaluate(now);
  }

  /// Periodic re-evaluation; catches sources that went silent.
  pub fn tick(&mut self, now: Instant) {
    self.health.refresh(now);
    self.evaluate(now);
  }

  /// Record the eviction total of a source's ingest queue.
  pub fn record_queue_drops(&mut self, source: DataSource, total: u64) {
    let previous = self
      .counters
      .queue_drops
      .insert(source.as_str().to_string(), total)
      .unwrap_or(0);
    if total > previous {
      warn!(
        source = %source,
        dropped = total - previous,
        dropped_total = total,
        "Ingest queue overflowed, oldest messages dropped"
      );
    }
  }

  /// Build the current snapshot.
  pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
    compose_snapshot(&self.health, &self.machine, &self.counters, now, true)
  }

  /// Publish the current snapshot to every `RouterHandle`.
  pub fn publish(&mut self, now: Instant) {
    self.snapshot_tx.send_replace(self.snapshot(now));
    self.dirty = false;
  }

  fn evaluate(&mut self, now: Instant) {
    let view = self.health.view(now);
    if let Some(transition) = self.machine.evaluate(&view, now) {
      self.on_transition(&transition, &view);
    }
  }

  fn on_transition(&mut self, transition: &StateTransition, view: &HealthView) {
    self.dirty = true;

    if transition.from == RoutingState::PrimaryActive && !view.primary.healthy {
      let latency = view.primary.since;
      self.counters.last_failover_latency_ms =
        Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
      if latency > self.failover_latency_target {
        warn!(
          latency_ms = latency.as_millis(),
          target_ms = self.failover_latency_target.as_millis(),
          to = %transition.to,
          "Failover exceeded latency target"
        );
      }
    }

    self.sink.on_state_transition(transition);
  }

  // ────────────────────────────────────────────
  // Consumer loop
  // ────────────────────────────────────────────

  /// Consume both queues and the signal channel until shutdown, then
  /// drain what is left for up to the drain timeout.
  ///
  /// Returns the final snapshot.
  #[instrument(skip_all, name = "price_router")]
  pub async fn run(
    mut self,
    mut ingest: IngestReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
  ) -> HealthSnapshot {
    let mut ticker = tokio::time::interval(self.evaluation_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signals_open = true;

    info!(
      evaluation_interval_ms = self.evaluation_interval.as_millis(),
      queue_capacity = ingest.primary.capacity(),
      "Price router started"
    );

    loop {
      tokio::select! {
        _ = shutdown_rx.recv() => {
          info!("Shutdown signal received in price router");
          break;
        }
        signal = ingest.signals.recv(), if signals_open => match signal {
          Some(signal) => self.apply_signal(&signal, clock()),
          None => {
            debug!("All ingest handles dropped");
            signals_open = false;
          }
        },
        () = ingest.primary.wait() => {
          self.process_batch(&ingest.primary, &mut ingest.signals);
        }
        () = ingest.fallback.wait() => {
          self.process_batch(&ingest.fallback, &mut ingest.signals);
        }
        _ = ticker.tick() => {
          let now = clock();
          self.tick(now);
          self.sync_queue_drops(&ingest);
          self.publish(now);
        }
      }

      if self.dirty {
        self.publish(clock());
      }
    }

    self.drain(&mut ingest).await;

    let now = clock();
    self.sync_queue_drops(&ingest);
    let mut last = self.snapshot(now);
    last.running = false;
    self.snapshot_tx.send_replace(last.clone());
    info!(
      state = %last.state,
      forwarded = last.counters.forwarded,
      rejected = last.counters.rejected,
      "Price router stopped"
    );
    last
  }

  fn process_batch(
    &mut self,
    queue: &IngestQueue,
    signals: &mut mpsc::UnboundedReceiver<ConnectivitySignal>,
  ) {
    self.apply_pending_signals(signals);
    for raw in queue.drain(self.batch_size) {
      self.process(queue.source(), raw, clock());
    }
    if !queue.is_empty() {
      queue.rearm();
    }
  }

  fn apply_pending_signals(&mut self, signals: &mut mpsc::UnboundedReceiver<ConnectivitySignal>) {
    while let Ok(signal) = signals.try_recv() {
      self.apply_signal(&signal, clock());
    }
  }

  async fn drain(&mut self, ingest: &mut IngestReceiver) {
    let deadline = tokio::time::Instant::now() + self.drain_timeout;
    let mut drained = 0usize;

    loop {
      self.apply_pending_signals(&mut ingest.signals);
      if ingest.is_idle() {
        break;
      }
      if tokio::time::Instant::now() >= deadline {
        warn!(
          primary = ingest.primary.len(),
          fallback = ingest.fallback.len(),
          "Drain timeout elapsed, discarding queued messages"
        );
        break;
      }
      for queue in [&ingest.primary, &ingest.fallback] {
        for raw in queue.drain(self.batch_size) {
          self.process(queue.source(), raw, clock());
          drained += 1;
        }
      }
      tokio::task::yield_now().await;
    }

    info!(drained, "Ingest queues drained");
  }

  fn sync_queue_drops(&mut self, ingest: &IngestReceiver) {
    for source in DataSource::ALL {
      let total = ingest.queue(source).dropped();
      self.record_queue_drops(source, total);
    }
  }
}

/// Current time on the runtime clock (pausable in tests).
fn clock() -> Instant {
  tokio::time::Instant::now().into_std()
}

fn compose_snapshot(
  health: &HealthTracker,
  machine: &RouterStateMachine,
  counters: &RouterCounters,
  now: Instant,
  running: bool,
) -> HealthSnapshot {
  let routing = machine.counters(now);
  let mut counters = counters.clone();
  counters.fallback_activation_count = routing.fallback_activation_count;
  counters.total_fallback_duration_secs = routing.total_fallback_duration.as_secs_f64();
  counters.uptime_percent = routing.uptime_percent;

  let view = health.view(now);
  let mut primary = health.health(DataSource::Primary).clone();
  primary.healthy = view.primary.healthy;
  let mut fallback = health.health(DataSource::Fallback).clone();
  fallback.healthy = view.fallback.healthy;

  HealthSnapshot {
    state: machine.state(),
    time_in_state_secs: routing.time_in_state.as_secs_f64(),
    primary,
    fallback,
    counters,
    recent_transitions: machine.history().iter().cloned().collect(),
    running,
    generated_at: Utc::now(),
  }
}
