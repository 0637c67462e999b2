//! Configuration Module - TOML-based Router Configuration
//!
//! Loads and validates configuration from `config.toml`. Every field has
//! a serde default, so an empty file yields a working router with the
//! documented thresholds. Durations are plain integers with the unit in
//! the key name.

pub mod loader;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::domain::health::HealthSettings;
use crate::domain::routing::RoutingTimings;
use crate::domain::validator::ValidationRules;

/// Upper bound for every `*_secs` window, one week.
pub const MAX_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Service identity and logging.
  pub service: ServiceConfig,
  /// Routing, health and queueing parameters.
  pub router: RouterConfig,
  /// Validator thresholds.
  pub validation: ValidationConfig,
  /// Reference provider adapters.
  pub feeds: FeedsConfig,
  /// Metrics and health endpoints.
  pub metrics: MetricsConfig,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
  /// Human-readable service name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
  pub log_level: String,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      name: "price-feed-router".to_string(),
      log_level: default_log_level(),
    }
  }
}

/// Router state machine, health tracker and ingest queue parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
  /// Silence after which a connected source is unhealthy.
  pub message_timeout_secs: u64,
  /// How long Startup waits for a usable primary update.
  pub startup_grace_secs: u64,
  /// Continuous primary health required before failing back.
  pub failback_grace_secs: u64,
  /// Failovers slower than this are logged as warnings.
  pub failover_latency_target_secs: u64,
  /// Per-source ingest queue capacity.
  pub queue_capacity: usize,
  /// Transitions kept in the history ring.
  pub transition_history_capacity: usize,
  /// Upper bound between two state re-evaluations.
  pub evaluation_interval_ms: u64,
  /// How long shutdown keeps draining queued messages.
  pub drain_timeout_ms: u64,
  /// Sliding window for the messages-per-second diagnostic.
  pub throughput_window_secs: u64,
  /// Messages taken from one queue before yielding to the other.
  pub batch_size: usize,
}

impl Default for RouterConfig {
  fn default() -> Self {
    Self {
      message_timeout_secs: 30,
      startup_grace_secs: 10,
      failback_grace_secs: 10,
      failover_latency_target_secs: 15,
      queue_capacity: 1024,
      transition_history_capacity: 50,
      evaluation_interval_ms: 1000,
      drain_timeout_ms: 2000,
      throughput_window_secs: 60,
      batch_size: 64,
    }
  }
}

impl RouterConfig {
  pub const fn timings(&self) -> RoutingTimings {
    RoutingTimings {
      startup_grace: Duration::from_secs(self.startup_grace_secs),
      failback_grace: Duration::from_secs(self.failback_grace_secs),
    }
  }

  pub const fn health_settings(&self) -> HealthSettings {
    HealthSettings {
      message_timeout: Duration::from_secs(self.message_timeout_secs),
      throughput_window: Duration::from_secs(self.throughput_window_secs),
    }
  }

  pub const fn failover_latency_target(&self) -> Duration {
    Duration::from_secs(self.failover_latency_target_secs)
  }

  pub const fn evaluation_interval(&self) -> Duration {
    Duration::from_millis(self.evaluation_interval_ms)
  }

  pub const fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.drain_timeout_ms)
  }
}

/// Validator thresholds. Percentages are whole percent (20 = 20%).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
  pub future_timestamp_tolerance_secs: i64,
  pub stale_data_threshold_secs: i64,
  pub circuit_breaker_movement_pct: Decimal,
  pub large_movement_warn_pct: Decimal,
  pub wide_spread_warn_pct: Decimal,
  pub cross_source_discrepancy_pct: Decimal,
  pub cross_source_window_secs: i64,
}

impl Default for ValidationConfig {
  fn default() -> Self {
    Self {
      future_timestamp_tolerance_secs: 300,
      stale_data_threshold_secs: 600,
      circuit_breaker_movement_pct: dec!(20),
      large_movement_warn_pct: dec!(5),
      wide_spread_warn_pct: dec!(5),
      cross_source_discrepancy_pct: dec!(5),
      cross_source_window_secs: 60,
    }
  }
}

impl ValidationConfig {
  /// Rule thresholds with percentages converted to fractions.
  pub fn rules(&self) -> ValidationRules {
    let fraction = |pct: Decimal| pct / dec!(100);
    // Clamped so unvalidated values cannot overflow chrono's range.
    let window = |secs: i64| chrono::Duration::seconds(secs.clamp(0, MAX_WINDOW_SECS));
    ValidationRules {
      future_timestamp_tolerance: window(self.future_timestamp_tolerance_secs),
      stale_data_threshold: window(self.stale_data_threshold_secs),
      circuit_breaker_movement: fraction(self.circuit_breaker_movement_pct),
      large_movement_warn: fraction(self.large_movement_warn_pct),
      wide_spread_warn: fraction(self.wide_spread_warn_pct),
      cross_source_discrepancy: fraction(self.cross_source_discrepancy_pct),
      cross_source_window: window(self.cross_source_window_secs),
    }
  }
}

/// Reference adapters and their supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
  /// Symbols subscribed on the stream and polled on the REST provider.
  pub symbols: Vec<String>,
  /// Delay before a crashed adapter is restarted.
  pub restart_backoff_ms: u64,
  pub stream: StreamFeedConfig,
  pub poller: PollFeedConfig,
}

impl Default for FeedsConfig {
  fn default() -> Self {
    Self {
      symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "SPY".to_string()],
      restart_backoff_ms: 5000,
      stream: StreamFeedConfig::default(),
      poller: PollFeedConfig::default(),
    }
  }
}

/// Primary WebSocket stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamFeedConfig {
  pub enabled: bool,
  /// WebSocket endpoint.
  pub url: String,
  /// Environment variable holding the API key, if the stream needs auth.
  pub key_env: Option<String>,
  /// Environment variable holding the API secret.
  pub secret_env: Option<String>,
  /// Delay between reconnection attempts.
  pub reconnect_delay_ms: u64,
  /// Subscribe to quotes in addition to trades.
  pub quotes: bool,
  /// Subscribe to minute bars.
  pub bars: bool,
}

impl Default for StreamFeedConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      url: "wss://stream.data.alpaca.markets/v2/iex".to_string(),
      key_env: Some("STREAM_API_KEY".to_string()),
      secret_env: Some("STREAM_API_SECRET".to_string()),
      reconnect_delay_ms: 5000,
      quotes: true,
      bars: false,
    }
  }
}

/// Fallback REST poller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollFeedConfig {
  pub enabled: bool,
  /// Chart endpoint; the symbol is appended as a path segment.
  pub base_url: String,
  /// Pause between two full polling cycles.
  pub interval_ms: u64,
  /// Request budget across all symbols.
  pub requests_per_second: u32,
  /// Per-request timeout.
  pub timeout_ms: u64,
}

impl Default for PollFeedConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      base_url: "https://query1.finance.yahoo.com/v8/finance/chart".to_string(),
      interval_ms: 15_000,
      requests_per_second: 2,
      timeout_ms: 5000,
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  pub enabled: bool,
  /// Metrics server bind address.
  pub bind_address: String,
  /// Health check endpoint port.
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: "0.0.0.0:9090".to_string(),
      health_port: 8080,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}
