//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use super::{AppConfig, MAX_WINDOW_SECS};

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
  let path = path.as_ref();

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)
    .with_context(|| format!("Invalid configuration in {}", path.display()))?;

  info!(
    symbols = config.feeds.symbols.len(),
    message_timeout_secs = config.router.message_timeout_secs,
    failback_grace_secs = config.router.failback_grace_secs,
    queue_capacity = config.router.queue_capacity,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration text.
///
/// # Errors
/// Fails on malformed TOML or out-of-range values.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig = toml::from_str(content).context("Failed to parse config.toml")?;
  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
fn validate_config(config: &AppConfig) -> Result<()> {
  let router = &config.router;
  anyhow::ensure!(
    router.message_timeout_secs > 0,
    "message_timeout_secs must be positive"
  );
  anyhow::ensure!(
    router.failover_latency_target_secs > 0,
    "failover_latency_target_secs must be positive"
  );
  anyhow::ensure!(router.queue_capacity > 0, "queue_capacity must be positive");
  anyhow::ensure!(
    router.transition_history_capacity > 0,
    "transition_history_capacity must be positive"
  );
  anyhow::ensure!(
    router.evaluation_interval_ms > 0,
    "evaluation_interval_ms must be positive"
  );
  anyhow::ensure!(router.batch_size > 0, "batch_size must be positive");
  anyhow::ensure!(
    router.throughput_window_secs > 0,
    "throughput_window_secs must be positive"
  );
  for (name, secs) in [
    ("message_timeout_secs", router.message_timeout_secs),
    ("startup_grace_secs", router.startup_grace_secs),
    ("failback_grace_secs", router.failback_grace_secs),
    ("failover_latency_target_secs", router.failover_latency_target_secs),
    ("throughput_window_secs", router.throughput_window_secs),
  ] {
    anyhow::ensure!(
      secs <= MAX_WINDOW_SECS.unsigned_abs(),
      "{name} must be at most {MAX_WINDOW_SECS}, got {secs}"
    );
  }
  for (name, ms) in [
    ("evaluation_interval_ms", router.evaluation_interval_ms),
    ("drain_timeout_ms", router.drain_timeout_ms),
  ] {
    anyhow::ensure!(
      ms <= MAX_WINDOW_SECS.unsigned_abs() * 1000,
      "{name} must be at most {}, got {ms}",
      MAX_WINDOW_SECS * 1000
    );
  }

  let validation = &config.validation;
  anyhow::ensure!(
    validation.future_timestamp_tolerance_secs >= 0,
    "future_timestamp_tolerance_secs must not be negative"
  );
  anyhow::ensure!(
    validation.stale_data_threshold_secs > 0,
    "stale_data_threshold_secs must be positive"
  );
  anyhow::ensure!(
    validation.cross_source_window_secs >= 0,
    "cross_source_window_secs must not be negative"
  );
  for (name, secs) in [
    ("future_timestamp_tolerance_secs", validation.future_timestamp_tolerance_secs),
    ("stale_data_threshold_secs", validation.stale_data_threshold_secs),
    ("cross_source_window_secs", validation.cross_source_window_secs),
  ] {
    anyhow::ensure!(
      secs <= MAX_WINDOW_SECS,
      "{name} must be at most {MAX_WINDOW_SECS}, got {secs}"
    );
  }
  for (name, pct) in [
    ("circuit_breaker_movement_pct", validation.circuit_breaker_movement_pct),
    ("large_movement_warn_pct", validation.large_movement_warn_pct),
    ("wide_spread_warn_pct", validation.wide_spread_warn_pct),
    ("cross_source_discrepancy_pct", validation.cross_source_discrepancy_pct),
  ] {
    anyhow::ensure!(pct > Decimal::ZERO, "{name} must be positive, got {pct}");
  }
  anyhow::ensure!(
    validation.large_movement_warn_pct < validation.circuit_breaker_movement_pct,
    "large_movement_warn_pct ({}) must be below circuit_breaker_movement_pct ({})",
    validation.large_movement_warn_pct,
    validation.circuit_breaker_movement_pct
  );

  let feeds = &config.feeds;
  if feeds.stream.enabled || feeds.poller.enabled {
    anyhow::ensure!(
      !feeds.symbols.is_empty(),
      "At least one symbol must be configured"
    );
    anyhow::ensure!(
      feeds.symbols.iter().all(|s| !s.trim().is_empty()),
      "Symbols must not be blank"
    );
  }
  if feeds.stream.enabled {
    anyhow::ensure!(!feeds.stream.url.is_empty(), "Stream URL must not be empty");
  }
  if feeds.poller.enabled {
    anyhow::ensure!(
      !feeds.poller.base_url.is_empty(),
      "Poller base_url must not be empty"
    );
    anyhow::ensure!(
      feeds.poller.requests_per_second > 0,
      "requests_per_second must be positive"
    );
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use rust_decimal_macros::dec;

  use super::*;
  use crate::config::ValidationConfig;

  #[test]
  fn test_load_nonexistent_file() {
    let result = load_config("nonexistent.toml");
    assert!(result.is_err());
  }

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = parse_config("").unwrap();
    assert_eq!(config.router.message_timeout_secs, 30);
    assert_eq!(config.router.queue_capacity, 1024);
    assert_eq!(config.router.transition_history_capacity, 50);
    assert_eq!(config.validation.circuit_breaker_movement_pct, dec!(20));
    assert_eq!(config.validation.rules().circuit_breaker_movement, dec!(0.20));
  }

  #[test]
  fn test_partial_section_keeps_other_defaults() {
    let config = parse_config(
      r#"
        [router]
        failback_grace_secs = 20

        [validation]
        large_movement_warn_pct = 2.5
      "#,
    )
    .unwrap();
    assert_eq!(config.router.failback_grace_secs, 20);
    assert_eq!(config.router.startup_grace_secs, 10);
    assert_eq!(config.validation.rules().large_movement_warn, dec!(0.025));
  }

  #[test]
  fn test_warn_threshold_must_be_below_breaker() {
    let err = parse_config(
      r#"
        [validation]
        large_movement_warn_pct = 25
      "#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("large_movement_warn_pct"));
  }

  #[test]
  fn test_out_of_range_windows_rejected() {
    let err = parse_config("[validation]\nfuture_timestamp_tolerance_secs = 9223372036854775807\n")
      .unwrap_err();
    assert!(format!("{err:#}").contains("future_timestamp_tolerance_secs"));

    let err = parse_config("[router]\nmessage_timeout_secs = 9223372036854775807\n").unwrap_err();
    assert!(format!("{err:#}").contains("message_timeout_secs"));

    assert!(parse_config("[validation]\ncross_source_window_secs = 604800\n").is_ok());
  }

  #[test]
  fn test_rules_clamp_unvalidated_windows() {
    let config = ValidationConfig {
      future_timestamp_tolerance_secs: i64::MAX,
      stale_data_threshold_secs: i64::MIN,
      ..ValidationConfig::default()
    };
    let rules = config.rules();
    assert_eq!(
      rules.future_timestamp_tolerance,
      chrono::Duration::seconds(MAX_WINDOW_SECS)
    );
    assert_eq!(rules.stale_data_threshold, chrono::Duration::zero());
  }

  #[test]
  fn test_zero_queue_capacity_rejected() {
    assert!(parse_config("[router]\nqueue_capacity = 0\n").is_err());
  }
}
