//! Metrics and Monitoring Adapters
//!
//! Prometheus export on the configured bind address, plus /live, /ready
//! and /health probes via axum 0.7. Both read the router only through
//! published snapshots.

pub mod health;
pub mod prometheus;

pub use health::{HealthServer, HealthState};
pub use prometheus::MetricsRegistry;
