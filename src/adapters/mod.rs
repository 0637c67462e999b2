//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (WebSockets, HTTP clients, HTTP servers).
//!
//! Adapter categories:
//! - `feeds`: Primary stream and fallback poller, plus their supervisor
//! - `metrics`: Prometheus metrics export and health checks
//! - `sink`: In-process broadcast of forwarded updates

pub mod feeds;
pub mod metrics;
pub mod sink;
