//! Price Feed Router - Library Root
//!
//! Routes normalized, validated price updates from a primary streaming
//! provider with automatic failover to a polled fallback provider.
//! Re-exports all modules for integration tests and benchmarks.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod usecases;
