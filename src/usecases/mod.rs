//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement the
//! router's ingestion and dispatch workflow.
//!
//! Use cases:
//! - `ingest`: Bounded drop-oldest queues from adapters to the router
//! - `PriceRouter`: Serialized normalize / validate / route consumer

pub mod ingest;
pub mod price_router;

pub use ingest::{IngestHandle, IngestReceiver, SourceHandle};
pub use price_router::{Disposition, HealthSnapshot, PriceRouter, RouterCounters, RouterHandle};
