//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the router requires from the
//! outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `PriceSource`: Provider adapters producing raw messages
//! - `UpdateSink`: Downstream delivery of forwarded updates

pub mod price_source;
pub mod update_sink;

pub use price_source::PriceSource;
pub use update_sink::UpdateSink;
