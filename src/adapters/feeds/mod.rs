//! Price Source Adapters - Provider Transports
//!
//! Reference implementations of the `PriceSource` port:
//! - Stream: Primary real-time trade/quote/bar WebSocket feed
//! - Poller: Fallback REST chart poller with rate limiting
//! - Supervisor: Manages feed lifecycle with restart on crash

pub mod poller;
pub mod stream;
pub mod supervisor;

pub use poller::PollFeed;
pub use stream::StreamFeed;
pub use supervisor::FeedSupervisor;
