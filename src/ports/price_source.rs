//! Price Source Port - Provider Adapter Interface
//!
//! A price source owns its transport (WebSocket, HTTP polling) and pushes
//! already-parsed `RawMessage`s plus connectivity signals into the router
//! through a `SourceHandle`. The router never sees wire formats.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::price::DataSource;
use crate::usecases::ingest::SourceHandle;

/// Trait for provider adapters feeding the router.
#[async_trait]
pub trait PriceSource: Send + Sync + 'static {
  /// Adapter name for logs.
  fn name(&self) -> &'static str;

  /// Which routing role this adapter plays.
  fn source(&self) -> DataSource;

  /// Run until shutdown is signaled.
  ///
  /// Transient transport failures are reported through `handle` and
  /// retried internally. An `Err` return means the adapter gave up and
  /// should be restarted by its supervisor.
  async fn run(
    &self,
    handle: SourceHandle,
    shutdown_rx: broadcast::Receiver<()>,
  ) -> anyhow::Result<()>;
}
