//! Update Sink Port - Downstream Delivery Interface
//!
//! The router hands every forwarded update to an `UpdateSink`. What the
//! sink does with it (broadcast, persist, render) is outside the router.

use crate::domain::price::PriceUpdate;
use crate::domain::routing::StateTransition;

/// Receiver of forwarded updates.
///
/// Called from the router's consumer task, in arrival order. Implementations
/// must not block: hand the update off to a channel or buffer.
pub trait UpdateSink: Send + Sync + 'static {
  /// Deliver one Accept/Warn update from the active source.
  fn forward(&self, update: &PriceUpdate);

  /// Observe a routing state change.
  fn on_state_transition(&self, _transition: &StateTransition) {}
}
