//! Broadcast Sink - In-process Fan-out of Forwarded Updates
//!
//! Implements `UpdateSink` on top of a tokio `broadcast` channel. Slow
//! subscribers lag and lose the oldest updates; the router never waits.

use tokio::sync::broadcast;
use tracing::{info, trace};

use crate::domain::price::PriceUpdate;
use crate::domain::routing::StateTransition;
use crate::ports::update_sink::UpdateSink;

/// Publishes forwarded updates to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    updates_tx: broadcast::Sender<PriceUpdate>,
    transitions_tx: broadcast::Sender<StateTransition>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        let (transitions_tx, _) = broadcast::channel(64);
        Self {
            updates_tx,
            transitions_tx,
        }
    }

    /// Receiver for forwarded updates.
    pub fn subscribe(&self) -> broadcast::Receiver<PriceUpdate> {
        self.updates_tx.subscribe()
    }

    /// Receiver for routing state changes.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions_tx.subscribe()
    }
}

impl UpdateSink for BroadcastSink {
    fn forward(&self, update: &PriceUpdate) {
        // No receivers is fine.
        let receivers = self.updates_tx.send(update.clone()).unwrap_or(0);
        trace!(
            symbol = %update.symbol,
            price = %update.price,
            source = %update.source,
            receivers,
            "Update forwarded"
        );
    }

    fn on_state_transition(&self, transition: &StateTransition) {
        info!(
            from = %transition.from,
            to = %transition.to,
            "Publishing routing transition"
        );
        let _ = self.transitions_tx.send(transition.clone());
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::price::DataSource;
    use crate::domain::routing::RoutingState;

    #[tokio::test]
    async fn test_subscribers_receive_forwarded_updates() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let update = PriceUpdate::new("AAPL", dec!(150), DataSource::Primary, Utc::now());

        sink.forward(&update);
        assert_eq!(rx.recv().await.unwrap(), update);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe_transitions();
        sink.on_state_transition(&StateTransition {
            from: RoutingState::Startup,
            to: RoutingState::PrimaryActive,
            at: Utc::now(),
            reason: "first usable primary update".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap().to, RoutingState::PrimaryActive);
    }

    #[test]
    fn test_forward_without_subscribers_is_noop() {
        let sink = BroadcastSink::new(1);
        sink.forward(&PriceUpdate::new("AAPL", dec!(1), DataSource::Fallback, Utc::now()));
    }
}
