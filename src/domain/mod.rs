//! Domain layer - price model, validation and routing decisions.
//!
//! Pure, synchronous logic for the router. Nothing here spawns tasks or
//! reads the clock on its own: callers pass `Instant`s and wall-clock
//! times in, which keeps every rule testable in isolation.

pub mod health;
pub mod normalizer;
pub mod price;
pub mod routing;
pub mod validator;

// Re-export core types for convenience
pub use health::{
    ConnectivitySignal, HealthSettings, HealthTracker, HealthView, ProviderHealth, SignalKind,
    SourceStatus,
};
pub use normalizer::{NormalizeError, Normalizer};
pub use price::{DataSource, PriceUpdate, RawMessage, FALLBACK_QUALITY, PRIMARY_QUALITY};
pub use routing::{
    RouterStateMachine, RoutingCounters, RoutingState, RoutingTimings, StateTransition,
    TransitionHistory,
};
pub use validator::{
    Flag, RejectReason, Rejection, ValidationResult, ValidationRules, Validator, Verdict,
    WarningKind,
};
