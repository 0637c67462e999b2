//! Router State Machine - active source selection with hysteresis.
//!
//! Owns the current `RoutingState`, the bounded transition history and
//! the failover accounting. It never looks at the clock itself: callers
//! pass the current `Instant` and a `HealthView` evaluated at that instant.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::health::HealthView;
use super::price::DataSource;

/// Which source, if any, is authoritative right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingState {
    /// Waiting for the first usable primary update or the startup grace.
    Startup,
    PrimaryActive,
    FallbackActive,
    /// Neither source is healthy; nothing is forwarded.
    BothUnavailable,
}

impl RoutingState {
    /// Source whose updates are forwarded in this state.
    pub const fn active_source(self) -> Option<DataSource> {
        match self {
            Self::PrimaryActive => Some(DataSource::Primary),
            Self::FallbackActive => Some(DataSource::Fallback),
            Self::Startup | Self::BothUnavailable => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "STARTUP",
            Self::PrimaryActive => "PRIMARY_ACTIVE",
            Self::FallbackActive => "FALLBACK_ACTIVE",
            Self::BothUnavailable => "BOTH_UNAVAILABLE",
        }
    }

    /// Numeric encoding for the routing state gauge.
    pub const fn code(self) -> i64 {
        match self {
            Self::Startup => 0,
            Self::PrimaryActive => 1,
            Self::FallbackActive => 2,
            Self::BothUnavailable => 3,
        }
    }
}

impl std::fmt::Display for RoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: RoutingState,
    pub to: RoutingState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

// ────────────────────────────────────────────
// Transition history ring
// ────────────────────────────────────────────

/// Fixed-capacity ring of transitions; the oldest entry is overwritten.
#[derive(Debug, Clone)]
pub struct TransitionHistory {
    slots: Vec<StateTransition>,
    capacity: usize,
    /// Slot the next push writes once the ring is full.
    next: usize,
}

impl TransitionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn push(&mut self, transition: StateTransition) {
        if self.slots.len() < self.capacity {
            self.slots.push(transition);
        } else {
            self.slots[self.next] = transition;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Transitions from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &StateTransition> {
        let split = if self.slots.len() < self.capacity {
            0
        } else {
            self.next
        };
        self.slots[split..].iter().chain(self.slots[..split].iter())
    }

    pub fn latest(&self) -> Option<&StateTransition> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = (self.next + self.capacity - 1) % self.capacity;
        self.slots.get(idx)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

// ────────────────────────────────────────────
// State machine
// ────────────────────────────────────────────

/// Grace periods governing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingTimings {
    /// How long Startup waits for a usable primary update.
    pub startup_grace: Duration,
    /// Continuous primary health required before failing back.
    pub failback_grace: Duration,
}

impl Default for RoutingTimings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(10),
            failback_grace: Duration::from_secs(10),
        }
    }
}

/// Failover accounting derived from time spent in each state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoutingCounters {
    pub fallback_activation_count: u64,
    pub total_fallback_duration: Duration,
    /// Share of elapsed time spent in `PrimaryActive`, in percent.
    pub uptime_percent: f64,
    /// Time spent in the current state.
    pub time_in_state: Duration,
}

/// Decides the active source.
#[derive(Debug)]
pub struct RouterStateMachine {
    state: RoutingState,
    started_at: Instant,
    entered_at: Instant,
    timings: RoutingTimings,
    history: TransitionHistory,
    fallback_activations: u64,
    /// Closed fallback stretches only; the open one is added on read.
    fallback_time: Duration,
    /// Closed primary stretches only.
    primary_time: Duration,
}

impl RouterStateMachine {
    pub fn new(timings: RoutingTimings, history_capacity: usize, now: Instant) -> Self {
        Self {
            state: RoutingState::Startup,
            started_at: now,
            entered_at: now,
            timings,
            history: TransitionHistory::new(history_capacity),
            fallback_activations: 0,
            fallback_time: Duration::ZERO,
            primary_time: Duration::ZERO,
        }
    }

    pub const fn state(&self) -> RoutingState {
        self.state
    }

    pub const fn history(&self) -> &TransitionHistory {
        &self.history
    }

    /// Whether an update from `source` goes downstream in the current state.
    pub fn should_forward(&self, source: DataSource) -> bool {
        self.state.active_source() == Some(source)
    }

    /// React to an Accept/Warn update. Only the first usable primary update
    /// during Startup changes anything.
    pub fn on_usable_update(
        &mut self,
        source: DataSource,
        view: &HealthView,
        now: Instant,
    ) -> Option<StateTransition> {
        if self.state == RoutingState::Startup
            && source == DataSource::Primary
            && view.primary.healthy
        {
            return self.transition(
                RoutingState::PrimaryActive,
                "first usable primary update".to_string(),
                view,
                now,
            );
        }
        None
    }

    /// Re-evaluate the state against current source health.
    pub fn evaluate(&mut self, view: &HealthView, now: Instant) -> Option<StateTransition> {
        let primary = view.primary;
        let fallback = view.fallback;
        let failback_ready = primary.healthy && primary.healthy_for() >= self.timings.failback_grace;

        let (to, reason) = match self.state {
            RoutingState::Startup => {
                let waited = now.saturating_duration_since(self.started_at);
                if waited < self.timings.startup_grace {
                    return None;
                }
                if fallback.healthy {
                    (
                        RoutingState::FallbackActive,
                        format!(
                            "no usable primary update within startup grace of {}s",
                            self.timings.startup_grace.as_secs()
                        ),
                    )
                } else if !primary.healthy {
                    (
                        RoutingState::BothUnavailable,
                        "no healthy source after startup grace".to_string(),
                    )
                } else {
                    return None;
                }
            }
            RoutingState::PrimaryActive => {
                if primary.healthy {
                    return None;
                }
                if fallback.healthy {
                    (
                        RoutingState::FallbackActive,
                        format!(
                            "primary unhealthy for {}s, fallback healthy",
                            primary.since.as_secs()
                        ),
                    )
                } else {
                    (
                        RoutingState::BothUnavailable,
                        "primary unhealthy and fallback unhealthy".to_string(),
                    )
                }
            }
            RoutingState::FallbackActive => {
                if failback_ready {
                    (
                        RoutingState::PrimaryActive,
                        format!(
                            "primary healthy for {}s (failback grace {}s)",
                            primary.healthy_for().as_secs(),
                            self.timings.failback_grace.as_secs()
                        ),
                    )
                } else if fallback.healthy {
                    return None;
                } else if primary.healthy {
                    (
                        RoutingState::PrimaryActive,
                        "fallback unhealthy, primary healthy".to_string(),
                    )
                } else {
                    (
                        RoutingState::BothUnavailable,
                        "fallback unhealthy and primary unhealthy".to_string(),
                    )
                }
            }
            RoutingState::BothUnavailable => {
                if failback_ready {
                    (
                        RoutingState::PrimaryActive,
                        format!(
                            "primary recovered, healthy for {}s",
                            primary.healthy_for().as_secs()
                        ),
                    )
                } else if fallback.healthy {
                    (
                        RoutingState::FallbackActive,
                        "fallback recovered".to_string(),
                    )
                } else {
                    return None;
                }
            }
        };

        self.transition(to, reason, view, now)
    }

    /// Failover accounting as of `now`.
    pub fn counters(&self, now: Instant) -> RoutingCounters {
        let in_state = now.saturating_duration_since(self.entered_at);
        let mut fallback_time = self.fallback_time;
        let mut primary_time = self.primary_time;
        match self.state {
            RoutingState::FallbackActive => fallback_time += in_state,
            RoutingState::PrimaryActive => primary_time += in_state,
            RoutingState::Startup | RoutingState::BothUnavailable => {}
        }

        let total = now.saturating_duration_since(self.started_at).as_secs_f64();
        let uptime_percent = if total > 0.0 {
            primary_time.as_secs_f64() / total * 100.0
        } else {
            0.0
        };

        RoutingCounters {
            fallback_activation_count: self.fallback_activations,
            total_fallback_duration: fallback_time,
            uptime_percent,
            time_in_state: in_state,
        }
    }

    /// Move to `to`, refusing targets the current health does not allow.
    fn transition(
        &mut self,
        to: RoutingState,
        reason: String,
        view: &HealthView,
        now: Instant,
    ) -> Option<StateTransition> {
        if to == self.state {
            return None;
        }

        let admissible = match to {
            RoutingState::PrimaryActive => view.primary.healthy,
            RoutingState::FallbackActive => view.fallback.healthy,
            RoutingState::BothUnavailable => !view.primary.healthy && !view.fallback.healthy,
            RoutingState::Startup => false,
        };
        debug_assert!(
            admissible,
            "invalid routing transition {} -> {to} ({reason})",
            self.state
        );
        if !admissible {
            warn!(
                from = %self.state,
                to = %to,
                reason = %reason,
                "Ignoring invalid routing transition"
            );
            return None;
        }

        let in_state = now.saturating_duration_since(self.entered_at);
        match self.state {
            RoutingState::FallbackActive => self.fallback_time += in_state,
            RoutingState::PrimaryActive => self.primary_time += in_state,
            RoutingState::Startup | RoutingState::BothUnavailable => {}
        }
        if to == RoutingState::FallbackActive {
            self.fallback_activations += 1;
        }

        let transition = StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
            reason,
        };
        match to {
            RoutingState::FallbackActive | RoutingState::BothUnavailable => warn!(
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Routing state changed"
            ),
            _ => info!(
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Routing state changed"
            ),
        }

        self.state = to;
        self.entered_at = now;
        self.history.push(transition.clone());
        Some(transition)
    }

    #[cfg(test)]
    fn force(&mut self, to: RoutingState, view: &HealthView, now: Instant) -> Option<StateTransition> {
        self.transition(to, "forced".to_string(), view, now)
    }
}
