//! Health Tracker - per-source liveness bookkeeping.
//!
//! A source is healthy while it is connected and has produced a message
//! (or connected) within the message timeout. An explicit Disconnected or
//! Error keeps it unhealthy until the adapter reports Connected again.
//! The tracker also remembers when the current healthy or unhealthy
//! stretch began, which drives failback hysteresis and failover latency.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::price::DataSource;

// ────────────────────────────────────────────
// Signals
// ────────────────────────────────────────────

/// Connectivity event kinds reported by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Connected,
    Disconnected,
    Error,
}

/// Connectivity event for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySignal {
    pub source: DataSource,
    pub kind: SignalKind,
    pub detail: Option<String>,
}

impl ConnectivitySignal {
    pub const fn connected(source: DataSource) -> Self {
        Self {
            source,
            kind: SignalKind::Connected,
            detail: None,
        }
    }

    pub fn disconnected(source: DataSource, detail: impl Into<String>) -> Self {
        Self {
            source,
            kind: SignalKind::Disconnected,
            detail: Some(detail.into()),
        }
    }

    pub fn error(source: DataSource, detail: impl Into<String>) -> Self {
        Self {
            source,
            kind: SignalKind::Error,
            detail: Some(detail.into()),
        }
    }
}

// ────────────────────────────────────────────
// Health records
// ────────────────────────────────────────────

/// Published health of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub connected: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Diagnostic throughput over the sliding window.
    pub messages_per_second: f64,
    pub last_error: Option<String>,
    /// Health as of the last evaluation.
    pub healthy: bool,
}

/// Point-in-time health of a source as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStatus {
    pub healthy: bool,
    /// How long the source has been in its current condition.
    pub since: Duration,
}

impl SourceStatus {
    /// Continuous healthy time, zero when unhealthy.
    pub const fn healthy_for(&self) -> Duration {
        if self.healthy {
            self.since
        } else {
            Duration::ZERO
        }
    }
}

/// Both sources' status, evaluated at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthView {
    pub primary: SourceStatus,
    pub fallback: SourceStatus,
}

impl HealthView {
    pub const fn get(&self, source: DataSource) -> SourceStatus {
        match source {
            DataSource::Primary => self.primary,
            DataSource::Fallback => self.fallback,
        }
    }
}

/// Tracker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub message_timeout: Duration,
    pub throughput_window: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            throughput_window: Duration::from_secs(60),
        }
    }
}

// ────────────────────────────────────────────
// Tracker
// ────────────────────────────────────────────

#[derive(Debug)]
struct SourceTracker {
    source: DataSource,
    health: ProviderHealth,
    connected_at: Option<Instant>,
    last_message: Option<Instant>,
    /// Start of the current healthy stretch.
    healthy_since: Option<Instant>,
    /// When the source last dropped out explicitly.
    down_since: Instant,
    recent: VecDeque<Instant>,
}

impl SourceTracker {
    fn new(source: DataSource, now: Instant) -> Self {
        Self {
            source,
            health: ProviderHealth {
                connected: false,
                last_message_at: None,
                consecutive_failures: 0,
                messages_per_second: 0.0,
                last_error: None,
                healthy: false,
            },
            connected_at: None,
            last_message: None,
            healthy_since: None,
            down_since: now,
            recent: VecDeque::new(),
        }
    }

    /// Latest proof of life while connected.
    fn reference(&self) -> Option<Instant> {
        match (self.connected_at, self.last_message) {
            (Some(c), Some(m)) => Some(c.max(m)),
            (c, m) => c.or(m),
        }
    }

    fn is_healthy(&self, now: Instant, timeout: Duration) -> bool {
        self.health.connected
            && self
                .reference()
                .is_some_and(|r| now.saturating_duration_since(r) <= timeout)
    }

    /// When the current unhealthy stretch began.
    fn unhealthy_since(&self, timeout: Duration) -> Instant {
        if self.health.connected {
            self.reference()
                .map_or(self.down_since, |r| r + timeout)
        } else {
            self.down_since
        }
    }

    /// Drop the healthy stretch if the timeout has lapsed.
    fn expire(&mut self, now: Instant, timeout: Duration) {
        let healthy = self.is_healthy(now, timeout);
        if !healthy && self.healthy_since.take().is_some() {
            warn!(
                source = %self.source,
                timeout_secs = timeout.as_secs(),
                "No messages within timeout, source marked unhealthy"
            );
        }
        self.health.healthy = healthy;
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        let secs = window.as_secs_f64();
        self.health.messages_per_second = if secs > 0.0 {
            self.recent.len() as f64 / secs
        } else {
            0.0
        };
    }
}

/// Owns the `ProviderHealth` of both sources.
#[derive(Debug)]
pub struct HealthTracker {
    settings: HealthSettings,
    primary: SourceTracker,
    fallback: SourceTracker,
}

impl HealthTracker {
    pub fn new(settings: HealthSettings, now: Instant) -> Self {
        Self {
            settings,
            primary: SourceTracker::new(DataSource::Primary, now),
            fallback: SourceTracker::new(DataSource::Fallback, now),
        }
    }

    pub const fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Apply an adapter connectivity signal.
    pub fn apply(&mut self, signal: &ConnectivitySignal, now: Instant) {
        let timeout = self.settings.message_timeout;
        let tracker = self.tracker_mut(signal.source);
        tracker.expire(now, timeout);

        match signal.kind {
            SignalKind::Connected => {
                if !tracker.health.connected {
                    info!(source = %tracker.source, "Source connected");
                }
                tracker.health.connected = true;
                tracker.connected_at = Some(now);
                tracker.healthy_since.get_or_insert(now);
                tracker.health.healthy = true;
            }
            SignalKind::Disconnected | SignalKind::Error => {
                let detail = signal
                    .detail
                    .clone()
                    .unwrap_or_else(|| "disconnected".to_string());
                if tracker.health.connected {
                    tracker.down_since = now;
                }
                tracker.health.connected = false;
                tracker.health.healthy = false;
                tracker.health.consecutive_failures =
                    tracker.health.consecutive_failures.saturating_add(1);
                tracker.healthy_since = None;
                warn!(
                    source = %tracker.source,
                    kind = ?signal.kind,
                    failures = tracker.health.consecutive_failures,
                    error = %detail,
                    "Source reported connectivity loss"
                );
                tracker.health.last_error = Some(detail);
            }
        }
    }

    /// Record a dequeued message from `source`.
    pub fn record_message(&mut self, source: DataSource, now: Instant) {
        let HealthSettings {
            message_timeout,
            throughput_window,
        } = self.settings;
        let tracker = self.tracker_mut(source);
        tracker.expire(now, message_timeout);

        tracker.last_message = Some(now);
        tracker.health.last_message_at = Some(Utc::now());
        tracker.recent.push_back(now);
        tracker.prune(now, throughput_window);

        if tracker.health.connected {
            tracker.health.consecutive_failures = 0;
            if tracker.healthy_since.is_none() {
                debug!(source = %tracker.source, "Source producing again");
                tracker.healthy_since = Some(now);
            }
            tracker.health.healthy = true;
        }
    }

    /// Re-evaluate timeouts and throughput for both sources.
    pub fn refresh(&mut self, now: Instant) {
        let HealthSettings {
            message_timeout,
            throughput_window,
        } = self.settings;
        for tracker in [&mut self.primary, &mut self.fallback] {
            tracker.expire(now, message_timeout);
            tracker.prune(now, throughput_window);
        }
    }

    /// Current status of one source.
    pub fn status(&self, source: DataSource, now: Instant) -> SourceStatus {
        let timeout = self.settings.message_timeout;
        let tracker = self.tracker(source);
        if tracker.is_healthy(now, timeout) {
            let since = tracker.healthy_since.unwrap_or(now);
            SourceStatus {
                healthy: true,
                since: now.saturating_duration_since(since),
            }
        } else {
            SourceStatus {
                healthy: false,
                since: now.saturating_duration_since(tracker.unhealthy_since(timeout)),
            }
        }
    }

    /// Status of both sources at `now`.
    pub fn view(&self, now: Instant) -> HealthView {
        HealthView {
            primary: self.status(DataSource::Primary, now),
            fallback: self.status(DataSource::Fallback, now),
        }
    }

    pub fn health(&self, source: DataSource) -> &ProviderHealth {
        &self.tracker(source).health
    }

    const fn tracker(&self, source: DataSource) -> &SourceTracker {
        match source {
            DataSource::Primary => &self.primary,
            DataSource::Fallback => &self.fallback,
        }
    }

    fn tracker_mut(&mut self, source: DataSource) -> &mut SourceTracker {
        match source {
            DataSource::Primary => &mut self.primary,
            DataSource::Fallback => &mut self.fallback,
        }
    }
}
