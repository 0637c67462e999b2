//! Validator - sanity rules for normalized updates.
//!
//! Rules run in a fixed order. The first rejection ends evaluation;
//! warnings accumulate and never block forwarding. The only state kept is
//! the last accepted price and source per symbol, used for the
//! cross-source discrepancy check.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::price::{DataSource, PriceUpdate};

// ────────────────────────────────────────────
// Verdicts
// ────────────────────────────────────────────

/// Outcome class of a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Warn,
    Reject,
}

/// Hard failures. Any of these drops the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    NonPositivePrice,
    NegativeVolume,
    FutureTimestamp,
    CircuitBreaker,
    OhlcInconsistency,
    InvertedBidAsk,
}

impl RejectReason {
    /// Human-readable reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NonPositivePrice => "non-positive price",
            Self::NegativeVolume => "negative volume",
            Self::FutureTimestamp => "future timestamp",
            Self::CircuitBreaker => "unrealistic price movement / circuit breaker",
            Self::OhlcInconsistency => "OHLC inconsistency",
            Self::InvertedBidAsk => "inverted bid/ask",
        }
    }

    /// Stable snake_case label for metrics and counters.
    pub const fn label(self) -> &'static str {
        match self {
            Self::NonPositivePrice => "non_positive_price",
            Self::NegativeVolume => "negative_volume",
            Self::FutureTimestamp => "future_timestamp",
            Self::CircuitBreaker => "circuit_breaker",
            Self::OhlcInconsistency => "ohlc_inconsistency",
            Self::InvertedBidAsk => "inverted_bid_ask",
        }
    }
}

/// Soft findings. The update is still forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WarningKind {
    StaleData,
    LargePriceMovement,
    WideSpread,
    CrossSourceDiscrepancy,
}

impl WarningKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StaleData => "stale data",
            Self::LargePriceMovement => "large price movement",
            Self::WideSpread => "wide spread",
            Self::CrossSourceDiscrepancy => "cross-source discrepancy",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::StaleData => "stale_data",
            Self::LargePriceMovement => "large_price_movement",
            Self::WideSpread => "wide_spread",
            Self::CrossSourceDiscrepancy => "cross_source_discrepancy",
        }
    }
}

/// A rejection with the values that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason.as_str(), self.detail)
    }
}

/// A warning with the values that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub kind: WarningKind,
    pub detail: String,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.as_str(), self.detail)
    }
}

/// Result of validating one update. Consumed immediately by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub verdict: Verdict,
    pub errors: Vec<Rejection>,
    pub warnings: Vec<Flag>,
}

impl ValidationResult {
    /// Accept and Warn are forwardable; Reject is not.
    pub fn is_forwardable(&self) -> bool {
        self.verdict != Verdict::Reject
    }

    /// The rejection that ended evaluation, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        self.errors.first()
    }

    /// Warnings rendered as strings, for attaching to forwarded updates.
    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }

    fn rejected(rejection: Rejection, warnings: Vec<Flag>) -> Self {
        Self {
            verdict: Verdict::Reject,
            errors: vec![rejection],
            warnings,
        }
    }

    fn passed(warnings: Vec<Flag>) -> Self {
        let verdict = if warnings.is_empty() {
            Verdict::Accept
        } else {
            Verdict::Warn
        };
        Self {
            verdict,
            errors: Vec::new(),
            warnings,
        }
    }
}

// ────────────────────────────────────────────
// Rule thresholds
// ────────────────────────────────────────────

/// Thresholds for the rule set. Percentages are fractions (0.20 = 20%).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    pub future_timestamp_tolerance: Duration,
    pub stale_data_threshold: Duration,
    pub circuit_breaker_movement: Decimal,
    pub large_movement_warn: Decimal,
    pub wide_spread_warn: Decimal,
    pub cross_source_discrepancy: Decimal,
    /// How recent the other source's price must be to compare against it.
    pub cross_source_window: Duration,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            future_timestamp_tolerance: Duration::minutes(5),
            stale_data_threshold: Duration::minutes(10),
            circuit_breaker_movement: dec!(0.20),
            large_movement_warn: dec!(0.05),
            wide_spread_warn: dec!(0.05),
            cross_source_discrepancy: dec!(0.05),
            cross_source_window: Duration::seconds(60),
        }
    }
}

// ────────────────────────────────────────────
// Validator
// ────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LastSeen {
    price: Decimal,
    source: DataSource,
    at: DateTime<Utc>,
}

/// Rule engine with minimal per-symbol context.
#[derive(Debug)]
pub struct Validator {
    rules: ValidationRules,
    last_seen: HashMap<String, LastSeen>,
}

impl Validator {
    pub fn new(rules: ValidationRules) -> Self {
        Self {
            rules,
            last_seen: HashMap::new(),
        }
    }

    pub const fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Validate an update against the rule set as of `now`.
    ///
    /// Forwardable updates become the cross-source reference for their
    /// symbol; rejected ones leave the context untouched.
    pub fn validate(&mut self, update: &PriceUpdate, now: DateTime<Utc>) -> ValidationResult {
        let result = self.evaluate(update, now);
        if result.is_forwardable() {
            self.last_seen.insert(
                update.symbol.clone(),
                LastSeen {
                    price: update.price,
                    source: update.source,
                    at: now,
                },
            );
        }
        result
    }

    fn evaluate(&self, update: &PriceUpdate, now: DateTime<Utc>) -> ValidationResult {
        let mut warnings = Vec::new();

        // 1. Price must be positive.
        if update.price <= Decimal::ZERO {
            return ValidationResult::rejected(
                reject(RejectReason::NonPositivePrice, format!("price={}", update.price)),
                warnings,
            );
        }

        // 2. Volume must not be negative.
        if update.volume < Decimal::ZERO {
            return ValidationResult::rejected(
                reject(RejectReason::NegativeVolume, format!("volume={}", update.volume)),
                warnings,
            );
        }

        // 3. Future timestamps beyond tolerance are rejected.
        if update.timestamp > now + self.rules.future_timestamp_tolerance {
            return ValidationResult::rejected(
                reject(
                    RejectReason::FutureTimestamp,
                    format!("timestamp={} now={now}", update.timestamp),
                ),
                warnings,
            );
        }

        // 4. Old timestamps are forwarded with a warning.
        if update.timestamp < now - self.rules.stale_data_threshold {
            let lag = now - update.timestamp;
            warnings.push(flag(
                WarningKind::StaleData,
                format!("lag={}s", lag.num_seconds()),
            ));
        }

        // 5. Movement against the reference close.
        if let Some(close) = update.previous_close().filter(|c| *c > Decimal::ZERO) {
            let Some(movement) = relative_difference(update.price, close) else {
                return ValidationResult::rejected(
                    reject(
                        RejectReason::CircuitBreaker,
                        format!("movement out of range price={} close={close}", update.price),
                    ),
                    warnings,
                );
            };
            if movement > self.rules.circuit_breaker_movement {
                return ValidationResult::rejected(
                    reject(
                        RejectReason::CircuitBreaker,
                        format!("movement={}% close={close}", pct(movement)),
                    ),
                    warnings,
                );
            }
            if movement > self.rules.large_movement_warn {
                warnings.push(flag(
                    WarningKind::LargePriceMovement,
                    format!("movement={}% close={close}", pct(movement)),
                ));
            }
        }

        // 6. OHLC bounds.
        if let Some(detail) = ohlc_violation(update) {
            return ValidationResult::rejected(
                reject(RejectReason::OhlcInconsistency, detail),
                warnings,
            );
        }

        // 7. Bid/ask ordering and spread width.
        if let (Some(bid), Some(ask)) = (update.bid, update.ask) {
            if bid > ask {
                return ValidationResult::rejected(
                    reject(RejectReason::InvertedBidAsk, format!("bid={bid} ask={ask}")),
                    warnings,
                );
            }
            let spread = (ask - bid).checked_div(update.price).unwrap_or(Decimal::MAX);
            if spread > self.rules.wide_spread_warn {
                warnings.push(flag(
                    WarningKind::WideSpread,
                    format!("spread={}%", pct(spread)),
                ));
            }
        }

        // 8. Disagreement with the other source. Informational only.
        if let Some(last) = self.last_seen.get(&update.symbol) {
            let recent = now - last.at <= self.rules.cross_source_window;
            if last.source != update.source && recent && last.price > Decimal::ZERO {
                let diff = relative_difference(update.price, last.price).unwrap_or(Decimal::MAX);
                if diff > self.rules.cross_source_discrepancy {
                    warnings.push(flag(
                        WarningKind::CrossSourceDiscrepancy,
                        format!(
                            "{}={} {}={} diff={}%",
                            update.source,
                            update.price,
                            last.source,
                            last.price,
                            pct(diff)
                        ),
                    ));
                }
            }
        }

        ValidationResult::passed(warnings)
    }
}

fn ohlc_violation(update: &PriceUpdate) -> Option<String> {
    let price = update.price;

    if let Some(high) = update.high {
        let floor = [update.open, update.low]
            .into_iter()
            .flatten()
            .fold(price, Decimal::max);
        if high < floor {
            return Some(format!("high={high} below {floor}"));
        }
    }

    if let Some(low) = update.low {
        let ceiling = [update.open, update.high]
            .into_iter()
            .flatten()
            .fold(price, Decimal::min);
        if low > ceiling {
            return Some(format!("low={low} above {ceiling}"));
        }
    }

    None
}

fn reject(reason: RejectReason, detail: String) -> Rejection {
    Rejection { reason, detail }
}

fn flag(kind: WarningKind, detail: String) -> Flag {
    Flag { kind, detail }
}

fn pct(fraction: Decimal) -> Decimal {
    fraction
        .checked_mul(dec!(100))
        .unwrap_or(Decimal::MAX)
        .round_dp(2)
}

/// `|price - reference| / reference`, or `None` when it does not fit a `Decimal`.
fn relative_difference(price: Decimal, reference: Decimal) -> Option<Decimal> {
    price.checked_sub(reference)?.abs().checked_div(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(ValidationRules::default())
    }

    fn update(price: Decimal, close: Option<Decimal>) -> PriceUpdate {
        PriceUpdate::new("AAPL", price, DataSource::Primary, Utc::now())
            .with_volume(dec!(10))
            .with_previous_close(close)
    }

    #[test]
    fn test_clean_update_is_accepted() {
        let result = validator().validate(&update(dec!(150.25), Some(dec!(150))), Utc::now());
        assert_eq!(result.verdict, Verdict::Accept);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_movement_from_tiny_close_trips_breaker() {
        let glitch = Decimal::new(1, 28);
        let result = validator().validate(&update(dec!(150), Some(glitch)), Utc::now());
        assert_eq!(
            result.rejection().map(|r| r.reason),
            Some(RejectReason::CircuitBreaker)
        );
    }

    #[test]
    fn test_cross_source_against_tiny_price_warns() {
        let now = Utc::now();
        let mut validator = validator();
        let tiny = PriceUpdate::new("AAPL", Decimal::new(1, 28), DataSource::Fallback, now);
        assert!(validator.validate(&tiny, now).is_forwardable());

        let result = validator.validate(&update(dec!(150), None), now);
        assert_eq!(result.verdict, Verdict::Warn);
        assert_eq!(result.warnings[0].kind, WarningKind::CrossSourceDiscrepancy);
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let result = validator().validate(&update(Decimal::ZERO, None), Utc::now());
        assert_eq!(result.verdict, Verdict::Reject);
        assert!(result.errors[0].to_string().contains("non-positive price"));
    }

    #[test]
    fn test_negative_volume_rejected() {
        let bad = update(dec!(10), None).with_volume(dec!(-1));
        let result = validator().validate(&bad, Utc::now());
        assert_eq!(
            result.rejection().map(|r| r.reason),
            Some(RejectReason::NegativeVolume)
        );
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let now = Utc::now();
        let mut future = update(dec!(10), None);
        future.timestamp = now + Duration::minutes(6);
        let result = validator().validate(&future, now);
        assert_eq!(
            result.rejection().map(|r| r.reason),
            Some(RejectReason::FutureTimestamp)
        );

        let mut within = update(dec!(10), None);
        within.timestamp = now + Duration::minutes(4);
        assert!(validator().validate(&within, now).is_forwardable());
    }

    #[test]
    fn test_stale_timestamp_warns() {
        let now = Utc::now();
        let mut stale = update(dec!(10), None);
        stale.timestamp = now - Duration::minutes(11);
        let result = validator().validate(&stale, now);
        assert_eq!(result.verdict, Verdict::Warn);
        assert_eq!(result.warnings[0].kind, WarningKind::StaleData);
    }

    #[test]
    fn test_circuit_breaker_at_25_percent() {
        let now = Utc::now();
        for price in [dec!(112.50), dec!(187.50)] {
            let result = validator().validate(&update(price, Some(dec!(150.00))), now);
            assert_eq!(result.verdict, Verdict::Reject);
            assert!(result.errors[0].to_string().contains("circuit breaker"));
        }
    }

    #[test]
    fn test_ten_percent_move_warns() {
        let result = validator().validate(&update(dec!(165.00), Some(dec!(150.00))), Utc::now());
        assert_eq!(result.verdict, Verdict::Warn);
        assert_eq!(result.warnings[0].kind, WarningKind::LargePriceMovement);
    }

    #[test]
    fn test_movement_boundaries() {
        let now = Utc::now();
        // Exactly 5% is still clean, exactly 20% is only a warning.
        let five = validator().validate(&update(dec!(105), Some(dec!(100))), now);
        assert_eq!(five.verdict, Verdict::Accept);
        let twenty = validator().validate(&update(dec!(120), Some(dec!(100))), now);
        assert_eq!(twenty.verdict, Verdict::Warn);
    }

    #[test]
    fn test_ohlc_inconsistency_rejected() {
        let bad = update(dec!(100), None).with_ohlc(Some(dec!(99)), Some(dec!(98)), Some(dec!(97)));
        let result = validator().validate(&bad, Utc::now());
        assert_eq!(
            result.rejection().map(|r| r.reason),
            Some(RejectReason::OhlcInconsistency)
        );

        let low_above = update(dec!(100), None).with_ohlc(None, None, Some(dec!(101)));
        assert!(!validator().validate(&low_above, Utc::now()).is_forwardable());

        let good = update(dec!(100), None).with_ohlc(Some(dec!(99)), Some(dec!(101)), Some(dec!(98)));
        assert!(validator().validate(&good, Utc::now()).is_forwardable());
    }

    #[test]
    fn test_inverted_bid_ask_rejected() {
        let inverted = update(dec!(150.50), None).with_quote(dec!(151.00), dec!(150.00));
        let result = validator().validate(&inverted, Utc::now());
        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.errors[0].reason, RejectReason::InvertedBidAsk);
    }

    #[test]
    fn test_wide_spread_warns() {
        let wide = update(dec!(100), None).with_quote(dec!(97), dec!(103));
        let result = validator().validate(&wide, Utc::now());
        assert_eq!(result.verdict, Verdict::Warn);
        assert_eq!(result.warnings[0].kind, WarningKind::WideSpread);
    }

    #[test]
    fn test_cross_source_discrepancy_warns_without_rejecting() {
        let now = Utc::now();
        let mut validator = validator();
        validator.validate(&update(dec!(100), None), now);

        let fallback = PriceUpdate::new("AAPL", dec!(110), DataSource::Fallback, now);
        let result = validator.validate(&fallback, now);
        assert_eq!(result.verdict, Verdict::Warn);
        assert_eq!(result.warnings[0].kind, WarningKind::CrossSourceDiscrepancy);
    }

    #[test]
    fn test_cross_source_check_ignores_old_reference() {
        let now = Utc::now();
        let mut validator = validator();
        validator.validate(&update(dec!(100), None), now - Duration::seconds(120));

        let fallback = PriceUpdate::new("AAPL", dec!(110), DataSource::Fallback, now);
        assert_eq!(validator.validate(&fallback, now).verdict, Verdict::Accept);
    }

    #[test]
    fn test_rejected_update_does_not_become_reference() {
        let now = Utc::now();
        let mut validator = validator();
        validator.validate(&update(Decimal::ZERO, None), now);

        let fallback = PriceUpdate::new("AAPL", dec!(110), DataSource::Fallback, now);
        assert_eq!(validator.validate(&fallback, now).verdict, Verdict::Accept);
    }

    #[test]
    fn test_warning_messages_render() {
        let result = validator().validate(&update(dec!(165.00), Some(dec!(150.00))), Utc::now());
        let messages = result.warning_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("large price movement"));
    }
}
