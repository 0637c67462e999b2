//! Unified price model.
//!
//! Every provider message, whatever its wire shape, ends up as a single
//! `PriceUpdate`. The raw side of the boundary is the `RawMessage` tagged
//! union that transport adapters produce after parsing their own formats.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────
// Source tagging
// ────────────────────────────────────────────

/// Quality score stamped on every primary update.
pub const PRIMARY_QUALITY: u8 = 100;

/// Quality score stamped on every fallback update.
pub const FALLBACK_QUALITY: u8 = 80;

/// Which provider an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    /// Push-based real-time stream.
    Primary,
    /// Poll-based REST provider.
    Fallback,
}

impl DataSource {
    /// Both sources, primary first.
    pub const ALL: [Self; 2] = [Self::Primary, Self::Fallback];

    /// Fixed quality score assigned at normalization time.
    pub const fn quality_score(self) -> u8 {
        match self {
            Self::Primary => PRIMARY_QUALITY,
            Self::Fallback => FALLBACK_QUALITY,
        }
    }

    /// The opposite source.
    pub const fn other(self) -> Self {
        match self {
            Self::Primary => Self::Fallback,
            Self::Fallback => Self::Primary,
        }
    }

    /// Lowercase label used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────
// Raw provider messages
// ────────────────────────────────────────────

/// Already-parsed provider message, one variant per message family.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// Single executed trade from the stream.
    Trade {
        symbol: String,
        price: Decimal,
        size: Decimal,
        timestamp: DateTime<Utc>,
        exchange: Option<String>,
    },
    /// Top-of-book quote; carries no trade price.
    Quote {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        timestamp: DateTime<Utc>,
    },
    /// Aggregated bar.
    Bar {
        symbol: String,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        trade_count: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    /// Snapshot returned by a REST poll.
    Poll {
        symbol: String,
        price: Decimal,
        prev_close: Option<Decimal>,
        open: Option<Decimal>,
        high: Option<Decimal>,
        low: Option<Decimal>,
        volume: Option<Decimal>,
        timestamp: DateTime<Utc>,
    },
}

impl RawMessage {
    /// Symbol as the provider sent it.
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade { symbol, .. }
            | Self::Quote { symbol, .. }
            | Self::Bar { symbol, .. }
            | Self::Poll { symbol, .. } => symbol,
        }
    }

    /// Provider-asserted observation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Trade { timestamp, .. }
            | Self::Quote { timestamp, .. }
            | Self::Bar { timestamp, .. }
            | Self::Poll { timestamp, .. } => *timestamp,
        }
    }

    /// Message family name.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Trade { .. } => "trade",
            Self::Quote { .. } => "quote",
            Self::Bar { .. } => "bar",
            Self::Poll { .. } => "poll",
        }
    }
}

// ────────────────────────────────────────────
// Canonical record
// ────────────────────────────────────────────

/// Canonical price record handed to the validator and the router.
///
/// `price_change` and `price_change_percent` are derived from `price` and
/// `previous_close` and can only be read, never set directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// Uppercased instrument symbol.
    pub symbol: String,
    /// Last price (trade, bar close, poll price or quote midpoint).
    pub price: Decimal,
    /// Reference close used for the change calculation.
    previous_close: Option<Decimal>,
    price_change: Decimal,
    price_change_percent: Decimal,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    /// Traded volume, zero for quotes.
    pub volume: Decimal,
    pub trade_count: Option<u64>,
    /// Provider-asserted time of observation.
    pub timestamp: DateTime<Utc>,
    pub source: DataSource,
    /// Confidence rating in `[0, 100]`.
    pub quality_score: u8,
    /// Validation warnings attached when forwarded with a Warn verdict.
    pub warnings: Vec<String>,
}

impl PriceUpdate {
    /// Create a bare update with no reference close.
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        source: DataSource,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            previous_close: None,
            price_change: Decimal::ZERO,
            price_change_percent: Decimal::ZERO,
            open: None,
            high: None,
            low: None,
            bid: None,
            ask: None,
            volume: Decimal::ZERO,
            trade_count: None,
            timestamp,
            source,
            quality_score: source.quality_score(),
            warnings: Vec::new(),
        }
    }

    /// Set the reference close and recompute the derived change fields.
    #[must_use]
    pub fn with_previous_close(mut self, previous_close: Option<Decimal>) -> Self {
        self.previous_close = previous_close;
        self.recompute_change();
        self
    }

    #[must_use]
    pub fn with_ohlc(
        mut self,
        open: Option<Decimal>,
        high: Option<Decimal>,
        low: Option<Decimal>,
    ) -> Self {
        self.open = open;
        self.high = high;
        self.low = low;
        self
    }

    #[must_use]
    pub fn with_quote(mut self, bid: Decimal, ask: Decimal) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = volume;
        self
    }

    #[must_use]
    pub fn with_trade_count(mut self, trade_count: Option<u64>) -> Self {
        self.trade_count = trade_count;
        self
    }

    pub const fn previous_close(&self) -> Option<Decimal> {
        self.previous_close
    }

    /// `price - previous_close`, zero when there is no reference close.
    pub const fn price_change(&self) -> Decimal {
        self.price_change
    }

    /// Change relative to the reference close, in percent.
    pub const fn price_change_percent(&self) -> Decimal {
        self.price_change_percent
    }

    /// `ask - bid` when both sides are present.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    fn recompute_change(&mut self) {
        match self.previous_close {
            Some(close) => {
                // Out-of-range results (e.g. a glitch close near zero) read as no change.
                self.price_change = self.price.checked_sub(close).unwrap_or(Decimal::ZERO);
                self.price_change_percent = if close > Decimal::ZERO {
                    self.price_change
                        .checked_div(close)
                        .and_then(|ratio| ratio.checked_mul(dec!(100)))
                        .unwrap_or(Decimal::ZERO)
                } else {
                    Decimal::ZERO
                };
            }
            None => {
                self.price_change = Decimal::ZERO;
                self.price_change_percent = Decimal::ZERO;
            }
        }
    }
}
