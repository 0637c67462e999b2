//! Normalizer - provider messages to `PriceUpdate`.
//!
//! Keeps a per-symbol last-known price that stands in for the previous
//! close whenever the provider does not supply one. The cache is updated
//! after every successful normalization regardless of source, so two calls
//! with the same raw message only agree if nothing else for that symbol
//! was normalized in between.

use std::collections::HashMap;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::trace;

use super::price::{DataSource, PriceUpdate, RawMessage};

/// Reasons a raw message cannot be turned into an update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{kind} message has an empty symbol")]
    EmptySymbol { kind: &'static str },
}

/// Stateful mapper from `RawMessage` to `PriceUpdate`.
#[derive(Debug, Default)]
pub struct Normalizer {
    /// Symbol → last normalized price.
    previous_close: HashMap<String, Decimal>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one raw message and advance the previous-close cache.
    ///
    /// # Errors
    /// Returns `NormalizeError::EmptySymbol` for blank symbols; the cache is
    /// left untouched in that case.
    pub fn normalize(
        &mut self,
        source: DataSource,
        raw: RawMessage,
    ) -> Result<PriceUpdate, NormalizeError> {
        let kind = raw.kind();
        let symbol = canonical_symbol(raw.symbol());
        if symbol.is_empty() {
            return Err(NormalizeError::EmptySymbol { kind });
        }

        let cached = self.previous_close.get(&symbol).copied();

        let update = match raw {
            RawMessage::Trade {
                price,
                size,
                timestamp,
                exchange,
                ..
            } => {
                trace!(symbol = %symbol, exchange = ?exchange, "Normalizing trade");
                PriceUpdate::new(symbol.clone(), price, source, timestamp)
                    .with_volume(size)
                    .with_previous_close(cached)
            }
            RawMessage::Quote {
                bid,
                ask,
                timestamp,
                ..
            } => {
                let mid = (bid + ask) / Decimal::TWO;
                PriceUpdate::new(symbol.clone(), mid, source, timestamp)
                    .with_quote(bid, ask)
                    .with_previous_close(cached)
            }
            RawMessage::Bar {
                open,
                high,
                low,
                close,
                volume,
                trade_count,
                timestamp,
                ..
            } => PriceUpdate::new(symbol.clone(), close, source, timestamp)
                .with_ohlc(Some(open), Some(high), Some(low))
                .with_volume(volume)
                .with_trade_count(trade_count)
                .with_previous_close(cached),
            RawMessage::Poll {
                price,
                prev_close,
                open,
                high,
                low,
                volume,
                timestamp,
                ..
            } => {
                // A provider-supplied close wins over the cache.
                let reference = prev_close.filter(|c| *c > Decimal::ZERO).or(cached);
                PriceUpdate::new(symbol.clone(), price, source, timestamp)
                    .with_ohlc(open, high, low)
                    .with_volume(volume.unwrap_or(Decimal::ZERO))
                    .with_previous_close(reference)
            }
        };

        self.previous_close.insert(symbol, update.price);
        Ok(update)
    }

    /// Last normalized price for a symbol.
    pub fn previous_close(&self, symbol: &str) -> Option<Decimal> {
        self.previous_close.get(&canonical_symbol(symbol)).copied()
    }

    /// Seed the cache, e.g. from an end-of-day close loaded at startup.
    pub fn seed_previous_close(&mut self, symbol: &str, close: Decimal) {
        self.previous_close.insert(canonical_symbol(symbol), close);
    }
}

fn canonical_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}
