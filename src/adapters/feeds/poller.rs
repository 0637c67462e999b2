//! REST Polling Feed - Fallback Price Source
//!
//! Polls a chart endpoint per symbol and reads the snapshot in the
//! response's `meta` block. Requests are paced by a `governor` rate
//! limiter shared across symbols. A cycle with at least one good symbol
//! counts as connected; a cycle where every request fails reports Error.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::config::PollFeedConfig;
use crate::domain::price::{DataSource, RawMessage};
use crate::ports::price_source::PriceSource;
use crate::usecases::ingest::SourceHandle;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartData,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    symbol: String,
    #[serde(default)]
    regular_market_price: Option<Decimal>,
    #[serde(default)]
    chart_previous_close: Option<Decimal>,
    #[serde(default)]
    previous_close: Option<Decimal>,
    #[serde(default)]
    regular_market_open: Option<Decimal>,
    #[serde(default)]
    regular_market_day_high: Option<Decimal>,
    #[serde(default)]
    regular_market_day_low: Option<Decimal>,
    #[serde(default)]
    regular_market_volume: Option<Decimal>,
    /// Unix seconds.
    #[serde(default)]
    regular_market_time: Option<i64>,
}

/// Turn a chart response body into a poll message.
pub(crate) fn parse_chart(body: &str) -> Result<RawMessage> {
    let response: ChartResponse =
        serde_json::from_str(body).context("Failed to parse chart response")?;

    if let Some(error) = response.chart.error {
        anyhow::bail!("Chart API error {}: {}", error.code, error.description);
    }

    let meta = response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .map(|result| result.meta)
        .context("No chart result in response")?;

    let price = meta
        .regular_market_price
        .with_context(|| format!("No market price for {}", meta.symbol))?;

    let timestamp = meta
        .regular_market_time
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(RawMessage::Poll {
        symbol: meta.symbol,
        price,
        prev_close: meta.chart_previous_close.or(meta.previous_close),
        open: meta.regular_market_open,
        high: meta.regular_market_day_high,
        low: meta.regular_market_day_low,
        volume: meta.regular_market_volume,
        timestamp,
    })
}

/// Poll-based fallback feed.
pub struct PollFeed {
    client: reqwest::Client,
    config: PollFeedConfig,
    symbols: Vec<String>,
    limiter: DirectRateLimiter,
}

impl PollFeed {
    /// Build the HTTP client and rate limiter.
    ///
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(config: PollFeedConfig, symbols: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("price-feed-router/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(rps));

        Ok(Self {
            client,
            config,
            symbols,
            limiter,
        })
    }

    async fn poll_symbol(&self, symbol: &str) -> Result<RawMessage> {
        self.limiter.until_ready().await;

        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), symbol);
        let response = self
            .client
            .get(&url)
            .query(&[("interval", "1m"), ("range", "1d")])
            .send()
            .await
            .with_context(|| format!("Chart request failed for {symbol}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read chart body for {symbol}"))?;
        anyhow::ensure!(status.is_success(), "HTTP {status} for {symbol}");

        parse_chart(&body)
    }

    /// Poll every symbol once. Returns how many succeeded and the last error.
    async fn poll_cycle(&self, handle: &SourceHandle) -> (usize, Option<anyhow::Error>) {
        let mut ok = 0;
        let mut last_error = None;

        for symbol in &self.symbols {
            match self.poll_symbol(symbol).await {
                Ok(raw) => {
                    handle.push(raw);
                    ok += 1;
                }
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "Poll failed");
                    last_error = Some(e);
                }
            }
        }
        (ok, last_error)
    }
}

#[async_trait]
impl PriceSource for PollFeed {
    fn name(&self) -> &'static str {
        "poller"
    }

    fn source(&self) -> DataSource {
        DataSource::Fallback
    }

    #[instrument(skip(self, handle, shutdown_rx), fields(feed = "poller"))]
    async fn run(
        &self,
        handle: SourceHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut healthy = false;

        info!(
            symbols = self.symbols.len(),
            interval_ms = self.config.interval_ms,
            "Polling feed started"
        );

        loop {
            let (ok, last_error) = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Polling feed shut down gracefully");
                    return Ok(());
                }
                outcome = self.poll_cycle(&handle) => outcome,
            };

            if ok > 0 {
                if !healthy {
                    info!(ok, "Polling feed producing");
                    handle.connected();
                    healthy = true;
                }
                if let Some(e) = last_error {
                    debug!(error = %e, "Some symbols failed this cycle");
                }
            } else {
                let detail = last_error
                    .map_or_else(|| "no symbols polled".to_string(), |e| format!("{e:#}"));
                warn!(error = %detail, "Polling cycle failed");
                handle.error(detail);
                healthy = false;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Polling feed shut down gracefully");
                    return Ok(());
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}
