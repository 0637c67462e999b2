//! Streaming WebSocket Feed - Primary Price Source
//!
//! Speaks a trade/quote/bar JSON stream where every frame is an array of
//! objects tagged by `"T"` (`t` trade, `q` quote, `b` bar, plus `success`,
//! `subscription` and `error` control messages). Authenticates when
//! credentials are configured, subscribes to the configured symbols and
//! pushes parsed messages into the router's primary queue.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::config::StreamFeedConfig;
use crate::domain::price::{DataSource, RawMessage};
use crate::ports::price_source::PriceSource;
use crate::usecases::ingest::SourceHandle;

/// One element of a stream frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "T")]
enum WireMessage {
    #[serde(rename = "t")]
    Trade {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "p")]
        price: Decimal,
        #[serde(rename = "s")]
        size: Decimal,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
        #[serde(rename = "x", default)]
        exchange: Option<String>,
    },
    #[serde(rename = "q")]
    Quote {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "bp")]
        bid: Decimal,
        #[serde(rename = "ap")]
        ask: Decimal,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "b")]
    Bar {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "o")]
        open: Decimal,
        #[serde(rename = "h")]
        high: Decimal,
        #[serde(rename = "l")]
        low: Decimal,
        #[serde(rename = "c")]
        close: Decimal,
        #[serde(rename = "v")]
        volume: Decimal,
        #[serde(rename = "n", default)]
        trade_count: Option<u64>,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "success")]
    Success { msg: String },
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "error")]
    Error { code: i64, msg: String },
    #[serde(other)]
    Unknown,
}

/// Parsed content of a frame element.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamEvent {
    Data(RawMessage),
    Success(String),
    Subscribed,
    Error { code: i64, msg: String },
}

/// Parse a text frame. Elements that fail to parse are skipped.
pub(crate) fn parse_frame(text: &str) -> Result<Vec<StreamEvent>> {
    let elements: Vec<serde_json::Value> =
        serde_json::from_str(text).context("Stream frame is not a JSON array")?;

    let mut events = Vec::with_capacity(elements.len());
    for element in elements {
        let wire = match serde_json::from_value::<WireMessage>(element) {
            Ok(wire) => wire,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable stream element");
                continue;
            }
        };
        let event = match wire {
            WireMessage::Trade {
                symbol,
                price,
                size,
                timestamp,
                exchange,
            } => StreamEvent::Data(RawMessage::Trade {
                symbol,
                price,
                size,
                timestamp,
                exchange,
            }),
            WireMessage::Quote {
                symbol,
                bid,
                ask,
                timestamp,
            } => StreamEvent::Data(RawMessage::Quote {
                symbol,
                bid,
                ask,
                timestamp,
            }),
            WireMessage::Bar {
                symbol,
                open,
                high,
                low,
                close,
                volume,
                trade_count,
                timestamp,
            } => StreamEvent::Data(RawMessage::Bar {
                symbol,
                open,
                high,
                low,
                close,
                volume,
                trade_count,
                timestamp,
            }),
            WireMessage::Success { msg } => StreamEvent::Success(msg),
            WireMessage::Subscription => StreamEvent::Subscribed,
            WireMessage::Error { code, msg } => StreamEvent::Error { code, msg },
            WireMessage::Unknown => continue,
        };
        events.push(event);
    }
    Ok(events)
}

/// Real-time primary feed over WebSocket.
pub struct StreamFeed {
    config: StreamFeedConfig,
    symbols: Vec<String>,
}

impl StreamFeed {
    pub fn new(config: StreamFeedConfig, symbols: Vec<String>) -> Self {
        Self { config, symbols }
    }

    /// Key and secret from the configured environment variables.
    fn credentials(&self) -> Option<(String, String)> {
        let key = std::env::var(self.config.key_env.as_deref()?).ok()?;
        let secret = std::env::var(self.config.secret_env.as_deref()?).ok()?;
        Some((key, secret))
    }

    fn subscribe_frame(&self) -> String {
        let quotes: &[String] = if self.config.quotes { &self.symbols } else { &[] };
        let bars: &[String] = if self.config.bars { &self.symbols } else { &[] };
        json!({
            "action": "subscribe",
            "trades": self.symbols,
            "quotes": quotes,
            "bars": bars,
        })
        .to_string()
    }

    /// Single connection session: connect, authenticate, subscribe, stream.
    async fn connect_and_stream(
        &self,
        handle: &SourceHandle,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .context("Stream WebSocket connection failed")?;

        let (mut write, mut read) = ws_stream.split();
        info!(url = %self.config.url, "Stream WebSocket connected");

        let credentials = self.credentials();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received in stream feed");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            // Pong is handled automatically by tungstenite
                            debug!(len = data.len(), "Stream ping received");
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("Stream closed by server: {frame:?}");
                        }
                        Some(Err(e)) => {
                            anyhow::bail!("WebSocket error: {e}");
                        }
                        None => {
                            anyhow::bail!("WebSocket stream ended");
                        }
                        Some(Ok(_)) => continue,
                    };

                    let events = match parse_frame(&text) {
                        Ok(events) => events,
                        Err(e) => {
                            debug!(error = %e, "Failed to parse stream frame");
                            continue;
                        }
                    };

                    for event in events {
                        match event {
                            StreamEvent::Data(raw) => handle.push(raw),
                            StreamEvent::Success(msg) if msg == "connected" => {
                                let frame = match &credentials {
                                    Some((key, secret)) => json!({
                                        "action": "auth",
                                        "key": key,
                                        "secret": secret,
                                    })
                                    .to_string(),
                                    None => self.subscribe_frame(),
                                };
                                write
                                    .send(Message::Text(frame))
                                    .await
                                    .context("Failed to send handshake frame")?;
                            }
                            StreamEvent::Success(msg) if msg == "authenticated" => {
                                write
                                    .send(Message::Text(self.subscribe_frame()))
                                    .await
                                    .context("Failed to send subscribe")?;
                            }
                            StreamEvent::Success(msg) => {
                                debug!(msg = %msg, "Stream control message");
                            }
                            StreamEvent::Subscribed => {
                                info!(symbols = self.symbols.len(), "Stream subscription confirmed");
                                handle.connected();
                            }
                            StreamEvent::Error { code, msg } => {
                                handle.error(format!("stream error {code}: {msg}"));
                                anyhow::bail!("Stream error {code}: {msg}");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PriceSource for StreamFeed {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn source(&self) -> DataSource {
        DataSource::Primary
    }

    /// Run the WebSocket connection loop, reconnecting after a fixed delay.
    #[instrument(skip(self, handle, shutdown_rx), fields(feed = "stream"))]
    async fn run(
        &self,
        handle: SourceHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        info!(url = %self.config.url, "Connecting to stream WebSocket");

        loop {
            match self.connect_and_stream(&handle, &mut shutdown_rx).await {
                Ok(()) => {
                    info!("Stream feed shut down gracefully");
                    return Ok(());
                }
                Err(e) => {
                    handle.disconnected(e.to_string());
                    warn!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay_ms,
                        "Stream WebSocket disconnected, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_parse_trade_quote_bar_frame() {
        let frame = r#"[
            {"T":"t","S":"AAPL","i":96921,"x":"D","p":150.25,"s":100,"t":"2024-03-01T15:30:00.123Z","c":["@"],"z":"C"},
            {"T":"q","S":"AAPL","bx":"U","bp":150.20,"bs":1,"ax":"Q","ap":150.30,"as":4,"t":"2024-03-01T15:30:00.200Z"},
            {"T":"b","S":"SPY","o":400.1,"h":401.0,"l":399.9,"c":400.5,"v":12000,"n":321,"t":"2024-03-01T15:30:00Z"}
        ]"#;
        let events = parse_frame(frame).unwrap();
        assert_eq!(events.len(), 3);

        match &events[0] {
            StreamEvent::Data(RawMessage::Trade {
                symbol,
                price,
                size,
                exchange,
                ..
            }) => {
                assert_eq!(symbol, "AAPL");
                assert_eq!(*price, dec!(150.25));
                assert_eq!(*size, dec!(100));
                assert_eq!(exchange.as_deref(), Some("D"));
            }
            other => panic!("expected trade, got {other:?}"),
        }
        assert!(matches!(
            &events[1],
            StreamEvent::Data(RawMessage::Quote { bid, ask, .. }) if *bid == dec!(150.20) && *ask == dec!(150.30)
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::Data(RawMessage::Bar { trade_count: Some(321), .. })
        ));
    }

    #[test]
    fn test_parse_control_messages() {
        let events = parse_frame(
            r#"[{"T":"success","msg":"connected"},{"T":"subscription","trades":["AAPL"]},{"T":"error","code":402,"msg":"auth failed"}]"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Success("connected".to_string()),
                StreamEvent::Subscribed,
                StreamEvent::Error {
                    code: 402,
                    msg: "auth failed".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_bad_elements_are_skipped() {
        let events = parse_frame(r#"[{"T":"t","S":"AAPL"},{"T":"lulu","S":"X"},{"T":"success","msg":"ok"}]"#)
            .unwrap();
        assert_eq!(events, vec![StreamEvent::Success("ok".to_string())]);
    }

    #[test]
    fn test_non_array_frame_is_error() {
        assert!(parse_frame(r#"{"T":"t"}"#).is_err());
    }

    #[test]
    fn test_subscribe_frame_lists_symbols() {
        let feed = StreamFeed::new(
            StreamFeedConfig {
                bars: false,
                ..StreamFeedConfig::default()
            },
            vec!["AAPL".to_string()],
        );
        let frame: serde_json::Value = serde_json::from_str(&feed.subscribe_frame()).unwrap();
        assert_eq!(frame["action"], "subscribe");
        assert_eq!(frame["trades"][0], "AAPL");
        assert_eq!(frame["quotes"][0], "AAPL");
        assert!(frame["bars"].as_array().unwrap().is_empty());
    }
}
