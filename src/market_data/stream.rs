// =============================================================================
// Streaming feed client — WebSocket market data
// =============================================================================
//
// Connects to the upstream feed, subscribes to bars and quotes for the
// configured symbols, and forwards parsed events to the Live Data Router
// over an mpsc channel.
//
// Runs until the stream disconnects or an error occurs, then returns so
// that the caller (main.rs) can handle reconnection:
//
// ```ignore
// loop {
//     if let Err(e) = run_market_stream(&url, &symbols, &tx).await {
//         error!(error = %e, "market stream error -- reconnecting in 5s");
//     }
//     let _ = tx.send(StreamEvent::Disconnected);
//     tokio::time::sleep(Duration::from_secs(5)).await;
// }
// ```
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::{Bar, BarKey, QuoteTick, TradeTick};
use crate::types::TradeSide;

/// Parsed event from the streaming feed.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Bar {
        key: BarKey,
        bar: Bar,
        closed: bool,
    },
    Quote(QuoteTick),
    Trade(TradeTick),
    SubscriptionFailed {
        symbol: String,
        reason: String,
    },
    Disconnected,
}

/// Parse a single feed frame.
///
/// Expected shapes:
/// ```json
/// { "type": "bar", "symbol": "MES", "tf": "1m", "ts": 1700000000000,
///   "o": "5000.25", "h": "5001.00", "l": "4999.75", "c": "5000.50",
///   "v": 123, "closed": true }
/// { "type": "quote", "symbol": "MES", "ts_ns": 1700000000000000000,
///   "seq": 42, "bid": "4999.75", "bid_size": 5, "ask": "5000.00",
///   "ask_size": 3 }
/// { "type": "trade", "symbol": "MES", "ts_ns": ..., "seq": 43,
///   "price": "5000.00", "size": 2, "side": "BUY" }
/// { "type": "error", "symbol": "MES", "reason": "unknown symbol" }
/// ```
pub fn parse_stream_message(text: &str) -> Result<Option<StreamEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    let kind = root["type"].as_str().context("missing field type")?;

    match kind {
        "bar" => {
            let symbol = root["symbol"]
                .as_str()
                .context("missing field symbol")?
                .to_uppercase();
            let tf = root["tf"].as_str().unwrap_or("1m").to_string();
            let ts = root["ts"].as_i64().context("missing field ts")?;
            let bar = Bar {
                ts_event: ts,
                open: parse_number(&root["o"], "o")?,
                high: parse_number(&root["h"], "h")?,
                low: parse_number(&root["l"], "l")?,
                close: parse_number(&root["c"], "c")?,
                volume: root["v"].as_u64().unwrap_or(0),
            };
            let closed = root["closed"].as_bool().unwrap_or(false);
            Ok(Some(StreamEvent::Bar {
                key: BarKey::new(symbol, tf),
                bar,
                closed,
            }))
        }
        "quote" => {
            let symbol = root["symbol"]
                .as_str()
                .context("missing field symbol")?
                .to_uppercase();
            Ok(Some(StreamEvent::Quote(QuoteTick {
                symbol,
                ts_ns: root["ts_ns"].as_i64().context("missing field ts_ns")?,
                seq: root["seq"].as_u64(),
                bid: parse_number(&root["bid"], "bid")?,
                bid_size: root["bid_size"].as_u64().unwrap_or(0),
                ask: parse_number(&root["ask"], "ask")?,
                ask_size: root["ask_size"].as_u64().unwrap_or(0),
            })))
        }
        "trade" => {
            let symbol = root["symbol"]
                .as_str()
                .context("missing field symbol")?
                .to_uppercase();
            Ok(Some(StreamEvent::Trade(TradeTick {
                symbol,
                ts_ns: root["ts_ns"].as_i64().context("missing field ts_ns")?,
                seq: root["seq"].as_u64(),
                price: parse_number(&root["price"], "price")?,
                size: root["size"].as_u64().unwrap_or(0),
                side: root["side"].as_str().and_then(TradeSide::parse),
            })))
        }
        "error" => {
            let symbol = root["symbol"].as_str().unwrap_or("").to_uppercase();
            let reason = root["reason"].as_str().unwrap_or("unknown").to_string();
            Ok(Some(StreamEvent::SubscriptionFailed { symbol, reason }))
        }
        // Heartbeats and acks carry no payload.
        "ping" | "ack" | "subscribed" => Ok(None),
        other => {
            debug!(kind = other, "ignoring unknown stream message type");
            Ok(None)
        }
    }
}

/// Feed numeric fields arrive as JSON strings or numbers.
fn parse_number(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Build the subscribe frame covering all symbols' 1m bars and quotes.
fn build_subscribe_frame(symbols: &[String]) -> String {
    json!({
        "op": "subscribe",
        "bars": symbols.iter().map(|s| format!("{s}:1m")).collect::<Vec<_>>(),
        "quotes": symbols,
    })
    .to_string()
}

/// Connect to the streaming feed, subscribe, and forward parsed events into
/// `tx` until the connection drops.
pub async fn run_market_stream(
    url: &str,
    symbols: &[String],
    tx: &UnboundedSender<StreamEvent>,
) -> Result<()> {
    info!(url = %url, symbols = ?symbols, "connecting to market stream");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to market stream")?;

    info!("market stream connected");
    let (mut write, mut read) = ws_stream.split();

    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            build_subscribe_frame(symbols),
        ))
        .await
        .context("failed to send subscribe frame")?;

    let _ = tx.send(StreamEvent::Connected);

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_stream_message(&text) {
                        Ok(Some(event)) => {
                            if tx.send(event).is_err() {
                                // Router dropped its receiver: shutting down.
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "failed to parse stream message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames: tungstenite answers pings
                // automatically.
            }
            Some(Err(e)) => {
                warn!(error = %e, "market stream read error");
                return Err(e.into());
            }
            None => {
                warn!("market stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bar_message() {
        let json = r#"{
            "type": "bar", "symbol": "mes", "tf": "1m", "ts": 1700000000000,
            "o": "5000.25", "h": "5001.00", "l": "4999.75", "c": 5000.5,
            "v": 123, "closed": true
        }"#;
        let event = parse_stream_message(json).unwrap().unwrap();
        match event {
            StreamEvent::Bar { key, bar, closed } => {
                assert_eq!(key.symbol, "MES");
                assert_eq!(key.timeframe, "1m");
                assert_eq!(bar.ts_event, 1_700_000_000_000);
                assert!((bar.open - 5000.25).abs() < 1e-12);
                assert!((bar.close - 5000.5).abs() < 1e-12);
                assert_eq!(bar.volume, 123);
                assert!(closed);
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn parse_quote_message() {
        let json = r#"{
            "type": "quote", "symbol": "MNQ", "ts_ns": 1700000000000000000,
            "seq": 42, "bid": "17950.25", "bid_size": 5,
            "ask": "17950.50", "ask_size": 3
        }"#;
        let event = parse_stream_message(json).unwrap().unwrap();
        match event {
            StreamEvent::Quote(q) => {
                assert_eq!(q.symbol, "MNQ");
                assert_eq!(q.seq, Some(42));
                assert!((q.bid - 17950.25).abs() < 1e-12);
                assert_eq!(q.ask_size, 3);
            }
            other => panic!("expected quote, got {other:?}"),
        }
    }

    #[test]
    fn parse_trade_with_side() {
        let json = r#"{
            "type": "trade", "symbol": "MES", "ts_ns": 1, "seq": 7,
            "price": "5000.00", "size": 2, "side": "SELL"
        }"#;
        let event = parse_stream_message(json).unwrap().unwrap();
        match event {
            StreamEvent::Trade(t) => {
                assert_eq!(t.side, Some(TradeSide::Sell));
                assert_eq!(t.size, 2);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_message() {
        let json = r#"{ "type": "error", "symbol": "XXX", "reason": "unknown symbol" }"#;
        let event = parse_stream_message(json).unwrap().unwrap();
        match event {
            StreamEvent::SubscriptionFailed { symbol, reason } => {
                assert_eq!(symbol, "XXX");
                assert_eq!(reason, "unknown symbol");
            }
            other => panic!("expected subscription failure, got {other:?}"),
        }
    }

    #[test]
    fn heartbeats_are_ignored() {
        assert!(parse_stream_message(r#"{ "type": "ping" }"#)
            .unwrap()
            .is_none());
        assert!(parse_stream_message(r#"{ "type": "subscribed" }"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_stream_message("not json").is_err());
        assert!(parse_stream_message(r#"{ "no_type": 1 }"#).is_err());
    }

    #[test]
    fn subscribe_frame_lists_all_keys() {
        let frame = build_subscribe_frame(&["MES".to_string(), "MNQ".to_string()]);
        assert!(frame.contains("MES:1m"));
        assert!(frame.contains("MNQ:1m"));
        assert!(frame.contains("subscribe"));
    }
}
