// =============================================================================
// Live Bar Feed — WebSocket stream of closed one-minute bars
// =============================================================================
//
// Connects to the configured feed URL and forwards each parsed bar into the
// engine's bar channel tagged LIVE. Runs until the stream disconnects or an
// error occurs, then returns so the caller (main.rs) can handle reconnection.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::Bar;
use crate::types::BarSource;

/// A bar as delivered by a feed, before instrument canonicalization.
#[derive(Debug, Clone)]
pub struct FeedBar {
    pub raw_instrument: String,
    pub bar: Bar,
}

/// Parse a single feed message.
///
/// Expected shape:
/// ```json
/// { "instrument": "MES", "open_time_utc": "2024-06-11T12:30:00Z",
///   "open": 4497.0, "high": 4500.0, "low": 4496.5, "close": 4498.0,
///   "volume": 1250 }
/// ```
fn parse_feed_message(text: &str) -> Result<FeedBar> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    let raw_instrument = root["instrument"]
        .as_str()
        .context("missing field instrument")?
        .to_uppercase();

    let ts = root["open_time_utc"]
        .as_str()
        .context("missing field open_time_utc")?;
    let open_time_utc = DateTime::parse_from_rfc3339(ts)
        .with_context(|| format!("invalid open_time_utc {ts:?}"))?
        .with_timezone(&Utc);

    let field_f64 = |name: &str| -> Result<f64> {
        root[name]
            .as_f64()
            .with_context(|| format!("missing or non-numeric field {name}"))
    };

    let bar = Bar {
        open_time_utc,
        open: field_f64("open")?,
        high: field_f64("high")?,
        low: field_f64("low")?,
        close: field_f64("close")?,
        volume: root["volume"].as_u64().context("missing field volume")?,
        source: BarSource::Live,
    };

    Ok(FeedBar {
        raw_instrument,
        bar,
    })
}

/// Connect to the live bar feed and forward parsed bars into `tx`.
///
/// Returns when the connection drops (Ok) or errors (Err); the caller owns
/// the reconnect-with-backoff loop.
pub async fn run_bar_stream(url: &str, tx: &mpsc::Sender<FeedBar>) -> Result<()> {
    info!(url = %url, "connecting to bar feed WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to bar feed WebSocket")?;

    info!(url = %url, "bar feed WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_feed_message(&text) {
                        Ok(feed_bar) => {
                            debug!(
                                instrument = %feed_bar.raw_instrument,
                                open_time = %feed_bar.bar.open_time_utc,
                                close = feed_bar.bar.close,
                                "live bar received"
                            );
                            if tx.send(feed_bar).await.is_err() {
                                warn!("bar channel closed — stopping feed reader");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse feed message");
                        }
                    }
                }
                // Ping / Pong / Binary / Close frames are handled by
                // tungstenite; nothing to do here.
            }
            Some(Err(e)) => {
                error!(error = %e, "bar feed WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("bar feed WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_feed_message_ok() {
        let json = r#"{
            "instrument": "mes",
            "open_time_utc": "2024-06-11T12:30:00Z",
            "open": 4497.0,
            "high": 4500.0,
            "low": 4496.5,
            "close": 4498.0,
            "volume": 1250
        }"#;
        let fb = parse_feed_message(json).expect("should parse");
        assert_eq!(fb.raw_instrument, "MES");
        assert_eq!(
            fb.bar.open_time_utc,
            Utc.with_ymd_and_hms(2024, 6, 11, 12, 30, 0).unwrap()
        );
        assert!((fb.bar.close - 4498.0).abs() < f64::EPSILON);
        assert_eq!(fb.bar.source, BarSource::Live);
    }

    #[test]
    fn parse_feed_message_missing_field() {
        let json = r#"{ "instrument": "MES", "open": 4497.0 }"#;
        assert!(parse_feed_message(json).is_err());
    }

    #[test]
    fn parse_feed_message_bad_timestamp() {
        let json = r#"{
            "instrument": "MES",
            "open_time_utc": "yesterday",
            "open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0, "volume": 1
        }"#;
        assert!(parse_feed_message(json).is_err());
    }
}
