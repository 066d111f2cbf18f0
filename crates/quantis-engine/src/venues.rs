//! Concrete venue wire-format parsers, plugged into [`crate::tick::
//! WebSocketVenueFeed`] as its `parse` function pointer. Grounded on
//! `market_data.rs`'s Binance `Deserialize` structs — adapted from klines to
//! the best bid/ask ticker stream, since the pipeline needs quote updates
//! rather than closed candles.

use chrono::Utc;
use quantis_core::Instrument;
use serde::Deserialize;

use crate::tick::Tick;

/// Binance `<symbol>@bookTicker` stream payload.
#[derive(Debug, Deserialize)]
struct BinanceBookTicker {
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "B")]
    bid_size: String,
    #[serde(rename = "a")]
    ask: String,
    #[serde(rename = "A")]
    ask_size: String,
}

/// Parse a raw Binance `bookTicker` WebSocket message into a [`Tick`].
/// Returns `None` for malformed messages (dropped silently; the venue feed
/// keeps its connection and the gap shows up as a missed-tick interval).
pub fn parse_binance_book_ticker(text: &str, instrument: &Instrument, exchange: &str) -> Option<Tick> {
    let payload: BinanceBookTicker = serde_json::from_str(text).ok()?;
    let bid: f64 = payload.bid.parse().ok()?;
    let ask: f64 = payload.ask.parse().ok()?;
    let bid_size: f64 = payload.bid_size.parse().ok()?;
    let ask_size: f64 = payload.ask_size.parse().ok()?;
    if bid <= 0.0 || ask <= 0.0 || ask < bid {
        return None;
    }
    let now = Utc::now();
    Some(Tick {
        instrument: instrument.clone(),
        exchange: exchange.to_string(),
        monotonic_ingest_time: now,
        exchange_time: now,
        mid_price: (bid + ask) / 2.0,
        bid,
        ask,
        bid_size,
        ask_size,
        last_trade_price: (bid + ask) / 2.0,
        last_trade_size: 0.0,
        funding_rate: None,
        suspect: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_book_ticker() {
        let instrument = Instrument::from("BTC-USDT");
        let text = r#"{"b":"49999.50","B":"1.2","a":"50000.50","A":"0.8"}"#;
        let tick = parse_binance_book_ticker(text, &instrument, "binance").unwrap();
        assert_eq!(tick.bid, 49_999.50);
        assert_eq!(tick.ask, 50_000.50);
        assert_eq!(tick.mid_price, 50_000.0);
    }

    #[test]
    fn rejects_crossed_book() {
        let instrument = Instrument::from("BTC-USDT");
        let text = r#"{"b":"50001.0","B":"1.0","a":"50000.0","A":"1.0"}"#;
        assert!(parse_binance_book_ticker(text, &instrument, "binance").is_none());
    }

    #[test]
    fn rejects_malformed_json() {
        let instrument = Instrument::from("BTC-USDT");
        assert!(parse_binance_book_ticker("not json", &instrument, "binance").is_none());
    }
}
