//! Offline replay: reads a captured newline-delimited JSON tick log and
//! feeds it through the pipeline for evaluation without touching a live
//! venue. Loosely grounded on the teacher's historical-kline REST fetch —
//! here the "historical source" is a local file instead of an exchange API.

use quantis_core::{Instrument, QuantisError};

use crate::tick::{ReplayFeed, Tick};

/// Parse a newline-delimited JSON tick log into a [`ReplayFeed`] for the
/// given venue name. Blank lines are skipped; a malformed line is a hard
/// error — replay logs are expected to be exactly what the engine itself
/// wrote out (e.g. captured from a prior `run`), not hand-edited.
pub fn load_replay_feed(venue_name: &str, path: &str) -> Result<ReplayFeed, QuantisError> {
    let content = std::fs::read_to_string(path).map_err(QuantisError::Io)?;
    let mut ticks = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tick: Tick = serde_json::from_str(line)?;
        ticks.push(tick);
    }
    Ok(ReplayFeed {
        name: venue_name.to_string(),
        ticks,
    })
}

/// Split a combined replay log by instrument, for logs that interleave
/// multiple instruments' ticks.
pub fn split_by_instrument(feed: ReplayFeed) -> Vec<(Instrument, ReplayFeed)> {
    use std::collections::HashMap;
    let mut by_instrument: HashMap<Instrument, Vec<Tick>> = HashMap::new();
    for tick in feed.ticks {
        by_instrument
            .entry(tick.instrument.clone())
            .or_default()
            .push(tick);
    }
    by_instrument
        .into_iter()
        .map(|(instrument, ticks)| {
            (
                instrument,
                ReplayFeed {
                    name: feed.name.clone(),
                    ticks,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    fn sample_tick(instrument: &str) -> Tick {
        Tick {
            instrument: Instrument::from(instrument),
            exchange: "binance".into(),
            monotonic_ingest_time: Utc::now(),
            exchange_time: Utc::now(),
            mid_price: 50_000.0,
            bid: 49_999.5,
            ask: 50_000.5,
            bid_size: 10.0,
            ask_size: 10.0,
            last_trade_price: 50_000.0,
            last_trade_size: 1.0,
            funding_rate: None,
            suspect: false,
        }
    }

    #[test]
    fn loads_ndjson_tick_log() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("quantis-replay-test-{}.ndjson", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        for _ in 0..3 {
            writeln!(file, "{}", serde_json::to_string(&sample_tick("BTC-USDT")).unwrap()).unwrap();
        }

        let feed = load_replay_feed("binance", path.to_str().unwrap()).unwrap();
        assert_eq!(feed.ticks.len(), 3);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn splits_interleaved_log_by_instrument() {
        let feed = ReplayFeed {
            name: "binance".into(),
            ticks: vec![sample_tick("BTC-USDT"), sample_tick("ETH-USDT"), sample_tick("BTC-USDT")],
        };
        let split = split_by_instrument(feed);
        assert_eq!(split.len(), 2);
        let btc = split
            .iter()
            .find(|(i, _)| i.as_str() == "BTC-USDT")
            .unwrap();
        assert_eq!(btc.1.ticks.len(), 2);
    }
}
