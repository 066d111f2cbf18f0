//! Feature Builder (C2): derives the observation vector `x_t` and covariate
//! vector `z_t` from the validated tick stream (spec §4.2).

use crate::hmm::{COV_DIM, OBS_DIM};
use crate::kalman::KalmanFilter;
use crate::tick::Tick;

/// Ticks required after a gap event before observations resume (spec §4.2).
pub const WARMUP_TICKS: u32 = 32;

const LAMBDA_RETURN: f64 = 0.94;
const EPS: f64 = 1e-12;

/// Per-instrument feature state. Stateful across ticks: EWMA return
/// volatility and a Kalman-filtered trend estimator feed `slope_D1`.
pub struct FeatureBuilder {
    trend_filter: KalmanFilter,
    last_mid: Option<f64>,
    last_trend: f64,
    ewma_var: f64,
    warmup_remaining: u32,
}

/// One emitted `(x_t, z_t)` pair, timestamped by the tick's `exchange_time`.
#[derive(Debug, Clone)]
pub struct Observation {
    pub x: [f64; OBS_DIM],
    pub z: [f64; COV_DIM],
    pub exchange_time: chrono::DateTime<chrono::Utc>,
    pub suspect: bool,
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureBuilder {
    pub fn new() -> Self {
        Self {
            trend_filter: KalmanFilter::crypto_default(),
            last_mid: None,
            last_trend: 0.0,
            ewma_var: 0.0,
            warmup_remaining: 0,
        }
    }

    /// Reset EWMA/trend state on a gap event and require `WARMUP_TICKS`
    /// ticks before observations are emitted downstream again (spec §4.2).
    /// The warmup ticks are still logged by the caller so that HMM
    /// re-estimation can use them.
    pub fn on_gap_event(&mut self) {
        self.trend_filter = KalmanFilter::crypto_default();
        self.last_mid = None;
        self.last_trend = 0.0;
        self.ewma_var = 0.0;
        self.warmup_remaining = WARMUP_TICKS;
    }

    /// Process one validated tick, returning `Some(Observation)` unless the
    /// builder is still warming up after a gap (or this is the very first
    /// tick, which has no previous mid-price to form a return from).
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Observation> {
        let mid = tick.mid_price;
        let (_, trend) = self.trend_filter.update(mid);
        let slope_d1 = trend - self.last_trend;
        self.last_trend = trend;

        let log_return = match self.last_mid {
            Some(prev) if prev > 0.0 => (mid / prev).ln(),
            _ => 0.0,
        };
        self.last_mid = Some(mid);

        self.ewma_var = LAMBDA_RETURN * self.ewma_var + (1.0 - LAMBDA_RETURN) * log_return.powi(2);
        let log_volatility = (self.ewma_var.sqrt() + EPS).ln();

        let denom = tick.bid_size + tick.ask_size;
        let orderbook_imbalance = if denom > 0.0 {
            (tick.bid_size - tick.ask_size) / denom
        } else {
            0.0
        };

        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return None;
        }

        Some(Observation {
            x: [log_return, log_volatility, slope_d1, orderbook_imbalance],
            z: [slope_d1, log_volatility, orderbook_imbalance],
            exchange_time: tick.exchange_time,
            suspect: tick.suspect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::Tick;
    use chrono::Utc;

    fn tick(mid: f64, bid_size: f64, ask_size: f64) -> Tick {
        Tick {
            instrument: "BTC-USDT".into(),
            exchange: "binance".into(),
            monotonic_ingest_time: Utc::now(),
            exchange_time: Utc::now(),
            mid_price: mid,
            bid: mid - 0.5,
            ask: mid + 0.5,
            bid_size,
            ask_size,
            last_trade_price: mid,
            last_trade_size: 1.0,
            funding_rate: None,
            suspect: false,
        }
    }

    #[test]
    fn first_tick_has_zero_log_return() {
        let mut fb = FeatureBuilder::new();
        let obs = fb.on_tick(&tick(50_000.0, 10.0, 10.0)).unwrap();
        assert_eq!(obs.x[0], 0.0);
    }

    #[test]
    fn gap_event_suppresses_observations_during_warmup() {
        let mut fb = FeatureBuilder::new();
        fb.on_tick(&tick(50_000.0, 10.0, 10.0));
        fb.on_gap_event();
        let mut emitted = 0;
        for i in 0..WARMUP_TICKS + 5 {
            if fb.on_tick(&tick(50_000.0 + i as f64, 10.0, 10.0)).is_some() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 5);
    }

    #[test]
    fn orderbook_imbalance_bounded_in_unit_interval() {
        let mut fb = FeatureBuilder::new();
        let obs = fb.on_tick(&tick(50_000.0, 100.0, 1.0)).unwrap();
        assert!(obs.x[3] > 0.0 && obs.x[3] <= 1.0);
    }
}
