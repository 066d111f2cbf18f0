//! Stream Ingestor (C1): multi-venue tick reception, validation, ordering,
//! and gap detection (spec §4.1).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use quantis_core::Instrument;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A validated, internal-format tick (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tick {
    pub instrument: Instrument,
    pub exchange: String,
    pub monotonic_ingest_time: DateTime<Utc>,
    pub exchange_time: DateTime<Utc>,
    pub mid_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub last_trade_price: f64,
    pub last_trade_size: f64,
    pub funding_rate: Option<f64>,
    /// Set when a validation rule soft-fails (spec §4.1) rather than drops.
    pub suspect: bool,
}

/// Outcome of applying the §4.1 validation rules to a raw venue message.
enum Validation {
    Keep(Tick),
    Drop(&'static str),
}

fn validate(mut tick: Tick, venue_prices: &[f64]) -> Validation {
    let stale = (tick.monotonic_ingest_time - tick.exchange_time)
        .num_milliseconds()
        .unsigned_abs()
        > 5_000;
    if stale {
        return Validation::Drop("stale");
    }
    if tick.bid > tick.ask || tick.mid_price <= 0.0 {
        return Validation::Drop("bad invariant");
    }
    if !venue_prices.is_empty() {
        let mut sorted = venue_prices.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];
        if median > 0.0 && ((tick.mid_price - median).abs() / median) > 0.05 {
            tick.suspect = true;
        }
    }
    Validation::Keep(tick)
}

/// Reference transport: any source of raw ticks for a single instrument.
/// The Ingestor merges across multiple [`VenueFeed`]s; an adapter's only
/// job is mapping its venue's wire format into [`Tick`].
#[async_trait]
pub trait VenueFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `shutdown` resolves, sending validated-shape ticks (bid/ask
    /// invariants are re-checked by the Ingestor's merge stage, not here) to
    /// `tx`. Implementations own their own reconnect loop.
    async fn run(&self, instrument: Instrument, tx: mpsc::Sender<Tick>, shutdown: ShutdownSignal);
}

/// A cooperative cancellation signal, cheaply cloneable, checked at every
/// suspension point (spec §5).
#[derive(Clone)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn new() -> (ShutdownHandle, Self) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (ShutdownHandle(tx), Self(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn cancelled(&mut self) {
        let _ = self.0.changed().await;
    }
}

#[derive(Clone)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Exponential backoff with full jitter (base 500ms, cap 30s — spec §4.1).
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis() as u64 * 2u64.saturating_pow(self.attempt);
        let capped = exp.min(self.cap.as_millis() as u64);
        self.attempt = (self.attempt + 1).min(16);
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// WebSocket venue adapter. Generic over a per-message parse function so
/// the same reconnect/backoff loop serves every exchange's wire format.
pub struct WebSocketVenueFeed {
    pub name: String,
    pub endpoint: String,
    pub parse: fn(&str, &Instrument, &str) -> Option<Tick>,
}

#[async_trait]
impl VenueFeed for WebSocketVenueFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, instrument: Instrument, tx: mpsc::Sender<Tick>, mut shutdown: ShutdownSignal) {
        let mut backoff = Backoff::new();
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            info!("quantis: connecting to venue {} at {}", self.name, self.endpoint);
            match tokio_tungstenite::connect_async(&self.endpoint).await {
                Ok((ws, _)) => {
                    info!("quantis: venue {} connected", self.name);
                    backoff.reset();
                    let (_, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                                        if let Some(tick) = (self.parse)(&text, &instrument, &self.name) {
                                            if tx.send(tick).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!("quantis: venue {} websocket error: {e}", self.name);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("quantis: venue {} connection failed: {e}", self.name);
                }
            }
            let delay = backoff.next_delay();
            warn!("quantis: venue {} reconnecting in {delay:?}", self.name);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Replay adapter: feeds a captured newline-delimited JSON tick log for
/// offline evaluation (the `replay` CLI subcommand).
pub struct ReplayFeed {
    pub name: String,
    pub ticks: Vec<Tick>,
}

#[async_trait]
impl VenueFeed for ReplayFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _instrument: Instrument, tx: mpsc::Sender<Tick>, mut shutdown: ShutdownSignal) {
        for tick in &self.ticks {
            if shutdown.is_cancelled() {
                return;
            }
            if tx.send(tick.clone()).await.is_err() {
                return;
            }
        }
    }
}

/// Merge-ordering wrapper: a min-heap entry ordered by `exchange_time`, with
/// the originating venue's configured priority (lower is higher priority)
/// as the tie-break when two venues report the same `exchange_time` (spec
/// §4.1: "on ties, preference order is configured (primary wins)").
struct HeapTick(Tick, u8);

impl PartialEq for HeapTick {
    fn eq(&self, other: &Self) -> bool {
        self.0.exchange_time == other.0.exchange_time && self.1 == other.1
    }
}
impl Eq for HeapTick {}
impl PartialOrd for HeapTick {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapTick {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so BinaryHeap (a max-heap) pops the earliest exchange_time
        // (and, on a tie, the highest-priority venue) first.
        other
            .0
            .exchange_time
            .cmp(&self.0.exchange_time)
            .then_with(|| other.1.cmp(&self.1))
    }
}

/// How long the merge buffer holds ticks before flushing them in
/// `exchange_time` order, to tolerate modest cross-venue skew.
const MERGE_WINDOW: Duration = Duration::from_millis(100);
/// All venues down longer than this triggers a gap event (spec §4.1).
const GAP_TIMEOUT: Duration = Duration::from_secs(10);
/// Two ticks with the same price within this many milliseconds of each
/// other's `exchange_time` are treated as the same trade reported by
/// different venues (spec §4.1).
const DUPLICATE_WINDOW_MS: i64 = 10;
/// Ingestor -> Feature Builder channel cap (spec §4.8); also the
/// backpressure coalescing threshold (spec §4.1).
const DEFAULT_BACKPRESSURE_CAP: usize = 512;

/// Cross-venue merge, validation, and gap detection for a single
/// instrument. Consumes raw per-venue tick channels and produces a single
/// ordered, validated output stream.
pub struct Ingestor {
    instrument: Instrument,
    venue_priority: Vec<(String, u8)>,
    out_cap: usize,
}

/// Emitted once all venues have been silent for [`GAP_TIMEOUT`]; consumers
/// reset rolling feature state and require a warmup period (spec §4.1/§4.2).
pub struct GapEvent;

impl Ingestor {
    pub fn new(instrument: Instrument, venue_priority: Vec<(String, u8)>, out_cap: usize) -> Self {
        Self {
            instrument,
            venue_priority,
            out_cap: out_cap.max(1),
        }
    }

    fn priority(&self, venue: &str) -> u8 {
        self.venue_priority
            .iter()
            .find(|(name, _)| name == venue)
            .map(|(_, p)| *p)
            .unwrap_or(u8::MAX)
    }

    /// Run the merge loop: `raw` receives unvalidated ticks from every
    /// venue feed task; `out` receives the validated, ordered stream;
    /// `gap_tx` receives a [`GapEvent`] on prolonged silence.
    pub async fn run(
        mut self,
        mut raw: mpsc::Receiver<Tick>,
        out: mpsc::Sender<Tick>,
        gap_tx: mpsc::Sender<GapEvent>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut heap: BinaryHeap<HeapTick> = BinaryHeap::new();
        let mut recent: Vec<(DateTime<Utc>, f64, String)> = Vec::new();
        let mut gap_announced = false;
        let mut flush_interval = tokio::time::interval(MERGE_WINDOW);
        let mut last_tick_at = std::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush_all(&mut heap, &out).await;
                    return;
                }
                maybe_tick = raw.recv() => {
                    match maybe_tick {
                        Some(tick) => {
                            last_tick_at = std::time::Instant::now();
                            if gap_announced {
                                gap_announced = false;
                                info!("quantis: instrument {} recovered from gap", self.instrument);
                            }
                            recent.retain(|(t, _, _)| tick.exchange_time - *t < chrono::Duration::seconds(1));
                            let venue_prices: Vec<f64> = recent.iter().map(|(_, p, _)| *p).collect();
                            recent.push((tick.exchange_time, tick.mid_price, tick.exchange.clone()));

                            match validate(tick, &venue_prices) {
                                Validation::Keep(t) => {
                                    if self.is_duplicate(&heap, &t) {
                                        continue;
                                    }
                                    if heap.len() >= self.out_cap {
                                        self.coalesce(&mut heap);
                                    }
                                    let prio = self.priority(&t.exchange);
                                    heap.push(HeapTick(t, prio));
                                }
                                Validation::Drop(_reason) => {}
                            }
                        }
                        None => {
                            self.flush_all(&mut heap, &out).await;
                            return;
                        }
                    }
                }
                _ = flush_interval.tick() => {
                    self.flush_ready(&mut heap, &out).await;
                    if last_tick_at.elapsed() > GAP_TIMEOUT && !gap_announced {
                        gap_announced = true;
                        warn!("quantis: all venues silent for instrument {} beyond {:?}, emitting gap event", self.instrument, GAP_TIMEOUT);
                        let _ = gap_tx.send(GapEvent).await;
                    }
                }
            }
        }
    }

    fn is_duplicate(&self, heap: &BinaryHeap<HeapTick>, candidate: &Tick) -> bool {
        heap.iter().any(|HeapTick(t, _)| {
            (t.exchange_time - candidate.exchange_time).num_milliseconds().abs() <= DUPLICATE_WINDOW_MS
                && (t.last_trade_price - candidate.last_trade_price).abs() < 1e-9
        })
    }

    /// Keep the latest tick per 100ms bucket, dropping the rest (spec §4.1
    /// backpressure coalescing). On a same-timestamp tie within a bucket,
    /// the higher-priority venue's tick wins.
    fn coalesce(&self, heap: &mut BinaryHeap<HeapTick>) {
        use std::collections::HashMap;
        let mut by_bucket: HashMap<i64, (Tick, u8)> = HashMap::new();
        for HeapTick(t, prio) in heap.drain() {
            let bucket = t.exchange_time.timestamp_millis() / 100;
            by_bucket
                .entry(bucket)
                .and_modify(|(existing, existing_prio)| {
                    if t.exchange_time > existing.exchange_time
                        || (t.exchange_time == existing.exchange_time && prio < *existing_prio)
                    {
                        *existing = t.clone();
                        *existing_prio = prio;
                    }
                })
                .or_insert((t, prio));
        }
        for (t, prio) in by_bucket.into_values() {
            heap.push(HeapTick(t, prio));
        }
    }

    async fn flush_ready(&self, heap: &mut BinaryHeap<HeapTick>, out: &mpsc::Sender<Tick>) {
        let cutoff = Utc::now() - chrono::Duration::from_std(MERGE_WINDOW).unwrap();
        while let Some(HeapTick(t, _)) = heap.peek() {
            if t.exchange_time > cutoff {
                break;
            }
            let HeapTick(t, _) = heap.pop().unwrap();
            let _ = out.send(t).await;
        }
    }

    async fn flush_all(&self, heap: &mut BinaryHeap<HeapTick>, out: &mpsc::Sender<Tick>) {
        while let Some(HeapTick(t, _)) = heap.pop() {
            let _ = out.send(t).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(instrument: &str, venue: &str, millis: i64, mid: f64, bid: f64, ask: f64) -> Tick {
        let t = Utc::now() + chrono::Duration::milliseconds(millis);
        Tick {
            instrument: Instrument::from(instrument),
            exchange: venue.into(),
            monotonic_ingest_time: t,
            exchange_time: t,
            mid_price: mid,
            bid,
            ask,
            bid_size: 10.0,
            ask_size: 10.0,
            last_trade_price: mid,
            last_trade_size: 1.0,
            funding_rate: None,
            suspect: false,
        }
    }

    #[test]
    fn bad_invariant_ticks_are_dropped() {
        let t = tick("BTC-USDT", "binance", 0, 100.0, 101.0, 99.0); // bid > ask
        assert!(matches!(validate(t, &[]), Validation::Drop(_)));
    }

    #[test]
    fn non_positive_mid_is_dropped() {
        let t = tick("BTC-USDT", "binance", 0, -1.0, -1.5, -0.5);
        assert!(matches!(validate(t, &[]), Validation::Drop(_)));
    }

    #[test]
    fn cross_venue_disagreement_marks_suspect_not_dropped() {
        let t = tick("BTC-USDT", "binance", 0, 107.0, 106.5, 107.5);
        match validate(t, &[100.0, 100.0]) {
            Validation::Keep(t) => assert!(t.suspect),
            Validation::Drop(_) => panic!("should not drop on soft disagreement"),
        }
    }

    #[test]
    fn within_tolerance_is_not_suspect() {
        let t = tick("BTC-USDT", "binance", 0, 101.0, 100.5, 101.5);
        match validate(t, &[100.0, 100.0]) {
            Validation::Keep(t) => assert!(!t.suspect),
            Validation::Drop(_) => panic!("should not drop"),
        }
    }

    #[test]
    fn backoff_delay_never_exceeds_cap() {
        let mut b = Backoff::new();
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn shutdown_signal_propagates() {
        let (handle, mut sig) = ShutdownSignal::new();
        assert!(!sig.is_cancelled());
        handle.shutdown();
        sig.cancelled().await;
        assert!(sig.is_cancelled());
    }

    #[test]
    fn heap_tick_breaks_exchange_time_ties_by_venue_priority() {
        let t = tick("BTC-USDT", "binance", 0, 100.0, 99.5, 100.5);
        let mut heap: BinaryHeap<HeapTick> = BinaryHeap::new();
        // Same exchange_time, but pushed with the lower-priority venue first.
        heap.push(HeapTick(t.clone(), 5));
        heap.push(HeapTick(t, 0));

        let HeapTick(_, top_priority) = heap.pop().unwrap();
        assert_eq!(top_priority, 0, "primary (lower-numbered) venue should win the tie");
    }

    #[test]
    fn ingestor_priority_defaults_unconfigured_venues_to_lowest() {
        let ingestor = Ingestor::new(Instrument::from("BTC-USDT"), vec![("binance".into(), 0)], 512);
        assert_eq!(ingestor.priority("binance"), 0);
        assert_eq!(ingestor.priority("unknown"), u8::MAX);
    }

    #[test]
    fn duplicate_detection_tolerates_cross_venue_clock_skew() {
        let ingestor = Ingestor::new(Instrument::from("BTC-USDT"), vec![("binance".into(), 0)], 512);
        let mut heap: BinaryHeap<HeapTick> = BinaryHeap::new();
        heap.push(HeapTick(tick("BTC-USDT", "binance", 0, 100.0, 99.5, 100.5), 0));

        let near = tick("BTC-USDT", "okx", 7, 100.0, 99.5, 100.5);
        assert!(ingestor.is_duplicate(&heap, &near), "within 10ms should dedupe");

        let far = tick("BTC-USDT", "okx", 25, 100.0, 99.5, 100.5);
        assert!(!ingestor.is_duplicate(&heap, &far), "beyond 10ms should not dedupe");
    }
}
