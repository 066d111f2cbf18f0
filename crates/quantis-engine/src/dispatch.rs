//! Signal Dispatcher (C7): the engine's output boundary. Mirrors
//! `omega-core`'s `Channel` trait — every downstream sink (stdout, file,
//! eventually a message bus) implements the same small async interface.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quantis_core::{Instrument, QuantisError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::DecisionState;
use crate::hypothesis::Direction;

/// Queue priority assigned to a signal at enqueue time (spec §4.7). A
/// signal built from a `suspect` tick is `Low` — it is the first thing
/// dropped if the sink queue backs up; everything else is `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
}

struct QueuedSignal {
    priority: Priority,
    signal: Signal,
}

/// Bounded sink-side retry policy: a handful of attempts with growing
/// delay, then give up and log (spec §4.7 "retries with bounded backoff").
const SEND_RETRIES: u32 = 3;
const SEND_RETRY_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    Long,
    Short,
}

impl From<Direction> for Option<SignalDirection> {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Long => Some(SignalDirection::Long),
            Direction::Short => Some(SignalDirection::Short),
            Direction::Null => None,
        }
    }
}

/// Wire format emitted to every sink (spec §3/§6). One `Signal` per
/// (instrument, hypothesis_id) EXECUTE event, at-most-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: Instrument,
    pub hypothesis_id: Uuid,
    pub direction: SignalDirection,
    pub position_fraction: f64,
    pub confidence: f64,
    pub expected_return: f64,
    pub variance: f64,
    pub regime_posterior: Vec<f64>,
    pub decision_time: DateTime<Utc>,
    pub sequence_no: u64,
    pub suspect: bool,
}

/// A downstream destination for signals. Implementors own their own I/O and
/// must not block the dispatcher's event loop for long.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, signal: &Signal) -> Result<(), QuantisError>;
}

/// Writes one line-delimited JSON signal per line to stdout.
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, signal: &Signal) -> Result<(), QuantisError> {
        let line = serde_json::to_string(signal)?;
        println!("{line}");
        Ok(())
    }
}

/// Appends one line-delimited JSON signal per line to a file. Signals are
/// rare relative to ticks, so a plain synchronous append under a
/// `parking_lot::Mutex` is simpler than threading an async file handle
/// through the sink, at negligible cost to the event loop.
pub struct FileSink {
    file: Mutex<std::fs::File>,
    path: String,
}

impl FileSink {
    pub fn open(path: &str) -> Result<Self, QuantisError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(QuantisError::Io)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.path
    }

    async fn send(&self, signal: &Signal) -> Result<(), QuantisError> {
        use std::io::Write;
        let mut line = serde_json::to_string(signal)?;
        line.push('\n');
        let mut guard = self.file.lock();
        guard.write_all(line.as_bytes()).map_err(QuantisError::Io)
    }
}

/// Deduplicates (instrument, hypothesis_id) pairs, assigns a monotonically
/// increasing per-instrument sequence number, and holds a bounded priority
/// queue in front of the configured sinks. Sink failures are retried with
/// backoff and otherwise logged, not propagated — one broken sink must not
/// stall the others (spec §4.7). When the queue is at its hard cap, the
/// oldest `Low`-priority signal is dropped to make room.
pub struct Dispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    dispatched: Mutex<HashSet<(Instrument, Uuid)>>,
    sequence: Mutex<u64>,
    queue: Mutex<VecDeque<QueuedSignal>>,
    queue_cap: usize,
}

/// Hard cap on the sink queue (spec §4.7 default).
const DEFAULT_QUEUE_CAP: usize = 10_000;

impl Dispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self::with_queue_cap(sinks, DEFAULT_QUEUE_CAP)
    }

    pub fn with_queue_cap(sinks: Vec<Arc<dyn Sink>>, queue_cap: usize) -> Self {
        Self {
            sinks,
            dispatched: Mutex::new(HashSet::new()),
            sequence: Mutex::new(0),
            queue: Mutex::new(VecDeque::new()),
            queue_cap: queue_cap.max(1),
        }
    }

    /// Build and enqueue a signal for an EXECUTE decision, then drain the
    /// queue to the sinks. Returns `false` if this (instrument,
    /// hypothesis_id) pair was already dispatched (at-most-once, spec
    /// invariant I-DISPATCH-ONCE) or the decision/direction doesn't warrant
    /// a signal.
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &self,
        instrument: &Instrument,
        hypothesis_id: Uuid,
        direction: Direction,
        position_fraction: f64,
        confidence: f64,
        expected_return: f64,
        variance: f64,
        regime_posterior: Vec<f64>,
        decision_state: DecisionState,
        suspect: bool,
    ) -> bool {
        if decision_state != DecisionState::Execute {
            return false;
        }
        let Some(direction): Option<SignalDirection> = direction.into() else {
            return false;
        };

        {
            let mut seen = self.dispatched.lock();
            if !seen.insert((instrument.clone(), hypothesis_id)) {
                return false;
            }
        }

        let sequence_no = {
            let mut seq = self.sequence.lock();
            *seq += 1;
            *seq
        };

        let signal = Signal {
            instrument: instrument.clone(),
            hypothesis_id,
            direction,
            position_fraction,
            confidence,
            expected_return,
            variance,
            regime_posterior,
            decision_time: Utc::now(),
            sequence_no,
            suspect,
        };

        let priority = if suspect { Priority::Low } else { Priority::Normal };
        self.enqueue(priority, signal);
        self.drain().await;
        true
    }

    /// Push a signal onto the bounded queue, applying the hard-cap drop
    /// policy (spec §4.7): the oldest `Low`-priority entry is evicted to
    /// make room; if none exists, the incoming signal itself is dropped.
    fn enqueue(&self, priority: Priority, signal: Signal) {
        let mut q = self.queue.lock();
        if q.len() >= self.queue_cap {
            if let Some(pos) = q.iter().position(|qs| qs.priority == Priority::Low) {
                let dropped = q.remove(pos).unwrap();
                tracing::warn!(
                    "quantis: sink queue at capacity ({}), dropped LOW priority signal for {} (hypothesis {})",
                    self.queue_cap,
                    dropped.signal.instrument,
                    dropped.signal.hypothesis_id
                );
            } else {
                tracing::warn!(
                    "quantis: sink queue at capacity ({}) with no LOW priority signal to evict, dropping incoming signal for {}",
                    self.queue_cap,
                    signal.instrument
                );
                return;
            }
        }
        q.push_back(QueuedSignal { priority, signal });
    }

    /// Drain every currently queued signal to all sinks, retrying each sink
    /// independently with bounded backoff on failure. Safe to call
    /// concurrently — each signal is popped and sent exactly once.
    pub async fn drain(&self) {
        loop {
            let next = {
                let mut q = self.queue.lock();
                q.pop_front()
            };
            let Some(item) = next else { break };
            self.send_to_sinks(&item.signal).await;
        }
    }

    async fn send_to_sinks(&self, signal: &Signal) {
        for sink in &self.sinks {
            let mut attempt = 0;
            loop {
                match sink.send(signal).await {
                    Ok(()) => break,
                    Err(e) if attempt < SEND_RETRIES => {
                        attempt += 1;
                        tracing::warn!(
                            "quantis: sink {} failed to dispatch signal (attempt {attempt}/{SEND_RETRIES}): {e}",
                            sink.name()
                        );
                        tokio::time::sleep(SEND_RETRY_BASE * attempt).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            "quantis: sink {} gave up dispatching signal after {SEND_RETRIES} retries: {e}",
                            sink.name()
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Current backlog size, for health/diagnostics.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        async fn send(&self, _signal: &Signal) -> Result<(), QuantisError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_is_at_most_once_per_hypothesis() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(vec![sink.clone()]);
        let instrument = Instrument::from("BTC-USDT");
        let id = Uuid::new_v4();

        let first = dispatcher
            .dispatch(
                &instrument,
                id,
                Direction::Long,
                0.05,
                0.8,
                0.01,
                0.0004,
                vec![0.5, 0.5],
                DecisionState::Execute,
                false,
            )
            .await;
        let second = dispatcher
            .dispatch(
                &instrument,
                id,
                Direction::Long,
                0.05,
                0.8,
                0.01,
                0.0004,
                vec![0.5, 0.5],
                DecisionState::Execute,
                false,
            )
            .await;

        assert!(first);
        assert!(!second);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_execute_state_never_dispatches() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(vec![sink.clone()]);
        let dispatched = dispatcher
            .dispatch(
                &Instrument::from("BTC-USDT"),
                Uuid::new_v4(),
                Direction::Long,
                0.05,
                0.8,
                0.01,
                0.0004,
                vec![0.5, 0.5],
                DecisionState::Continue,
                false,
            )
            .await;
        assert!(!dispatched);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn null_direction_never_dispatches() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(vec![sink.clone()]);
        let dispatched = dispatcher
            .dispatch(
                &Instrument::from("BTC-USDT"),
                Uuid::new_v4(),
                Direction::Null,
                0.0,
                0.8,
                0.0,
                0.0004,
                vec![0.5, 0.5],
                DecisionState::Execute,
                false,
            )
            .await;
        assert!(!dispatched);
    }

    /// A blocking sink lets queued signals pile up faster than they drain,
    /// so `enqueue`'s cap-drop policy is exercised directly rather than via
    /// `dispatch` (which drains inline after every call).
    #[test]
    fn enqueue_drops_oldest_low_priority_signal_at_capacity() {
        let dispatcher = Dispatcher::with_queue_cap(vec![], 2);
        let make = |suffix: &str| Signal {
            instrument: Instrument::from("BTC-USDT"),
            hypothesis_id: Uuid::new_v4(),
            direction: SignalDirection::Long,
            position_fraction: 0.01,
            confidence: 0.5,
            expected_return: 0.001,
            variance: 0.0001,
            regime_posterior: vec![0.5, 0.5],
            decision_time: Utc::now(),
            sequence_no: 1,
            suspect: suffix == "low",
        };

        dispatcher.enqueue(Priority::Low, make("low"));
        dispatcher.enqueue(Priority::Normal, make("normal"));
        assert_eq!(dispatcher.queue_len(), 2);

        // Queue is at capacity; the LOW entry is evicted to admit this one.
        dispatcher.enqueue(Priority::Normal, make("normal2"));
        assert_eq!(dispatcher.queue_len(), 2);
        let q = dispatcher.queue.lock();
        assert!(q.iter().all(|qs| qs.priority == Priority::Normal));
    }

    #[test]
    fn enqueue_drops_incoming_signal_when_no_low_priority_to_evict() {
        let dispatcher = Dispatcher::with_queue_cap(vec![], 1);
        let make = || Signal {
            instrument: Instrument::from("BTC-USDT"),
            hypothesis_id: Uuid::new_v4(),
            direction: SignalDirection::Long,
            position_fraction: 0.01,
            confidence: 0.5,
            expected_return: 0.001,
            variance: 0.0001,
            regime_posterior: vec![0.5, 0.5],
            decision_time: Utc::now(),
            sequence_no: 1,
            suspect: false,
        };

        dispatcher.enqueue(Priority::Normal, make());
        dispatcher.enqueue(Priority::Normal, make());
        assert_eq!(dispatcher.queue_len(), 1);
    }

    struct FlakySink {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn send(&self, _signal: &Signal) -> Result<(), QuantisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(QuantisError::Sink("transient failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn dispatch_retries_a_failing_sink_until_it_succeeds() {
        let sink = Arc::new(FlakySink {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let dispatcher = Dispatcher::new(vec![sink.clone()]);
        let dispatched = dispatcher
            .dispatch(
                &Instrument::from("BTC-USDT"),
                Uuid::new_v4(),
                Direction::Long,
                0.05,
                0.8,
                0.01,
                0.0004,
                vec![0.5, 0.5],
                DecisionState::Execute,
                false,
            )
            .await;
        assert!(dispatched);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn suspect_signals_are_queued_at_low_priority() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(vec![sink.clone()]);
        dispatcher
            .dispatch(
                &Instrument::from("BTC-USDT"),
                Uuid::new_v4(),
                Direction::Long,
                0.05,
                0.8,
                0.01,
                0.0004,
                vec![0.5, 0.5],
                DecisionState::Execute,
                true,
            )
            .await;
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }
}
