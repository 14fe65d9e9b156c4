//! Statistics aggregator.
//!
//! Counts cache hits, misses and remote calls per (endpoint, operation),
//! plus events dropped by slow consumers. Purely observational: recording
//! never fails and nothing reads the counters back to make decisions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of a fetch, as seen by the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss,
    RemoteCall,
}

/// Monotonic counters of one (endpoint, operation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counters {
    pub hits: u64,
    pub misses: u64,
    pub remote_calls: u64,
}

impl Counters {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Hit => self.hits += 1,
            Outcome::Miss => self.misses += 1,
            Outcome::RemoteCall => self.remote_calls += 1,
        }
    }

    fn since(&self, earlier: &Counters) -> Counters {
        Counters {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            remote_calls: self.remote_calls.saturating_sub(earlier.remote_calls),
        }
    }

    fn merge(&mut self, other: &Counters) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.remote_calls += other.remote_calls;
    }

    /// Share of lookups served from cache, `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            None
        } else {
            Some(self.hits as f64 / lookups as f64)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hits == 0 && self.misses == 0 && self.remote_calls == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub endpoint: String,
    pub operation: String,
    pub total: Counters,
    pub delta: Counters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedEventsReport {
    pub endpoint: String,
    pub total: u64,
    pub delta: u64,
}

/// Counters at one point in time, with deltas since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub taken_at: DateTime<Utc>,
    pub operations: Vec<OperationReport>,
    pub dropped_events: Vec<DroppedEventsReport>,
    pub total: Counters,
    pub delta: Counters,
}

impl StatsReport {
    /// Counters of one (endpoint, operation) pair.
    pub fn operation(&self, endpoint: &str, operation: &str) -> Option<&OperationReport> {
        self.operations
            .iter()
            .find(|r| r.endpoint == endpoint && r.operation == operation)
    }

    pub fn dropped(&self, endpoint: &str) -> u64 {
        self.dropped_events
            .iter()
            .find(|r| r.endpoint == endpoint)
            .map(|r| r.total)
            .unwrap_or(0)
    }
}

type Key = (String, String);

/// Counter values at the last snapshot of one reader.
#[derive(Default)]
struct Baseline {
    counters: BTreeMap<Key, Counters>,
    dropped: BTreeMap<String, u64>,
}

/// Who a snapshot is taken for. Each reader has its own delta baseline.
#[derive(Debug, Clone, Copy)]
enum Reader {
    Caller,
    Reporter,
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<Key, Counters>,
    dropped: BTreeMap<String, u64>,
    caller: Baseline,
    reporter: Baseline,
}

impl Inner {
    fn baseline(&mut self, reader: Reader) -> &mut Baseline {
        match reader {
            Reader::Caller => &mut self.caller,
            Reader::Reporter => &mut self.reporter,
        }
    }
}

/// Shared statistics sink.
#[derive(Default)]
pub struct StatsAggregator {
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    // counters stay usable after a panic elsewhere
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, endpoint: &str, operation: &str, outcome: Outcome) {
        let mut inner = self.lock();
        inner
            .counters
            .entry((endpoint.to_string(), operation.to_string()))
            .or_default()
            .add(outcome);
    }

    /// Count events dropped from a consumer queue of `endpoint`.
    pub fn record_dropped(&self, endpoint: &str, count: u64) {
        let mut inner = self.lock();
        *inner.dropped.entry(endpoint.to_string()).or_insert(0) += count;
    }

    /// Totals and deltas since the previous call. The periodic log keeps
    /// its own baseline and does not reset these deltas.
    pub fn snapshot(&self) -> StatsReport {
        self.snapshot_for(Reader::Caller)
    }

    fn snapshot_for(&self, reader: Reader) -> StatsReport {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let baseline = match reader {
            Reader::Caller => &inner.caller,
            Reader::Reporter => &inner.reporter,
        };

        let mut total = Counters::default();
        let mut delta = Counters::default();
        let operations: Vec<OperationReport> = inner
            .counters
            .iter()
            .map(|((endpoint, operation), counters)| {
                let previous = baseline.counters.get(&(endpoint.clone(), operation.clone()));
                let d = counters.since(previous.unwrap_or(&Counters::default()));
                total.merge(counters);
                delta.merge(&d);
                OperationReport {
                    endpoint: endpoint.clone(),
                    operation: operation.clone(),
                    total: *counters,
                    delta: d,
                }
            })
            .collect();

        let dropped_events = inner
            .dropped
            .iter()
            .map(|(endpoint, count)| DroppedEventsReport {
                endpoint: endpoint.clone(),
                total: *count,
                delta: count.saturating_sub(*baseline.dropped.get(endpoint).unwrap_or(&0)),
            })
            .collect();

        let (counters, dropped) = (inner.counters.clone(), inner.dropped.clone());
        let baseline = inner.baseline(reader);
        baseline.counters = counters;
        baseline.dropped = dropped;

        StatsReport {
            taken_at: Utc::now(),
            operations,
            dropped_events,
            total,
            delta,
        }
    }

    /// Log the deltas since the previous log line.
    pub fn log_snapshot(&self) {
        log_report(&self.snapshot_for(Reader::Reporter));
    }

    /// Log a snapshot every `interval` until `shutdown` fires.
    pub fn spawn_reporter(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // the first tick completes immediately
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => self.log_snapshot(),
                }
            }
        })
    }
}

fn log_report(report: &StatsReport) {
    for op in report.operations.iter().filter(|op| !op.delta.is_zero()) {
        info!(
            endpoint = %op.endpoint,
            operation = %op.operation,
            hits = op.delta.hits,
            misses = op.delta.misses,
            remote_calls = op.delta.remote_calls,
            hit_ratio = op.total.hit_ratio().unwrap_or(0.0),
            "Cache statistics"
        );
    }
    for dropped in report.dropped_events.iter().filter(|d| d.delta > 0) {
        info!(
            endpoint = %dropped.endpoint,
            dropped = dropped.delta,
            total_dropped = dropped.total,
            "Events dropped by slow consumers"
        );
    }
    info!(
        hits = report.total.hits,
        misses = report.total.misses,
        remote_calls = report.total.remote_calls,
        "Statistics totals"
    );
}
