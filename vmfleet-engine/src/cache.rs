//! Cache and invalidation layer.
//!
//! Entries are grouped in buckets keyed by (endpoint, operation); each
//! bucket has its own lock, TTL and LRU capacity. A miss spawns one remote
//! fetch per key and every concurrent caller of that key waits on the same
//! result. A caller that stops waiting leaves the fetch running for the
//! others.
//!
//! Entries are tagged with the domain UUIDs they depend on, so a lifecycle
//! event for a domain can drop exactly the entries it affects.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};
use vmfleet_hypervisor::Hypervisor;

use crate::config::CacheConfig;
use crate::error::{EngineError, Result};
use crate::query::{Operation, Query, Value};
use crate::stats::{Outcome, StatsAggregator};

// =============================================================================
// POLICY
// =============================================================================

/// TTL and capacity of the cache buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    ttls: HashMap<Operation, Option<Duration>>,
    capacity_per_bucket: usize,
}

impl CachePolicy {
    /// Built-in TTL of an operation class. `None` means entries never
    /// expire and are only dropped by invalidation.
    pub fn default_ttl(operation: Operation) -> Option<Duration> {
        match operation {
            Operation::ListDomains => Some(Duration::from_secs(5)),
            Operation::DomainInfo => Some(Duration::from_secs(5)),
            Operation::DomainXml => Some(Duration::from_secs(300)),
            Operation::DomainStats => Some(Duration::from_secs(5)),
            Operation::HostCapabilities => None,
            Operation::StoragePools => Some(Duration::from_secs(60)),
            Operation::PoolVolumes => Some(Duration::from_secs(30)),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let ttls = Operation::ALL
            .iter()
            .map(|op| {
                let ttl = match config.ttl_secs.get(op) {
                    Some(secs) => secs.map(Duration::from_secs),
                    None => Self::default_ttl(*op),
                };
                (*op, ttl)
            })
            .collect();
        Self {
            ttls,
            capacity_per_bucket: config.capacity_per_bucket.max(1),
        }
    }

    pub fn ttl(&self, operation: Operation) -> Option<Duration> {
        self.ttls
            .get(&operation)
            .copied()
            .unwrap_or_else(|| Self::default_ttl(operation))
    }

    pub fn with_ttl(mut self, operation: Operation, ttl: Option<Duration>) -> Self {
        self.ttls.insert(operation, ttl);
        self
    }

    pub fn capacity_per_bucket(&self) -> usize {
        self.capacity_per_bucket
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

// =============================================================================
// BUCKETS
// =============================================================================

type Shared = Option<Result<Value>>;

struct Entry {
    value: Value,
    created: Instant,
    ttl: Option<Duration>,
    hits: u64,
    misses: u64,
    tags: BTreeSet<String>,
    last_used: u64,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created) < ttl,
            None => true,
        }
    }
}

#[derive(Default)]
struct Bucket {
    entries: HashMap<String, Entry>,
    inflight: HashMap<String, watch::Receiver<Shared>>,
    /// Misses of keys that have no entry yet
    pending_misses: HashMap<String, u64>,
    /// Bumped on every invalidation; a fetch started under an older epoch
    /// is not inserted
    epoch: u64,
    clock: u64,
}

impl Bucket {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    trace!(key = %key, "Evicting least recently used entry");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn invalidate(&mut self, domain: Option<&str>) -> usize {
        self.epoch += 1;
        let before = self.entries.len();
        match domain {
            Some(uuid) => self.entries.retain(|_, e| !e.tags.contains(uuid)),
            None => self.entries.clear(),
        }
        before - self.entries.len()
    }
}

type BucketKey = (String, Operation);

/// Hit and miss counters of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCounters {
    pub hits: u64,
    pub misses: u64,
}

/// Memoizes read operations per endpoint.
pub struct Cache {
    buckets: RwLock<HashMap<BucketKey, Arc<Mutex<Bucket>>>>,
    policy: RwLock<CachePolicy>,
    stats: Arc<StatsAggregator>,
}

fn lock(bucket: &Mutex<Bucket>) -> MutexGuard<'_, Bucket> {
    // a bucket's invariants hold between statements; keep serving
    bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Cache {
    pub fn new(policy: CachePolicy, stats: Arc<StatsAggregator>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            policy: RwLock::new(policy),
            stats,
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Replace the policy. Existing entries keep their TTL; capacity applies
    /// from the next insertion.
    pub fn set_policy(&self, policy: CachePolicy) {
        if let Ok(mut current) = self.policy.write() {
            *current = policy;
        }
    }

    fn bucket(&self, endpoint: &str, operation: Operation) -> Arc<Mutex<Bucket>> {
        let key = (endpoint.to_string(), operation);
        if let Ok(buckets) = self.buckets.read() {
            if let Some(bucket) = buckets.get(&key) {
                return bucket.clone();
            }
        }
        match self.buckets.write() {
            Ok(mut buckets) => buckets.entry(key).or_default().clone(),
            // a detached bucket still serves the call, it just caches nothing
            Err(_) => Arc::new(Mutex::new(Bucket::default())),
        }
    }

    fn endpoint_buckets(&self, endpoint: &str) -> Vec<Arc<Mutex<Bucket>>> {
        self.buckets
            .read()
            .map(|buckets| {
                buckets
                    .iter()
                    .filter(|((ep, _), _)| ep == endpoint)
                    .map(|(_, b)| b.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serve `query` from cache or fetch it through `handle`.
    pub async fn fetch(
        &self,
        endpoint: &str,
        query: &Query,
        handle: Arc<dyn Hypervisor>,
    ) -> Result<Value> {
        let operation = query.operation();
        let key = query.fingerprint().to_string();
        let bucket = self.bucket(endpoint, operation);

        let mut rx = {
            let mut b = lock(&bucket);
            let now = Instant::now();
            let tick = b.tick();

            if let Some(entry) = b.entries.get_mut(&key) {
                if entry.is_fresh(now) {
                    entry.hits += 1;
                    entry.last_used = tick;
                    let value = entry.value.clone();
                    drop(b);
                    self.stats.record(endpoint, operation.as_str(), Outcome::Hit);
                    trace!(endpoint = %endpoint, operation = %operation, key = %key, "Cache hit");
                    return Ok(value);
                }
                entry.misses += 1;
            } else {
                *b.pending_misses.entry(key.clone()).or_insert(0) += 1;
            }

            match b.inflight.get(&key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    b.inflight.insert(key.clone(), rx.clone());
                    let epoch = b.epoch;
                    self.spawn_fetch(endpoint, query, handle, bucket.clone(), epoch, tx);
                    rx
                }
            }
        };

        self.stats.record(endpoint, operation.as_str(), Outcome::Miss);
        debug!(endpoint = %endpoint, operation = %operation, key = %key, "Cache miss");

        let lost = || EngineError::RemoteCallFailed {
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            diagnostic: "fetch ended without a result".to_string(),
        };
        let shared = rx.wait_for(|v| v.is_some()).await.map_err(|_| lost())?;
        let result = shared.clone();
        result.unwrap_or_else(|| Err(lost()))
    }

    fn spawn_fetch(
        &self,
        endpoint: &str,
        query: &Query,
        handle: Arc<dyn Hypervisor>,
        bucket: Arc<Mutex<Bucket>>,
        epoch: u64,
        tx: watch::Sender<Shared>,
    ) {
        let endpoint = endpoint.to_string();
        let query = query.clone();
        let stats = self.stats.clone();
        let policy = self.policy();

        tokio::spawn(async move {
            let operation = query.operation();
            let key = query.fingerprint().to_string();

            let result = query
                .execute(handle.as_ref())
                .await
                .map_err(|e| EngineError::remote(&endpoint, operation.as_str(), e));
            stats.record(&endpoint, operation.as_str(), Outcome::RemoteCall);

            {
                let mut b = lock(&bucket);
                b.inflight.remove(&key);
                let pending = b.pending_misses.remove(&key).unwrap_or(0);

                match &result {
                    Ok(value) if b.epoch == epoch => {
                        let mut tags = value.domain_tags();
                        if let Some(uuid) = query.domain() {
                            tags.insert(uuid.to_string());
                        }
                        let tick = b.tick();
                        let (hits, misses) = b
                            .entries
                            .get(&key)
                            .map(|old| (old.hits, old.misses))
                            .unwrap_or((0, 0));
                        b.entries.insert(
                            key.clone(),
                            Entry {
                                value: value.clone(),
                                created: Instant::now(),
                                ttl: policy.ttl(operation),
                                hits,
                                misses: misses + pending,
                                tags,
                                last_used: tick,
                            },
                        );
                        b.evict_to(policy.capacity_per_bucket());
                    }
                    Ok(_) => {
                        debug!(
                            endpoint = %endpoint,
                            operation = %operation,
                            key = %key,
                            "Invalidated while in flight, not caching"
                        );
                    }
                    Err(e) => {
                        debug!(endpoint = %endpoint, operation = %operation, error = %e, "Fetch failed");
                    }
                }
            }

            let _ = tx.send(Some(result));
        });
    }

    /// Drop entries of `endpoint`.
    ///
    /// With an `operation`, only that bucket is touched; with a `domain`,
    /// only entries tagged with that domain are dropped. Returns the number
    /// of entries removed.
    pub fn invalidate(
        &self,
        endpoint: &str,
        operation: Option<Operation>,
        domain: Option<&str>,
    ) -> usize {
        let buckets = match operation {
            Some(op) => self
                .buckets
                .read()
                .ok()
                .and_then(|b| b.get(&(endpoint.to_string(), op)).cloned())
                .into_iter()
                .collect(),
            None => self.endpoint_buckets(endpoint),
        };

        let removed: usize = buckets.iter().map(|b| lock(b).invalidate(domain)).sum();
        debug!(
            endpoint = %endpoint,
            operation = ?operation,
            domain = ?domain,
            removed,
            "Cache invalidated"
        );
        removed
    }

    /// Hit/miss counters of the entry for `query`, if cached.
    pub fn entry_counters(&self, endpoint: &str, query: &Query) -> Option<EntryCounters> {
        let bucket = self
            .buckets
            .read()
            .ok()?
            .get(&(endpoint.to_string(), query.operation()))
            .cloned()?;
        let b = lock(&bucket);
        b.entries.get(query.fingerprint()).map(|e| EntryCounters {
            hits: e.hits,
            misses: e.misses,
        })
    }

    /// Number of cached entries of an endpoint.
    pub fn len(&self, endpoint: &str) -> usize {
        self.endpoint_buckets(endpoint)
            .iter()
            .map(|b| lock(b).entries.len())
            .sum()
    }

    pub fn is_empty(&self, endpoint: &str) -> bool {
        self.len(endpoint) == 0
    }

    /// Release every entry.
    pub fn clear(&self) {
        let buckets: Vec<_> = match self.buckets.write() {
            Ok(mut buckets) => buckets.drain().map(|(_, b)| b).collect(),
            Err(_) => return,
        };
        for bucket in buckets {
            lock(&bucket).invalidate(None);
        }
        debug!("Cache cleared");
    }
}
