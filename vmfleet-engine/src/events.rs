//! Event subscriber and dispatcher.
//!
//! One receiver loop per connected endpoint reads the endpoint's raw
//! lifecycle stream, normalizes each notification, invalidates the cache
//! for the domain and fans the event out to bounded consumer queues.
//! A full queue drops its oldest event; drops are counted in the
//! statistics.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vmfleet_hypervisor::{lifecycle, Hypervisor, RawDomainEvent};

use crate::cache::Cache;
use crate::error::{EngineError, Result};
use crate::query::Operation;
use crate::stats::StatsAggregator;

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Defined,
    Undefined,
    Started,
    Stopped,
    Suspended,
    Resumed,
    Crashed,
}

impl EventKind {
    /// Map a raw lifecycle code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            lifecycle::DEFINED => Some(EventKind::Defined),
            lifecycle::UNDEFINED => Some(EventKind::Undefined),
            lifecycle::STARTED => Some(EventKind::Started),
            lifecycle::SUSPENDED | lifecycle::PMSUSPENDED => Some(EventKind::Suspended),
            lifecycle::RESUMED => Some(EventKind::Resumed),
            lifecycle::STOPPED | lifecycle::SHUTDOWN => Some(EventKind::Stopped),
            lifecycle::CRASHED => Some(EventKind::Crashed),
            _ => None,
        }
    }

    /// Whether the event changes the set of defined domains.
    pub fn changes_listing(&self) -> bool {
        matches!(self, EventKind::Defined | EventKind::Undefined)
    }
}

/// Normalized lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub endpoint: String,
    pub domain_uuid: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn normalize(endpoint: &str, raw: &RawDomainEvent) -> Option<Self> {
        EventKind::from_code(raw.code).map(|kind| Event {
            endpoint: endpoint.to_string(),
            domain_uuid: raw.domain_uuid.clone(),
            kind,
            timestamp: Utc::now(),
        })
    }
}

// =============================================================================
// CONSUMERS
// =============================================================================

struct ConsumerQueue {
    endpoint: Option<String>,
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl ConsumerQueue {
    fn wants(&self, event: &Event) -> bool {
        self.endpoint.as_deref().map_or(true, |ep| ep == event.endpoint)
    }

    /// Returns whether an older event had to be dropped.
    fn push(&self, event: Event) -> bool {
        let dropped = {
            let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
            let dropped = if events.len() >= self.capacity {
                events.pop_front();
                true
            } else {
                false
            };
            events.push_back(event);
            dropped
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Event> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }
}

/// Receiving end of an event subscription.
///
/// Dropping it unregisters the consumer.
pub struct EventReceiver {
    queue: Arc<ConsumerQueue>,
}

impl EventReceiver {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.queue.pop() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Events dropped from this queue because it was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> EventStream {
        EventStream {
            inner: Box::pin(futures::stream::unfold(self, |mut rx| async move {
                let event = rx.recv().await;
                Some((event, rx))
            })),
        }
    }
}

/// [`Stream`] adapter over an [`EventReceiver`].
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.inner.as_mut().poll_next(cx)
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Per-endpoint subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// A subscription stream failed; the connection behind it is presumed lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLoss {
    pub endpoint: String,
    /// Connection generation the subscription belonged to
    pub generation: u64,
    pub reason: String,
}

struct Subscription {
    state: SubscriptionState,
    generation: u64,
    token: CancellationToken,
}

/// Turns endpoint notifications into cache invalidations and consumer events.
pub struct EventDispatcher {
    cache: Arc<Cache>,
    stats: Arc<StatsAggregator>,
    consumers: Mutex<Vec<Weak<ConsumerQueue>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    loss_tx: mpsc::UnboundedSender<ConnectionLoss>,
    queue_capacity: AtomicUsize,
}

impl EventDispatcher {
    pub fn new(
        cache: Arc<Cache>,
        stats: Arc<StatsAggregator>,
        loss_tx: mpsc::UnboundedSender<ConnectionLoss>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            cache,
            stats,
            consumers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            loss_tx,
            queue_capacity: AtomicUsize::new(queue_capacity.max(1)),
        }
    }

    /// Capacity of queues created from now on.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.queue_capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    /// Register a consumer, optionally limited to one endpoint.
    pub fn subscribe(&self, endpoint: Option<&str>) -> EventReceiver {
        let queue = Arc::new(ConsumerQueue {
            endpoint: endpoint.map(str::to_string),
            capacity: self.queue_capacity.load(Ordering::Relaxed),
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let mut consumers = self.consumers.lock().unwrap_or_else(|p| p.into_inner());
        consumers.retain(|c| c.strong_count() > 0);
        consumers.push(Arc::downgrade(&queue));
        EventReceiver { queue }
    }

    pub fn state(&self, endpoint: &str) -> SubscriptionState {
        self.subscriptions
            .lock()
            .ok()
            .and_then(|s| s.get(endpoint).map(|sub| sub.state))
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    fn set_state(&self, endpoint: &str, generation: u64, state: SubscriptionState) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            if let Some(sub) = subs.get_mut(endpoint) {
                if sub.generation == generation {
                    sub.state = state;
                }
            }
        }
    }

    /// Subscribe to a freshly connected endpoint and start its receiver loop.
    #[instrument(skip(self, handle), fields(endpoint = %endpoint))]
    pub async fn attach(
        self: &Arc<Self>,
        endpoint: &str,
        generation: u64,
        handle: Arc<dyn Hypervisor>,
    ) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut subs = self
                .subscriptions
                .lock()
                .map_err(|_| EngineError::NotConnected(endpoint.to_string()))?;
            if let Some(previous) = subs.insert(
                endpoint.to_string(),
                Subscription {
                    state: SubscriptionState::Subscribing,
                    generation,
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        let mut stream = match handle.subscribe_events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Event subscription failed");
                self.set_state(endpoint, generation, SubscriptionState::Unsubscribed);
                return Err(EngineError::remote(endpoint, "subscribe_events", e));
            }
        };

        self.set_state(endpoint, generation, SubscriptionState::Subscribed);
        info!("Subscribed to lifecycle events");

        let dispatcher = self.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.recv() => item,
                };
                match item {
                    Some(Ok(raw)) => dispatcher.dispatch(&endpoint, &raw),
                    Some(Err(e)) => {
                        warn!(endpoint = %endpoint, error = %e, "Event stream failed");
                        dispatcher.set_state(&endpoint, generation, SubscriptionState::Unsubscribed);
                        let _ = dispatcher.loss_tx.send(ConnectionLoss {
                            endpoint: endpoint.clone(),
                            generation,
                            reason: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        debug!(endpoint = %endpoint, "Event stream ended");
                        dispatcher.set_state(&endpoint, generation, SubscriptionState::Unsubscribed);
                        break;
                    }
                }
            }
            debug!(endpoint = %endpoint, "Event receiver loop stopped");
        });

        Ok(())
    }

    /// Stop the receiver loop of an endpoint.
    pub fn detach(&self, endpoint: &str) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            if let Some(sub) = subs.remove(endpoint) {
                sub.token.cancel();
                debug!(endpoint = %endpoint, "Event subscription detached");
            }
        }
    }

    /// Process one raw notification: invalidate, then fan out.
    pub fn dispatch(&self, endpoint: &str, raw: &RawDomainEvent) {
        let event = match Event::normalize(endpoint, raw) {
            Some(event) => event,
            None => {
                warn!(
                    endpoint = %endpoint,
                    domain = %raw.domain_uuid,
                    code = raw.code,
                    "Skipping unknown lifecycle event"
                );
                return;
            }
        };

        debug!(endpoint = %endpoint, domain = %event.domain_uuid, kind = ?event.kind, "Lifecycle event");

        self.cache.invalidate(endpoint, None, Some(&event.domain_uuid));
        if event.kind.changes_listing() {
            self.cache.invalidate(endpoint, Some(Operation::ListDomains), None);
        }

        let consumers: Vec<Arc<ConsumerQueue>> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|p| p.into_inner());
            consumers.retain(|c| c.strong_count() > 0);
            consumers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut dropped = 0;
        for consumer in consumers.iter().filter(|c| c.wants(&event)) {
            if consumer.push(event.clone()) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.stats.record_dropped(endpoint, dropped);
        }
    }
}
