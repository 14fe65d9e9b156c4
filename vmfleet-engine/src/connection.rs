//! Connection manager.
//!
//! Owns the transport handle of every endpoint. Connect attempts are
//! bounded by a timeout, cancellable, and never retried automatically.
//! Each endpoint has its own slot and lock, so a slow or dead endpoint
//! never holds up the others.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vmfleet_hypervisor::uri::server_name;
use vmfleet_hypervisor::{Connector, Hypervisor, HypervisorError};

use crate::cache::Cache;
use crate::config::EndpointConfig;
use crate::error::{EngineError, Result};
use crate::events::{ConnectionLoss, EventDispatcher};

/// Connection status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Listing row of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub name: String,
    pub uri: String,
    /// Host name shown to users
    pub server_name: String,
    pub autoconnect: bool,
    pub status: EndpointStatus,
    pub last_error: Option<String>,
}

/// Notified when an endpoint goes away, explicitly or not.
pub trait ConnectionObserver: Send + Sync {
    fn endpoint_lost(&self, endpoint: &str, reason: &str);
}

struct SlotState {
    status: EndpointStatus,
    last_error: Option<String>,
    handle: Option<Arc<dyn Hypervisor>>,
    /// Bumped on every successful connect
    generation: u64,
}

struct EndpointSlot {
    config: EndpointConfig,
    state: RwLock<SlotState>,
    /// Serializes connect and disconnect of this endpoint only
    lifecycle: tokio::sync::Mutex<()>,
    attempt: Mutex<Option<CancellationToken>>,
}

impl EndpointSlot {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            state: RwLock::new(SlotState {
                status: EndpointStatus::Disconnected,
                last_error: None,
                handle: None,
                generation: 0,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            attempt: Mutex::new(None),
        }
    }

    fn update(&self, f: impl FnOnce(&mut SlotState)) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        f(&mut state);
    }

    fn read<T>(&self, f: impl FnOnce(&SlotState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        f(&state)
    }
}

/// Manages the connections to all configured endpoints.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slots: RwLock<BTreeMap<String, Arc<EndpointSlot>>>,
    cache: Arc<Cache>,
    dispatcher: Arc<EventDispatcher>,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
    connect_timeout: RwLock<Duration>,
}

impl ConnectionManager {
    /// Create the manager and start listening for connection losses
    /// reported by the dispatcher. Must be called inside a Tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Arc<Cache>,
        dispatcher: Arc<EventDispatcher>,
        losses: mpsc::UnboundedReceiver<ConnectionLoss>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            connector,
            slots: RwLock::new(BTreeMap::new()),
            cache,
            dispatcher,
            observers: Mutex::new(Vec::new()),
            connect_timeout: RwLock::new(connect_timeout),
        });
        Self::spawn_loss_listener(Arc::downgrade(&manager), losses);
        manager
    }

    fn spawn_loss_listener(
        manager: Weak<Self>,
        mut losses: mpsc::UnboundedReceiver<ConnectionLoss>,
    ) {
        tokio::spawn(async move {
            while let Some(loss) = losses.recv().await {
                match manager.upgrade() {
                    Some(manager) => manager.connection_lost(loss).await,
                    None => break,
                }
            }
        });
    }

    pub fn add_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    fn notify_lost(&self, endpoint: &str, reason: &str) {
        let observers: Vec<Arc<dyn ConnectionObserver>> = match self.observers.lock() {
            Ok(mut observers) => {
                observers.retain(|o| o.strong_count() > 0);
                observers.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return,
        };
        for observer in observers {
            observer.endpoint_lost(endpoint, reason);
        }
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        if let Ok(mut t) = self.connect_timeout.write() {
            *t = timeout;
        }
    }

    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
            .read()
            .map(|t| *t)
            .unwrap_or(Duration::from_secs(10))
    }

    fn slot(&self, endpoint: &str) -> Result<Arc<EndpointSlot>> {
        self.slots
            .read()
            .ok()
            .and_then(|slots| slots.get(endpoint).cloned())
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_string()))
    }

    // =========================================================================
    // Endpoint set
    // =========================================================================

    pub fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        let mut slots = self
            .slots
            .write()
            .map_err(|_| EngineError::InvalidConfig("endpoint table unavailable".to_string()))?;
        if slots.contains_key(&config.name) {
            return Err(EngineError::InvalidConfig(format!(
                "endpoint '{}' already exists",
                config.name
            )));
        }
        info!(endpoint = %config.name, uri = %config.uri, "Endpoint added");
        slots.insert(config.name.clone(), Arc::new(EndpointSlot::new(config)));
        Ok(())
    }

    /// Disconnect and forget an endpoint.
    pub async fn remove_endpoint(&self, endpoint: &str) -> Result<()> {
        self.disconnect(endpoint).await?;
        if let Ok(mut slots) = self.slots.write() {
            slots.remove(endpoint);
        }
        info!(endpoint = %endpoint, "Endpoint removed");
        Ok(())
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let slots: Vec<Arc<EndpointSlot>> = self
            .slots
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        slots
            .iter()
            .map(|slot| {
                slot.read(|state| EndpointInfo {
                    name: slot.config.name.clone(),
                    uri: slot.config.uri.clone(),
                    server_name: server_name(&slot.config.uri),
                    autoconnect: slot.config.autoconnect,
                    status: state.status,
                    last_error: state.last_error.clone(),
                })
            })
            .collect()
    }

    pub fn config(&self, endpoint: &str) -> Result<EndpointConfig> {
        Ok(self.slot(endpoint)?.config.clone())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn status(&self, endpoint: &str) -> Result<EndpointStatus> {
        Ok(self.slot(endpoint)?.read(|s| s.status))
    }

    pub fn last_error(&self, endpoint: &str) -> Result<Option<String>> {
        Ok(self.slot(endpoint)?.read(|s| s.last_error.clone()))
    }

    /// Live transport handle of a connected endpoint.
    pub fn handle(&self, endpoint: &str) -> Result<Arc<dyn Hypervisor>> {
        self.slot(endpoint)?
            .read(|s| s.handle.clone())
            .ok_or_else(|| EngineError::NotConnected(endpoint.to_string()))
    }

    /// Connect an endpoint. A no-op when it is already connected.
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let slot = self.slot(endpoint)?;
        let _lifecycle = slot.lifecycle.lock().await;

        if slot.read(|s| s.status == EndpointStatus::Connected) {
            debug!("Already connected");
            return Ok(());
        }

        let token = CancellationToken::new();
        if let Ok(mut attempt) = slot.attempt.lock() {
            *attempt = Some(token.clone());
        }
        slot.update(|s| {
            s.status = EndpointStatus::Connecting;
            s.last_error = None;
        });

        let timeout = self.connect_timeout();
        info!(uri = %slot.config.uri, timeout_secs = timeout.as_secs(), "Connecting");

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(timeout, self.connector.open(&slot.config.uri)) => Some(result),
        };

        if let Ok(mut attempt) = slot.attempt.lock() {
            *attempt = None;
        }

        let handle = match outcome {
            Some(Ok(Ok(handle))) => handle,
            Some(Ok(Err(e))) => {
                warn!(error = %e, "Connect failed");
                slot.update(|s| {
                    s.status = EndpointStatus::Error;
                    s.last_error = Some(e.to_string());
                });
                return Err(match e {
                    HypervisorError::AuthenticationFailed(reason) => EngineError::AuthenticationFailed {
                        endpoint: endpoint.to_string(),
                        reason,
                    },
                    other => EngineError::EndpointUnreachable {
                        endpoint: endpoint.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
            Some(Err(_)) => {
                warn!(timeout_secs = timeout.as_secs(), "Connect timed out");
                slot.update(|s| {
                    s.status = EndpointStatus::Error;
                    s.last_error = Some("timeout".to_string());
                });
                return Err(EngineError::EndpointUnreachable {
                    endpoint: endpoint.to_string(),
                    reason: "timeout".to_string(),
                });
            }
            None => {
                info!("Connect cancelled");
                slot.update(|s| {
                    s.status = EndpointStatus::Disconnected;
                    s.last_error = Some("cancelled".to_string());
                });
                return Err(EngineError::EndpointUnreachable {
                    endpoint: endpoint.to_string(),
                    reason: "cancelled".to_string(),
                });
            }
        };

        let mut generation = 0;
        slot.update(|s| {
            s.generation += 1;
            generation = s.generation;
            s.status = EndpointStatus::Connected;
            s.handle = Some(handle.clone());
        });
        info!(generation, "Connected");

        // a connection without events still serves reads
        if let Err(e) = self.dispatcher.attach(endpoint, generation, handle).await {
            warn!(error = %e, "Connected without lifecycle events");
        }

        Ok(())
    }

    /// Abort a pending connect attempt.
    pub fn cancel_connect(&self, endpoint: &str) -> Result<bool> {
        let slot = self.slot(endpoint)?;
        let token = slot.attempt.lock().ok().and_then(|a| a.clone());
        Ok(match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        })
    }

    /// Disconnect an endpoint. A no-op when it is not connected.
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn disconnect(&self, endpoint: &str) -> Result<()> {
        let slot = self.slot(endpoint)?;
        self.cancel_connect(endpoint)?;
        let _lifecycle = slot.lifecycle.lock().await;

        let mut handle = None;
        slot.update(|s| {
            handle = s.handle.take();
            s.status = EndpointStatus::Disconnected;
        });

        match handle {
            Some(handle) => {
                self.release(endpoint, "disconnected", handle).await;
                info!("Disconnected");
            }
            None => debug!("Not connected"),
        }
        Ok(())
    }

    /// Disconnect every endpoint.
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self
            .slots
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        let results = futures::future::join_all(names.iter().map(|n| self.disconnect(n))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                error!(endpoint = %name, error = %e, "Disconnect failed");
            }
        }
    }

    /// The event stream of a connection failed.
    async fn connection_lost(&self, loss: ConnectionLoss) {
        let slot = match self.slot(&loss.endpoint) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        let _lifecycle = slot.lifecycle.lock().await;

        let mut handle = None;
        slot.update(|s| {
            if s.generation == loss.generation && s.status == EndpointStatus::Connected {
                handle = s.handle.take();
                s.status = EndpointStatus::Error;
                s.last_error = Some(format!("connection lost: {}", loss.reason));
            }
        });

        match handle {
            Some(handle) => {
                warn!(endpoint = %loss.endpoint, reason = %loss.reason, "Connection lost");
                self.release(&loss.endpoint, &loss.reason, handle).await;
            }
            None => debug!(endpoint = %loss.endpoint, "Stale connection loss ignored"),
        }
    }

    async fn release(&self, endpoint: &str, reason: &str, handle: Arc<dyn Hypervisor>) {
        self.dispatcher.detach(endpoint);
        self.cache.invalidate(endpoint, None, None);
        self.notify_lost(endpoint, reason);
        if let Err(e) = handle.close().await {
            debug!(endpoint = %endpoint, error = %e, "Error closing handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::events::SubscriptionState;
    use crate::query::Query;
    use crate::stats::StatsAggregator;
    use vmfleet_hypervisor::{ConnectBehavior, MockCluster};

    struct Harness {
        cluster: Arc<MockCluster>,
        manager: Arc<ConnectionManager>,
        cache: Arc<Cache>,
        dispatcher: Arc<EventDispatcher>,
    }

    fn harness(endpoints: &[(&str, &str)]) -> Harness {
        let cluster = Arc::new(MockCluster::new());
        let stats = Arc::new(StatsAggregator::new());
        let cache = Arc::new(Cache::new(CachePolicy::default(), stats.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(EventDispatcher::new(cache.clone(), stats, tx, 64));
        let manager = ConnectionManager::new(
            cluster.clone(),
            cache.clone(),
            dispatcher.clone(),
            rx,
            Duration::from_secs(10),
        );
        for (name, uri) in endpoints {
            cluster.add_host(uri);
            manager.add_endpoint(EndpointConfig::new(*name, *uri)).unwrap();
        }
        Harness { cluster, manager, cache, dispatcher }
    }

    struct Recorder(Mutex<Vec<String>>);

    impl ConnectionObserver for Recorder {
        fn endpoint_lost(&self, endpoint: &str, _reason: &str) {
            self.0.lock().unwrap().push(endpoint.to_string());
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let h = harness(&[("e1", "qemu+ssh://e1/system")]);
        h.manager.connect("e1").await.unwrap();
        h.manager.connect("e1").await.unwrap();

        assert_eq!(h.manager.status("e1").unwrap(), EndpointStatus::Connected);
        assert_eq!(h.cluster.opens("qemu+ssh://e1/system"), 1);
        assert!(h.manager.handle("e1").is_ok());
        assert_eq!(h.dispatcher.state("e1"), SubscriptionState::Subscribed);
    }

    #[tokio::test]
    async fn test_unknown_and_unconnected_endpoints() {
        let h = harness(&[("e1", "qemu+ssh://e1/system")]);
        assert!(matches!(h.manager.connect("nope").await, Err(EngineError::UnknownEndpoint(_))));
        assert!(matches!(h.manager.handle("e1"), Err(EngineError::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_sets_error_without_retry() {
        let h = harness(&[("e3", "qemu+ssh://e3/system")]);
        h.cluster.set_behavior("qemu+ssh://e3/system", ConnectBehavior::Hang);

        let err = h.manager.connect("e3").await.unwrap_err();
        assert!(matches!(err, EngineError::EndpointUnreachable { ref reason, .. } if reason == "timeout"));
        assert_eq!(h.manager.status("e3").unwrap(), EndpointStatus::Error);
        assert_eq!(h.manager.last_error("e3").unwrap().as_deref(), Some("timeout"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.cluster.opens("qemu+ssh://e3/system"), 1);
        assert_eq!(h.manager.status("e3").unwrap(), EndpointStatus::Error);
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let h = harness(&[("e1", "qemu+ssh://e1/system")]);
        h.cluster.set_behavior(
            "qemu+ssh://e1/system",
            ConnectBehavior::RejectCredentials("permission denied (publickey)".to_string()),
        );
        let err = h.manager.connect("e1").await.unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationFailed { .. }));
        assert_eq!(h.manager.status("e1").unwrap(), EndpointStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_endpoint_does_not_block_another() {
        let h = harness(&[("a", "qemu+ssh://a/system"), ("b", "qemu+ssh://b/system")]);
        h.cluster.set_behavior("qemu+ssh://a/system", ConnectBehavior::Hang);

        let manager = h.manager.clone();
        let slow = tokio::spawn(async move { manager.connect("a").await });

        let started = tokio::time::Instant::now();
        h.manager.connect("b").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.manager.status("a").unwrap(), EndpointStatus::Connecting);

        assert!(slow.await.unwrap().is_err());
        assert_eq!(h.manager.status("b").unwrap(), EndpointStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_connect() {
        let h = harness(&[("a", "qemu+ssh://a/system")]);
        h.cluster.set_behavior("qemu+ssh://a/system", ConnectBehavior::Hang);

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move { manager.connect("a").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.manager.cancel_connect("a").unwrap());
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::EndpointUnreachable { ref reason, .. } if reason == "cancelled"));
        assert_eq!(h.manager.status("a").unwrap(), EndpointStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_and_notifies() {
        let h = harness(&[("e1", "qemu+ssh://e1/system")]);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let observer: Arc<dyn ConnectionObserver> = recorder.clone();
        h.manager.add_observer(Arc::downgrade(&observer));

        h.manager.connect("e1").await.unwrap();
        let handle = h.manager.handle("e1").unwrap();
        h.cache.fetch("e1", &Query::StoragePools, handle).await.unwrap();
        assert!(!h.cache.is_empty("e1"));

        h.manager.disconnect("e1").await.unwrap();
        assert!(h.cache.is_empty("e1"));
        assert_eq!(h.manager.status("e1").unwrap(), EndpointStatus::Disconnected);
        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["e1".to_string()]);
        assert_eq!(h.dispatcher.state("e1"), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_connection_loss_from_event_stream() {
        let h = harness(&[("e1", "qemu+ssh://e1/system")]);
        h.manager.connect("e1").await.unwrap();

        let host = h.cluster.host("qemu+ssh://e1/system").unwrap();
        host.simulate_loss("broken pipe");

        for _ in 0..100 {
            if h.manager.status("e1").unwrap() == EndpointStatus::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.manager.status("e1").unwrap(), EndpointStatus::Error);
        assert!(h.manager.last_error("e1").unwrap().unwrap().contains("broken pipe"));

        // explicit reconnect brings it back and resubscribes
        h.manager.connect("e1").await.unwrap();
        assert_eq!(h.manager.status("e1").unwrap(), EndpointStatus::Connected);
        assert_eq!(h.dispatcher.state("e1"), SubscriptionState::Subscribed);
    }

    #[tokio::test]
    async fn test_endpoint_listing() {
        let h = harness(&[("local", "qemu:///system"), ("n2", "qemu+ssh://root@node2/system")]);
        let list = h.manager.endpoints();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].server_name, "Local");
        assert_eq!(list[1].server_name, "node2");

        assert!(h.manager.add_endpoint(EndpointConfig::new("n2", "qemu:///x")).is_err());
        h.manager.remove_endpoint("n2").await.unwrap();
        assert_eq!(h.manager.endpoints().len(), 1);
    }
}
