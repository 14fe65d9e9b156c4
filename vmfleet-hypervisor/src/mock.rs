//! Mock hypervisor backend for testing and development.
//!
//! [`MockBackend`] keeps domains, pools and volumes in memory and emits
//! lifecycle events for its own mutations. [`MockCluster`] maps URIs to
//! backends and plays the role of the transport, so several simulated
//! hosts can talk to each other during a migration.
//!
//! Both carry knobs for tests: call counters, latency, failure injection,
//! connect behaviour and event stream breakage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, DomainEventStream, Hypervisor, MigrationTarget};
use crate::types::*;
use crate::xml::{parse_domain, DomainXmlBuilder};

const EVENT_BUFFER: usize = 256;

fn poisoned<T>(_: T) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

#[derive(Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    pools: BTreeMap<String, MockPool>,
    capabilities: HostCapabilities,
}

struct MockDomain {
    record: DomainRecord,
    cpu_time_ns: u64,
}

struct MockPool {
    info: PoolInfo,
    volumes: BTreeMap<String, VolumeInfo>,
}

struct InjectedFailure {
    error: HypervisorError,
    /// Remaining failing calls, `None` for every call
    remaining: Option<u32>,
}

/// In-memory hypervisor endpoint.
pub struct MockBackend {
    uri: String,
    state: RwLock<MockState>,
    calls: Mutex<HashMap<String, u64>>,
    failures: Mutex<HashMap<String, InjectedFailure>>,
    latency: Mutex<Duration>,
    migration_time: Mutex<Duration>,
    subscribers: Mutex<Vec<mpsc::Sender<Result<RawDomainEvent>>>>,
    migrations: Mutex<HashMap<String, Arc<Notify>>>,
    closed: AtomicBool,
}

impl MockBackend {
    /// Create an empty mock endpoint for `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        debug!(uri = %uri, "Creating mock hypervisor backend");
        Self {
            state: RwLock::new(MockState {
                capabilities: HostCapabilities {
                    hostname: crate::uri::server_name(&uri),
                    arch: "x86_64".to_string(),
                    cpu_model: "Skylake-Server".to_string(),
                    cpu_vendor: "Intel".to_string(),
                    cpu_features: ["sse4.2", "avx", "avx2", "vmx", "aes"]
                        .iter()
                        .map(|f| f.to_string())
                        .collect(),
                    cpu_cores: 16,
                    memory_bytes: 64 * 1024 * 1024 * 1024,
                    hypervisor: "QEMU 8.2.0 (mock)".to_string(),
                },
                ..Default::default()
            }),
            uri,
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            migration_time: Mutex::new(Duration::from_millis(10)),
            subscribers: Mutex::new(Vec::new()),
            migrations: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A host with a local pool and a couple of domains, for development.
    pub fn with_demo_data(uri: impl Into<String>) -> Self {
        let backend = Self::new(uri);
        let host = crate::uri::server_name(&backend.uri);
        let pool_path = "/var/lib/libvirt/images".to_string();

        backend.add_pool(PoolInfo {
            name: "default".to_string(),
            kind: PoolKind::Dir,
            active: true,
            target_path: Some(pool_path.clone()),
            capacity_bytes: 500 * 1024 * 1024 * 1024,
            available_bytes: 350 * 1024 * 1024 * 1024,
        });

        for (i, state) in [DomainState::Running, DomainState::Stopped].into_iter().enumerate() {
            let name = format!("{}-vm{}", host, i + 1);
            let image = format!("{}.qcow2", name);
            backend.add_volume(VolumeInfo {
                name: image.clone(),
                pool: "default".to_string(),
                path: format!("{}/{}", pool_path, image),
                format: DiskFormat::Qcow2,
                capacity_bytes: 20 * 1024 * 1024 * 1024,
                allocation_bytes: 4 * 1024 * 1024 * 1024,
                backing_path: None,
            });
            let mut record = sample_domain(&name, state);
            record.disks[0].path = format!("{}/{}", pool_path, image);
            backend.add_domain(record);
        }

        backend
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    /// Insert a domain without emitting events.
    pub fn add_domain(&self, record: DomainRecord) {
        if let Ok(mut state) = self.state.write() {
            state.domains.insert(
                record.uuid.clone(),
                MockDomain { record, cpu_time_ns: 0 },
            );
        }
    }

    pub fn add_pool(&self, info: PoolInfo) {
        if let Ok(mut state) = self.state.write() {
            state.pools.insert(
                info.name.clone(),
                MockPool { info, volumes: BTreeMap::new() },
            );
        }
    }

    /// Insert a volume into an existing pool.
    pub fn add_volume(&self, volume: VolumeInfo) {
        if let Ok(mut state) = self.state.write() {
            if let Some(pool) = state.pools.get_mut(&volume.pool) {
                pool.volumes.insert(volume.name.clone(), volume);
            }
        }
    }

    pub fn set_capabilities(&self, capabilities: HostCapabilities) {
        if let Ok(mut state) = self.state.write() {
            state.capabilities = capabilities;
        }
    }

    /// Current definition of a domain, bypassing counters and failures.
    pub fn domain(&self, uuid: &str) -> Option<DomainRecord> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.domains.get(uuid).map(|d| d.record.clone()))
    }

    /// Volumes of a pool, bypassing counters and failures.
    pub fn volumes(&self, pool: &str) -> Vec<VolumeInfo> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.pools.get(pool).map(|p| p.volumes.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Change a domain's state out of band, emitting the matching event.
    pub fn set_domain_state(&self, uuid: &str, new_state: DomainState) {
        let code = match new_state {
            DomainState::Running => lifecycle::STARTED,
            DomainState::Paused => lifecycle::SUSPENDED,
            DomainState::Suspended => lifecycle::PMSUSPENDED,
            DomainState::Stopped => lifecycle::STOPPED,
            DomainState::Crashed => lifecycle::CRASHED,
            DomainState::Unknown => return,
        };
        let changed = match self.state.write() {
            Ok(mut state) => match state.domains.get_mut(uuid) {
                Some(domain) => {
                    domain.record.state = new_state;
                    true
                }
                None => false,
            },
            Err(_) => false,
        };
        if changed {
            self.emit(uuid, code);
        }
    }

    // =========================================================================
    // Test knobs
    // =========================================================================

    /// Number of calls made to `operation` (the trait method name).
    pub fn calls(&self, operation: &str) -> u64 {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.get(operation).copied())
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// Make every call to `operation` fail with `error`.
    pub fn fail(&self, operation: &str, error: HypervisorError) {
        self.inject(operation, error, None);
    }

    /// Make the next call to `operation` fail with `error`.
    pub fn fail_once(&self, operation: &str, error: HypervisorError) {
        self.inject(operation, error, Some(1));
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    fn inject(&self, operation: &str, error: HypervisorError, remaining: Option<u32>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(operation.to_string(), InjectedFailure { error, remaining });
        }
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    /// Time a migration takes before the domain lands on the destination.
    pub fn set_migration_time(&self, duration: Duration) {
        if let Ok(mut t) = self.migration_time.lock() {
            *t = duration;
        }
    }

    /// Push a raw event to every subscriber.
    pub fn inject_event(&self, event: RawDomainEvent) {
        self.broadcast(Ok(event));
    }

    /// End every event stream with a connection error.
    pub fn break_event_streams(&self, reason: &str) {
        let subscribers = match self.subscribers.lock() {
            Ok(mut subs) => std::mem::take(&mut *subs),
            Err(_) => return,
        };
        for tx in subscribers {
            let _ = tx.try_send(Err(HypervisorError::Disconnected(reason.to_string())));
        }
    }

    /// Simulate the endpoint going away: calls fail and event streams break.
    pub fn simulate_loss(&self, reason: &str) {
        warn!(uri = %self.uri, reason = %reason, "Simulating endpoint loss");
        self.closed.store(true, Ordering::SeqCst);
        self.break_event_streams(reason);
    }

    /// Make the endpoint reachable again after [`close`] or a simulated loss.
    ///
    /// [`close`]: Hypervisor::close
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Bookkeeping done at the start of every call.
    async fn enter(&self, operation: &str) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(operation.to_string()).or_insert(0) += 1;
        }

        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.is_closed() {
            return Err(HypervisorError::Disconnected(format!("{} is closed", self.uri)));
        }

        let mut failures = self.failures.lock().map_err(poisoned)?;
        if let Some(failure) = failures.get_mut(operation) {
            let error = failure.error.clone();
            match failure.remaining.as_mut() {
                Some(n) if *n <= 1 => {
                    failures.remove(operation);
                }
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(error);
        }
        Ok(())
    }

    fn emit(&self, uuid: &str, code: i32) {
        self.broadcast(Ok(RawDomainEvent {
            domain_uuid: uuid.to_string(),
            code,
            detail: 0,
        }));
    }

    fn broadcast(&self, item: Result<RawDomainEvent>) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| match tx.try_send(item.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(uri = %self.uri, "Mock event subscriber is full, event lost");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn with_domain<T>(&self, uuid: &str, f: impl FnOnce(&mut MockDomain) -> Result<T>) -> Result<T> {
        let mut state = self.state.write().map_err(poisoned)?;
        let domain = state
            .domains
            .get_mut(uuid)
            .ok_or_else(|| HypervisorError::DomainNotFound(uuid.to_string()))?;
        f(domain)
    }
}

/// A small domain definition for fixtures.
pub fn sample_domain(name: &str, state: DomainState) -> DomainRecord {
    DomainRecord {
        uuid: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        state,
        vcpus: 2,
        memory_mib: 2048,
        cpu_mode: CpuMode::HostModel,
        required_cpu_features: Vec::new(),
        persistent: true,
        disks: vec![DomainDisk {
            target: "vda".to_string(),
            path: format!("/var/lib/libvirt/images/{}.qcow2", name),
            format: DiskFormat::Qcow2,
            pool: None,
            volume: None,
            readonly: false,
        }],
        nics: vec![DomainNic {
            mac: None,
            kind: "network".to_string(),
            source: Some("default".to_string()),
            model: Some("virtio".to_string()),
        }],
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn health_check(&self) -> Result<bool> {
        self.enter("health_check").await?;
        Ok(true)
    }

    async fn host_capabilities(&self) -> Result<HostCapabilities> {
        self.enter("host_capabilities").await?;
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.capabilities.clone())
    }

    async fn list_domains(&self) -> Result<Vec<DomainSummary>> {
        self.enter("list_domains").await?;
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.domains.values().map(|d| d.record.summary()).collect())
    }

    async fn domain_info(&self, uuid: &str) -> Result<DomainRecord> {
        self.enter("domain_info").await?;
        self.with_domain(uuid, |d| Ok(d.record.clone()))
    }

    async fn domain_xml(&self, uuid: &str) -> Result<String> {
        self.enter("domain_xml").await?;
        self.with_domain(uuid, |d| Ok(DomainXmlBuilder::new(&d.record).build()))
    }

    #[instrument(skip(self, xml), fields(uri = %self.uri))]
    async fn define_domain(&self, xml: &str) -> Result<String> {
        self.enter("define_domain").await?;
        let mut record = parse_domain(xml)?;
        if record.uuid.is_empty() {
            record.uuid = uuid::Uuid::new_v4().to_string();
        }

        let uuid = record.uuid.clone();
        {
            let mut state = self.state.write().map_err(poisoned)?;
            if let Some(other) = state
                .domains
                .values()
                .find(|d| d.record.name == record.name && d.record.uuid != uuid)
            {
                return Err(HypervisorError::OperationFailed(format!(
                    "domain '{}' already exists with uuid {}",
                    record.name, other.record.uuid
                )));
            }

            match state.domains.get_mut(&uuid) {
                Some(existing) => {
                    record.state = existing.record.state;
                    record.persistent = true;
                    existing.record = record;
                }
                None => {
                    record.state = DomainState::Stopped;
                    record.persistent = true;
                    state.domains.insert(uuid.clone(), MockDomain { record, cpu_time_ns: 0 });
                }
            }
        }

        info!(domain = %uuid, "Mock domain defined");
        self.emit(&uuid, lifecycle::DEFINED);
        Ok(uuid)
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn undefine_domain(&self, uuid: &str) -> Result<()> {
        self.enter("undefine_domain").await?;
        {
            let mut state = self.state.write().map_err(poisoned)?;
            let active = state
                .domains
                .get(uuid)
                .map(|d| d.record.state.is_active())
                .ok_or_else(|| HypervisorError::DomainNotFound(uuid.to_string()))?;
            if active {
                // a running domain stays around as a transient one
                if let Some(d) = state.domains.get_mut(uuid) {
                    d.record.persistent = false;
                }
            } else {
                state.domains.remove(uuid);
            }
        }
        info!(domain = %uuid, "Mock domain undefined");
        self.emit(uuid, lifecycle::UNDEFINED);
        Ok(())
    }

    async fn start_domain(&self, uuid: &str) -> Result<()> {
        self.enter("start_domain").await?;
        self.with_domain(uuid, |d| {
            if d.record.state == DomainState::Running {
                return Err(HypervisorError::InvalidState("domain is already running".to_string()));
            }
            d.record.state = DomainState::Running;
            Ok(())
        })?;
        self.emit(uuid, lifecycle::STARTED);
        Ok(())
    }

    async fn destroy_domain(&self, uuid: &str) -> Result<()> {
        self.enter("destroy_domain").await?;
        self.with_domain(uuid, |d| {
            if !d.record.state.is_active() {
                return Err(HypervisorError::InvalidState("domain is not running".to_string()));
            }
            d.record.state = DomainState::Stopped;
            Ok(())
        })?;
        self.emit(uuid, lifecycle::STOPPED);
        Ok(())
    }

    async fn suspend_domain(&self, uuid: &str) -> Result<()> {
        self.enter("suspend_domain").await?;
        self.with_domain(uuid, |d| {
            if d.record.state != DomainState::Running {
                return Err(HypervisorError::InvalidState("domain is not running".to_string()));
            }
            d.record.state = DomainState::Paused;
            Ok(())
        })?;
        self.emit(uuid, lifecycle::SUSPENDED);
        Ok(())
    }

    async fn resume_domain(&self, uuid: &str) -> Result<()> {
        self.enter("resume_domain").await?;
        self.with_domain(uuid, |d| {
            if d.record.state != DomainState::Paused {
                return Err(HypervisorError::InvalidState("domain is not paused".to_string()));
            }
            d.record.state = DomainState::Running;
            Ok(())
        })?;
        self.emit(uuid, lifecycle::RESUMED);
        Ok(())
    }

    async fn domain_stats(&self, uuid: &str) -> Result<DomainStats> {
        self.enter("domain_stats").await?;
        self.with_domain(uuid, |d| {
            let active = d.record.state.is_active();
            if active {
                d.cpu_time_ns += 1_000_000_000;
            }
            let total = d.record.memory_mib * 1024 * 1024;
            Ok(DomainStats {
                uuid: d.record.uuid.clone(),
                state: d.record.state,
                cpu_time_ns: d.cpu_time_ns,
                memory_used_bytes: if active { total / 2 } else { 0 },
                memory_total_bytes: total,
                block_read_bytes: d.cpu_time_ns / 1000,
                block_write_bytes: d.cpu_time_ns / 2000,
                net_rx_bytes: d.cpu_time_ns / 4000,
                net_tx_bytes: d.cpu_time_ns / 8000,
            })
        })
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        self.enter("list_pools").await?;
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.pools.values().map(|p| p.info.clone()).collect())
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        self.enter("list_volumes").await?;
        let state = self.state.read().map_err(poisoned)?;
        state
            .pools
            .get(pool)
            .map(|p| p.volumes.values().cloned().collect())
            .ok_or_else(|| HypervisorError::PoolNotFound(pool.to_string()))
    }

    #[instrument(skip(self, spec), fields(uri = %self.uri, volume = %spec.name))]
    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo> {
        self.enter("create_volume").await?;
        let mut state = self.state.write().map_err(poisoned)?;

        if let Some((backing, _)) = &spec.backing {
            let found = state
                .pools
                .values()
                .any(|p| p.volumes.values().any(|v| &v.path == backing));
            if !found {
                return Err(HypervisorError::VolumeNotFound(backing.clone()));
            }
        }

        let target = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::PoolNotFound(pool.to_string()))?;
        if target.volumes.contains_key(&spec.name) {
            return Err(HypervisorError::OperationFailed(format!(
                "volume '{}' already exists in pool '{}'",
                spec.name, pool
            )));
        }

        let dir = target.info.target_path.clone().unwrap_or_else(|| format!("/{}", pool));
        let volume = VolumeInfo {
            name: spec.name.clone(),
            pool: pool.to_string(),
            path: format!("{}/{}", dir.trim_end_matches('/'), spec.name),
            format: spec.format,
            capacity_bytes: spec.capacity_bytes,
            allocation_bytes: 0,
            backing_path: spec.backing.as_ref().map(|(p, _)| p.clone()),
        };
        target.volumes.insert(spec.name.clone(), volume.clone());
        debug!(path = %volume.path, "Mock volume created");
        Ok(volume)
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.enter("delete_volume").await?;
        let mut state = self.state.write().map_err(poisoned)?;
        let target = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::PoolNotFound(pool.to_string()))?;
        target
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::VolumeNotFound(format!("{}/{}", pool, name)))
    }

    async fn subscribe_events(&self) -> Result<DomainEventStream> {
        self.enter("subscribe_events").await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.subscribers.lock().map_err(poisoned)?.push(tx);
        Ok(rx)
    }

    #[instrument(skip(self, target, flags, disks), fields(uri = %self.uri, dest = %target.uri))]
    async fn migrate_domain(
        &self,
        uuid: &str,
        target: &MigrationTarget,
        flags: &MigrationFlags,
        disks: &[String],
    ) -> Result<()> {
        self.enter("migrate_domain").await?;

        let record = self.with_domain(uuid, |d| Ok(d.record.clone()))?;
        if flags.live && record.state != DomainState::Running {
            return Err(HypervisorError::InvalidState(
                "live migration requires a running domain".to_string(),
            ));
        }

        let abort = Arc::new(Notify::new());
        self.migrations
            .lock()
            .map_err(poisoned)?
            .insert(uuid.to_string(), abort.clone());

        let duration = self.migration_time.lock().map(|t| *t).unwrap_or_default();
        info!(disks = disks.len(), "Mock migration started");

        let aborted = tokio::select! {
            _ = abort.notified() => true,
            _ = tokio::time::sleep(duration) => false,
        };

        if let Ok(mut migrations) = self.migrations.lock() {
            migrations.remove(uuid);
        }

        if aborted {
            info!("Mock migration aborted");
            return Err(HypervisorError::Aborted(format!("migration of {} aborted", uuid)));
        }

        if self.is_closed() {
            return Err(HypervisorError::Disconnected(format!("{} is closed", self.uri)));
        }

        let xml = DomainXmlBuilder::new(&record).build();
        target
            .handle
            .define_domain(&xml)
            .await
            .map_err(|e| HypervisorError::MigrationFailed(format!("destination define: {}", e)))?;

        if record.state.is_active() {
            target
                .handle
                .start_domain(uuid)
                .await
                .map_err(|e| HypervisorError::MigrationFailed(format!("destination start: {}", e)))?;

            // the source copy stops once the guest runs elsewhere
            let remove = self.with_domain(uuid, |d| {
                d.record.state = DomainState::Stopped;
                Ok(!d.record.persistent)
            })?;
            if remove {
                if let Ok(mut state) = self.state.write() {
                    state.domains.remove(uuid);
                }
            }
            self.emit(uuid, lifecycle::STOPPED);
        }

        info!("Mock migration completed");
        Ok(())
    }

    async fn abort_migration(&self, uuid: &str) -> Result<()> {
        self.enter("abort_migration").await?;
        let abort = self
            .migrations
            .lock()
            .map_err(poisoned)?
            .get(uuid)
            .cloned()
            .ok_or_else(|| {
                HypervisorError::OperationFailed(format!("no migration job for {}", uuid))
            })?;
        abort.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
        debug!(uri = %self.uri, "Mock connection closed");
        Ok(())
    }
}

// =============================================================================
// CLUSTER
// =============================================================================

/// How the simulated transport answers a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    /// Never answer
    Hang,
    Refuse(String),
    RejectCredentials(String),
}

/// A set of mock hosts addressed by URI.
#[derive(Default)]
pub struct MockCluster {
    hosts: RwLock<HashMap<String, Arc<MockBackend>>>,
    behavior: RwLock<HashMap<String, ConnectBehavior>>,
    opens: Mutex<HashMap<String, u64>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty host and return it.
    pub fn add_host(&self, uri: &str) -> Arc<MockBackend> {
        self.insert_host(Arc::new(MockBackend::new(uri)))
    }

    pub fn insert_host(&self, backend: Arc<MockBackend>) -> Arc<MockBackend> {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.insert(backend.uri().to_string(), backend.clone());
        }
        backend
    }

    pub fn host(&self, uri: &str) -> Option<Arc<MockBackend>> {
        self.hosts.read().ok().and_then(|h| h.get(uri).cloned())
    }

    pub fn set_behavior(&self, uri: &str, behavior: ConnectBehavior) {
        if let Ok(mut b) = self.behavior.write() {
            b.insert(uri.to_string(), behavior);
        }
    }

    /// Number of connect attempts made to `uri`.
    pub fn opens(&self, uri: &str) -> u64 {
        self.opens
            .lock()
            .ok()
            .and_then(|o| o.get(uri).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        if let Ok(mut opens) = self.opens.lock() {
            *opens.entry(uri.to_string()).or_insert(0) += 1;
        }

        let behavior = self
            .behavior
            .read()
            .map_err(poisoned)?
            .get(uri)
            .cloned()
            .unwrap_or_default();

        match behavior {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Hang => {
                std::future::pending::<()>().await;
            }
            ConnectBehavior::Refuse(reason) => {
                return Err(HypervisorError::ConnectionFailed(reason));
            }
            ConnectBehavior::RejectCredentials(reason) => {
                return Err(HypervisorError::AuthenticationFailed(reason));
            }
        }

        let host = self
            .host(uri)
            .ok_or_else(|| HypervisorError::ConnectionFailed(format!("no route to {}", uri)))?;
        host.reopen();
        Ok(host as Arc<dyn Hypervisor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, path: &str) -> PoolInfo {
        PoolInfo {
            name: name.to_string(),
            kind: PoolKind::Dir,
            active: true,
            target_path: Some(path.to_string()),
            capacity_bytes: 1 << 40,
            available_bytes: 1 << 39,
        }
    }

    #[tokio::test]
    async fn test_domain_lifecycle_emits_events() {
        let backend = MockBackend::new("qemu:///system");
        let mut events = backend.subscribe_events().await.unwrap();

        let record = sample_domain("web", DomainState::Stopped);
        let xml = DomainXmlBuilder::new(&record).build();
        let uuid = backend.define_domain(&xml).await.unwrap();
        assert_eq!(uuid, record.uuid);

        backend.start_domain(&uuid).await.unwrap();
        assert!(backend.start_domain(&uuid).await.is_err());
        backend.destroy_domain(&uuid).await.unwrap();
        backend.undefine_domain(&uuid).await.unwrap();

        let mut codes = Vec::new();
        while let Ok(Ok(ev)) = events.try_recv() {
            codes.push(ev.code);
        }
        assert_eq!(
            codes,
            vec![lifecycle::DEFINED, lifecycle::STARTED, lifecycle::STOPPED, lifecycle::UNDEFINED]
        );
        assert!(backend.domain(&uuid).is_none());
    }

    #[tokio::test]
    async fn test_failure_injection_and_counters() {
        let backend = MockBackend::new("qemu:///system");
        backend.fail_once("list_domains", HypervisorError::OperationFailed("boom".into()));

        assert!(backend.list_domains().await.is_err());
        assert!(backend.list_domains().await.is_ok());
        assert_eq!(backend.calls("list_domains"), 2);

        backend.simulate_loss("cable cut");
        assert!(matches!(
            backend.list_domains().await,
            Err(HypervisorError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_create_volume_requires_backing() {
        let backend = MockBackend::new("qemu:///system");
        backend.add_pool(pool("default", "/images"));

        let spec = VolumeSpec {
            name: "overlay.qcow2".to_string(),
            format: DiskFormat::Qcow2,
            capacity_bytes: 1024,
            backing: Some(("/images/base.qcow2".to_string(), DiskFormat::Qcow2)),
        };
        assert!(matches!(
            backend.create_volume("default", &spec).await,
            Err(HypervisorError::VolumeNotFound(_))
        ));

        let base = VolumeSpec { name: "base.qcow2".to_string(), backing: None, ..spec.clone() };
        backend.create_volume("default", &base).await.unwrap();
        let overlay = backend.create_volume("default", &spec).await.unwrap();
        assert_eq!(overlay.path, "/images/overlay.qcow2");
        assert_eq!(overlay.backing_path.as_deref(), Some("/images/base.qcow2"));
    }

    #[tokio::test]
    async fn test_migration_moves_running_domain() {
        let cluster = MockCluster::new();
        let src = cluster.add_host("qemu+ssh://a/system");
        let dst = cluster.add_host("qemu+ssh://b/system");
        let record = sample_domain("db", DomainState::Running);
        src.add_domain(record.clone());

        let target = MigrationTarget {
            uri: dst.uri().to_string(),
            handle: cluster.open(dst.uri()).await.unwrap(),
        };
        let flags = MigrationFlags { live: true, ..Default::default() };
        src.migrate_domain(&record.uuid, &target, &flags, &[]).await.unwrap();

        assert_eq!(dst.domain(&record.uuid).unwrap().state, DomainState::Running);
        assert_eq!(src.domain(&record.uuid).unwrap().state, DomainState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_migration_abort() {
        let cluster = MockCluster::new();
        let src = cluster.add_host("qemu+ssh://a/system");
        let dst = cluster.add_host("qemu+ssh://b/system");
        src.set_migration_time(Duration::from_secs(3600));
        let record = sample_domain("db", DomainState::Running);
        src.add_domain(record.clone());

        let target = MigrationTarget {
            uri: dst.uri().to_string(),
            handle: dst.clone(),
        };
        let migrating = {
            let src = src.clone();
            let uuid = record.uuid.clone();
            tokio::spawn(async move {
                src.migrate_domain(&uuid, &target, &MigrationFlags::default(), &[]).await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        src.abort_migration(&record.uuid).await.unwrap();

        let result = migrating.await.unwrap();
        assert!(matches!(result, Err(HypervisorError::Aborted(_))));
        assert!(dst.domain(&record.uuid).is_none());
    }

    #[tokio::test]
    async fn test_cluster_connect_behaviour() {
        let cluster = MockCluster::new();
        cluster.add_host("qemu+ssh://a/system");
        cluster.set_behavior(
            "qemu+ssh://a/system",
            ConnectBehavior::RejectCredentials("bad key".to_string()),
        );

        assert!(matches!(
            cluster.open("qemu+ssh://a/system").await,
            Err(HypervisorError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            cluster.open("qemu+ssh://nowhere/system").await,
            Err(HypervisorError::ConnectionFailed(_))
        ));
        assert_eq!(cluster.opens("qemu+ssh://a/system"), 1);
    }
}
