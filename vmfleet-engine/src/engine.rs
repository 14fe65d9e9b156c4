//! Engine facade.
//!
//! Wires the components together and exposes the surface used by the UI,
//! the CLI and the daemon.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vmfleet_hypervisor::{Connector, DomainRecord, DomainSummary, MigrationFlags};

use crate::cache::{Cache, CachePolicy};
use crate::config::{EndpointConfig, EngineConfig};
use crate::connection::{ConnectionManager, EndpointInfo, EndpointStatus};
use crate::error::{EngineError, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::migration::{JobId, MigrationJob, MigrationOrchestrator};
use crate::query::{Operation, Query, Value};
use crate::stats::{StatsAggregator, StatsReport};

/// The state engine.
pub struct Engine {
    config: RwLock<EngineConfig>,
    stats: Arc<StatsAggregator>,
    cache: Arc<Cache>,
    dispatcher: Arc<EventDispatcher>,
    connections: Arc<ConnectionManager>,
    migrations: Arc<MigrationOrchestrator>,
    shutdown: CancellationToken,
    reporter: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Engine {
    /// Build an engine from a configuration snapshot. Nothing is connected
    /// until [`Engine::start`] or [`Engine::connect`].
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        config.validate()?;

        let stats = Arc::new(StatsAggregator::new());
        let cache = Arc::new(Cache::new(CachePolicy::from_config(&config.cache), stats.clone()));
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(EventDispatcher::new(
            cache.clone(),
            stats.clone(),
            loss_tx,
            config.events.consumer_queue_capacity,
        ));
        let connections = ConnectionManager::new(
            connector,
            cache.clone(),
            dispatcher.clone(),
            loss_rx,
            config.connection.connect_timeout(),
        );
        for endpoint in &config.endpoints {
            connections.add_endpoint(endpoint.clone())?;
        }
        let migrations =
            MigrationOrchestrator::new(connections.clone(), cache.clone(), config.migration.clone());

        info!(endpoints = config.endpoints.len(), "State engine created");

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            stats,
            cache,
            dispatcher,
            connections,
            migrations,
            shutdown: CancellationToken::new(),
            reporter: Mutex::new(None),
        }))
    }

    /// Start the statistics reporter and connect autoconnect endpoints.
    ///
    /// Returns the outcome of each autoconnect attempt; failures leave the
    /// endpoint in `Error` and are not retried.
    pub async fn start(&self) -> Vec<(String, Result<()>)> {
        let config = self.config();
        self.restart_reporter(config.stats.report_interval_secs);

        let names: Vec<String> = config
            .endpoints
            .iter()
            .filter(|e| e.autoconnect)
            .map(|e| e.name.clone())
            .collect();
        let results = futures::future::join_all(names.iter().map(|n| self.connections.connect(n))).await;

        names
            .into_iter()
            .zip(results)
            .inspect(|(name, result)| {
                if let Err(e) = result {
                    warn!(endpoint = %name, error = %e, "Autoconnect failed");
                }
            })
            .collect()
    }

    fn config(&self) -> EngineConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn restart_reporter(&self, interval_secs: u64) {
        let mut reporter = self.reporter.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((token, _)) = reporter.take() {
            token.cancel();
        }
        if interval_secs == 0 || self.shutdown.is_cancelled() {
            return;
        }
        let token = self.shutdown.child_token();
        let handle = self
            .stats
            .clone()
            .spawn_reporter(Duration::from_secs(interval_secs), token.clone());
        *reporter = Some((token, handle));
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        self.connections.connect(endpoint).await
    }

    pub async fn disconnect(&self, endpoint: &str) -> Result<()> {
        self.connections.disconnect(endpoint).await
    }

    /// Abort a pending connect attempt. Returns whether one was pending.
    pub fn cancel_connect(&self, endpoint: &str) -> Result<bool> {
        self.connections.cancel_connect(endpoint)
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.connections.endpoints()
    }

    pub fn endpoint_status(&self, endpoint: &str) -> Result<EndpointStatus> {
        self.connections.status(endpoint)
    }

    /// Add an endpoint at runtime, connecting it if it asks for autoconnect.
    pub async fn add_endpoint(&self, endpoint: EndpointConfig) -> Result<()> {
        let mut config = self.config();
        config.endpoints.push(endpoint.clone());
        config.validate()?;

        self.connections.add_endpoint(endpoint.clone())?;
        if let Ok(mut c) = self.config.write() {
            c.endpoints.push(endpoint.clone());
        }
        if endpoint.autoconnect {
            self.connections.connect(&endpoint.name).await?;
        }
        Ok(())
    }

    pub async fn remove_endpoint(&self, endpoint: &str) -> Result<()> {
        self.connections.remove_endpoint(endpoint).await?;
        if let Ok(mut c) = self.config.write() {
            c.endpoints.retain(|e| e.name != endpoint);
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Serve a query from cache or the endpoint.
    pub async fn fetch(&self, endpoint: &str, query: Query) -> Result<Value> {
        let handle = self.connections.handle(endpoint)?;
        self.cache.fetch(endpoint, &query, handle).await
    }

    pub async fn list_domains(&self, endpoint: &str) -> Result<Vec<DomainSummary>> {
        let value = self.fetch(endpoint, Query::ListDomains).await?;
        value.into_domains().ok_or_else(|| unexpected(endpoint, Operation::ListDomains))
    }

    pub async fn domain_info(&self, endpoint: &str, uuid: &str) -> Result<DomainRecord> {
        let value = self.fetch(endpoint, Query::DomainInfo(uuid.to_string())).await?;
        value.into_domain().ok_or_else(|| unexpected(endpoint, Operation::DomainInfo))
    }

    /// Drop cached entries, see [`Cache::invalidate`].
    pub fn invalidate(&self, endpoint: &str, operation: Option<Operation>, domain: Option<&str>) -> usize {
        self.cache.invalidate(endpoint, operation, domain)
    }

    // =========================================================================
    // Domain actions
    // =========================================================================

    /// Run a power action on one domain and drop its cached entries.
    ///
    /// Refused while the domain has a migration in progress.
    pub async fn perform_action(&self, endpoint: &str, uuid: &str, action: DomainAction) -> Result<()> {
        if let Some(job_id) = self.migrations.active_job(uuid) {
            return Err(EngineError::AlreadyMigrating {
                domain: uuid.to_string(),
                job_id,
            });
        }
        let handle = self.connections.handle(endpoint)?;

        let result = match action {
            DomainAction::Start => handle.start_domain(uuid).await,
            DomainAction::ForceOff => handle.destroy_domain(uuid).await,
            DomainAction::Suspend => handle.suspend_domain(uuid).await,
            DomainAction::Resume => handle.resume_domain(uuid).await,
            DomainAction::Undefine => handle.undefine_domain(uuid).await,
        };

        // a failed call may still have changed something remotely
        self.cache.invalidate(endpoint, None, Some(uuid));
        if action == DomainAction::Undefine {
            self.cache.invalidate(endpoint, Some(Operation::ListDomains), None);
        }

        result.map_err(|e| EngineError::remote(endpoint, action.as_str(), e))?;
        info!(endpoint = %endpoint, domain = %uuid, action = %action, "Domain action performed");
        Ok(())
    }

    /// Run the same action on several domains concurrently. Every domain
    /// gets its own result; one failure does not stop the others.
    pub async fn perform_bulk_action(
        &self,
        endpoint: &str,
        uuids: &[String],
        action: DomainAction,
    ) -> Vec<(String, Result<()>)> {
        let results = join_all(uuids.iter().map(|uuid| self.perform_action(endpoint, uuid, action))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(endpoint = %endpoint, action = %action, failed, total = uuids.len(), "Bulk action partly failed");
        }
        uuids.iter().cloned().zip(results).collect()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Receive normalized events of one endpoint, or of all with `None`.
    pub fn subscribe_events(&self, endpoint: Option<&str>) -> EventReceiver {
        self.dispatcher.subscribe(endpoint)
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Start a migration. `None` flags use the configured defaults.
    pub fn request_migration(
        &self,
        domain_uuid: &str,
        source: &str,
        destination: &str,
        flags: Option<MigrationFlags>,
    ) -> Result<JobId> {
        self.migrations.request(domain_uuid, source, destination, flags)
    }

    pub fn job_status(&self, id: &str) -> Result<MigrationJob> {
        self.migrations.status(id)
    }

    pub fn cancel_job(&self, id: &str) -> Result<()> {
        self.migrations.cancel(id)
    }

    pub fn jobs(&self) -> Vec<MigrationJob> {
        self.migrations.jobs()
    }

    /// Wait for a job to reach `Completed` or `Failed`.
    pub async fn wait_job(&self, id: &str) -> Result<MigrationJob> {
        self.migrations.wait(id).await
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Totals and deltas since the previous snapshot.
    pub fn stats_snapshot(&self) -> StatsReport {
        self.stats.snapshot()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Apply a new configuration snapshot.
    ///
    /// Removed endpoints are disconnected, new ones added, endpoints whose
    /// URI changed are reconnected from scratch. Cache policy, queue
    /// capacity, timeouts and migration defaults apply from now on.
    pub async fn reload(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        let previous = self.config();

        for old in &previous.endpoints {
            match config.endpoint(&old.name) {
                Some(new) if new.uri == old.uri && new.autoconnect == old.autoconnect => {}
                _ => self.connections.remove_endpoint(&old.name).await?,
            }
        }
        let mut added = Vec::new();
        for new in &config.endpoints {
            if self.connections.config(&new.name).is_err() {
                self.connections.add_endpoint(new.clone())?;
                added.push(new.clone());
            }
        }

        self.cache.set_policy(CachePolicy::from_config(&config.cache));
        self.dispatcher.set_queue_capacity(config.events.consumer_queue_capacity);
        self.connections.set_connect_timeout(config.connection.connect_timeout());
        self.migrations.set_config(config.migration.clone());
        if config.stats.report_interval_secs != previous.stats.report_interval_secs {
            self.restart_reporter(config.stats.report_interval_secs);
        }

        info!(
            endpoints = config.endpoints.len(),
            added = added.len(),
            "Configuration reloaded"
        );
        if let Ok(mut c) = self.config.write() {
            *c = config;
        }

        for endpoint in added.iter().filter(|e| e.autoconnect) {
            if let Err(e) = self.connections.connect(&endpoint.name).await {
                warn!(endpoint = %endpoint.name, error = %e, "Autoconnect failed");
            }
        }
        Ok(())
    }

    /// Stop background work, disconnect everything, flush statistics to
    /// the log and release the cache.
    pub async fn shutdown(&self) {
        info!("Shutting down state engine");
        self.shutdown.cancel();
        let reporter = self
            .reporter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((_, handle)) = reporter {
            let _ = handle.await;
        }

        self.connections.disconnect_all().await;
        self.stats.log_snapshot();
        self.cache.clear();
        info!("State engine stopped");
    }
}

/// Power action on a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainAction {
    Start,
    /// Hard power off
    ForceOff,
    Suspend,
    Resume,
    /// Remove the definition, storage is left alone
    Undefine,
}

impl DomainAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainAction::Start => "start_domain",
            DomainAction::ForceOff => "destroy_domain",
            DomainAction::Suspend => "suspend_domain",
            DomainAction::Resume => "resume_domain",
            DomainAction::Undefine => "undefine_domain",
        }
    }
}

impl std::fmt::Display for DomainAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unexpected(endpoint: &str, operation: Operation) -> EngineError {
    EngineError::RemoteCallFailed {
        endpoint: endpoint.to_string(),
        operation: operation.to_string(),
        diagnostic: "unexpected value shape".to_string(),
    }
}
