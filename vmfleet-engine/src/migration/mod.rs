//! Migration orchestrator.
//!
//! Runs one task per migration job through
//! `Requested → CompatibilityCheck → Preparing → Transferring → Finalizing`
//! and ends in `Completed` or `Failed`. At most one job per domain is active
//! at any time; a migration is never retried on its own.

pub mod job;
pub mod preflight;
pub mod storage;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmfleet_hypervisor::xml::DomainXmlBuilder;
use vmfleet_hypervisor::{Hypervisor, HypervisorError, MigrationFlags, MigrationTarget};

use crate::cache::Cache;
use crate::config::MigrationConfig;
use crate::connection::{ConnectionManager, ConnectionObserver};
use crate::error::{EngineError, Result};
use crate::query::Operation;

pub use job::{ChainLink, CreatedVolume, DiskAction, DiskPlan, JobId, JobState, MigrationJob};
pub use preflight::{PreflightIssue, PreflightReport, Severity};

struct TrackedJob {
    job: MigrationJob,
    /// Cancellation requested by a caller
    cancel: CancellationToken,
    /// Fired when an endpoint of the job goes away
    lost: CancellationToken,
}

#[derive(Default)]
struct Registry {
    /// Domain UUID -> its non-terminal job
    active: HashMap<String, JobId>,
    running: HashMap<JobId, TrackedJob>,
    archive: VecDeque<MigrationJob>,
}

/// Runs and tracks migration jobs.
pub struct MigrationOrchestrator {
    connections: Arc<ConnectionManager>,
    cache: Arc<Cache>,
    config: RwLock<MigrationConfig>,
    registry: Mutex<Registry>,
    finished: Notify,
}

impl MigrationOrchestrator {
    /// Create the orchestrator and register it for endpoint loss.
    pub fn new(
        connections: Arc<ConnectionManager>,
        cache: Arc<Cache>,
        config: MigrationConfig,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            connections: connections.clone(),
            cache,
            config: RwLock::new(config),
            registry: Mutex::new(Registry::default()),
            finished: Notify::new(),
        });
        let observer: Arc<dyn ConnectionObserver> = orchestrator.clone();
        connections.add_observer(Arc::downgrade(&observer));
        orchestrator
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn config(&self) -> MigrationConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn set_config(&self, config: MigrationConfig) {
        if let Ok(mut c) = self.config.write() {
            *c = config;
        }
    }

    // =========================================================================
    // Public surface
    // =========================================================================

    /// Admit a migration and start it. `None` flags use the configured
    /// defaults.
    pub fn request(
        self: &Arc<Self>,
        domain_uuid: &str,
        source: &str,
        destination: &str,
        flags: Option<MigrationFlags>,
    ) -> Result<JobId> {
        self.connections.config(source)?;
        self.connections.config(destination)?;
        let flags = flags.unwrap_or_else(|| self.config().default_flags);

        let job = MigrationJob::new(domain_uuid, source, destination, flags);
        let id = job.id.clone();
        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();

        {
            let mut registry = self.registry();
            if let Some(existing) = registry.active.get(domain_uuid) {
                return Err(EngineError::AlreadyMigrating {
                    domain: domain_uuid.to_string(),
                    job_id: existing.clone(),
                });
            }
            registry.active.insert(domain_uuid.to_string(), id.clone());
            registry.running.insert(
                id.clone(),
                TrackedJob { job, cancel: cancel.clone(), lost: lost.clone() },
            );
        }

        info!(
            job_id = %id,
            domain = %domain_uuid,
            source = %source,
            destination = %destination,
            ?flags,
            "Migration requested"
        );

        let orchestrator = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move { orchestrator.run(job_id, cancel, lost).await });

        Ok(id)
    }

    /// Current view of a job, running or archived.
    pub fn status(&self, id: &str) -> Result<MigrationJob> {
        let registry = self.registry();
        registry
            .running
            .get(id)
            .map(|t| t.job.clone())
            .or_else(|| registry.archive.iter().find(|j| j.id == id).cloned())
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    /// Request cancellation. A no-op for a job that already finished.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut registry = self.registry();
        if let Some(tracked) = registry.running.get_mut(id) {
            info!(job_id = %id, state = %tracked.job.state, "Migration cancellation requested");
            tracked.job.cancel_requested = true;
            tracked.cancel.cancel();
            return Ok(());
        }
        if registry.archive.iter().any(|j| j.id == id) {
            return Ok(());
        }
        Err(EngineError::JobNotFound(id.to_string()))
    }

    /// Running jobs followed by archived ones, oldest first.
    pub fn jobs(&self) -> Vec<MigrationJob> {
        let registry = self.registry();
        let mut running: Vec<MigrationJob> = registry.running.values().map(|t| t.job.clone()).collect();
        running.sort_by_key(|j| j.created_at);
        running.extend(registry.archive.iter().cloned());
        running
    }

    /// Non-terminal job of a domain.
    pub fn active_job(&self, domain_uuid: &str) -> Option<JobId> {
        self.registry().active.get(domain_uuid).cloned()
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<MigrationJob> {
        loop {
            let notified = self.finished.notified();
            let job = self.status(id)?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    // =========================================================================
    // Job bookkeeping
    // =========================================================================

    fn update(&self, id: &str, f: impl FnOnce(&mut MigrationJob)) {
        if let Some(tracked) = self.registry().running.get_mut(id) {
            f(&mut tracked.job);
        }
    }

    fn snapshot(&self, id: &str) -> Result<MigrationJob> {
        self.registry()
            .running
            .get(id)
            .map(|t| t.job.clone())
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    /// Move a job forward. Fails with the job's own failure when something
    /// else (endpoint loss) already ended it.
    fn advance(&self, id: &str, next: JobState) -> Result<()> {
        let mut registry = self.registry();
        let tracked = registry
            .running
            .get_mut(id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;

        if tracked.job.transition(next) {
            info!(job_id = %id, domain = %tracked.job.domain_uuid, state = %next, "Migration state changed");
            return Ok(());
        }
        Err(tracked.job.failure.clone().unwrap_or_else(|| {
            EngineError::MigrationTransferFailed(format!(
                "invalid transition from {} to {}",
                tracked.job.state, next
            ))
        }))
    }

    /// Run `work` unless the job is cancelled or loses an endpoint first.
    /// The interrupted future is dropped.
    async fn interruptible<F: Future>(
        &self,
        id: &str,
        cancel: &CancellationToken,
        lost: &CancellationToken,
        work: F,
    ) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = lost.cancelled() => Err(self.interruption(id)),
            _ = cancel.cancelled() => Err(self.interruption(id)),
            output = work => Ok(output),
        }
    }

    /// The failure recorded on the job, or `Cancelled`.
    fn interruption(&self, id: &str) -> EngineError {
        self.snapshot(id)
            .ok()
            .and_then(|job| job.failure)
            .unwrap_or(EngineError::Cancelled)
    }

    /// Safe point between steps.
    fn checkpoint(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let job = self.snapshot(id)?;
        match job.failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Archive a terminal job and release its domain.
    fn finish(&self, id: &str) {
        let capacity = self.config().archive_capacity.max(1);
        let job = {
            let mut registry = self.registry();
            let tracked = match registry.running.remove(id) {
                Some(tracked) => tracked,
                None => return,
            };
            let job = tracked.job;
            if registry.active.get(&job.domain_uuid).map(String::as_str) == Some(id) {
                registry.active.remove(&job.domain_uuid);
            }
            registry.archive.push_back(job.clone());
            while registry.archive.len() > capacity {
                registry.archive.pop_front();
            }
            job
        };

        match job.state {
            JobState::Completed => info!(
                job_id = %id,
                domain = %job.domain_uuid,
                destination = %job.destination,
                "Migration completed"
            ),
            _ => warn!(
                job_id = %id,
                domain = %job.domain_uuid,
                error = job.error.as_deref().unwrap_or("unknown"),
                "Migration failed"
            ),
        }
        self.finished.notify_waiters();
    }

    // =========================================================================
    // Runner
    // =========================================================================

    async fn run(self: Arc<Self>, id: JobId, cancel: CancellationToken, lost: CancellationToken) {
        if let Err(failure) = self.drive(&id, &cancel, &lost).await {
            self.update(&id, |job| {
                job.fail(failure);
            });
        }
        self.finish(&id);
    }

    async fn drive(&self, id: &str, cancel: &CancellationToken, lost: &CancellationToken) -> Result<()> {
        let job = self.snapshot(id)?;
        let config = self.config();
        let uuid = job.domain_uuid.as_str();

        // --- CompatibilityCheck -------------------------------------------
        self.advance(id, JobState::CompatibilityCheck)?;

        let (source, destination) = match (
            self.connections.handle(&job.source),
            self.connections.handle(&job.destination),
        ) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => {
                return Err(EngineError::MigrationPreflightFailed(vec![e.to_string()]))
            }
        };
        let destination_uri = self.connections.config(&job.destination)?.uri;

        let check = preflight::Preflight {
            domain_uuid: uuid,
            source_name: &job.source,
            destination_name: &job.destination,
            source: source.clone(),
            destination: destination.clone(),
            flags: &job.flags,
        };
        let timeout = config.preflight_timeout();
        let report = self
            .interruptible(id, cancel, lost, tokio::time::timeout(timeout, check.run()))
            .await?
            .map_err(|_| {
                EngineError::MigrationPreflightFailed(vec![format!(
                    "compatibility check timed out after {}s",
                    timeout.as_secs()
                )])
            })?;

        self.update(id, |j| j.diagnostics = report.issues.clone());
        if !report.passed() {
            return Err(EngineError::MigrationPreflightFailed(report.blocking()));
        }
        self.checkpoint(id, cancel)?;

        // --- Preparing ----------------------------------------------------
        let mut plans = Vec::new();
        let mut created = Vec::new();
        if job.flags.moves_storage() && !report.disks.is_empty() {
            self.advance(id, JobState::Preparing)?;

            plans = storage::plan(&report.disks, destination.as_ref())
                .await
                .map_err(|e| EngineError::MigrationTransferFailed(format!("storage planning failed: {}", e)))?;
            let prepare = storage::prepare(&mut plans, destination.as_ref(), &mut created);
            let prepared = self.interruptible(id, cancel, lost, prepare).await;
            self.update(id, |j| {
                j.plan = plans.clone();
                j.created_volumes = created.clone();
            });

            let failure = match prepared {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(EngineError::MigrationTransferFailed(format!(
                    "storage preparation failed: {}",
                    e
                ))),
                Err(interrupted) => Some(interrupted),
            };
            if let Some(failure) = failure {
                storage::rollback(&created, destination.as_ref()).await;
                return Err(failure);
            }
        }

        if let Err(e) = self
            .checkpoint(id, cancel)
            .and_then(|_| self.advance(id, JobState::Transferring))
        {
            storage::rollback(&created, destination.as_ref()).await;
            return Err(e);
        }

        // --- Transferring -------------------------------------------------
        let target = MigrationTarget {
            uri: destination_uri,
            handle: destination.clone(),
        };
        let disks = storage::paths_to_copy(&plans);
        let transfer = source.migrate_domain(uuid, &target, &job.flags, &disks);
        tokio::pin!(transfer);

        let result = tokio::select! {
            biased;
            result = &mut transfer => result,
            _ = cancel.cancelled() => {
                info!(job_id = %id, "Aborting migration");
                if let Err(e) = source.abort_migration(uuid).await {
                    warn!(job_id = %id, error = %e, "Abort request failed");
                }
                tokio::select! {
                    result = &mut transfer => result,
                    _ = lost.cancelled() => Err(HypervisorError::Disconnected("endpoint lost during abort".to_string())),
                }
            }
            _ = lost.cancelled() => {
                if let Err(e) = source.abort_migration(uuid).await {
                    warn!(job_id = %id, error = %e, "Abort after endpoint loss failed");
                }
                Err(HypervisorError::Disconnected("endpoint lost during transfer".to_string()))
            }
        };

        match result {
            Ok(()) if cancel.is_cancelled() => {
                info!(job_id = %id, "Migration completed before the abort took effect");
            }
            Ok(()) => {}
            Err(HypervisorError::Aborted(_)) if cancel.is_cancelled() => {
                storage::rollback(&created, destination.as_ref()).await;
                return Err(EngineError::Cancelled);
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Migration transfer failed");
                storage::rollback(&created, destination.as_ref()).await;
                return Err(EngineError::MigrationTransferFailed(e.to_string()));
            }
        }

        // --- Finalizing ---------------------------------------------------
        self.advance(id, JobState::Finalizing)?;
        self.finalize(&job, &report, &plans, source.as_ref(), destination.as_ref())
            .await
            .map_err(|e| EngineError::MigrationTransferFailed(format!("finalizing failed: {}", e)))?;
        self.advance(id, JobState::Completed)
    }

    async fn finalize(
        &self,
        job: &MigrationJob,
        report: &PreflightReport,
        plans: &[DiskPlan],
        source: &dyn Hypervisor,
        destination: &dyn Hypervisor,
    ) -> std::result::Result<(), HypervisorError> {
        let uuid = job.domain_uuid.as_str();
        let relocated = storage::relocations(plans);

        let landed = match destination.domain_info(uuid).await {
            Ok(record) => Some(record),
            Err(HypervisorError::DomainNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let persisted = landed.as_ref().map(|r| r.persistent).unwrap_or(false);

        if (job.flags.persistent && !persisted) || !relocated.is_empty() {
            let xml = match (landed, &report.source_xml) {
                (None, Some(xml)) if relocated.is_empty() => xml.clone(),
                (landed, _) => {
                    let mut record = landed
                        .or_else(|| report.domain.clone())
                        .ok_or_else(|| HypervisorError::DomainNotFound(uuid.to_string()))?;
                    for disk in record.disks.iter_mut() {
                        if let Some(path) = relocated.get(&disk.path) {
                            disk.path = path.clone();
                        }
                    }
                    DomainXmlBuilder::new(&record).build()
                }
            };
            destination.define_domain(&xml).await?;
            info!(domain = %uuid, relocated = relocated.len(), "Destination definition written");
        }

        if job.flags.undefine_source {
            match source.domain_info(uuid).await {
                Ok(record) if record.state.is_active() => {
                    warn!(domain = %uuid, "Source domain still active, not undefined");
                }
                Ok(_) => {
                    if let Err(e) = source.undefine_domain(uuid).await {
                        warn!(domain = %uuid, error = %e, "Failed to undefine source domain");
                    }
                }
                Err(HypervisorError::DomainNotFound(_)) => {}
                Err(e) => warn!(domain = %uuid, error = %e, "Cannot inspect source domain"),
            }
        }

        for endpoint in [&job.source, &job.destination] {
            self.cache.invalidate(endpoint, None, Some(uuid));
            self.cache.invalidate(endpoint, Some(Operation::ListDomains), None);
        }
        Ok(())
    }
}

impl ConnectionObserver for MigrationOrchestrator {
    /// Fails every job using `endpoint` and releases its domain right away;
    /// the runner only cleans up after that.
    fn endpoint_lost(&self, endpoint: &str, reason: &str) {
        let failed = {
            let mut registry = self.registry();
            let Registry { active, running, .. } = &mut *registry;
            let mut failed = 0;
            for tracked in running.values_mut() {
                if tracked.job.uses_endpoint(endpoint)
                    && tracked.job.fail(EngineError::EndpointLost(endpoint.to_string()))
                {
                    warn!(
                        job_id = %tracked.job.id,
                        endpoint = %endpoint,
                        reason = %reason,
                        "Migration failed, endpoint lost"
                    );
                    if active.get(&tracked.job.domain_uuid) == Some(&tracked.job.id) {
                        active.remove(&tracked.job.domain_uuid);
                    }
                    tracked.lost.cancel();
                    failed += 1;
                }
            }
            failed
        };
        debug!(endpoint = %endpoint, failed, "Migration jobs checked for endpoint loss");
        if failed > 0 {
            self.finished.notify_waiters();
        }
    }
}
