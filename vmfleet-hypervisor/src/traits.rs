//! Endpoint call surface.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::*;

/// Stream of lifecycle notifications from one endpoint.
///
/// An `Err` item means the underlying connection was lost; the stream ends
/// after it. The stream also ends when the handle is closed.
pub type DomainEventStream = mpsc::Receiver<Result<RawDomainEvent>>;

/// Destination of a migration: where to send the domain and a live handle to
/// the destination endpoint.
#[derive(Clone)]
pub struct MigrationTarget {
    pub uri: String,
    pub handle: Arc<dyn Hypervisor>,
}

impl std::fmt::Debug for MigrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationTarget").field("uri", &self.uri).finish()
    }
}

/// One logical connection to a hypervisor endpoint.
///
/// Every method is a remote round-trip. Implementations never cache; that is
/// the caller's job.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// URI this handle is connected to.
    fn uri(&self) -> &str;

    // =========================================================================
    // Host
    // =========================================================================

    /// Check if the connection is still alive.
    async fn health_check(&self) -> Result<bool>;

    /// Host topology and CPU capabilities.
    async fn host_capabilities(&self) -> Result<HostCapabilities>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// List all domains, active and inactive.
    async fn list_domains(&self) -> Result<Vec<DomainSummary>>;

    /// Describe a domain.
    async fn domain_info(&self, uuid: &str) -> Result<DomainRecord>;

    /// Raw XML description of a domain.
    async fn domain_xml(&self, uuid: &str) -> Result<String>;

    /// Define (or redefine) a persistent domain. Returns its UUID.
    async fn define_domain(&self, xml: &str) -> Result<String>;

    /// Remove a domain definition.
    async fn undefine_domain(&self, uuid: &str) -> Result<()>;

    async fn start_domain(&self, uuid: &str) -> Result<()>;

    /// Power off immediately.
    async fn destroy_domain(&self, uuid: &str) -> Result<()>;

    async fn suspend_domain(&self, uuid: &str) -> Result<()>;

    async fn resume_domain(&self, uuid: &str) -> Result<()>;

    /// CPU, memory, block and interface counters.
    async fn domain_stats(&self, uuid: &str) -> Result<DomainStats>;

    // =========================================================================
    // Storage
    // =========================================================================

    async fn list_pools(&self) -> Result<Vec<PoolInfo>>;

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>>;

    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo>;

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Subscribe to lifecycle notifications.
    async fn subscribe_events(&self) -> Result<DomainEventStream>;

    // =========================================================================
    // Migration
    // =========================================================================

    /// Migrate a domain to `target`. May run for hours.
    ///
    /// `disks` lists the source paths whose contents must be copied.
    async fn migrate_domain(
        &self,
        uuid: &str,
        target: &MigrationTarget,
        flags: &MigrationFlags,
        disks: &[String],
    ) -> Result<()>;

    /// Ask the hypervisor to abort the running migration job of a domain.
    ///
    /// The pending `migrate_domain` call returns [`HypervisorError::Aborted`]
    /// once the abort is confirmed.
    ///
    /// [`HypervisorError::Aborted`]: crate::HypervisorError::Aborted
    async fn abort_migration(&self, uuid: &str) -> Result<()>;

    /// Release the connection. Event streams end.
    async fn close(&self) -> Result<()>;
}

/// Opens transport handles. One implementation per backend family.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to `uri`.
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>>;
}
