//! Libvirt backend implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, DomainEventStream, Hypervisor, MigrationTarget};
use crate::types::*;
use crate::uri::transport_uri;
use crate::watch::{spawn_poller, DEFAULT_POLL_INTERVAL};
use crate::xml::{parse_capabilities, parse_domain, parse_pool, parse_volume, volume_xml};

const EVENT_BUFFER: usize = 256;

fn poisoned<T>(_: T) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

fn op_failed(e: virt::error::Error) -> HypervisorError {
    HypervisorError::OperationFailed(e.to_string())
}

/// Convert libvirt domain state to DomainState.
fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
    match state {
        sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => DomainState::Running,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN | sys::VIR_DOMAIN_SHUTOFF => DomainState::Stopped,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
        _ => DomainState::Unknown,
    }
}

fn migration_flags(flags: &MigrationFlags) -> u32 {
    let mut bits = 0;
    if flags.live {
        bits |= sys::VIR_MIGRATE_LIVE;
    } else {
        bits |= sys::VIR_MIGRATE_OFFLINE | sys::VIR_MIGRATE_PERSIST_DEST;
    }
    if flags.persistent {
        bits |= sys::VIR_MIGRATE_PERSIST_DEST;
    }
    if flags.copy_storage_all {
        bits |= sys::VIR_MIGRATE_NON_SHARED_DISK;
    }
    if flags.unsafe_migration {
        bits |= sys::VIR_MIGRATE_UNSAFE;
    }
    if flags.compressed {
        bits |= sys::VIR_MIGRATE_COMPRESSED;
    }
    if flags.tunnelled {
        bits |= sys::VIR_MIGRATE_TUNNELLED | sys::VIR_MIGRATE_PEER2PEER;
    }
    bits
}

/// Libvirt/QEMU endpoint connection.
pub struct LibvirtBackend {
    uri: String,
    /// Shared with blocking calls in flight; `None` once closed
    connection: Mutex<Option<Arc<Connect>>>,
    /// Domains whose migration was asked to abort
    aborting: Mutex<HashSet<String>>,
    self_ref: Weak<dyn Hypervisor>,
}

impl LibvirtBackend {
    /// Connect to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn connect(uri: &str) -> Result<Arc<Self>> {
        info!(uri = %uri, "Connecting to libvirt");

        let target = transport_uri(uri);
        let connection = tokio::task::spawn_blocking(move || Connect::open(Some(&target)))
            .await
            .map_err(|e| HypervisorError::Internal(e.to_string()))?
            .map_err(|e| {
                let msg = e.to_string();
                if msg.to_lowercase().contains("auth") {
                    HypervisorError::AuthenticationFailed(msg)
                } else {
                    HypervisorError::ConnectionFailed(msg)
                }
            })?;

        info!(uri = %uri, "Connected to libvirt");

        Ok(Arc::new_cyclic(|weak: &Weak<LibvirtBackend>| {
            let self_ref: Weak<dyn Hypervisor> = weak.clone();
            Self {
                uri: uri.to_string(),
                connection: Mutex::new(Some(Arc::new(connection))),
                aborting: Mutex::new(HashSet::new()),
                self_ref,
            }
        }))
    }

    /// Run `f` against the open connection on the blocking pool.
    ///
    /// The connection lock is only held to clone the handle. A failing call
    /// on a dead connection is reported as a lost connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connect) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .connection
            .lock()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| HypervisorError::Disconnected(format!("{} is closed", self.uri)))?;

        tokio::task::spawn_blocking(move || match f(&conn) {
            Err(HypervisorError::OperationFailed(msg)) if !conn.is_alive().unwrap_or(false) => {
                Err(HypervisorError::Disconnected(msg))
            }
            other => other,
        })
        .await
        .map_err(|e| HypervisorError::Internal(e.to_string()))?
    }

    fn lookup(conn: &Connect, uuid: &str) -> Result<Domain> {
        Domain::lookup_by_uuid_string(conn, uuid)
            .map_err(|e| HypervisorError::DomainNotFound(format!("{}: {}", uuid, e)))
    }

    fn lookup_pool(conn: &Connect, pool: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(conn, pool)
            .map_err(|e| HypervisorError::PoolNotFound(format!("{}: {}", pool, e)))
    }

    fn describe(domain: &Domain) -> Result<DomainRecord> {
        let xml = domain.get_xml_desc(0).map_err(op_failed)?;
        let mut record = parse_domain(&xml)?;
        let (state, _) = domain.get_state().map_err(op_failed)?;
        record.state = state_from_libvirt(state);
        record.persistent = domain.is_persistent().map_err(op_failed)?;
        Ok(record)
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn health_check(&self) -> Result<bool> {
        self.with_conn(|conn| Ok(conn.is_alive().unwrap_or(false))).await
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn host_capabilities(&self) -> Result<HostCapabilities> {
        self.with_conn(|conn| {
            let xml = conn.get_capabilities().map_err(op_failed)?;
            let mut caps = parse_capabilities(&xml)?;

            caps.hostname = conn.get_hostname().map_err(op_failed)?;

            let node = conn.get_node_info().map_err(op_failed)?;
            caps.memory_bytes = node.memory * 1024;
            if caps.cpu_cores == 0 {
                caps.cpu_cores = node.cpus;
            }

            let driver = conn.get_type().map_err(op_failed)?;
            let version = conn.get_hyp_version().map_err(op_failed)?;
            caps.hypervisor = format!(
                "{} {}.{}.{}",
                driver,
                version / 1_000_000,
                (version / 1000) % 1000,
                version % 1000
            );
            Ok(caps)
        })
        .await
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn list_domains(&self) -> Result<Vec<DomainSummary>> {
        self.with_conn(|conn| {
            let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
            let domains = conn.list_all_domains(flags).map_err(op_failed)?;

            let mut result = Vec::with_capacity(domains.len());
            for domain in domains {
                let uuid = domain.get_uuid_string().map_err(op_failed)?;
                let name = domain.get_name().map_err(op_failed)?;
                let (state, _) = domain.get_state().map_err(op_failed)?;
                result.push(DomainSummary {
                    uuid,
                    name,
                    state: state_from_libvirt(state),
                });
            }
            debug!(count = result.len(), "Listed domains");
            Ok(result)
        })
        .await
    }

    async fn domain_info(&self, uuid: &str) -> Result<DomainRecord> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| Self::describe(&Self::lookup(conn, &uuid)?))
            .await
    }

    async fn domain_xml(&self, uuid: &str) -> Result<String> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| Self::lookup(conn, &uuid)?.get_xml_desc(0).map_err(op_failed))
            .await
    }

    #[instrument(skip(self, xml), fields(uri = %self.uri))]
    async fn define_domain(&self, xml: &str) -> Result<String> {
        let xml = xml.to_string();
        let uuid = self
            .with_conn(move |conn| {
                let domain = Domain::define_xml(conn, &xml).map_err(op_failed)?;
                domain.get_uuid_string().map_err(op_failed)
            })
            .await?;
        info!(domain = %uuid, "Domain defined");
        Ok(uuid)
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn undefine_domain(&self, uuid: &str) -> Result<()> {
        let target = uuid.to_string();
        self.with_conn(move |conn| Self::lookup(conn, &target)?.undefine().map_err(op_failed))
            .await?;
        info!(domain = %uuid, "Domain undefined");
        Ok(())
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn start_domain(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            Self::lookup(conn, &uuid)?.create().map_err(op_failed)?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn destroy_domain(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| Self::lookup(conn, &uuid)?.destroy().map_err(op_failed))
            .await
    }

    async fn suspend_domain(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            Self::lookup(conn, &uuid)?.suspend().map_err(op_failed)?;
            Ok(())
        })
        .await
    }

    async fn resume_domain(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            Self::lookup(conn, &uuid)?.resume().map_err(op_failed)?;
            Ok(())
        })
        .await
    }

    async fn domain_stats(&self, uuid: &str) -> Result<DomainStats> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let domain = Self::lookup(conn, &uuid)?;
            let record = Self::describe(&domain)?;
            let info = domain.get_info().map_err(op_failed)?;

            let (mut rd, mut wr) = (0u64, 0u64);
            for disk in &record.disks {
                if let Ok(stats) = domain.get_block_stats(&disk.target) {
                    rd += stats.rd_bytes.max(0) as u64;
                    wr += stats.wr_bytes.max(0) as u64;
                }
            }

            Ok(DomainStats {
                uuid,
                state: record.state,
                cpu_time_ns: info.cpu_time,
                memory_used_bytes: info.memory * 1024,
                memory_total_bytes: info.max_mem * 1024,
                block_read_bytes: rd,
                block_write_bytes: wr,
                // interface target names are not part of the parsed definition
                net_rx_bytes: 0,
                net_tx_bytes: 0,
            })
        })
        .await
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        self.with_conn(|conn| {
            let pools = conn.list_all_storage_pools(0).map_err(op_failed)?;
            let mut result = Vec::with_capacity(pools.len());
            for pool in pools {
                let xml = pool.get_xml_desc(0).map_err(op_failed)?;
                let active = pool.is_active().map_err(op_failed)?;
                result.push(parse_pool(&xml, active)?);
            }
            Ok(result)
        })
        .await
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let pool = pool.to_string();
        self.with_conn(move |conn| {
            let handle = Self::lookup_pool(conn, &pool)?;
            let volumes = handle.list_all_volumes(0).map_err(op_failed)?;
            let mut result = Vec::with_capacity(volumes.len());
            for vol in volumes {
                let xml = vol.get_xml_desc(0).map_err(op_failed)?;
                result.push(parse_volume(&xml, &pool)?);
            }
            Ok(result)
        })
        .await
    }

    #[instrument(skip(self, spec), fields(uri = %self.uri, volume = %spec.name))]
    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let xml = volume_xml(spec);
        let pool = pool.to_string();
        let volume = self
            .with_conn(move |conn| {
                let handle = Self::lookup_pool(conn, &pool)?;
                let vol = StorageVol::create_xml(&handle, &xml, 0).map_err(op_failed)?;
                parse_volume(&vol.get_xml_desc(0).map_err(op_failed)?, &pool)
            })
            .await?;
        info!(path = %volume.path, "Volume created");
        Ok(volume)
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let (pool_name, volume_name) = (pool.to_string(), name.to_string());
        self.with_conn(move |conn| {
            let handle = Self::lookup_pool(conn, &pool_name)?;
            let vol = StorageVol::lookup_by_name(&handle, &volume_name).map_err(|e| {
                HypervisorError::VolumeNotFound(format!("{}/{}: {}", pool_name, volume_name, e))
            })?;
            vol.delete(0).map_err(op_failed)
        })
        .await?;
        info!(pool = %pool, volume = %name, "Volume deleted");
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<DomainEventStream> {
        // lifecycle callbacks need a libvirt event loop; poll instead
        self.with_conn(|_| Ok(())).await?;
        Ok(spawn_poller(self.self_ref.clone(), DEFAULT_POLL_INTERVAL, EVENT_BUFFER))
    }

    #[instrument(skip(self, target, flags, disks), fields(uri = %self.uri, dest = %target.uri))]
    async fn migrate_domain(
        &self,
        uuid: &str,
        target: &MigrationTarget,
        flags: &MigrationFlags,
        disks: &[String],
    ) -> Result<()> {
        info!(live = flags.live, disks = disks.len(), "Migrating domain");

        if let Ok(mut aborting) = self.aborting.lock() {
            aborting.remove(uuid);
        }

        let source_uri = transport_uri(&self.uri);
        let dest_uri = transport_uri(&target.uri);
        let domain_uuid = uuid.to_string();
        let bits = migration_flags(flags);

        // migration blocks for its whole duration; keep it off the runtime
        let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
            let source = Connect::open(Some(&source_uri))
                .map_err(|e| HypervisorError::Disconnected(e.to_string()))?;
            let domain = Self::lookup(&source, &domain_uuid)?;
            let dest = Connect::open(Some(&dest_uri)).map_err(|e| {
                HypervisorError::MigrationFailed(format!("Failed to connect to target: {}", e))
            })?;
            domain
                .migrate(&dest, bits, None, None, 0)
                .map_err(|e| HypervisorError::MigrationFailed(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| HypervisorError::Internal(e.to_string()))?;

        let aborted = self
            .aborting
            .lock()
            .map(|mut a| a.remove(uuid))
            .unwrap_or(false);

        match outcome {
            Err(HypervisorError::MigrationFailed(msg)) if aborted => {
                info!("Migration aborted");
                Err(HypervisorError::Aborted(msg))
            }
            Err(e) => Err(e),
            Ok(()) => {
                info!("Domain migrated successfully");
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn abort_migration(&self, uuid: &str) -> Result<()> {
        warn!("Job abort not exposed by the virt crate - using virsh fallback");

        self.aborting.lock().map_err(poisoned)?.insert(uuid.to_string());

        let output = tokio::process::Command::new("virsh")
            .args(["-c", &transport_uri(&self.uri), "domjobabort", uuid])
            .output()
            .await
            .map_err(|e| HypervisorError::Internal(format!("virsh command failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::OperationFailed(format!(
                "virsh domjobabort failed: {}",
                stderr
            )));
        }

        info!("Migration abort requested via virsh");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let conn = self.connection.lock().map_err(poisoned)?.take();
        // calls still in flight keep their handle; the last one drops it
        if let Some(Ok(mut conn)) = conn.map(Arc::try_unwrap) {
            let closed = tokio::task::spawn_blocking(move || conn.close()).await;
            if let Ok(Err(e)) = closed {
                warn!(uri = %self.uri, error = %e, "Error closing libvirt connection");
            }
        }
        info!(uri = %self.uri, "Libvirt connection closed");
        Ok(())
    }
}

/// Opens libvirt connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibvirtConnector;

#[async_trait]
impl Connector for LibvirtConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        let backend = LibvirtBackend::connect(uri).await?;
        Ok(backend as Arc<dyn Hypervisor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // libvirt's built-in test driver, no daemon required
    const TEST_URI: &str = "test:///default";

    #[tokio::test(flavor = "current_thread")]
    async fn test_calls_run_on_blocking_pool() {
        let backend = LibvirtBackend::connect(TEST_URI).await.unwrap();

        let runtime_thread = std::thread::current().id();
        let call_thread = backend
            .with_conn(|_| Ok(std::thread::current().id()))
            .await
            .unwrap();
        assert_ne!(call_thread, runtime_thread);

        // the runtime keeps turning while calls are in flight
        let (domains, pools, _) = tokio::join!(
            backend.list_domains(),
            backend.list_pools(),
            tokio::time::sleep(std::time::Duration::from_millis(1)),
        );
        assert!(!domains.unwrap().is_empty());
        assert!(!pools.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_calls_after_close() {
        let backend = LibvirtBackend::connect(TEST_URI).await.unwrap();
        backend.close().await.unwrap();

        let err = backend.list_domains().await.unwrap_err();
        assert!(matches!(err, HypervisorError::Disconnected(_)));
        assert!(backend.close().await.is_ok());
    }
}
