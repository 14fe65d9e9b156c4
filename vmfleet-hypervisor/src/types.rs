//! Type definitions for domains, storage, host topology and events.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// =============================================================================
// DOMAINS
// =============================================================================

/// Domain power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainState {
    Running,
    Paused,
    Stopped,
    Suspended,
    Crashed,
    #[default]
    Unknown,
}

impl DomainState {
    /// Whether the domain currently has a live process on the host.
    pub fn is_active(&self) -> bool {
        match self {
            DomainState::Running | DomainState::Paused | DomainState::Suspended => true,
            DomainState::Stopped | DomainState::Crashed | DomainState::Unknown => false,
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::Stopped => "stopped",
            DomainState::Suspended => "suspended",
            DomainState::Crashed => "crashed",
            DomainState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Row of a domain listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSummary {
    /// Domain UUID
    pub uuid: String,
    /// Domain name
    pub name: String,
    /// Current power state
    pub state: DomainState,
}

/// CPU mode requested by a domain definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMode {
    HostPassthrough,
    HostModel,
    Custom,
    Maximum,
    #[default]
    Unspecified,
}

impl CpuMode {
    /// Parse the libvirt `mode` attribute.
    pub fn from_libvirt(mode: Option<&str>) -> Self {
        match mode {
            Some("host-passthrough") => CpuMode::HostPassthrough,
            Some("host-model") => CpuMode::HostModel,
            Some("custom") => CpuMode::Custom,
            Some("maximum") => CpuMode::Maximum,
            _ => CpuMode::Unspecified,
        }
    }

    /// The libvirt `mode` attribute, if any.
    pub fn as_libvirt(&self) -> Option<&'static str> {
        match self {
            CpuMode::HostPassthrough => Some("host-passthrough"),
            CpuMode::HostModel => Some("host-model"),
            CpuMode::Custom => Some("custom"),
            CpuMode::Maximum => Some("maximum"),
            CpuMode::Unspecified => None,
        }
    }
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
    Vmdk,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
        }
    }

    /// Parse a libvirt format string. Unknown formats are treated as raw.
    pub fn parse(s: &str) -> Self {
        match s {
            "qcow2" => DiskFormat::Qcow2,
            "vmdk" => DiskFormat::Vmdk,
            _ => DiskFormat::Raw,
        }
    }
}

/// A disk attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDisk {
    /// Guest device name (vda, sdb, ...)
    pub target: String,
    /// Host path of the image
    pub path: String,
    /// Image format
    pub format: DiskFormat,
    /// Storage pool, when the disk is defined as a pool volume
    pub pool: Option<String>,
    /// Volume name inside `pool`
    pub volume: Option<String>,
    /// Read-only flag
    pub readonly: bool,
}

/// A network interface attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainNic {
    /// MAC address
    pub mac: Option<String>,
    /// Interface type (network, bridge, direct, ...)
    pub kind: String,
    /// Network or bridge name
    pub source: Option<String>,
    /// NIC model
    pub model: Option<String>,
}

/// Cached snapshot of a domain's metadata.
///
/// Always derived from the endpoint; may be stale between refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub uuid: String,
    pub name: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub cpu_mode: CpuMode,
    /// CPU features the definition requires from the host
    pub required_cpu_features: Vec<String>,
    /// Whether the definition survives a shutdown
    pub persistent: bool,
    pub disks: Vec<DomainDisk>,
    pub nics: Vec<DomainNic>,
}

impl DomainRecord {
    /// Summary row for listings.
    pub fn summary(&self) -> DomainSummary {
        DomainSummary {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            state: self.state,
        }
    }
}

/// Runtime counters of a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub uuid: String,
    pub state: DomainState,
    /// Total CPU time consumed (nanoseconds)
    pub cpu_time_ns: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

// =============================================================================
// HOST
// =============================================================================

/// Host topology and CPU capabilities of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HostCapabilities {
    pub hostname: String,
    /// CPU architecture (x86_64, aarch64, ...)
    pub arch: String,
    pub cpu_model: String,
    pub cpu_vendor: String,
    pub cpu_features: BTreeSet<String>,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    /// Hypervisor driver and version (e.g. "QEMU 8.2.0")
    pub hypervisor: String,
}

// =============================================================================
// STORAGE
// =============================================================================

/// Type of storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Local directory (file-based)
    Dir,
    /// Local filesystem on a block device
    Fs,
    /// NFS / network filesystem
    Netfs,
    /// Local LVM
    Logical,
    /// Ceph RBD
    Rbd,
    /// iSCSI
    Iscsi,
    /// GlusterFS
    Gluster,
    Other,
}

impl PoolKind {
    /// Parse the libvirt pool `type` attribute.
    pub fn from_libvirt(kind: &str) -> Self {
        match kind {
            "dir" => PoolKind::Dir,
            "fs" => PoolKind::Fs,
            "netfs" => PoolKind::Netfs,
            "logical" => PoolKind::Logical,
            "rbd" => PoolKind::Rbd,
            "iscsi" | "iscsi-direct" => PoolKind::Iscsi,
            "gluster" => PoolKind::Gluster,
            _ => PoolKind::Other,
        }
    }

    /// Whether volumes of this pool are reachable from several hosts.
    pub fn is_shared(&self) -> bool {
        match self {
            PoolKind::Netfs | PoolKind::Rbd | PoolKind::Iscsi | PoolKind::Gluster => true,
            PoolKind::Dir | PoolKind::Fs | PoolKind::Logical | PoolKind::Other => false,
        }
    }
}

/// A storage pool on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub kind: PoolKind,
    pub active: bool,
    /// Directory or device the pool's volumes live under
    pub target_path: Option<String>,
    pub capacity_bytes: u64,
    pub available_bytes: u64,
}

/// A storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub pool: String,
    pub path: String,
    pub format: DiskFormat,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    /// Backing file of a copy-on-write overlay
    pub backing_path: Option<String>,
}

/// Request to create a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub format: DiskFormat,
    pub capacity_bytes: u64,
    /// Backing image of the new overlay (path, format)
    pub backing: Option<(String, DiskFormat)>,
}

// =============================================================================
// EVENTS
// =============================================================================

/// Lifecycle event codes, numbered like libvirt's `virDomainEventType`.
pub mod lifecycle {
    pub const DEFINED: i32 = 0;
    pub const UNDEFINED: i32 = 1;
    pub const STARTED: i32 = 2;
    pub const SUSPENDED: i32 = 3;
    pub const RESUMED: i32 = 4;
    pub const STOPPED: i32 = 5;
    pub const SHUTDOWN: i32 = 6;
    pub const PMSUSPENDED: i32 = 7;
    pub const CRASHED: i32 = 8;
}

/// A lifecycle notification as delivered by an endpoint, before
/// normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDomainEvent {
    pub domain_uuid: String,
    /// One of the [`lifecycle`] codes
    pub code: i32,
    /// Backend specific detail code
    pub detail: i32,
}

// =============================================================================
// MIGRATION
// =============================================================================

/// Flags requested for a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MigrationFlags {
    /// Live migration of a running domain (offline otherwise)
    pub live: bool,
    /// Copy all disk contents to the destination
    pub copy_storage_all: bool,
    /// Skip the hypervisor's safety checks (cache modes, ...)
    #[serde(rename = "unsafe")]
    pub unsafe_migration: bool,
    /// Persist the definition on the destination
    pub persistent: bool,
    pub compressed: bool,
    /// Tunnel the data through the hypervisor connection
    pub tunnelled: bool,
    /// Cold migration with disks prepared by vmfleet itself
    pub custom_non_shared: bool,
    /// Remove the definition from the source once migrated
    pub undefine_source: bool,
}

impl MigrationFlags {
    /// Whether disk contents have to be moved to the destination.
    pub fn moves_storage(&self) -> bool {
        self.copy_storage_all || self.custom_non_shared
    }
}
