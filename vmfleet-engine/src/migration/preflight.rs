//! Compatibility checks run before anything is changed.
//!
//! Every fact is read with a fresh call on the source or destination
//! handle. The cache is never consulted here.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use vmfleet_hypervisor::{
    CpuMode, DomainRecord, DomainState, Hypervisor, HypervisorError, MigrationFlags, PoolInfo,
    VolumeInfo,
};

use super::storage::matches_image;

/// Longest backing chain followed before giving up.
pub const MAX_CHAIN_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One finding of the compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightIssue {
    pub severity: Severity,
    pub message: String,
}

impl PreflightIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self { severity: Severity::Error, message: message.into() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, message: message.into() }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self { severity: Severity::Info, message: message.into() }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A guest disk with its backing chain resolved on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDisk {
    pub target: String,
    pub path: String,
    /// Base first, the disk's own volume last
    pub chain: Vec<VolumeInfo>,
    /// Whether the disk's pool is reachable from both hosts
    pub shared: bool,
}

/// Everything the later steps need from the check.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub issues: Vec<PreflightIssue>,
    pub domain: Option<DomainRecord>,
    /// Source definition, used to restore persistence on the destination
    pub source_xml: Option<String>,
    /// Disks whose contents have to move
    pub disks: Vec<ResolvedDisk>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        !self.issues.iter().any(PreflightIssue::is_blocking)
    }

    /// Messages of the blocking issues.
    pub fn blocking(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.is_blocking())
            .map(|i| i.message.clone())
            .collect()
    }

    fn push(&mut self, issue: PreflightIssue) {
        debug!(severity = ?issue.severity, message = %issue.message, "Preflight finding");
        self.issues.push(issue);
    }
}

/// Inputs of a compatibility check.
pub struct Preflight<'a> {
    pub domain_uuid: &'a str,
    pub source_name: &'a str,
    pub destination_name: &'a str,
    pub source: Arc<dyn Hypervisor>,
    pub destination: Arc<dyn Hypervisor>,
    pub flags: &'a MigrationFlags,
}

impl Preflight<'_> {
    /// Run every check and collect the findings.
    pub async fn run(&self) -> PreflightReport {
        let mut report = PreflightReport::default();

        if self.source_name == self.destination_name {
            report.push(PreflightIssue::error("source and destination are the same endpoint"));
            return report;
        }

        match self.destination.health_check().await {
            Ok(true) => {}
            Ok(false) => {
                report.push(PreflightIssue::error(format!(
                    "destination {} is not responding",
                    self.destination_name
                )));
                return report;
            }
            Err(e) => {
                report.push(PreflightIssue::error(format!(
                    "destination {} unreachable: {}",
                    self.destination_name, e
                )));
                return report;
            }
        }

        let domain = match self.source.domain_info(self.domain_uuid).await {
            Ok(domain) => domain,
            Err(HypervisorError::DomainNotFound(_)) => {
                report.push(PreflightIssue::error(format!(
                    "domain {} not found on {}",
                    self.domain_uuid, self.source_name
                )));
                return report;
            }
            Err(e) => {
                report.push(PreflightIssue::error(format!("cannot describe domain: {}", e)));
                return report;
            }
        };

        self.check_state(&domain, &mut report);
        self.check_destination_domains(&domain, &mut report).await;
        self.check_cpu(&domain, &mut report).await;
        self.check_storage(&domain, &mut report).await;

        match self.source.domain_xml(self.domain_uuid).await {
            Ok(xml) => report.source_xml = Some(xml),
            Err(e) => report.push(PreflightIssue::error(format!(
                "cannot read domain definition: {}",
                e
            ))),
        }

        report.domain = Some(domain);
        report
    }

    fn check_state(&self, domain: &DomainRecord, report: &mut PreflightReport) {
        if self.flags.live && domain.state != DomainState::Running {
            report.push(PreflightIssue::error(format!(
                "live migration requires a running domain, '{}' is {}",
                domain.name, domain.state
            )));
        }
        if self.flags.custom_non_shared && domain.state.is_active() {
            report.push(PreflightIssue::error(format!(
                "custom migration requires '{}' to be stopped",
                domain.name
            )));
        }
        if self.flags.custom_non_shared && self.flags.live {
            report.push(PreflightIssue::error(
                "custom migration is a cold migration and cannot be live",
            ));
        }
        if !domain.persistent && !self.flags.persistent {
            report.push(PreflightIssue::warning(format!(
                "'{}' is transient and will not be persisted on the destination",
                domain.name
            )));
        }
    }

    async fn check_destination_domains(&self, domain: &DomainRecord, report: &mut PreflightReport) {
        let listing = match self.destination.list_domains().await {
            Ok(listing) => listing,
            Err(e) => {
                report.push(PreflightIssue::error(format!(
                    "cannot list domains on destination: {}",
                    e
                )));
                return;
            }
        };

        for other in listing.iter().filter(|d| d.name == domain.name) {
            if other.state.is_active() {
                report.push(PreflightIssue::error(format!(
                    "a domain named '{}' is already running on {}",
                    domain.name, self.destination_name
                )));
            } else if other.uuid != domain.uuid {
                report.push(PreflightIssue::error(format!(
                    "a different domain named '{}' is defined on {}",
                    domain.name, self.destination_name
                )));
            } else {
                report.push(PreflightIssue::info(format!(
                    "the stopped definition of '{}' on {} will be replaced",
                    domain.name, self.destination_name
                )));
            }
        }
    }

    async fn check_cpu(&self, domain: &DomainRecord, report: &mut PreflightReport) {
        let (source, destination) = match (
            self.source.host_capabilities().await,
            self.destination.host_capabilities().await,
        ) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => {
                report.push(PreflightIssue::error(format!("cannot read host capabilities: {}", e)));
                return;
            }
        };

        if source.arch != destination.arch {
            report.push(PreflightIssue::error(format!(
                "architecture mismatch: source is {}, destination is {}",
                source.arch, destination.arch
            )));
            return;
        }

        let mut wanted: BTreeSet<&String> = source.cpu_features.iter().collect();
        wanted.extend(domain.required_cpu_features.iter());
        let missing: Vec<&str> = wanted
            .into_iter()
            .filter(|f| !destination.cpu_features.contains(*f))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            if source.cpu_model != destination.cpu_model {
                report.push(PreflightIssue::info(format!(
                    "CPU models differ ({} / {}) but features match",
                    source.cpu_model, destination.cpu_model
                )));
            }
            return;
        }

        let message = format!("destination CPU lacks features: {}", missing.join(", "));
        if domain.cpu_mode == CpuMode::HostPassthrough {
            report.push(PreflightIssue::error(format!("{} (host-passthrough)", message)));
        } else {
            report.push(PreflightIssue::warning(message));
        }
    }

    async fn check_storage(&self, domain: &DomainRecord, report: &mut PreflightReport) {
        let source_pools = match list_pools_with_volumes(self.source.as_ref()).await {
            Ok(pools) => pools,
            Err(e) => {
                report.push(PreflightIssue::error(format!("cannot list source storage: {}", e)));
                return;
            }
        };
        let dest_pools: BTreeMap<String, PoolInfo> = match self.destination.list_pools().await {
            Ok(pools) => pools.into_iter().map(|p| (p.name.clone(), p)).collect(),
            Err(e) => {
                report.push(PreflightIssue::error(format!(
                    "cannot list destination storage pools: {}",
                    e
                )));
                return;
            }
        };

        let moves_storage = self.flags.moves_storage();
        let mut required: BTreeMap<String, u64> = BTreeMap::new();
        // destination pool -> its volumes by name, listed on first use
        let mut dest_volumes: BTreeMap<String, HashMap<String, VolumeInfo>> = BTreeMap::new();
        let mut clashes: BTreeSet<(String, String)> = BTreeSet::new();

        for disk in &domain.disks {
            let chain = match resolve_chain(&disk.path, &source_pools) {
                Ok(chain) => chain,
                Err(ChainError::Unmanaged(path)) => {
                    if moves_storage {
                        report.push(PreflightIssue::error(format!(
                            "disk {} ({}) is not a managed volume and cannot be moved",
                            disk.target, path
                        )));
                    } else {
                        report.push(PreflightIssue::info(format!(
                            "disk {} ({}) must be reachable from the destination",
                            disk.target, path
                        )));
                    }
                    continue;
                }
                Err(e) => {
                    report.push(PreflightIssue::error(format!(
                        "backing chain of disk {} unresolvable: {}",
                        disk.target, e
                    )));
                    continue;
                }
            };

            let mut shared = true;
            for volume in &chain {
                let kind = source_pools.get(&volume.pool).map(|(info, _)| info.kind);
                let pool_shared = kind.map(|k| k.is_shared()).unwrap_or(false);
                shared &= pool_shared;

                match dest_pools.get(&volume.pool) {
                    Some(pool) if !pool.active => report.push(PreflightIssue::error(format!(
                        "storage pool '{}' is inactive on the destination",
                        volume.pool
                    ))),
                    Some(_) => {}
                    None => report.push(PreflightIssue::error(format!(
                        "storage pool '{}' missing on the destination",
                        volume.pool
                    ))),
                }

                if !pool_shared && !moves_storage {
                    report.push(PreflightIssue::error(format!(
                        "disk {} uses local pool '{}'; copy_storage_all or custom_non_shared is required",
                        disk.target, volume.pool
                    )));
                }
                if !pool_shared {
                    *required.entry(volume.pool.clone()).or_insert(0) += volume.capacity_bytes;
                }

                if moves_storage && !pool_shared {
                    if let Some(pool) = dest_pools.get(&volume.pool).filter(|p| p.active) {
                        if !dest_volumes.contains_key(&pool.name) {
                            let listing = match self.destination.list_volumes(&pool.name).await {
                                Ok(volumes) => volumes.into_iter().map(|v| (v.name.clone(), v)).collect(),
                                Err(e) => {
                                    report.push(PreflightIssue::error(format!(
                                        "cannot list volumes of destination pool '{}': {}",
                                        pool.name, e
                                    )));
                                    HashMap::new()
                                }
                            };
                            dest_volumes.insert(pool.name.clone(), listing);
                        }

                        let existing = dest_volumes.get(&pool.name).and_then(|l| l.get(&volume.name));
                        if let Some(existing) = existing {
                            if !matches_image(volume, existing)
                                && clashes.insert((pool.name.clone(), volume.name.clone()))
                            {
                                report.push(PreflightIssue::error(format!(
                                    "volume '{}' already exists in destination pool '{}' as {} {} bytes, source is {} {} bytes",
                                    volume.name,
                                    pool.name,
                                    existing.format.as_str(),
                                    existing.capacity_bytes,
                                    volume.format.as_str(),
                                    volume.capacity_bytes
                                )));
                            }
                        }
                    }
                }
            }

            if !shared && moves_storage {
                report.disks.push(ResolvedDisk {
                    target: disk.target.clone(),
                    path: disk.path.clone(),
                    chain,
                    shared,
                });
            }
        }

        if moves_storage {
            for (pool, bytes) in required {
                if let Some(info) = dest_pools.get(&pool) {
                    if info.available_bytes < bytes {
                        report.push(PreflightIssue::warning(format!(
                            "pool '{}' on the destination has {} bytes free, disks may grow to {}",
                            pool, info.available_bytes, bytes
                        )));
                    }
                }
            }
        }
    }
}

type PoolIndex = BTreeMap<String, (PoolInfo, Vec<VolumeInfo>)>;

async fn list_pools_with_volumes(handle: &dyn Hypervisor) -> Result<PoolIndex, HypervisorError> {
    let mut index = BTreeMap::new();
    for pool in handle.list_pools().await? {
        let volumes = if pool.active {
            handle.list_volumes(&pool.name).await?
        } else {
            Vec::new()
        };
        index.insert(pool.name.clone(), (pool, volumes));
    }
    Ok(index)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum ChainError {
    #[error("{0} is not a managed volume")]
    Unmanaged(String),
    #[error("backing file {0} not found in any pool")]
    MissingBacking(String),
    #[error("cycle at {0}")]
    Cycle(String),
    #[error("deeper than {} images", MAX_CHAIN_DEPTH)]
    TooDeep,
}

fn find_volume<'a>(path: &str, pools: &'a PoolIndex) -> Option<&'a VolumeInfo> {
    pools
        .values()
        .flat_map(|(_, volumes)| volumes.iter())
        .find(|v| v.path == path)
}

/// Follow backing files from `path` down to the base. Base first.
fn resolve_chain(path: &str, pools: &PoolIndex) -> Result<Vec<VolumeInfo>, ChainError> {
    let top = find_volume(path, pools).ok_or_else(|| ChainError::Unmanaged(path.to_string()))?;

    let mut seen = HashSet::new();
    seen.insert(top.path.clone());
    let mut chain = vec![top.clone()];

    while let Some(backing) = chain.last().and_then(|v| v.backing_path.clone()) {
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(ChainError::TooDeep);
        }
        if !seen.insert(backing.clone()) {
            return Err(ChainError::Cycle(backing));
        }
        let volume = find_volume(&backing, pools).ok_or(ChainError::MissingBacking(backing))?;
        chain.push(volume.clone());
    }

    chain.reverse();
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_hypervisor::mock::sample_domain;
    use vmfleet_hypervisor::{DiskFormat, MockBackend, PoolKind};

    fn volume(pool: &str, name: &str, backing: Option<&str>) -> VolumeInfo {
        VolumeInfo {
            name: name.to_string(),
            pool: pool.to_string(),
            path: format!("/pools/{}/{}", pool, name),
            format: DiskFormat::Qcow2,
            capacity_bytes: 1 << 30,
            allocation_bytes: 0,
            backing_path: backing.map(|b| format!("/pools/{}/{}", pool, b)),
        }
    }

    fn pool(name: &str, kind: PoolKind) -> PoolInfo {
        PoolInfo {
            name: name.to_string(),
            kind,
            active: true,
            target_path: Some(format!("/pools/{}", name)),
            capacity_bytes: 1 << 40,
            available_bytes: 1 << 40,
        }
    }

    fn index(volumes: Vec<VolumeInfo>) -> PoolIndex {
        let mut index = PoolIndex::new();
        index.insert("p".to_string(), (pool("p", PoolKind::Dir), volumes));
        index
    }

    #[test]
    fn test_resolve_chain_base_first() {
        let pools = index(vec![
            volume("p", "base.qcow2", None),
            volume("p", "mid.qcow2", Some("base.qcow2")),
            volume("p", "top.qcow2", Some("mid.qcow2")),
        ]);
        let chain = resolve_chain("/pools/p/top.qcow2", &pools).unwrap();
        let names: Vec<&str> = chain.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["base.qcow2", "mid.qcow2", "top.qcow2"]);
    }

    #[test]
    fn test_resolve_chain_failures() {
        let pools = index(vec![
            volume("p", "a", Some("b")),
            volume("p", "b", Some("a")),
            volume("p", "orphan", Some("gone")),
        ]);
        assert!(matches!(resolve_chain("/pools/p/a", &pools), Err(ChainError::Cycle(_))));
        assert!(matches!(
            resolve_chain("/pools/p/orphan", &pools),
            Err(ChainError::MissingBacking(_))
        ));
        assert!(matches!(resolve_chain("/elsewhere.img", &pools), Err(ChainError::Unmanaged(_))));

        let mut deep = vec![volume("p", "v0", None)];
        for i in 1..=MAX_CHAIN_DEPTH {
            deep.push(volume("p", &format!("v{}", i), Some(&format!("v{}", i - 1))));
        }
        let pools = index(deep);
        let top = format!("/pools/p/v{}", MAX_CHAIN_DEPTH);
        assert_eq!(resolve_chain(&top, &pools), Err(ChainError::TooDeep));
    }

    fn hosts() -> (Arc<MockBackend>, Arc<MockBackend>) {
        let source = Arc::new(MockBackend::new("qemu+ssh://src/system"));
        let dest = Arc::new(MockBackend::new("qemu+ssh://dst/system"));
        for host in [&source, &dest] {
            host.add_pool(pool("p", PoolKind::Dir));
        }
        (source, dest)
    }

    async fn run(
        source: &Arc<MockBackend>,
        dest: &Arc<MockBackend>,
        uuid: &str,
        flags: MigrationFlags,
    ) -> PreflightReport {
        Preflight {
            domain_uuid: uuid,
            source_name: "src",
            destination_name: "dst",
            source: source.clone(),
            destination: dest.clone(),
            flags: &flags,
        }
        .run()
        .await
    }

    #[tokio::test]
    async fn test_local_disk_needs_storage_flags() {
        let (source, dest) = hosts();
        source.add_volume(volume("p", "vm.qcow2", None));
        let mut domain = sample_domain("vm", DomainState::Running);
        domain.disks[0].path = "/pools/p/vm.qcow2".to_string();
        source.add_domain(domain.clone());

        let flags = MigrationFlags { live: true, ..Default::default() };
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(!report.passed());
        assert!(report.blocking()[0].contains("copy_storage_all"));

        let flags = MigrationFlags { live: true, copy_storage_all: true, ..Default::default() };
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(report.passed(), "{:?}", report.issues);
        assert_eq!(report.disks.len(), 1);
        assert!(report.source_xml.is_some());
    }

    #[tokio::test]
    async fn test_destination_volume_clash() {
        let (source, dest) = hosts();
        let mut image = volume("p", "vm.qcow2", None);
        image.capacity_bytes = 20 << 30;
        source.add_volume(image.clone());
        let mut domain = sample_domain("vm", DomainState::Running);
        domain.disks[0].path = "/pools/p/vm.qcow2".to_string();
        source.add_domain(domain.clone());

        // same name, smaller image already on the destination
        dest.add_volume(volume("p", "vm.qcow2", None));
        let flags = MigrationFlags { live: true, copy_storage_all: true, ..Default::default() };
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(!report.passed());
        let blocking = report.blocking();
        assert_eq!(blocking.len(), 1, "{:?}", blocking);
        assert!(blocking[0].contains("'vm.qcow2' already exists"));
        assert_eq!(dest.calls("create_volume"), 0);

        // an identical image is reused, not a clash
        dest.add_volume(image);
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(report.passed(), "{:?}", report.issues);
    }

    #[tokio::test]
    async fn test_cpu_passthrough_and_arch() {
        let (source, dest) = hosts();
        let mut caps = dest.host_capabilities().await.unwrap();
        caps.cpu_features.remove("avx2");
        dest.set_capabilities(caps.clone());

        let mut domain = sample_domain("vm", DomainState::Running);
        domain.disks.clear();
        source.add_domain(domain.clone());
        let flags = MigrationFlags { live: true, ..Default::default() };

        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(report.passed());
        assert!(report.issues.iter().any(|i| i.severity == Severity::Warning && i.message.contains("avx2")));

        let mut passthrough = domain.clone();
        passthrough.cpu_mode = CpuMode::HostPassthrough;
        source.add_domain(passthrough);
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(!report.passed());

        caps.arch = "aarch64".to_string();
        dest.set_capabilities(caps);
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(report.blocking().iter().any(|m| m.contains("architecture")));
    }

    #[tokio::test]
    async fn test_state_and_name_conflicts() {
        let (source, dest) = hosts();
        let mut domain = sample_domain("vm", DomainState::Stopped);
        domain.disks.clear();
        source.add_domain(domain.clone());

        let live = MigrationFlags { live: true, ..Default::default() };
        let report = run(&source, &dest, &domain.uuid, live).await;
        assert!(report.blocking().iter().any(|m| m.contains("running domain")));

        let mut clash = sample_domain("vm", DomainState::Running);
        clash.disks.clear();
        dest.add_domain(clash);
        let report = run(&source, &dest, &domain.uuid, MigrationFlags::default()).await;
        assert!(report.blocking().iter().any(|m| m.contains("already running")));
    }

    #[tokio::test]
    async fn test_missing_pool_and_same_endpoint() {
        let (source, dest) = hosts();
        source.add_pool(pool("nfs", PoolKind::Netfs));
        source.add_volume(volume("nfs", "vm.qcow2", None));
        let mut domain = sample_domain("vm", DomainState::Running);
        domain.disks[0].path = "/pools/nfs/vm.qcow2".to_string();
        source.add_domain(domain.clone());

        let flags = MigrationFlags { live: true, ..Default::default() };
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(report.blocking().iter().any(|m| m.contains("'nfs' missing")));

        dest.add_pool(pool("nfs", PoolKind::Netfs));
        let report = run(&source, &dest, &domain.uuid, flags).await;
        assert!(report.passed(), "{:?}", report.issues);
        assert!(report.disks.is_empty());

        let report = Preflight {
            domain_uuid: &domain.uuid,
            source_name: "src",
            destination_name: "src",
            source: source.clone(),
            destination: source.clone(),
            flags: &flags,
        }
        .run()
        .await;
        assert!(!report.passed());
    }
}
