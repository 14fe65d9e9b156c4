//! Destination storage preparation for non-shared migrations.
//!
//! Chains are planned and created bottom-up: a base exists on the
//! destination before any overlay that references it. Images shared by
//! several disks are handled once.

use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};
use vmfleet_hypervisor::{Hypervisor, HypervisorError, VolumeInfo, VolumeSpec};

use super::job::{ChainLink, CreatedVolume, DiskAction, DiskPlan};
use super::preflight::ResolvedDisk;

/// Decide per image what the destination needs, from a fresh volume
/// listing of each pool involved.
pub async fn plan(
    disks: &[ResolvedDisk],
    destination: &dyn Hypervisor,
) -> Result<Vec<DiskPlan>, HypervisorError> {
    let mut listings: BTreeMap<String, HashMap<String, VolumeInfo>> = BTreeMap::new();
    for disk in disks {
        for volume in &disk.chain {
            if !listings.contains_key(&volume.pool) {
                let existing = destination
                    .list_volumes(&volume.pool)
                    .await?
                    .into_iter()
                    .map(|v| (v.name.clone(), v))
                    .collect();
                listings.insert(volume.pool.clone(), existing);
            }
        }
    }

    let plans = disks
        .iter()
        .map(|disk| {
            let top = disk.chain.len().saturating_sub(1);
            let chain = disk
                .chain
                .iter()
                .enumerate()
                .map(|(i, source)| {
                    let existing = listings.get(&source.pool).and_then(|l| l.get(&source.name));
                    let (action, dest_path) = match existing {
                        Some(v) if matches_image(source, v) => (DiskAction::Reuse, Some(v.path.clone())),
                        _ if i == top => (DiskAction::Create, None),
                        _ => (DiskAction::Copy, None),
                    };
                    ChainLink {
                        source_path: source.path.clone(),
                        volume: source.name.clone(),
                        format: source.format,
                        capacity_bytes: source.capacity_bytes,
                        dest_pool: source.pool.clone(),
                        dest_path,
                        action,
                    }
                })
                .collect();
            DiskPlan {
                target: disk.target.clone(),
                source_path: disk.path.clone(),
                chain,
            }
        })
        .collect();

    Ok(plans)
}

/// Same base image identity: name, format and size.
pub(super) fn matches_image(source: &VolumeInfo, dest: &VolumeInfo) -> bool {
    source.name == dest.name
        && source.format == dest.format
        && source.capacity_bytes == dest.capacity_bytes
}

/// Create every missing image of `plans` on the destination.
///
/// Volumes are recorded in `created` as soon as they exist, so the caller
/// can roll back whatever was done before a failure.
pub async fn prepare(
    plans: &mut [DiskPlan],
    destination: &dyn Hypervisor,
    created: &mut Vec<CreatedVolume>,
) -> Result<(), HypervisorError> {
    // source path -> destination path of images already handled
    let mut done: HashMap<String, String> = HashMap::new();

    for plan in plans.iter_mut() {
        let mut below: Option<(String, vmfleet_hypervisor::DiskFormat)> = None;

        for link in plan.chain.iter_mut() {
            if let Some(path) = done.get(&link.source_path) {
                if link.dest_path.is_none() {
                    link.dest_path = Some(path.clone());
                }
            } else if link.action != DiskAction::Reuse {
                let spec = VolumeSpec {
                    name: link.volume.clone(),
                    format: link.format,
                    capacity_bytes: link.capacity_bytes,
                    backing: below.clone(),
                };
                let volume = destination.create_volume(&link.dest_pool, &spec).await?;
                info!(
                    pool = %link.dest_pool,
                    volume = %volume.name,
                    action = ?link.action,
                    "Destination volume created"
                );
                created.push(CreatedVolume {
                    pool: link.dest_pool.clone(),
                    name: volume.name.clone(),
                    path: volume.path.clone(),
                });
                link.dest_path = Some(volume.path);
            }

            let dest_path = link
                .dest_path
                .clone()
                .ok_or_else(|| HypervisorError::Internal(format!("no destination path for {}", link.volume)))?;
            done.insert(link.source_path.clone(), dest_path.clone());
            below = Some((dest_path, link.format));
        }
    }

    Ok(())
}

/// Delete `created` volumes, newest first. Failures are logged, not returned.
pub async fn rollback(created: &[CreatedVolume], destination: &dyn Hypervisor) -> usize {
    let mut removed = 0;
    for volume in created.iter().rev() {
        match destination.delete_volume(&volume.pool, &volume.name).await {
            Ok(()) => {
                removed += 1;
                info!(pool = %volume.pool, volume = %volume.name, "Rolled back destination volume");
            }
            Err(e) => warn!(
                pool = %volume.pool,
                volume = %volume.name,
                error = %e,
                "Could not roll back destination volume"
            ),
        }
    }
    removed
}

/// Source paths whose contents the transfer has to carry.
pub fn paths_to_copy(plans: &[DiskPlan]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    plans
        .iter()
        .flat_map(|p| p.chain.iter())
        .filter(|l| l.action != DiskAction::Reuse)
        .filter(|l| seen.insert(l.source_path.as_str()))
        .map(|l| l.source_path.clone())
        .collect()
}

/// Source to destination path of every disk whose location changes.
pub fn relocations(plans: &[DiskPlan]) -> HashMap<String, String> {
    plans
        .iter()
        .filter_map(|p| {
            let top = p.top()?;
            let dest = top.dest_path.as_ref()?;
            (dest != &p.source_path).then(|| (p.source_path.clone(), dest.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_hypervisor::{DiskFormat, MockBackend, PoolInfo, PoolKind};

    fn image(name: &str, backing: Option<&str>) -> VolumeInfo {
        VolumeInfo {
            name: name.to_string(),
            pool: "default".to_string(),
            path: format!("/src/images/{}", name),
            format: DiskFormat::Qcow2,
            capacity_bytes: 10 << 30,
            allocation_bytes: 1 << 30,
            backing_path: backing.map(|b| format!("/src/images/{}", b)),
        }
    }

    fn destination() -> MockBackend {
        let dest = MockBackend::new("qemu+ssh://dst/system");
        dest.add_pool(PoolInfo {
            name: "default".to_string(),
            kind: PoolKind::Dir,
            active: true,
            target_path: Some("/dst/images".to_string()),
            capacity_bytes: 1 << 40,
            available_bytes: 1 << 40,
        });
        dest
    }

    fn disk(target: &str, chain: Vec<VolumeInfo>) -> ResolvedDisk {
        ResolvedDisk {
            target: target.to_string(),
            path: chain.last().map(|v| v.path.clone()).unwrap_or_default(),
            chain,
            shared: false,
        }
    }

    #[tokio::test]
    async fn test_plan_and_prepare_shared_base() {
        let dest = destination();
        let base = image("base.qcow2", None);
        let disks = vec![
            disk("vda", vec![base.clone(), image("a.qcow2", Some("base.qcow2"))]),
            disk("vdb", vec![base, image("b.qcow2", Some("base.qcow2"))]),
        ];

        let mut plans = plan(&disks, &dest).await.unwrap();
        assert_eq!(plans[0].chain[0].action, DiskAction::Copy);
        assert_eq!(plans[0].chain[1].action, DiskAction::Create);

        let mut created = Vec::new();
        prepare(&mut plans, &dest, &mut created).await.unwrap();

        // the shared base is created once, before both overlays
        assert_eq!(created.len(), 3);
        assert_eq!(created[0].name, "base.qcow2");
        let volumes = dest.volumes("default");
        let overlay = volumes.iter().find(|v| v.name == "b.qcow2").unwrap();
        assert_eq!(overlay.backing_path.as_deref(), Some("/dst/images/base.qcow2"));

        let relocated = relocations(&plans);
        assert_eq!(relocated.get("/src/images/a.qcow2").map(String::as_str), Some("/dst/images/a.qcow2"));
        assert_eq!(paths_to_copy(&plans).len(), 3);
    }

    #[tokio::test]
    async fn test_matching_volume_is_reused() {
        let dest = destination();
        let mut existing = image("base.qcow2", None);
        existing.path = "/dst/images/base.qcow2".to_string();
        dest.add_volume(existing);

        let disks = vec![disk("vda", vec![image("base.qcow2", None), image("top.qcow2", Some("base.qcow2"))])];
        let mut plans = plan(&disks, &dest).await.unwrap();
        assert_eq!(plans[0].chain[0].action, DiskAction::Reuse);

        let mut created = Vec::new();
        prepare(&mut plans, &dest, &mut created).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "top.qcow2");
    }

    #[tokio::test]
    async fn test_size_mismatch_is_not_reused() {
        let dest = destination();
        let mut existing = image("vm.qcow2", None);
        existing.capacity_bytes = 1;
        dest.add_volume(existing);

        let plans = plan(&[disk("vda", vec![image("vm.qcow2", None)])], &dest).await.unwrap();
        assert_eq!(plans[0].chain[0].action, DiskAction::Create);
    }

    #[tokio::test]
    async fn test_failure_leaves_record_for_rollback() {
        let dest = destination();
        let disks = vec![disk("vda", vec![image("base.qcow2", None), image("top.qcow2", Some("base.qcow2"))])];
        let mut plans = plan(&disks, &dest).await.unwrap();

        // the base succeeds, the overlay targets a pool that does not exist
        plans[0].chain[1].dest_pool = "gone".to_string();
        let mut created = Vec::new();
        let err = prepare(&mut plans, &dest, &mut created).await.unwrap_err();
        assert!(matches!(err, HypervisorError::PoolNotFound(_)));
        assert_eq!(created.len(), 1);

        assert_eq!(rollback(&created, &dest).await, 1);
        assert!(dest.volumes("default").is_empty());
    }
}
