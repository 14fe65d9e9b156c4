//! Integration tests for the state engine.
//!
//! Every test runs the full engine against simulated hosts from
//! `MockCluster`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use vmfleet_engine::{
    DiskAction, DomainAction, EndpointConfig, EndpointStatus, Engine, EngineConfig, EngineError, EventKind,
    JobState, MigrationJob, Operation, Query,
};
use vmfleet_hypervisor::mock::sample_domain;
use vmfleet_hypervisor::{
    ConnectBehavior, DiskFormat, DomainRecord, DomainState, MigrationFlags, MockBackend,
    MockCluster, PoolInfo, PoolKind, VolumeInfo,
};

const E1: &str = "qemu+ssh://root@node1/system";
const E2: &str = "qemu+ssh://root@node2/system";
const IMAGES: &str = "/var/lib/libvirt/images";

fn default_pool() -> PoolInfo {
    PoolInfo {
        name: "default".to_string(),
        kind: PoolKind::Dir,
        active: true,
        target_path: Some(IMAGES.to_string()),
        capacity_bytes: 500 << 30,
        available_bytes: 400 << 30,
    }
}

fn host(cluster: &MockCluster, uri: &str) -> Arc<MockBackend> {
    let host = cluster.add_host(uri);
    host.add_pool(default_pool());
    host
}

/// A domain with one qcow2 disk in the `default` pool of `host`.
fn domain_with_disk(host: &MockBackend, name: &str, state: DomainState) -> DomainRecord {
    let image = format!("{}.qcow2", name);
    host.add_volume(VolumeInfo {
        name: image.clone(),
        pool: "default".to_string(),
        path: format!("{}/{}", IMAGES, image),
        format: DiskFormat::Qcow2,
        capacity_bytes: 20 << 30,
        allocation_bytes: 3 << 30,
        backing_path: None,
    });
    let record = sample_domain(name, state);
    host.add_domain(record.clone());
    record
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.endpoints = vec![EndpointConfig::new("e1", E1), EndpointConfig::new("e2", E2)];
    config.stats.report_interval_secs = 0;
    config
}

async fn engine(cluster: &Arc<MockCluster>, config: EngineConfig) -> Arc<Engine> {
    let engine = Engine::new(config, cluster.clone()).unwrap();
    engine.connect("e1").await.unwrap();
    engine.connect("e2").await.unwrap();
    engine
}

async fn wait_for_state(engine: &Engine, id: &str, state: JobState) -> MigrationJob {
    for _ in 0..400 {
        let job = engine.job_status(id).unwrap();
        if job.state == state || job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {}", id, state);
}

/// Scenario 1: two fetches within the TTL make one remote call.
#[tokio::test]
async fn test_fetch_within_ttl_hits_cache() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let vm1 = domain_with_disk(&e1, "vm1", DomainState::Running);

    let mut config = config();
    config.cache.ttl_secs.insert(Operation::DomainInfo, Some(300));
    let engine = engine(&cluster, config).await;

    let first = engine.domain_info("e1", &vm1.uuid).await.unwrap();
    let second = engine.domain_info("e1", &vm1.uuid).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(e1.calls("domain_info"), 1);
    let stats = engine.stats_snapshot();
    let op = stats.operation("e1", "domain_info").unwrap();
    assert_eq!(op.total.hits, 1);
    assert_eq!(op.total.misses, 1);
    assert_eq!(op.total.remote_calls, 1);
}

/// Scenario 2: a lifecycle event purges the domain's entries.
#[tokio::test]
async fn test_event_invalidates_domain_entries() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let vm1 = domain_with_disk(&e1, "vm1", DomainState::Running);
    let engine = engine(&cluster, config()).await;
    let mut events = engine.subscribe_events(Some("e1"));

    engine.domain_info("e1", &vm1.uuid).await.unwrap();
    engine.fetch("e1", Query::DomainStats(vm1.uuid.clone())).await.unwrap();

    e1.set_domain_state(&vm1.uuid, DomainState::Stopped);
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(event.kind, EventKind::Stopped);
    assert_eq!(event.domain_uuid, vm1.uuid);

    let info = engine.domain_info("e1", &vm1.uuid).await.unwrap();
    assert_eq!(info.state, DomainState::Stopped);
    assert_eq!(e1.calls("domain_info"), 2);
    engine.fetch("e1", Query::DomainStats(vm1.uuid.clone())).await.unwrap();
    assert_eq!(e1.calls("domain_stats"), 2);
}

/// Scenario 3: copy-storage migration creates the missing volume and completes.
#[tokio::test]
async fn test_copy_storage_migration_creates_volume() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    let e2 = host(&cluster, E2);
    let vm2 = domain_with_disk(&e1, "vm2", DomainState::Running);
    let engine = engine(&cluster, config()).await;

    let flags = MigrationFlags { copy_storage_all: true, ..Default::default() };
    let id = engine.request_migration(&vm2.uuid, "e1", "e2", Some(flags)).unwrap();
    let job = engine.wait_job(&id).await.unwrap();

    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);
    assert_eq!(job.plan.len(), 1);
    assert_eq!(job.plan[0].chain[0].action, DiskAction::Create);

    let volumes = e2.volumes("default");
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].name, "vm2.qcow2");
    assert_eq!(volumes[0].format, DiskFormat::Qcow2);
    assert_eq!(volumes[0].capacity_bytes, 20 << 30);

    let landed = e2.domain(&vm2.uuid).unwrap();
    assert_eq!(landed.state, DomainState::Running);
    assert_eq!(e1.domain(&vm2.uuid).unwrap().state, DomainState::Stopped);
}

/// Scenario 4: a second request for the same domain is rejected until the
/// first job ends.
#[tokio::test]
async fn test_duplicate_migration_rejected() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let mut vm3 = sample_domain("vm3", DomainState::Running);
    vm3.disks.clear();
    e1.add_domain(vm3.clone());
    e1.set_migration_time(Duration::from_millis(300));
    let engine = engine(&cluster, config()).await;

    let flags = MigrationFlags { live: true, ..Default::default() };
    let first = engine.request_migration(&vm3.uuid, "e1", "e2", Some(flags)).unwrap();
    let second = engine.request_migration(&vm3.uuid, "e1", "e2", Some(flags));
    assert_eq!(
        second,
        Err(EngineError::AlreadyMigrating { domain: vm3.uuid.clone(), job_id: first.clone() })
    );

    let done = engine.wait_job(&first).await.unwrap();
    assert!(done.state.is_terminal());

    // the domain is admitted again once the job is over
    let again = engine.request_migration(&vm3.uuid, "e2", "e1", Some(flags)).unwrap();
    assert_ne!(again, first);
    engine.wait_job(&again).await.unwrap();
}

/// Scenario 5: a connect attempt that never answers ends in `Error` with
/// reason `timeout` and is not retried.
#[tokio::test(start_paused = true)]
async fn test_connect_timeout_not_retried() {
    let cluster = Arc::new(MockCluster::new());
    host(&cluster, E1);
    let mut config = config();
    config.endpoints.push(EndpointConfig::new("e3", "qemu+ssh://node3/system"));
    cluster.add_host("qemu+ssh://node3/system");
    cluster.set_behavior("qemu+ssh://node3/system", ConnectBehavior::Hang);

    let engine = Engine::new(config, cluster.clone()).unwrap();
    let err = engine.connect("e3").await.unwrap_err();
    assert!(matches!(err, EngineError::EndpointUnreachable { ref reason, .. } if reason == "timeout"));
    assert_eq!(engine.endpoint_status("e3").unwrap(), EndpointStatus::Error);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(cluster.opens("qemu+ssh://node3/system"), 1);

    cluster.set_behavior("qemu+ssh://node3/system", ConnectBehavior::Accept);
    engine.connect("e3").await.unwrap();
    assert_eq!(engine.endpoint_status("e3").unwrap(), EndpointStatus::Connected);
    assert_eq!(cluster.opens("qemu+ssh://node3/system"), 2);
}

/// Concurrent fetches of an uncached key share one remote call.
#[tokio::test]
async fn test_stampede_protection() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    domain_with_disk(&e1, "vm1", DomainState::Running);
    let engine = engine(&cluster, config()).await;
    e1.set_latency(Duration::from_millis(50));

    let fetches = (0..32).map(|_| engine.list_domains("e1"));
    let results = futures::future::join_all(fetches).await;

    assert_eq!(e1.calls("list_domains"), 1);
    let first = results[0].as_ref().unwrap();
    assert!(results.iter().all(|r| r.as_ref().unwrap() == first));
}

/// A failed compatibility check leaves both hosts untouched.
#[tokio::test]
async fn test_preflight_failure_mutates_nothing() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    let e2 = host(&cluster, E2);
    let vm = domain_with_disk(&e1, "vm4", DomainState::Running);
    let engine = engine(&cluster, config()).await;

    // local storage without a storage flag
    let flags = MigrationFlags { live: true, ..Default::default() };
    let id = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    let job = engine.wait_job(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert!(matches!(job.failure, Some(EngineError::MigrationPreflightFailed(ref issues)) if !issues.is_empty()));
    assert_eq!(e2.calls("create_volume"), 0);
    assert_eq!(e1.calls("migrate_domain"), 0);
    assert!(e2.domain(&vm.uuid).is_none());
}

/// Cancelling during the transfer aborts it, keeps the source intact and
/// rolls back the prepared volumes.
#[tokio::test]
async fn test_cancel_during_transfer() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    let e2 = host(&cluster, E2);
    let vm = domain_with_disk(&e1, "vm5", DomainState::Running);
    e1.set_migration_time(Duration::from_secs(60));
    let engine = engine(&cluster, config()).await;

    let flags = MigrationFlags { live: true, copy_storage_all: true, ..Default::default() };
    let id = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    wait_for_state(&engine, &id, JobState::Transferring).await;
    assert_eq!(e2.volumes("default").len(), 1);

    engine.cancel_job(&id).unwrap();
    let job = tokio::time::timeout(Duration::from_secs(5), engine.wait_job(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(EngineError::Cancelled));
    assert!(job.cancel_requested);
    assert_eq!(e1.domain(&vm.uuid).unwrap().state, DomainState::Running);
    assert!(e2.domain(&vm.uuid).is_none());
    assert!(e2.volumes("default").is_empty());
}

/// Losing the destination mid-transfer fails the job with `EndpointLost`
/// and drops the endpoint's cache.
#[tokio::test]
async fn test_endpoint_loss_fails_job() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    let e2 = host(&cluster, E2);
    let mut vm = sample_domain("vm6", DomainState::Running);
    vm.disks.clear();
    e1.add_domain(vm.clone());
    e1.set_migration_time(Duration::from_secs(60));
    let engine = engine(&cluster, config()).await;

    engine.list_domains("e2").await.unwrap();
    let flags = MigrationFlags { live: true, ..Default::default() };
    let id = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    wait_for_state(&engine, &id, JobState::Transferring).await;

    e2.simulate_loss("link down");
    let job = tokio::time::timeout(Duration::from_secs(5), engine.wait_job(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(EngineError::EndpointLost("e2".to_string())));
    assert_eq!(engine.endpoint_status("e2").unwrap(), EndpointStatus::Error);
    assert!(matches!(engine.list_domains("e2").await, Err(EngineError::NotConnected(_))));
    assert_eq!(e1.domain(&vm.uuid).unwrap().state, DomainState::Running);
}

/// Losing the source mid-transfer still tries the abort; its failure does
/// not hold up the job.
#[tokio::test]
async fn test_source_loss_during_transfer_attempts_abort() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    let e2 = host(&cluster, E2);
    let mut vm = sample_domain("vm13", DomainState::Running);
    vm.disks.clear();
    e1.add_domain(vm.clone());
    e1.set_migration_time(Duration::from_secs(60));
    let engine = engine(&cluster, config()).await;

    let flags = MigrationFlags { live: true, ..Default::default() };
    let id = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    wait_for_state(&engine, &id, JobState::Transferring).await;

    e1.simulate_loss("link down");
    let job = tokio::time::timeout(Duration::from_secs(5), engine.wait_job(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(EngineError::EndpointLost("e1".to_string())));
    // the runner aborts after the job is already marked failed
    for _ in 0..200 {
        if e1.calls("abort_migration") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(e1.calls("abort_migration"), 1);
    assert!(e2.domain(&vm.uuid).is_none());
}

/// Losing the source while the compatibility check waits on a slow
/// destination fails the job at once and frees the domain for a new request.
#[tokio::test]
async fn test_endpoint_loss_during_check_releases_domain() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    let e2 = host(&cluster, E2);
    let mut vm = sample_domain("vm9", DomainState::Running);
    vm.disks.clear();
    e1.add_domain(vm.clone());
    let engine = engine(&cluster, config()).await;
    e2.set_latency(Duration::from_secs(3));

    let flags = MigrationFlags { live: true, ..Default::default() };
    let first = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.job_status(&first).unwrap().state, JobState::CompatibilityCheck);

    e1.simulate_loss("link down");
    let job = tokio::time::timeout(Duration::from_secs(1), engine.wait_job(&first))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(EngineError::EndpointLost("e1".to_string())));

    // the domain is free again, the new job fails on the dead source instead
    let second = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    assert_ne!(second, first);
    let retry = tokio::time::timeout(Duration::from_secs(1), engine.wait_job(&second))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retry.state, JobState::Failed);
    assert_eq!(e2.calls("create_volume"), 0);
    assert!(e2.domain(&vm.uuid).is_none());
}

/// Power actions reach the host and drop the domain's cached view.
#[tokio::test]
async fn test_domain_actions_invalidate_cache() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let vm = domain_with_disk(&e1, "vm10", DomainState::Stopped);
    let other = domain_with_disk(&e1, "vm11", DomainState::Stopped);

    let mut config = config();
    config.cache.ttl_secs.insert(Operation::DomainInfo, Some(300));
    let engine = engine(&cluster, config).await;

    assert_eq!(engine.domain_info("e1", &vm.uuid).await.unwrap().state, DomainState::Stopped);
    engine.perform_action("e1", &vm.uuid, DomainAction::Start).await.unwrap();
    assert_eq!(e1.calls("start_domain"), 1);
    assert_eq!(engine.domain_info("e1", &vm.uuid).await.unwrap().state, DomainState::Running);
    assert_eq!(e1.calls("domain_info"), 2);

    engine.perform_action("e1", &vm.uuid, DomainAction::Suspend).await.unwrap();
    assert_eq!(engine.domain_info("e1", &vm.uuid).await.unwrap().state, DomainState::Paused);
    engine.perform_action("e1", &vm.uuid, DomainAction::Resume).await.unwrap();
    engine.perform_action("e1", &vm.uuid, DomainAction::ForceOff).await.unwrap();
    assert_eq!(e1.domain(&vm.uuid).unwrap().state, DomainState::Stopped);

    // a stopped domain cannot be resumed
    let err = engine.perform_action("e1", &vm.uuid, DomainAction::Resume).await.unwrap_err();
    assert!(matches!(err, EngineError::RemoteCallFailed { ref operation, .. } if operation == "resume_domain"));

    let results = engine
        .perform_bulk_action("e1", &[vm.uuid.clone(), other.uuid.clone(), "missing".to_string()], DomainAction::Start)
        .await;
    assert_eq!(results.len(), 3);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_ok());
    assert!(results[2].1.is_err());
    assert_eq!(e1.domain(&other.uuid).unwrap().state, DomainState::Running);
}

/// No power actions on a domain that is being migrated.
#[tokio::test]
async fn test_domain_action_refused_while_migrating() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let mut vm = sample_domain("vm12", DomainState::Running);
    vm.disks.clear();
    e1.add_domain(vm.clone());
    e1.set_migration_time(Duration::from_secs(60));
    let engine = engine(&cluster, config()).await;

    let flags = MigrationFlags { live: true, ..Default::default() };
    let id = engine.request_migration(&vm.uuid, "e1", "e2", Some(flags)).unwrap();
    let err = engine.perform_action("e1", &vm.uuid, DomainAction::ForceOff).await.unwrap_err();
    assert_eq!(err, EngineError::AlreadyMigrating { domain: vm.uuid.clone(), job_id: id.clone() });
    assert_eq!(e1.calls("destroy_domain"), 0);

    engine.cancel_job(&id).unwrap();
    engine.wait_job(&id).await.unwrap();
}

/// A connect failure on one endpoint does not hold up another.
#[tokio::test(start_paused = true)]
async fn test_independent_endpoints() {
    let cluster = Arc::new(MockCluster::new());
    host(&cluster, E1);
    host(&cluster, E2);
    cluster.set_behavior(E1, ConnectBehavior::Hang);
    let engine = Engine::new(config(), cluster.clone()).unwrap();

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.connect("e1").await })
    };
    let started = tokio::time::Instant::now();
    engine.connect("e2").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(slow.await.unwrap().is_err());
    assert_eq!(engine.endpoint_status("e1").unwrap(), EndpointStatus::Error);
    assert_eq!(engine.endpoint_status("e2").unwrap(), EndpointStatus::Connected);
}

/// Events reach stream consumers in order; unknown job ids are reported.
#[tokio::test]
async fn test_event_stream_and_job_lookup() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let vm = domain_with_disk(&e1, "vm7", DomainState::Stopped);
    let engine = engine(&cluster, config()).await;
    let mut stream = engine.subscribe_events(None).into_stream();

    e1.set_domain_state(&vm.uuid, DomainState::Running);
    e1.set_domain_state(&vm.uuid, DomainState::Paused);

    let kinds: Vec<EventKind> = tokio::time::timeout(
        Duration::from_secs(2),
        (&mut stream).take(2).map(|e| e.kind).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(kinds, [EventKind::Started, EventKind::Suspended]);

    assert!(matches!(engine.job_status("nope"), Err(EngineError::JobNotFound(_))));
    assert!(matches!(engine.cancel_job("nope"), Err(EngineError::JobNotFound(_))));
}

/// Reload adds and removes endpoints and applies new cache TTLs.
#[tokio::test]
async fn test_reload_and_shutdown() {
    let cluster = Arc::new(MockCluster::new());
    let e1 = host(&cluster, E1);
    host(&cluster, E2);
    let vm = domain_with_disk(&e1, "vm8", DomainState::Running);
    let engine = engine(&cluster, config()).await;

    let mut next = config();
    next.endpoints.retain(|e| e.name != "e2");
    next.endpoints.push(EndpointConfig {
        name: "e3".to_string(),
        uri: "qemu+ssh://node3/system".to_string(),
        autoconnect: true,
    });
    cluster.add_host("qemu+ssh://node3/system");
    next.cache.ttl_secs.insert(Operation::DomainInfo, Some(0));
    engine.reload(next).await.unwrap();

    let names: Vec<String> = engine.endpoints().into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["e1", "e3"]);
    assert_eq!(engine.endpoint_status("e3").unwrap(), EndpointStatus::Connected);
    assert_eq!(engine.endpoint_status("e1").unwrap(), EndpointStatus::Connected);

    // zero TTL: every fetch goes out
    engine.domain_info("e1", &vm.uuid).await.unwrap();
    engine.domain_info("e1", &vm.uuid).await.unwrap();
    assert_eq!(e1.calls("domain_info"), 2);

    engine.shutdown().await;
    assert_eq!(engine.endpoint_status("e1").unwrap(), EndpointStatus::Disconnected);
    assert!(e1.is_closed());
}
