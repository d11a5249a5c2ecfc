use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_catalog::CatalogLoader;
use fleet_core::{CatalogKind, DeploymentTarget, DesiredState, NewResource, ResourceKind};
use fleet_persist::{LeaseStore, SqliteStore};
use fleet_workers::{LeaderWorker, Readiness, Reconciler, StartupGate, TypeManager, TypeService, Worker};
use serde_json::json;
use tempfile::TempDir;

struct Catalogs {
    _tmp: TempDir,
    root: PathBuf,
}

impl Catalogs {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        fs::create_dir_all(root.join("catalog")).unwrap();
        fs::create_dir_all(root.join("metadata")).unwrap();
        Self { _tmp: tmp, root }
    }

    /// Replace the catalog with `types`, each given as (id, revision).
    fn set(&self, types: &[(&str, i64)]) {
        for dir in ["catalog", "metadata"] {
            let d = self.root.join(dir);
            fs::remove_dir_all(&d).unwrap();
            fs::create_dir_all(&d).unwrap();
        }
        let mut meta = String::new();
        for (id, rev) in types {
            let file = json!({
                "processor_type": {
                    "id": id,
                    "name": format!("Processor {id}"),
                    "version": "0.1",
                    "channels": ["stable"],
                    "json_schema": {"type": "object"}
                },
                "channels": {"stable": {"shard_metadata": {"processor_revision": rev, "image": format!("img:{rev}")}}}
            });
            fs::write(self.root.join("catalog").join(format!("{id}.json")), file.to_string()).unwrap();
            meta.push_str(&format!("- processor_type_id: {id}\n  channels: [stable]\n"));
        }
        if meta.is_empty() {
            meta.push_str("[]\n");
        }
        fs::write(self.root.join("metadata/processors.yaml"), meta).unwrap();
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn service(&self, store: &Arc<SqliteStore>) -> Arc<TypeService> {
        let loader = CatalogLoader::new(CatalogKind::Processor, vec![self.dir("catalog")], vec![self.dir("metadata")]);
        Arc::new(TypeService::new(store.clone(), loader))
    }
}

fn full_pass(svc: &TypeService) {
    svc.delete_or_deprecate_removed_types().unwrap();
    svc.reconcile_types().unwrap();
    svc.for_each_catalog_entry(|t, ch, cfg| svc.reconcile_shard_metadata(t, ch, cfg).map(|_| ())).unwrap();
    svc.cleanup_deployments().unwrap();
    svc.record_checksums().unwrap();
}

fn processor(type_id: &str) -> NewResource {
    NewResource {
        kind: ResourceKind::Processor,
        name: "proc".into(),
        type_id: type_id.into(),
        channel: "stable".into(),
        namespace_id: "ns".into(),
        owner: "owner".into(),
        organisation_id: String::new(),
        desired_state: DesiredState::Ready,
        definition: json!({}),
        annotations: BTreeMap::new(),
    }
}

fn target() -> DeploymentTarget {
    DeploymentTarget { cluster_id: "c1".into(), namespace_id: "ns".into(), operator_id: "op".into() }
}

#[test]
fn reconciling_twice_writes_nothing_the_second_time() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1), ("b", 1)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let svc = cats.service(&store);
    assert_eq!(svc.reconcile_types().unwrap(), 2);
    assert!(store.get_type("a").unwrap().unwrap().checksum.is_none(), "checksum waits for the end of the pass");
    assert_eq!(svc.record_checksums().unwrap(), 2);
    let before = store.get_type("a").unwrap().unwrap();
    assert_eq!(svc.reconcile_types().unwrap(), 0);
    assert_eq!(svc.record_checksums().unwrap(), 0);
    assert_eq!(store.get_type("a").unwrap().unwrap(), before);
    assert_eq!(before.checksum.as_deref(), Some(svc.catalog().unwrap().get("a").unwrap().checksum.as_str()));
}

#[test]
fn removed_types_are_deprecated_or_deleted() {
    let cats = Catalogs::new();
    cats.set(&[("kept", 1), ("used", 1), ("unused", 1)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    full_pass(&cats.service(&store));
    store.create_resource(&processor("used")).unwrap();

    cats.set(&[("kept", 1)]);
    let svc = cats.service(&store);
    let removed = svc.delete_or_deprecate_removed_types().unwrap();
    assert_eq!((removed.deprecated, removed.deleted), (1, 1));
    assert!(store.get_type("used").unwrap().unwrap().deprecated);
    assert!(store.get_type("unused").unwrap().is_none());
    assert!(store.list_shard_metadata("unused").unwrap().is_empty());
    assert!(!store.get_type("kept").unwrap().unwrap().deprecated);

    let again = svc.delete_or_deprecate_removed_types().unwrap();
    assert_eq!((again.deprecated, again.deleted), (0, 0));
}

#[test]
fn new_revision_becomes_latest_and_flags_pinned_deployments() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    full_pass(&cats.service(&store));
    let r1 = store.latest_shard_metadata("a", "stable").unwrap().unwrap();
    assert_eq!(r1.revision, 1);
    let res = store.create_resource(&processor("a")).unwrap();
    let dep = store.create_deployment(&res.id, &target(), Some(r1.id), false).unwrap();
    assert!(!dep.status.upgrade_available);

    cats.set(&[("a", 2)]);
    full_pass(&cats.service(&store));
    let rows = store.list_shard_metadata("a").unwrap();
    assert_eq!(rows.iter().map(|r| (r.revision, r.latest)).collect::<Vec<_>>(), vec![(1, false), (2, true)]);
    let flagged = store.get_deployment(&dep.id).unwrap().unwrap();
    assert!(flagged.status.upgrade_available);
    assert!(flagged.version > dep.version);
    assert_eq!(flagged.shard_metadata_id, Some(r1.id));
}

#[test]
fn bad_revision_is_reported_with_type_and_channel() {
    let cats = Catalogs::new();
    cats.set(&[]);
    fs::write(
        cats.dir("catalog").join("x.json"),
        r#"{"processor_type": {"id": "x"}, "channels": {"stable": {"shard_metadata": {"processor_revision": "7"}}}}"#,
    )
    .unwrap();
    fs::write(cats.dir("metadata").join("x.yaml"), "- id: x\n").unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let svc = cats.service(&store);
    let err = svc
        .for_each_catalog_entry(|t, ch, cfg| svc.reconcile_shard_metadata(t, ch, cfg).map(|_| ()))
        .unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.starts_with("processor type x channel stable: "), "{msg}");
    assert!(msg.contains("processor_revision in shard metadata must be a non-negative integer, got string"), "{msg}");
}

#[test]
fn other_instance_detects_convergence_by_checksum() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1), ("b", 3)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let leader = cats.service(&store);
    let follower = cats.service(&store);
    assert!(!follower.catalog_entries_reconciled().unwrap());
    leader.reconcile_types().unwrap();
    assert!(!follower.catalog_entries_reconciled().unwrap());
    leader.record_checksums().unwrap();
    assert!(follower.catalog_entries_reconciled().unwrap());
    assert!(leader.catalog_entries_reconciled().unwrap());
}

#[test]
fn broken_catalog_is_retried_on_next_call() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1)]);
    fs::write(cats.dir("catalog").join("broken.json"), "{").unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let svc = cats.service(&store);
    assert!(svc.catalog_entries_reconciled().is_err());
    fs::remove_file(cats.dir("catalog").join("broken.json")).unwrap();
    assert!(!svc.catalog_entries_reconciled().unwrap());
}

#[tokio::test]
async fn leader_type_manager_runs_once_and_opens_the_gate() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let svc = cats.service(&store);
    let readiness = StartupGate::spawn(svc.clone(), Duration::from_millis(5));

    let manager = TypeManager::new(svc.clone(), readiness.clone(), Duration::from_millis(5));
    let leases: Arc<dyn LeaseStore> = store.clone();
    let worker = Arc::new(LeaderWorker::new(manager, leases, CatalogKind::Processor.lease_type(), Duration::from_secs(30)));
    let id = worker.id().to_string();
    let reconciler = Reconciler::new();
    reconciler.start(worker.clone()).unwrap();

    tokio::time::timeout(Duration::from_secs(2), readiness.wait()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.latest_shard_metadata("a", "stable").unwrap().is_some());
    assert!(!reconciler.is_running(&id));
    assert_eq!(reconciler.prune_terminated().await, vec![id]);
    let lease = store.current_lease("processor_type").unwrap().unwrap();
    assert!(lease.is_expired(fleet_core::now_ms()), "lease released on stop");
}

#[tokio::test]
async fn follower_type_manager_stands_by() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    assert!(store.claim("processor_type", "someone-else", Duration::from_secs(30)).unwrap());
    let svc = cats.service(&store);

    let released = TypeManager::new(svc.clone(), Readiness::ready(), Duration::from_millis(5));
    assert!(released.has_terminated());

    let leases: Arc<dyn LeaseStore> = store.clone();
    let pending = StartupGate::spawn(svc.clone(), Duration::from_secs(60));
    let follower = LeaderWorker::new(
        TypeManager::new(svc, pending, Duration::from_millis(5)),
        leases,
        "processor_type",
        Duration::from_secs(30),
    );
    assert!(!follower.has_terminated());
    assert!(follower.reconcile().await.is_empty());
    assert!(!follower.is_leader());
    assert!(store.get_type("a").unwrap().is_none());
}

#[tokio::test]
async fn failed_revision_keeps_the_gate_closed_and_the_manager_running() {
    let cats = Catalogs::new();
    cats.set(&[]);
    fs::write(
        cats.dir("catalog").join("x.json"),
        r#"{"processor_type": {"id": "x", "name": "X", "channels": ["stable"]}, "channels": {"stable": {"shard_metadata": {"image": "img:x"}}}}"#,
    )
    .unwrap();
    fs::write(cats.dir("metadata").join("x.yaml"), "- id: x\n").unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let svc = cats.service(&store);
    let readiness = StartupGate::spawn(svc.clone(), Duration::from_millis(5));
    let manager = TypeManager::new(svc.clone(), readiness.clone(), Duration::from_millis(5));

    for _ in 0..2 {
        let errors = manager.reconcile().await;
        assert_eq!(errors.len(), 1, "{errors:?}");
        let msg = format!("{:#}", errors[0]);
        assert!(msg.contains("processor_revision not found in shard metadata"), "{msg}");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = store.get_type("x").unwrap().unwrap();
    assert!(stored.checksum.is_none());
    assert!(store.latest_shard_metadata("x", "stable").unwrap().is_none());
    assert!(!svc.catalog_entries_reconciled().unwrap());
    assert!(!readiness.is_ready());
    assert!(!manager.is_done());
    assert!(!manager.has_terminated());
}

#[tokio::test]
async fn failed_cleanup_is_retried_before_the_gate_opens() {
    let cats = Catalogs::new();
    cats.set(&[("a", 1)]);
    let db = cats.dir("fleet.db");
    let store = Arc::new(SqliteStore::open(db.to_str().unwrap()).unwrap());
    full_pass(&cats.service(&store));
    let r1 = store.latest_shard_metadata("a", "stable").unwrap().unwrap();
    let res = store.create_resource(&processor("a")).unwrap();
    let dep = store.create_deployment(&res.id, &target(), Some(r1.id), false).unwrap();

    cats.set(&[("a", 2)]);
    let raw = rusqlite::Connection::open(&db).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER hold_flags BEFORE UPDATE OF upgrade_available ON resource_deployments
         BEGIN SELECT RAISE(ABORT, 'flags held'); END;",
    )
    .unwrap();

    let svc = cats.service(&store);
    let readiness = StartupGate::spawn(svc.clone(), Duration::from_millis(5));
    let manager = TypeManager::new(svc.clone(), readiness.clone(), Duration::from_millis(5));
    let errors = manager.reconcile().await;
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(format!("{:#}", errors[0]).contains("flags held"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.latest_shard_metadata("a", "stable").unwrap().unwrap().revision, 2);
    assert!(!store.get_deployment(&dep.id).unwrap().unwrap().status.upgrade_available);
    assert!(!readiness.is_ready());
    assert!(!manager.has_terminated());

    raw.execute_batch("DROP TRIGGER hold_flags;").unwrap();
    assert!(manager.reconcile().await.is_empty());
    tokio::time::timeout(Duration::from_secs(2), readiness.wait()).await.unwrap();
    assert!(manager.has_terminated());
    assert!(store.get_deployment(&dep.id).unwrap().unwrap().status.upgrade_available);
}
