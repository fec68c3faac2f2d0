//! End-to-end happy path test.
//!
//! Runs the daemon stack against a SQLite store file while a second store
//! handle on the same file plays the part of `rekonctl`, verifying:
//!
//! 1. Apply the demo document
//! 2. Four workers start, one per node, with volumes bound under node roots
//! 3. Scale down through a re-applied document (LIFO)
//! 4. Delete tears everything down and purges the record from the file
//!
//! ## Running
//!
//! ```bash
//! cargo test -p rekon-e2e --test happy_path
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rekon_controller::collector::ObservedStateCollector;
use rekon_controller::device::{DevicePlugin, StaticDevicePlugin};
use rekon_controller::document::{DesiredDocument, DocumentFormat};
use rekon_controller::model::{InstancePhase, ResourceSpec};
use rekon_controller::placement::Placement;
use rekon_controller::reconciler::{Reconciler, ReconcilerConfig};
use rekon_controller::runtime::{MockRuntime, Runtime};
use rekon_controller::store::{DesiredStateStore, SqliteStore};
use rekon_controller::volumes::{LocalHostPaths, VolumeBinder};
use rekon_controller::worker::ControllerWorker;
use rekon_id::{NodeName, ResourceName};
use rekon_reconcile::{BackoffPolicy, ConvergenceStatus, RollingStrategy};
use tokio::sync::watch;

const NODES: [&str; 4] = ["gpu-0", "gpu-1", "gpu-2", "gpu-3"];
const TIMEOUT: Duration = Duration::from_secs(10);

fn demo_document() -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/mpi-workers.yaml");
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
}

fn demo_spec(replicas: i64) -> ResourceSpec {
    let mut document = DesiredDocument::parse(&demo_document(), DocumentFormat::Yaml).unwrap();
    document.replica_count = replicas;
    document.into_spec().unwrap()
}

/// Create the demo's host paths under `<root>/<node>/` for every node.
fn prepare_node_roots(root: &Path) {
    for node in NODES {
        for dir in ["srv/shared", "srv/datasets/mnist"] {
            std::fs::create_dir_all(root.join(node).join(dir)).unwrap();
        }
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn happy_path() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("desired.db");
    let node_root = dir.path().join("nodes");
    prepare_node_roots(&node_root);

    // ---- daemon side ----
    let daemon_store = Arc::new(SqliteStore::open(&store_path).unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let devices = Arc::new(StaticDevicePlugin::new(
        NODES.iter().map(|n| (NodeName::parse(n).unwrap(), 1)),
    ));
    let placement = Arc::new(Placement::new());
    placement.sync_capacity(devices.as_ref()).await.unwrap();
    let collector = Arc::new(ObservedStateCollector::new(
        runtime.clone(),
        Duration::from_millis(100),
    ));
    let reconciler = Arc::new(Reconciler::new(
        daemon_store,
        Arc::clone(&collector),
        placement,
        VolumeBinder::new(Arc::new(LocalHostPaths)).with_node_roots(&node_root),
        runtime.clone(),
        ReconcilerConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                max: Duration::from_millis(200),
                jitter: 0.0,
            },
            strategy: RollingStrategy::default(),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let devices: Arc<dyn DevicePlugin> = devices;
    let worker = ControllerWorker::new(Arc::clone(&reconciler), Duration::from_millis(50))
        .with_device_plugin(devices);
    let collector_handle = tokio::spawn(Arc::clone(&collector).run(shutdown_rx.clone()));
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    // ---- client side: a separate handle on the same file ----
    let client = &SqliteStore::open(&store_path).unwrap();
    let name = &ResourceName::parse("mpi").unwrap();
    let reconciler = &reconciler;
    let runtime_ref = &runtime;

    // Step 1: apply
    let put = client.put(demo_spec(4)).unwrap();
    assert_eq!(put.revision, 1);

    // Step 2: converge to four workers, one per node
    eventually("four running workers", || async move {
        reconciler
            .status(name)
            .is_some_and(|s| s.convergence == ConvergenceStatus::Converged && s.running == 4)
    })
    .await;

    let instances = reconciler.collector().list(name).await;
    assert_eq!(instances.len(), 4);
    assert!(instances.iter().all(|i| i.phase == InstancePhase::Running));
    let mut nodes: Vec<&str> = instances.iter().map(|i| i.node.as_str()).collect();
    nodes.sort_unstable();
    assert_eq!(nodes, NODES);

    let units = runtime.list().await.unwrap();
    for unit in &units {
        let expected: PathBuf = node_root.join(unit.spec.node.as_str()).join("srv/shared");
        let workdir = unit
            .spec
            .volumes
            .iter()
            .find(|v| v.name == "workdir")
            .unwrap();
        assert_eq!(workdir.host_path, expected);
        assert!(unit.spec.volumes.iter().any(|v| v.name == "dataset" && v.read_only));
    }

    // Step 3: scale down to two; the two newest workers go
    let newest: Vec<_> = {
        let mut sorted = instances.clone();
        sorted.sort_by_key(|i| i.creation_key());
        sorted.iter().rev().take(2).map(|i| i.id).collect()
    };
    assert_eq!(client.put(demo_spec(2)).unwrap().revision, 2);

    eventually("two running workers", || async move {
        let instances = reconciler.collector().list(name).await;
        instances.len() == 2 && runtime_ref.unit_count() == 2
    })
    .await;
    let remaining = reconciler.collector().list(name).await;
    assert!(remaining.iter().all(|i| !newest.contains(&i.id)));

    // Step 4: delete
    client.delete(name).unwrap().unwrap();

    eventually("teardown and purge", || async move {
        reconciler.collector().list(name).await.is_empty()
            && runtime_ref.unit_count() == 0
            && client.get(name).unwrap().is_none()
    })
    .await;
    assert_eq!(runtime.stop_count(), 4);
    assert!(reconciler
        .placement()
        .snapshot()
        .iter()
        .all(|n| n.allocated == 0));

    shutdown_tx.send(true).unwrap();
    collector_handle.await.unwrap();
    worker_handle.await.unwrap();
}
