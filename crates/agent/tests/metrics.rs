#![forbid(unsafe_code)]

// One recorder per process: keep a single test in this binary.

use std::sync::Arc;
use std::time::Duration;

use certsync_agent::{EventRouter, ItemHandler, Reconciler, Routing, SecretQueue, WorkerPool};
use certsync_core::{SecretKey, SecretSnapshot, SecretType, AUTOSYNC_ANNOTATION, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use certsync_kubehub::SecretEvent;
use metrics_exporter_prometheus::PrometheusBuilder;

fn tls(name: &str) -> Arc<SecretSnapshot> {
    let mut s = SecretSnapshot::new(SecretKey::new("kube-system", name).unwrap(), SecretType::Tls);
    s.annotations.insert(AUTOSYNC_ANNOTATION.into(), "true".into());
    s.data.insert(TLS_PRIVATE_KEY_KEY.into(), b"privatekeydata".to_vec());
    s.data.insert(TLS_CERT_KEY.into(), b"certificatedata".to_vec());
    Arc::new(s)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_and_delete_counters_are_exported() {
    let handle = PrometheusBuilder::new().install_recorder().expect("install recorder");

    let root = tempfile::tempdir().unwrap();
    let queue = Arc::new(SecretQueue::new());
    let reconciler = Arc::new(Reconciler::new(root.path()));
    let router = EventRouter::new(Arc::clone(&queue), Arc::clone(&reconciler));
    let handler: Arc<dyn ItemHandler> = reconciler.clone();
    let pool = WorkerPool::start(1, Arc::clone(&queue), handler);

    let foo = tls("foo");
    assert_eq!(router.handle(SecretEvent::Added(Arc::clone(&foo))), Routing::Enqueued);
    let crt = root.path().join("kube-system/foo.crt");
    for _ in 0..200 {
        if crt.exists() { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(crt.exists(), "worker synced foo");
    // The worker counts its outcome after the files land.
    for _ in 0..200 {
        if handle.render().contains(r#"certsync_sync_total{outcome="ok"} 1"#) { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(router.handle(SecretEvent::Deleted(foo)), Routing::Removed);
    queue.shutdown();
    tokio::time::timeout(Duration::from_secs(2), pool.join()).await.expect("workers stop");

    let out = handle.render();
    assert!(out.contains("certsync_file_writes_total 2"), "{out}");
    assert!(out.contains(r#"certsync_sync_total{outcome="ok"} 1"#), "{out}");
    assert!(out.contains(r#"certsync_delete_total{outcome="ok"} 1"#), "{out}");
    assert!(out.contains("certsync_queue_adds_total 1"), "{out}");
    assert!(out.contains("certsync_queue_depth 0"), "{out}");
}
