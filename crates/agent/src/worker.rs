use std::sync::Arc;

use certsync_core::{is_qualified, SecretSnapshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::reconciler::{ReconcileError, Reconciler, SyncReport};
use crate::router::SecretQueue;

/// Result of processing one dequeued snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Synced(SyncReport),
    Removed,
}

/// Per-item work done by the pool. Runs on the blocking thread pool.
pub trait ItemHandler: Send + Sync + 'static {
    fn process(&self, snapshot: &SecretSnapshot) -> Result<Processed, ReconcileError>;
}

/// Qualified snapshots are synced; a snapshot that stopped qualifying (opt-in
/// switched off by an update) has whatever files remain removed. Files that were
/// never written (the opt-in was coalesced away, or its sync failed) are already
/// converged.
impl ItemHandler for Reconciler {
    fn process(&self, snapshot: &SecretSnapshot) -> Result<Processed, ReconcileError> {
        if is_qualified(snapshot) {
            self.sync(snapshot).map(Processed::Synced)
        } else {
            self.remove_if_present(snapshot).map(|_| Processed::Removed)
        }
    }
}

/// Fixed set of workers draining the queue until it shuts down.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(threadiness: usize, queue: Arc<SecretQueue>, handler: Arc<dyn ItemHandler>) -> Self {
        let handles = (0..threadiness)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&queue), Arc::clone(&handler))))
            .collect();
        info!(threadiness, "workers started");
        Self { handles }
    }

    pub fn len(&self) -> usize { self.handles.len() }

    pub fn is_empty(&self) -> bool { self.handles.is_empty() }

    /// Wait for every worker to observe queue shutdown.
    pub async fn join(self) {
        for h in self.handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

async fn run_worker(id: usize, queue: Arc<SecretQueue>, handler: Arc<dyn ItemHandler>) {
    debug!(worker = id, "worker running");
    while let Some((key, snapshot)) = queue.get().await {
        let h = Arc::clone(&handler);
        let res = tokio::task::spawn_blocking(move || h.process(&snapshot)).await;
        match res {
            Ok(Ok(Processed::Synced(report))) => {
                metrics::counter!("certsync_sync_total", 1u64, "outcome" => "ok");
                info!(worker = id, secret = %key, key_file = ?report.key, cert_file = ?report.cert, "synchronize succeeded");
            }
            Ok(Ok(Processed::Removed)) => {
                metrics::counter!("certsync_sync_total", 1u64, "outcome" => "removed");
                info!(worker = id, secret = %key, "secret no longer wants autosync; files removed");
            }
            Ok(Err(e @ ReconcileError::Remove { .. })) => {
                metrics::counter!("certsync_sync_total", 1u64, "outcome" => "error");
                warn!(worker = id, secret = %key, error = %e, "removing opted-out files failed");
            }
            Ok(Err(e)) => {
                metrics::counter!("certsync_sync_total", 1u64, "outcome" => "error");
                error!(worker = id, secret = %key, error = %e, "synchronize failed");
            }
            Err(e) => {
                metrics::counter!("certsync_worker_panics_total", 1u64);
                error!(worker = id, secret = %key, error = %e, "synchronize panicked");
            }
        }
        // No retry: failures wait for the next change event.
        queue.done(&key);
        queue.forget(&key);
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use certsync_core::{SecretKey, SecretType};

    struct Flaky {
        calls: AtomicUsize,
    }

    impl ItemHandler for Flaky {
        fn process(&self, snapshot: &SecretSnapshot) -> Result<Processed, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if snapshot.key.name() == "boom" {
                panic!("handler blew up");
            }
            Ok(Processed::Removed)
        }
    }

    fn item(name: &str) -> (SecretKey, Arc<SecretSnapshot>) {
        let key = SecretKey::new("ns", name).unwrap();
        (key.clone(), Arc::new(SecretSnapshot::new(key, SecretType::Tls)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_in_one_item_does_not_stop_the_worker() {
        let q = Arc::new(SecretQueue::new());
        let handler = Arc::new(Flaky { calls: AtomicUsize::new(0) });
        let pool = WorkerPool::start(1, Arc::clone(&q), handler.clone());
        assert_eq!(pool.len(), 1);

        let (k, v) = item("boom");
        q.add(k, v);
        let (k2, v2) = item("fine");
        q.add(k2, v2);

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 2 { break; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        // The panicked key was released and can be processed again.
        let (k, v) = item("boom");
        q.add(k.clone(), v);
        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 3 { break; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(q.num_requeues(&k), 0);

        q.shutdown();
        tokio::time::timeout(Duration::from_secs(2), pool.join()).await.expect("workers stop");
    }

    #[test]
    fn reconciler_branches_on_qualification() {
        let tmp = tempfile::tempdir().unwrap();
        let r = Reconciler::new(tmp.path());
        let mut s = SecretSnapshot::new(SecretKey::new("ns", "a").unwrap(), SecretType::Tls);
        s.annotations.insert(certsync_core::AUTOSYNC_ANNOTATION.into(), "true".into());
        assert!(matches!(r.process(&s).unwrap(), Processed::Synced(_)));
        s.annotations.clear();
        assert_eq!(r.process(&s).unwrap(), Processed::Removed);
        assert!(!tmp.path().join("ns/a.key").exists());
    }

    #[test]
    fn opt_out_of_never_synced_secret_is_already_converged() {
        let tmp = tempfile::tempdir().unwrap();
        let r = Reconciler::new(tmp.path());
        let s = SecretSnapshot::new(SecretKey::new("ns", "a").unwrap(), SecretType::Tls);
        assert_eq!(r.process(&s).unwrap(), Processed::Removed);
        assert!(!tmp.path().join("ns").exists());
    }
}
