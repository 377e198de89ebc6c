use std::sync::Arc;

use certsync_core::{has_concerned_change, is_qualified, SecretKey, SecretSnapshot};
use certsync_kubehub::SecretEvent;
use certsync_queue::DedupQueue;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::reconciler::Reconciler;

/// Work queue of Secret snapshots keyed by identity.
pub type SecretQueue = DedupQueue<SecretKey, Arc<SecretSnapshot>>;

/// What the router did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Enqueued,
    Ignored,
    Removed,
    RemoveFailed,
    Synced,
}

/// Filters watch events: adds and concerned updates go to the queue, deletes of
/// qualified Secrets are reconciled right away on the calling task.
pub struct EventRouter {
    queue: Arc<SecretQueue>,
    reconciler: Arc<Reconciler>,
    synced: watch::Sender<bool>,
}

impl EventRouter {
    pub fn new(queue: Arc<SecretQueue>, reconciler: Arc<Reconciler>) -> Self {
        let (synced, _) = watch::channel(false);
        Self { queue, reconciler, synced }
    }

    /// Receiver flipping to `true` once the initial list has been routed.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub fn handle(&self, ev: SecretEvent) -> Routing {
        match ev {
            SecretEvent::Added(s) => {
                if !is_qualified(&s) {
                    return Routing::Ignored;
                }
                debug!(secret = %s.key, "add queued");
                self.queue.add(s.key.clone(), s);
                Routing::Enqueued
            }
            SecretEvent::Modified { old, new } => {
                if !has_concerned_change(&old, &new) {
                    return Routing::Ignored;
                }
                debug!(secret = %new.key, rv = ?new.resource_version, "update queued");
                self.queue.add(new.key.clone(), new);
                Routing::Enqueued
            }
            SecretEvent::Deleted(s) => {
                if !is_qualified(&s) {
                    return Routing::Ignored;
                }
                match self.reconciler.delete(&s) {
                    Ok(()) => {
                        metrics::counter!("certsync_delete_total", 1u64, "outcome" => "ok");
                        info!(secret = %s.key, "remove succeeded");
                        Routing::Removed
                    }
                    Err(e) => {
                        metrics::counter!("certsync_delete_total", 1u64, "outcome" => "error");
                        warn!(secret = %s.key, error = %e, "remove failed");
                        Routing::RemoveFailed
                    }
                }
            }
            SecretEvent::Synced => {
                info!(queued = self.queue.len(), "initial secret list synced");
                self.synced.send_replace(true);
                Routing::Synced
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certsync_core::{SecretType, AUTOSYNC_ANNOTATION, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

    fn snap(autosync: Option<&str>, ty: SecretType, cert: &[u8]) -> Arc<SecretSnapshot> {
        let mut s = SecretSnapshot::new(SecretKey::new("kube-system", "foo").unwrap(), ty);
        if let Some(v) = autosync {
            s.annotations.insert(AUTOSYNC_ANNOTATION.into(), v.into());
        }
        s.data.insert(TLS_PRIVATE_KEY_KEY.into(), b"privatekeydata".to_vec());
        s.data.insert(TLS_CERT_KEY.into(), cert.to_vec());
        Arc::new(s)
    }

    fn router(root: &std::path::Path) -> (EventRouter, Arc<SecretQueue>) {
        let q = Arc::new(SecretQueue::new());
        (EventRouter::new(Arc::clone(&q), Arc::new(Reconciler::new(root))), q)
    }

    #[tokio::test]
    async fn add_only_queues_qualified() {
        let tmp = tempfile::tempdir().unwrap();
        let (r, q) = router(tmp.path());
        assert_eq!(r.handle(SecretEvent::Added(snap(Some("false"), SecretType::Tls, b"c"))), Routing::Ignored);
        assert_eq!(r.handle(SecretEvent::Added(snap(Some("true"), SecretType::Opaque, b"c"))), Routing::Ignored);
        assert!(q.is_empty());
        assert_eq!(r.handle(SecretEvent::Added(snap(Some("true"), SecretType::Tls, b"c"))), Routing::Enqueued);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn update_queues_latest_snapshot_on_concerned_change() {
        let tmp = tempfile::tempdir().unwrap();
        let (r, q) = router(tmp.path());
        let old = snap(Some("true"), SecretType::Tls, b"c1");
        assert_eq!(r.handle(SecretEvent::Modified { old: Arc::clone(&old), new: Arc::clone(&old) }), Routing::Ignored);

        let mid = snap(Some("true"), SecretType::Tls, b"c2");
        let last = snap(Some("true"), SecretType::Tls, b"c3");
        r.handle(SecretEvent::Modified { old, new: Arc::clone(&mid) });
        r.handle(SecretEvent::Modified { old: mid, new: Arc::clone(&last) });
        assert_eq!(q.len(), 1);
        let (_, got) = q.get().await.unwrap();
        assert_eq!(got.certificate(), b"c3");
    }

    #[tokio::test]
    async fn opt_out_update_is_still_queued() {
        let tmp = tempfile::tempdir().unwrap();
        let (r, q) = router(tmp.path());
        let on = snap(Some("true"), SecretType::Tls, b"c");
        let off = snap(None, SecretType::Tls, b"c");
        assert_eq!(r.handle(SecretEvent::Modified { old: on, new: off }), Routing::Enqueued);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn delete_runs_inline_and_reports_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let (r, q) = router(tmp.path());
        let s = snap(Some("true"), SecretType::Tls, b"c");
        Reconciler::new(tmp.path()).sync(&s).unwrap();

        assert_eq!(r.handle(SecretEvent::Deleted(snap(None, SecretType::Tls, b"c"))), Routing::Ignored);
        assert!(tmp.path().join("kube-system/foo.key").exists());

        assert_eq!(r.handle(SecretEvent::Deleted(Arc::clone(&s))), Routing::Removed);
        assert!(!tmp.path().join("kube-system/foo.crt").exists());
        assert!(q.is_empty());

        assert_eq!(r.handle(SecretEvent::Deleted(s)), Routing::RemoveFailed);
    }

    #[tokio::test]
    async fn synced_flips_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let (r, _q) = router(tmp.path());
        let rx = r.subscribe_synced();
        assert!(!*rx.borrow());
        assert_eq!(r.handle(SecretEvent::Synced), Routing::Synced);
        assert!(*rx.borrow());
    }
}
