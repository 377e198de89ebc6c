//! certsync agent: mirrors TLS Secrets that opt in via
//! `certsync.istio.io/autosync: "true"` onto a local certificate directory.
//!
//! Data flow: Secret watch -> [`EventRouter`] -> [`SecretQueue`] -> [`WorkerPool`] -> [`Reconciler`].

#![forbid(unsafe_code)]

pub mod config;
pub mod reconciler;
pub mod router;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use certsync_kubehub::SecretEvent;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub use config::{AgentConfig, AgentOptions, ConfigError, DEFAULT_THREADINESS, MAX_THREADINESS, MIN_THREADINESS};
pub use reconciler::{CertPaths, FileOutcome, ReconcileError, Reconciler, SyncReport};
pub use router::{EventRouter, Routing, SecretQueue};
pub use worker::{ItemHandler, Processed, WorkerPool};

const EVENT_CHANNEL_CAP: usize = 1024;

/// Queue, reconciler and worker count: everything needed to drain an event stream.
pub struct Pipeline {
    threadiness: usize,
    queue: Arc<SecretQueue>,
    reconciler: Arc<Reconciler>,
}

impl Pipeline {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            threadiness: config.threadiness,
            queue: Arc::new(SecretQueue::new()),
            reconciler: Arc::new(Reconciler::new(&config.cert_dir)),
        }
    }

    /// Route `events` until the stop signal fires. Workers start only after the
    /// initial list has been routed; on stop the queue shuts down and the workers
    /// are joined.
    pub async fn run(self, mut events: mpsc::Receiver<SecretEvent>, mut stop: watch::Receiver<bool>) {
        let router = EventRouter::new(Arc::clone(&self.queue), Arc::clone(&self.reconciler));
        let mut synced = router.subscribe_synced();
        let routing = tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                router.handle(ev);
            }
            warn!("secret event stream closed");
        });

        tokio::select! {
            ok = async { synced.wait_for(|s| *s).await.is_ok() } => {
                if !ok {
                    warn!("event routing ended before the initial sync");
                }
            }
            _ = async { stop.wait_for(|s| *s).await.is_ok() } => {
                warn!("stopped before the initial secret list was synced");
                self.queue.shutdown();
                routing.abort();
                return;
            }
        }

        let handler: Arc<dyn ItemHandler> = self.reconciler.clone();
        let pool = WorkerPool::start(self.threadiness, Arc::clone(&self.queue), handler);

        // A dropped sender also counts as stop.
        let _ = stop.wait_for(|s| *s).await;
        info!("stopping cert-sync agent");
        self.queue.shutdown();
        routing.abort();
        pool.join().await;
    }
}

/// The running service: validated config plus the control-plane client.
pub struct Agent {
    config: AgentConfig,
    client: kube::Client,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let client = certsync_kubehub::client(config.kubeconfig.as_deref())
            .await
            .with_context(|| match &config.kubeconfig {
                Some(p) => format!("initialize kube client using {}", p.display()),
                None => "initialize kube client from ambient credentials".to_string(),
            })?;
        Ok(Self { config, client })
    }

    /// Watch Secrets and keep the certificate directory in sync until `stop` flips.
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<()> {
        info!(cert_dir = %self.config.cert_dir.display(), threadiness = self.config.threadiness, "starting cert-sync agent");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let watcher = tokio::spawn(certsync_kubehub::watch_secrets(self.client.clone(), tx));
        Pipeline::new(&self.config).run(rx, stop).await;
        watcher.abort();
        info!("cert-sync agent stopped");
        Ok(())
    }
}
