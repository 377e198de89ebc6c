//! certsync kubehub: client bootstrap and Secret list+watch wiring

#![forbid(unsafe_code)]

mod informer;

use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{watcher, WatchStreamExt},
    Client, Config,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use informer::{snapshot_from, Informer, SecretEvent, SnapshotError};

/// Field selector narrowing the watch to TLS secrets server-side.
pub const TLS_FIELD_SELECTOR: &str = "type=kubernetes.io/tls";

/// Build a client from an explicit kubeconfig file, or from ambient credentials
/// (in-cluster service account or the default kubeconfig) when none is given.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        None => Client::try_default().await.context("building client from ambient credentials"),
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?;
            Client::try_from(cfg).context("building client from kubeconfig")
        }
    }
}

/// List+watch TLS Secrets across all namespaces and forward typed events into `tx`.
///
/// The underlying watcher restarts itself with backoff, so watch errors are logged
/// and never end the loop. Returns when the receiver is dropped or the stream ends.
pub async fn watch_secrets(client: Client, tx: mpsc::Sender<SecretEvent>) {
    let api: Api<Secret> = Api::all(client);
    let cfg = watcher::Config::default().fields(TLS_FIELD_SELECTOR);
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    let mut informer = Informer::new();
    info!(selector = TLS_FIELD_SELECTOR, "secret watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => {
                for out in informer.apply(ev) {
                    metrics::counter!("certsync_watch_events_total", 1u64, "kind" => event_kind(&out));
                    if tx.send(out).await.is_err() {
                        debug!("event receiver dropped; stopping watcher");
                        return;
                    }
                }
            }
            Err(e) => {
                metrics::counter!("certsync_watch_errors_total", 1u64);
                warn!(error = %e, "secret watch error");
            }
        }
    }
    warn!("secret watcher stream ended");
}

fn event_kind(ev: &SecretEvent) -> &'static str {
    match ev {
        SecretEvent::Added(_) => "added",
        SecretEvent::Modified { .. } => "modified",
        SecretEvent::Deleted(_) => "deleted",
        SecretEvent::Synced => "synced",
    }
}
