use std::collections::BTreeMap;
use std::sync::Arc;

use certsync_core::{KeyError, SecretKey, SecretSnapshot, SecretType};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Event;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Typed change notification for a Secret.
#[derive(Debug, Clone, PartialEq)]
pub enum SecretEvent {
    Added(Arc<SecretSnapshot>),
    Modified { old: Arc<SecretSnapshot>, new: Arc<SecretSnapshot> },
    Deleted(Arc<SecretSnapshot>),
    /// The initial full list has been delivered.
    Synced,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("secret has no metadata.name")]
    MissingName,
    #[error("secret {0} has no metadata.namespace")]
    MissingNamespace(String),
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
}

/// Project a k8s Secret into the snapshot the pipeline works on.
pub fn snapshot_from(secret: &Secret) -> Result<SecretSnapshot, SnapshotError> {
    let meta = &secret.metadata;
    let name = meta.name.clone().ok_or(SnapshotError::MissingName)?;
    let namespace = meta.namespace.clone().ok_or_else(|| SnapshotError::MissingNamespace(name.clone()))?;
    let key = SecretKey::new(namespace, name)?;
    let data: BTreeMap<String, Vec<u8>> = secret
        .data
        .as_ref()
        .map(|d| d.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default();
    Ok(SecretSnapshot {
        key,
        secret_type: SecretType::parse(secret.type_.as_deref()),
        annotations: meta.annotations.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        data,
        resource_version: meta.resource_version.clone(),
    })
}

/// Last-seen cache turning raw watcher events into add/modify/delete transitions.
#[derive(Debug, Default)]
pub struct Informer {
    known: FxHashMap<SecretKey, Arc<SecretSnapshot>>,
    synced: bool,
}

impl Informer {
    pub fn new() -> Self { Self::default() }

    pub fn has_synced(&self) -> bool { self.synced }

    pub fn len(&self) -> usize { self.known.len() }

    pub fn is_empty(&self) -> bool { self.known.is_empty() }

    /// Fold one watcher event into the cache and return the resulting transitions.
    pub fn apply(&mut self, ev: Event<Secret>) -> Vec<SecretEvent> {
        let mut out = Vec::new();
        match ev {
            Event::Applied(o) => {
                if let Some(snap) = project(&o) {
                    out.push(self.upsert(snap));
                }
            }
            Event::Deleted(o) => {
                if let Some(snap) = project(&o) {
                    let last = self.known.remove(&snap.key).unwrap_or_else(|| Arc::new(snap));
                    out.push(SecretEvent::Deleted(last));
                }
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch relist");
                let fresh: Vec<SecretSnapshot> = list.iter().filter_map(project).collect();
                let listed: FxHashSet<&SecretKey> = fresh.iter().map(|s| &s.key).collect();
                let mut gone: Vec<SecretKey> = self.known.keys().filter(|k| !listed.contains(k)).cloned().collect();
                gone.sort();
                for k in gone {
                    if let Some(last) = self.known.remove(&k) {
                        out.push(SecretEvent::Deleted(last));
                    }
                }
                for snap in fresh {
                    out.push(self.upsert(snap));
                }
                if !self.synced {
                    self.synced = true;
                    out.push(SecretEvent::Synced);
                }
            }
        }
        out
    }

    fn upsert(&mut self, snap: SecretSnapshot) -> SecretEvent {
        let new = Arc::new(snap);
        match self.known.insert(new.key.clone(), Arc::clone(&new)) {
            Some(old) => SecretEvent::Modified { old, new },
            None => SecretEvent::Added(new),
        }
    }
}

fn project(secret: &Secret) -> Option<SecretSnapshot> {
    match snapshot_from(secret) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "skipping secret without usable identity");
            None
        }
    }
}
