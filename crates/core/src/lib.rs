//! certsync core types: secret snapshots, identity and the qualification predicates
//! deciding which Secrets are synchronized to disk.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation a Secret must carry (with the literal value `"true"`) to be synchronized.
pub const AUTOSYNC_ANNOTATION: &str = "certsync.istio.io/autosync";
/// Data key holding the TLS private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
/// Data key holding the TLS certificate chain.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret type string of TLS secrets.
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("secret namespace is empty")]
    EmptyNamespace,
    #[error("secret name is empty")]
    EmptyName,
}

/// Identity of a Secret: `(namespace, name)`. Both parts are non-empty and are
/// used verbatim to build on-disk paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretKey {
    namespace: String,
    name: String,
}

impl SecretKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() {
            return Err(KeyError::EmptyNamespace);
        }
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Secret subtype. Only [`SecretType::Tls`] is eligible for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    Tls,
    Opaque,
    Other(String),
}

impl SecretType {
    /// Exact, case-sensitive parse of a Kubernetes secret type string.
    /// Kubernetes defaults a missing type to `Opaque`.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some(SECRET_TYPE_TLS) => SecretType::Tls,
            None | Some("Opaque") => SecretType::Opaque,
            Some(other) => SecretType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SecretType::Tls => SECRET_TYPE_TLS,
            SecretType::Opaque => "Opaque",
            SecretType::Other(s) => s,
        }
    }
}

/// Immutable view of a Secret as delivered by the watch source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSnapshot {
    pub key: SecretKey,
    pub secret_type: SecretType,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    /// Server-side resource version, for logging only.
    pub resource_version: Option<String>,
}

impl SecretSnapshot {
    /// Minimal snapshot with no annotations, labels or data.
    pub fn new(key: SecretKey, secret_type: SecretType) -> Self {
        Self {
            key,
            secret_type,
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            data: BTreeMap::new(),
            resource_version: None,
        }
    }

    /// Private key bytes; empty when the key is absent.
    pub fn private_key(&self) -> &[u8] {
        self.data.get(TLS_PRIVATE_KEY_KEY).map(Vec::as_slice).unwrap_or_default()
    }

    /// Certificate bytes; empty when the key is absent.
    pub fn certificate(&self) -> &[u8] {
        self.data.get(TLS_CERT_KEY).map(Vec::as_slice).unwrap_or_default()
    }
}

/// True iff the secret is of the TLS subtype.
pub fn is_target_kind(s: &SecretSnapshot) -> bool {
    s.secret_type == SecretType::Tls
}

/// True iff the autosync annotation is exactly `"true"`. No general boolean parsing:
/// `"TRUE"`, `"1"` or `"yes"` do not opt in.
pub fn wants_sync(s: &SecretSnapshot) -> bool {
    s.annotations.get(AUTOSYNC_ANNOTATION).map(String::as_str) == Some("true")
}

/// Secret is in scope for synchronization (add) and removal (delete).
pub fn is_qualified(s: &SecretSnapshot) -> bool {
    is_target_kind(s) && wants_sync(s)
}

/// Whether the transition `old -> new` requires reconciliation:
/// the opt-in flag toggled, or the key/cert bytes changed while opted in.
pub fn has_concerned_change(old: &SecretSnapshot, new: &SecretSnapshot) -> bool {
    let (was, is) = (wants_sync(old), wants_sync(new));
    if !was && !is {
        return false;
    }
    if was != is {
        return true;
    }
    old.private_key() != new.private_key() || old.certificate() != new.certificate()
}
