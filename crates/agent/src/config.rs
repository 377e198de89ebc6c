use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub const MIN_THREADINESS: usize = 1;
pub const MAX_THREADINESS: usize = 10;
pub const DEFAULT_THREADINESS: usize = 1;

/// Raw startup options as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub cert_dir: PathBuf,
    /// Empty or `None` means ambient credentials.
    pub kubeconfig: Option<PathBuf>,
    /// `0` means "not set".
    pub thread: usize,
}

/// Validated configuration the agent runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Absolute path of an existing directory.
    pub cert_dir: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub threadiness: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bad certificate directory {path}: {source}")]
    InvalidCertDir { path: PathBuf, source: io::Error },
    #[error("bad certificate directory {0}: not a valid directory")]
    NotADirectory(PathBuf),
    #[error("invalid threadiness {0}: expected {MIN_THREADINESS}-{MAX_THREADINESS}")]
    ThreadinessOutOfRange(usize),
}

impl AgentConfig {
    pub fn validate(opts: AgentOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            cert_dir: validate_cert_dir(opts.cert_dir)?,
            kubeconfig: opts.kubeconfig.filter(|p| !p.as_os_str().is_empty()),
            threadiness: validate_threadiness(opts.thread)?,
        })
    }
}

fn validate_cert_dir(dir: PathBuf) -> Result<PathBuf, ConfigError> {
    let abs = std::path::absolute(&dir).map_err(|source| ConfigError::InvalidCertDir { path: dir.clone(), source })?;
    let meta = std::fs::metadata(&abs).map_err(|source| ConfigError::InvalidCertDir { path: dir.clone(), source })?;
    if !meta.is_dir() {
        return Err(ConfigError::NotADirectory(dir));
    }
    Ok(abs)
}

fn validate_threadiness(t: usize) -> Result<usize, ConfigError> {
    match t {
        0 => Ok(DEFAULT_THREADINESS),
        MIN_THREADINESS..=MAX_THREADINESS => Ok(t),
        _ => Err(ConfigError::ThreadinessOutOfRange(t)),
    }
}
