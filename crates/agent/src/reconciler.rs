//! Filesystem side of the agent: converges `<root>/<namespace>/<name>.{key,crt}`
//! on a Secret's TLS payload, and removes them again.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use certsync_core::{SecretKey, SecretSnapshot};
use thiserror::Error;
use tracing::debug;

const FILE_MODE: u32 = 0o666;
const DIR_MODE: u32 = 0o777;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("creating directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("writing {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("removing {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// On-disk locations for one Secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub dir: PathBuf,
    pub key: PathBuf,
    pub cert: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Created,
    Updated,
    Unchanged,
}

impl FileOutcome {
    pub fn wrote(self) -> bool { self != FileOutcome::Unchanged }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub key: FileOutcome,
    pub cert: FileOutcome,
}

impl SyncReport {
    /// Number of files written by this pass.
    pub fn writes(&self) -> usize {
        usize::from(self.key.wrote()) + usize::from(self.cert.wrote())
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    cert_root: PathBuf,
}

impl Reconciler {
    pub fn new(cert_root: impl Into<PathBuf>) -> Self {
        Self { cert_root: cert_root.into() }
    }

    pub fn paths(&self, key: &SecretKey) -> CertPaths {
        let dir = self.cert_root.join(key.namespace());
        CertPaths {
            key: dir.join(format!("{}.key", key.name())),
            cert: dir.join(format!("{}.crt", key.name())),
            dir,
        }
    }

    /// Make both files match the snapshot's payload, writing only what differs.
    /// A failure on the certificate leaves an already written key in place.
    pub fn sync(&self, snapshot: &SecretSnapshot) -> Result<SyncReport, ReconcileError> {
        let paths = self.paths(&snapshot.key);
        ensure_dir(&paths.dir)?;
        let key = ensure_file_data(&paths.key, snapshot.private_key())?;
        let cert = ensure_file_data(&paths.cert, snapshot.certificate())?;
        let report = SyncReport { key, cert };
        metrics::counter!("certsync_file_writes_total", report.writes() as u64);
        Ok(report)
    }

    /// Remove the key file, then the certificate file. The certificate is left alone
    /// when removing the key fails (including when it does not exist). The namespace
    /// directory is kept.
    pub fn delete(&self, snapshot: &SecretSnapshot) -> Result<(), ReconcileError> {
        let paths = self.paths(&snapshot.key);
        for path in [paths.key, paths.cert] {
            fs::remove_file(&path).map_err(|source| ReconcileError::Remove { path, source })?;
        }
        Ok(())
    }

    /// Remove whatever is left of the key and certificate files. A file that is
    /// already gone counts as removed, so this converges from any prior state.
    /// Returns how many files were actually removed.
    pub fn remove_if_present(&self, snapshot: &SecretSnapshot) -> Result<usize, ReconcileError> {
        let paths = self.paths(&snapshot.key);
        let mut removed = 0;
        for path in [paths.key, paths.cert] {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ReconcileError::Remove { path, source }),
            }
        }
        Ok(removed)
    }
}

fn ensure_dir(dir: &Path) -> Result<(), ReconcileError> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    match builder.create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(ReconcileError::CreateDir { path: dir.to_path_buf(), source }),
    }
}

fn ensure_file_data(path: &Path, data: &[u8]) -> Result<FileOutcome, ReconcileError> {
    let outcome = match fs::read(path) {
        Ok(current) if current == data => return Ok(FileOutcome::Unchanged),
        Ok(_) => FileOutcome::Updated,
        Err(e) if e.kind() == io::ErrorKind::NotFound => FileOutcome::Created,
        Err(source) => return Err(ReconcileError::Read { path: path.to_path_buf(), source }),
    };
    replace_file(path, data).map_err(|source| ReconcileError::Write { path: path.to_path_buf(), source })?;
    debug!(path = %path.display(), ?outcome, bytes = data.len(), "file written");
    Ok(outcome)
}

/// Write `data` to a sibling temp file and rename it over `path`, so readers see
/// either the old or the new content in full.
fn replace_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(FILE_MODE);
    }
    let res = opts
        .open(&tmp)
        .and_then(|mut f| {
            f.write_all(data)?;
            f.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}
