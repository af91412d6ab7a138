//! Advisory lock on an artifact subtree
//!
//! Opens `locks/<scope>.lock` with create-only semantics and writes the
//! holder's pid into it; the file is removed when the lock is dropped. A
//! second invocation against the same scope fails immediately. Nothing is
//! retried.

use crate::artifact_store::ArtifactStore;
use crate::error::{Result, TrustError};
use crate::naming::domain_artifact_name;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Identity written into the lock file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockContext {
    pub pid: u32,
    pub operation: String,
}

impl LockContext {
    pub fn current(operation: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            operation: operation.into(),
        }
    }
}

#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
    _handle: File,
}

impl Lockfile {
    /// Take the lock for `scope` (a domain or the CA hierarchy)
    pub fn acquire(store: &ArtifactStore, scope: &str, operation: &str) -> Result<Self> {
        let dir = store.lock_dir();
        fs::create_dir_all(&dir).map_err(|e| TrustError::filesystem(&dir, e))?;
        let path = dir.join(format!("{}.lock", domain_artifact_name(scope)));
        Self::create(&path, LockContext::current(operation))
    }

    fn create(path: &Path, context: LockContext) -> Result<Self> {
        let mut handle = match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read(path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<LockContext>(&bytes).ok());
                let reason = match holder {
                    Some(ctx) => format!(
                        "locked by pid {} ({}); remove the file if that process is gone",
                        ctx.pid, ctx.operation
                    ),
                    None => "locked by another invocation".to_string(),
                };
                return Err(TrustError::filesystem(path, reason));
            }
            Err(e) => return Err(TrustError::filesystem(path, e)),
        };

        // From here on the Lockfile owns the path and removes it on drop
        let lock = Self {
            path: path.to_path_buf(),
            _handle: handle.try_clone().map_err(|e| TrustError::filesystem(path, e))?,
        };
        let json = serde_json::to_vec(&context).map_err(|e| TrustError::filesystem(path, e))?;
        handle
            .write_all(&json)
            .and_then(|_| handle.flush())
            .map_err(|e| TrustError::filesystem(path, e))?;
        debug!(path = %path.display(), pid = context.pid, "Acquired lock");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}
