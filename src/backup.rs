//! Backup snapshots taken before destructive replacement
//!
//! A snapshot mirrors one live artifact subtree under
//! `backup/<UTC timestamp>/<path relative to the store>`. The copy is verified
//! file by file against the source and then marked read-only. Any failure
//! removes the partial snapshot and reports a `Backup` error, before the live
//! artifact has been touched.

use crate::artifact_store::ArtifactStore;
use crate::error::{Result, TrustError};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// A completed, verified backup of one subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// `backup/<timestamp>` directory
    pub root: PathBuf,
    /// The mirrored subtree inside `root`
    pub path: PathBuf,
    pub files: usize,
}

impl Snapshot {
    /// Copy `live` into a fresh snapshot directory and verify it.
    pub fn take(store: &ArtifactStore, live: &Path, taken_at: DateTime<Utc>) -> Result<Self> {
        if !live.is_dir() {
            return Err(TrustError::backup(live, "nothing to back up: not a directory"));
        }
        let root = create_unique(&store.backup_root(), taken_at)?;
        let path = root.join(store.relative(live));

        match copy_and_verify(live, &path) {
            Ok(files) => {
                if let Err(e) = mark_read_only(&path) {
                    discard(&root);
                    return Err(e);
                }
                info!(
                    source = %live.display(),
                    snapshot = %path.display(),
                    files,
                    "Backup snapshot verified"
                );
                Ok(Self { root, path, files })
            }
            Err(e) => {
                discard(&root);
                Err(e)
            }
        }
    }
}

/// `backup/<timestamp>`, or `<timestamp>-N` when that name is taken
fn create_unique(backup_root: &Path, taken_at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(backup_root).map_err(|e| TrustError::backup(backup_root, e))?;
    let stamp = taken_at.format(TIMESTAMP_FORMAT).to_string();
    for attempt in 0u32.. {
        let name = if attempt == 0 {
            stamp.clone()
        } else {
            format!("{}-{}", stamp, attempt)
        };
        let candidate = backup_root.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(TrustError::backup(&candidate, e)),
        }
    }
    Err(TrustError::backup(backup_root, "no free snapshot name"))
}

fn copy_and_verify(source: &Path, target: &Path) -> Result<usize> {
    fs::create_dir_all(target).map_err(|e| TrustError::backup(target, e))?;
    let mut copied = 0;
    let entries = fs::read_dir(source).map_err(|e| TrustError::backup(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| TrustError::backup(source, e))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| TrustError::backup(&from, e))?;
        if file_type.is_dir() {
            copied += copy_and_verify(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to).map_err(|e| TrustError::backup(&from, e))?;
            verify_copy(&from, &to)?;
            copied += 1;
        } else {
            return Err(TrustError::backup(&from, "not a regular file or directory"));
        }
    }
    Ok(copied)
}

fn verify_copy(original: &Path, copy: &Path) -> Result<()> {
    let expected = fs::read(original).map_err(|e| TrustError::backup(original, e))?;
    let actual = fs::read(copy).map_err(|e| TrustError::backup(copy, e))?;
    if expected != actual {
        return Err(TrustError::backup(copy, "copy does not match the live file"));
    }
    Ok(())
}

/// Clear write permission on every file below `path`
fn mark_read_only(path: &Path) -> Result<()> {
    let entries = fs::read_dir(path).map_err(|e| TrustError::backup(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| TrustError::backup(path, e))?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            mark_read_only(&entry_path)?;
            continue;
        }
        let mut permissions = fs::metadata(&entry_path)
            .map_err(|e| TrustError::backup(&entry_path, e))?
            .permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&entry_path, permissions)
            .map_err(|e| TrustError::backup(&entry_path, e))?;
    }
    Ok(())
}

fn discard(root: &Path) {
    if let Err(e) = fs::remove_dir_all(root) {
        warn!(path = %root.display(), error = %e, "Failed to remove incomplete snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::ArtifactBundle;
    use chrono::TimeZone;
    use zeroize::Zeroizing;

    fn populated_store() -> (tempfile::TempDir, ArtifactStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let live = store.cert_dir("example.com");
        let bundle = ArtifactBundle::new()
            .secret("example.com.key", Zeroizing::new(b"private".to_vec()))
            .public("example.com.crt", "certificate");
        store.commit(&live, &bundle).unwrap();
        (dir, store, live)
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, second).unwrap()
    }

    #[test]
    fn test_snapshot_mirrors_live_subtree() {
        let (_dir, store, live) = populated_store();
        let snapshot = Snapshot::take(&store, &live, at(0)).unwrap();

        assert!(snapshot.root.ends_with("backup/20261016T120000Z"));
        assert!(snapshot.path.ends_with("20261016T120000Z/certs/example.com"));
        assert_eq!(snapshot.files, 2);
        assert_eq!(
            fs::read(snapshot.path.join("example.com.key")).unwrap(),
            fs::read(live.join("example.com.key")).unwrap()
        );
        let permissions = fs::metadata(snapshot.path.join("example.com.crt"))
            .unwrap()
            .permissions();
        assert!(permissions.readonly());
    }

    #[test]
    fn test_colliding_timestamps_get_suffix() {
        let (_dir, store, live) = populated_store();
        let first = Snapshot::take(&store, &live, at(5)).unwrap();
        let second = Snapshot::take(&store, &live, at(5)).unwrap();
        assert_ne!(first.root, second.root);
        assert!(second.root.ends_with("20261016T120005Z-1"));
    }

    #[test]
    fn test_blocked_backup_root_is_backup_error() {
        let (dir, store, live) = populated_store();
        // a plain file where the backup directory should be
        fs::write(dir.path().join("backup"), b"not a directory").unwrap();
        let err = Snapshot::take(&store, &live, at(0)).unwrap_err();
        assert!(matches!(err, TrustError::Backup { .. }));
    }

    #[test]
    fn test_missing_live_directory_is_backup_error() {
        let (_dir, store, _live) = populated_store();
        let err = Snapshot::take(&store, &store.kex_dir("example.com"), at(0)).unwrap_err();
        assert!(matches!(err, TrustError::Backup { .. }));
    }
}
