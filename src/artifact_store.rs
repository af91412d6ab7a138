//! Artifact Store
//!
//! Filesystem hierarchy holding every key, certificate and derived encoding,
//! keyed by entity type and domain:
//!
//! ```text
//! ca/root/            root.key root.crt root.der root.b64
//! ca/intermediate/    intermediate.key intermediate.crt .der .b64 chain.pem
//! certs/<domain>/     <domain>.key .crt .der .b64 .spki.sha256 [fullchain.pem]
//! kex/<domain>/       x25519.key x25519.pub.pem x25519.pub.der x25519.raw.b64 x25519.raw.hex
//! pgp/<domain>/<id>/  public.asc public.pgp public.b64 fingerprint
//! dns/records/        <domain>.zone
//! manifests/          _ca.json <domain>.json
//! backup/<timestamp>/ snapshot mirror
//! ```
//!
//! Artifact directories are replaced as a unit: [`ArtifactStore::commit`]
//! writes a complete staging directory next to the live one and swaps it in
//! with `rename`, so a reader sees either the old set of files or the new set.

use crate::error::{Result, TrustError};
use crate::naming::{domain_artifact_name, identity_artifact_name};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const SECRET_FILE_MODE: u32 = 0o600;
pub const PUBLIC_FILE_MODE: u32 = 0o644;
pub const SECRET_DIR_MODE: u32 = 0o700;
pub const PUBLIC_DIR_MODE: u32 = 0o755;

/// One file of an artifact set
pub struct ArtifactFile {
    pub name: String,
    contents: Zeroizing<Vec<u8>>,
    pub secret: bool,
}

impl ArtifactFile {
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }
}

/// The complete set of files making up one artifact directory
#[derive(Default)]
pub struct ArtifactBundle {
    files: Vec<ArtifactFile>,
}

impl ArtifactBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freely distributable file
    pub fn public(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push(ArtifactFile {
            name: name.into(),
            contents: Zeroizing::new(contents.into()),
            secret: false,
        });
        self
    }

    /// Add an owner-only file (private key material)
    pub fn secret(mut self, name: impl Into<String>, contents: Zeroizing<Vec<u8>>) -> Self {
        self.files.push(ArtifactFile {
            name: name.into(),
            contents,
            secret: true,
        });
        self
    }

    pub fn files(&self) -> &[ArtifactFile] {
        &self.files
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.contents())
    }

    fn has_secret(&self) -> bool {
        self.files.iter().any(|f| f.secret)
    }
}

/// Handle on the on-disk trust-material hierarchy
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| TrustError::filesystem(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_ca_dir(&self) -> PathBuf {
        self.root.join("ca").join("root")
    }

    pub fn intermediate_ca_dir(&self) -> PathBuf {
        self.root.join("ca").join("intermediate")
    }

    pub fn cert_dir(&self, domain: &str) -> PathBuf {
        self.root.join("certs").join(domain_artifact_name(domain))
    }

    pub fn kex_dir(&self, domain: &str) -> PathBuf {
        self.root.join("kex").join(domain_artifact_name(domain))
    }

    pub fn pgp_dir(&self, domain: &str, identity: &str) -> PathBuf {
        self.root
            .join("pgp")
            .join(domain_artifact_name(domain))
            .join(identity_artifact_name(identity))
    }

    pub fn gnupg_home(&self) -> PathBuf {
        self.root.join("pgp").join(".gnupg")
    }

    pub fn zone_path(&self, domain: &str) -> PathBuf {
        self.root
            .join("dns")
            .join("records")
            .join(format!("{}.zone", domain_artifact_name(domain)))
    }

    pub fn wkd_dir(&self, domain: &str) -> PathBuf {
        self.root
            .join("dns")
            .join("wkd")
            .join(domain_artifact_name(domain))
    }

    pub fn backup_root(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Path relative to the store root, as recorded in manifests
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Check that `dir` can receive a new artifact set before any key is generated.
    ///
    /// Creates the parent directory and opens every existing file in `dir`
    /// for write access, so a protected artifact owned by another principal is
    /// reported up front instead of after a key was produced.
    pub fn prepare(&self, dir: &Path) -> Result<()> {
        let parent = parent_of(dir)?;
        fs::create_dir_all(parent).map_err(|e| TrustError::filesystem(parent, e))?;

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(TrustError::filesystem(dir, e)),
        };
        for entry in entries {
            let path = entry.map_err(|e| TrustError::filesystem(dir, e))?.path();
            if path.is_file() {
                OpenOptions::new().write(true).open(&path).map_err(|e| {
                    TrustError::filesystem(
                        &path,
                        format!("existing artifact is not writable: {}", e),
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Replace `dir` with exactly the files in `bundle`.
    ///
    /// On error the previous contents of `dir` (if any) are left in place and
    /// the staging directory is removed.
    pub fn commit(&self, dir: &Path, bundle: &ArtifactBundle) -> Result<()> {
        self.prepare(dir)?;
        let parent = parent_of(dir)?;
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TrustError::filesystem(dir, "artifact directory has no name"))?;
        let pid = std::process::id();
        let staging = parent.join(format!(".{}.staging-{}", name, pid));
        let retired = parent.join(format!(".{}.old-{}", name, pid));

        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| TrustError::filesystem(&staging, e))?;
        }
        if let Err(e) = write_staging(&staging, bundle) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if dir.exists() {
            if let Err(e) = fs::rename(dir, &retired) {
                let _ = fs::remove_dir_all(&staging);
                return Err(TrustError::filesystem(dir, format!("cannot retire live artifact: {}", e)));
            }
            if let Err(e) = fs::rename(&staging, dir) {
                // put the previous artifact set back before reporting
                let _ = fs::rename(&retired, dir);
                let _ = fs::remove_dir_all(&staging);
                return Err(TrustError::filesystem(dir, format!("cannot install new artifact: {}", e)));
            }
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!(path = %retired.display(), error = %e, "Failed to remove retired artifact directory");
            }
        } else {
            fs::rename(&staging, dir).map_err(|e| {
                let _ = fs::remove_dir_all(&staging);
                TrustError::filesystem(dir, format!("cannot install new artifact: {}", e))
            })?;
        }
        debug!(path = %dir.display(), files = bundle.files().len(), "Committed artifact set");
        Ok(())
    }

    /// Read a file from the store, naming the artifact in the error
    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| TrustError::filesystem(path, e))
    }

    pub fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| TrustError::filesystem(path, e))
    }
}

fn parent_of(dir: &Path) -> Result<&Path> {
    dir.parent()
        .ok_or_else(|| TrustError::filesystem(dir, "artifact directory has no parent"))
}

fn write_staging(staging: &Path, bundle: &ArtifactBundle) -> Result<()> {
    fs::create_dir(staging).map_err(|e| TrustError::filesystem(staging, e))?;
    let dir_mode = if bundle.has_secret() {
        SECRET_DIR_MODE
    } else {
        PUBLIC_DIR_MODE
    };
    set_mode(staging, dir_mode)?;
    for file in bundle.files() {
        let mode = if file.secret {
            SECRET_FILE_MODE
        } else {
            PUBLIC_FILE_MODE
        };
        let path = staging.join(&file.name);
        // names may carry a relative subdirectory (the WKD tree)
        if let Some(parent) = path.parent().filter(|p| *p != staging) {
            fs::create_dir_all(parent).map_err(|e| TrustError::filesystem(parent, e))?;
        }
        write_file(&path, file.contents(), mode)?;
    }
    Ok(())
}

/// Create `path` with `mode` already applied and flush it to disk
fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file: File = options.open(path).map_err(|e| TrustError::filesystem(path, e))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| TrustError::filesystem(path, e))?;
    // umask may have narrowed the requested mode
    set_mode(path, mode)
}

/// Write `contents` to `path` by way of a temporary sibling and `rename`
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TrustError::filesystem(path, "path has no parent"))?;
    fs::create_dir_all(parent).map_err(|e| TrustError::filesystem(parent, e))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TrustError::filesystem(path, "path has no file name"))?;
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));
    if tmp.exists() {
        fs::remove_file(&tmp).map_err(|e| TrustError::filesystem(&tmp, e))?;
    }
    if let Err(e) = write_file(&tmp, contents, mode) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        TrustError::filesystem(path, e)
    })
}

/// Set unix permission bits (no-op elsewhere)
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| TrustError::filesystem(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(tag: &str) -> ArtifactBundle {
        ArtifactBundle::new()
            .secret("leaf.key", Zeroizing::new(format!("key-{}", tag).into_bytes()))
            .public("leaf.crt", format!("cert-{}", tag))
    }

    #[test]
    fn test_layout_uses_sanitized_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(store.cert_dir("*.example.com").ends_with("certs/_wildcard_.example.com"));
        assert!(store
            .pgp_dir("example.com", "alice@example.com")
            .ends_with("pgp/example.com/alice_at_example_com"));
        assert!(store.zone_path("example.com").ends_with("dns/records/example.com.zone"));
    }

    #[test]
    fn test_commit_creates_and_replaces_whole_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = store.cert_dir("example.com");

        store
            .commit(&target, &bundle("one").public("fullchain.pem", "chain"))
            .unwrap();
        assert_eq!(fs::read(target.join("leaf.crt")).unwrap(), b"cert-one");
        assert!(target.join("fullchain.pem").exists());

        store.commit(&target, &bundle("two")).unwrap();
        assert_eq!(fs::read(target.join("leaf.key")).unwrap(), b"key-two");
        // files not in the new bundle do not survive
        assert!(!target.join("fullchain.pem").exists());

        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["example.com".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = store.kex_dir("example.com");
        store.commit(&target, &bundle("one")).unwrap();

        let key_mode = fs::metadata(target.join("leaf.key")).unwrap().permissions().mode();
        let crt_mode = fs::metadata(target.join("leaf.crt")).unwrap().permissions().mode();
        let dir_mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(key_mode & 0o777, SECRET_FILE_MODE);
        assert_eq!(crt_mode & 0o777, PUBLIC_FILE_MODE);
        assert_eq!(dir_mode & 0o777, SECRET_DIR_MODE);
    }

    #[cfg(unix)]
    #[test]
    fn test_prepare_rejects_read_only_artifact() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let target = store.cert_dir("example.com");
        fs::create_dir_all(&target).unwrap();
        let locked = target.join("leaf.key");
        fs::write(&locked, b"foreign").unwrap();
        if fs::metadata(&locked).unwrap().uid() == 0 {
            // root ignores permission bits
            return;
        }
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o400)).unwrap();

        match store.prepare(&target) {
            Err(TrustError::Filesystem { path, .. }) => assert_eq!(path, locked),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            store.commit(&target, &bundle("new")),
            Err(TrustError::Filesystem { .. })
        ));
        assert_eq!(fs::read(&locked).unwrap(), b"foreign");
        assert!(!target.join("leaf.crt").exists());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns").join("records").join("example.com.zone");
        write_atomic(&path, b"first", PUBLIC_FILE_MODE).unwrap();
        write_atomic(&path, b"second", PUBLIC_FILE_MODE).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_bundle_lookup() {
        let b = bundle("x");
        assert_eq!(b.get("leaf.crt"), Some(&b"cert-x"[..]));
        assert_eq!(b.get("missing"), None);
        assert_eq!(b.file_names(), vec!["leaf.key", "leaf.crt"]);
    }
}
