//! Per-domain artifact manifest
//!
//! The manifest is the single record of which artifacts exist, where they
//! live, how they were produced and when. Operations resolve artifacts through
//! it instead of scanning directories. Two kinds of manifest exist: one for the
//! CA hierarchy (`manifests/_ca.json`) and one per domain.

use crate::artifact_store::{write_atomic, ArtifactStore, PUBLIC_FILE_MODE};
use crate::error::{Result, TrustError};
use crate::naming::domain_artifact_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Manifest scope name of the CA hierarchy
pub const CA_SCOPE: &str = "_ca";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    RootCa,
    IntermediateCa,
    ServerCert,
    KeyExchange,
    Openpgp,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::RootCa => "root CA",
            ArtifactKind::IntermediateCa => "intermediate CA",
            ArtifactKind::ServerCert => "server certificate",
            ArtifactKind::KeyExchange => "key-exchange key",
            ArtifactKind::Openpgp => "OpenPGP key",
        };
        f.write_str(name)
    }
}

/// How an artifact came to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GenerationSource {
    SelfSigned,
    SignedBy { issuer: String },
    Generated,
    OpenpgpEngine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    /// Domain, identity or CA common name the artifact belongs to
    pub name: String,
    /// Directory relative to the store root
    pub directory: PathBuf,
    pub files: Vec<String>,
    pub source: GenerationSource,
    /// SHA-256 of the public key DER (or the OpenPGP fingerprint)
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    /// Backup snapshot holding the artifact this one replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_backup: Option<PathBuf>,
}

impl ArtifactRecord {
    pub fn key(&self) -> String {
        record_key(self.kind, &self.name)
    }
}

fn record_key(kind: ArtifactKind, name: &str) -> String {
    let kind = serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!("{}:{}", kind, name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub scope: String,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    fn path(store: &ArtifactStore, scope: &str) -> PathBuf {
        store
            .manifest_dir()
            .join(format!("{}.json", domain_artifact_name(scope)))
    }

    /// Load the manifest for `scope`; a missing file is an empty manifest
    pub fn load(store: &ArtifactStore, scope: &str) -> Result<Self> {
        let path = Self::path(store, scope);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TrustError::encoding(format!("manifest {}", path.display()), e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::new(scope)),
            Err(e) => Err(TrustError::filesystem(&path, e)),
        }
    }

    pub fn save(&mut self, store: &ArtifactStore) -> Result<()> {
        self.updated_at = Some(Utc::now());
        let path = Self::path(store, &self.scope);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| TrustError::encoding(format!("manifest {}", path.display()), e))?;
        write_atomic(&path, &json, PUBLIC_FILE_MODE)
    }

    pub fn get(&self, kind: ArtifactKind, name: &str) -> Option<&ArtifactRecord> {
        self.artifacts.get(&record_key(kind, name))
    }

    /// First record of `kind`, for singleton artifacts like the CAs
    pub fn first(&self, kind: ArtifactKind) -> Option<&ArtifactRecord> {
        self.artifacts.values().find(|r| r.kind == kind)
    }

    /// All records of `kind`, ordered by name
    pub fn all(&self, kind: ArtifactKind) -> Vec<&ArtifactRecord> {
        let mut records: Vec<_> = self.artifacts.values().filter(|r| r.kind == kind).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn upsert(&mut self, record: ArtifactRecord) {
        self.artifacts.insert(record.key(), record);
    }

    pub fn remove_kind(&mut self, kind: ArtifactKind) {
        self.artifacts.retain(|_, r| r.kind != kind);
    }
}

/// Resolve a record to its live directory, failing if the store lost it
pub fn live_directory(store: &ArtifactStore, record: &ArtifactRecord) -> Result<PathBuf> {
    let dir = store.resolve(&record.directory);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(TrustError::filesystem(
            &dir,
            format!("manifest lists {} {:?} but the directory is missing", record.kind, record.name),
        ))
    }
}

pub fn record_file(dir: &Path, record: &ArtifactRecord, name: &str) -> Result<PathBuf> {
    if record.files.iter().any(|f| f == name) {
        Ok(dir.join(name))
    } else {
        Err(TrustError::filesystem(
            dir.join(name),
            format!("{} {:?} has no file {}", record.kind, record.name, name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: ArtifactKind, name: &str) -> ArtifactRecord {
        ArtifactRecord {
            kind,
            name: name.to_string(),
            directory: PathBuf::from("certs").join(name),
            files: vec![format!("{}.crt", name)],
            source: GenerationSource::SelfSigned,
            fingerprint: "00".repeat(32),
            created_at: Utc::now(),
            not_after: None,
            replaced_backup: None,
        }
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let manifest = Manifest::load(&store, "example.com").unwrap();
        assert_eq!(manifest.scope, "example.com");
        assert!(manifest.artifacts.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let mut manifest = Manifest::new("example.com");
        manifest.upsert(record(ArtifactKind::ServerCert, "example.com"));
        let mut pgp = record(ArtifactKind::Openpgp, "alice@example.com");
        pgp.source = GenerationSource::OpenpgpEngine;
        manifest.upsert(pgp);
        manifest.save(&store).unwrap();

        let loaded = Manifest::load(&store, "example.com").unwrap();
        assert_eq!(loaded.artifacts.len(), 2);
        assert!(loaded.get(ArtifactKind::ServerCert, "example.com").is_some());
        assert_eq!(
            loaded.get(ArtifactKind::Openpgp, "alice@example.com").unwrap().source,
            GenerationSource::OpenpgpEngine
        );
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_upsert_replaces_same_key() {
        let mut manifest = Manifest::new("example.com");
        manifest.upsert(record(ArtifactKind::ServerCert, "example.com"));
        let mut second = record(ArtifactKind::ServerCert, "example.com");
        second.fingerprint = "ff".repeat(32);
        manifest.upsert(second);
        assert_eq!(manifest.all(ArtifactKind::ServerCert).len(), 1);
        assert_eq!(
            manifest.first(ArtifactKind::ServerCert).unwrap().fingerprint,
            "ff".repeat(32)
        );
    }

    #[test]
    fn test_source_serialization_is_tagged() {
        let json = serde_json::to_string(&GenerationSource::SignedBy {
            issuer: "Explicit Trust Intermediate CA".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"signed-by","issuer":"Explicit Trust Intermediate CA"}"#);
        assert_eq!(record_key(ArtifactKind::KeyExchange, "example.com"), "key-exchange:example.com");
    }

    #[test]
    fn test_live_directory_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let err = live_directory(&store, &record(ArtifactKind::ServerCert, "example.com")).unwrap_err();
        assert!(err.to_string().contains("directory is missing"));
    }
}
