//! DNS zone export
//!
//! Turns the artifacts recorded in the manifests into zone-file text. Every
//! record is derived from stored encodings; nothing is kept between exports,
//! and an artifact that does not exist simply contributes no record.
//!
//! Record order is fixed (root CA, intermediate CA, server certificate,
//! OpenPGP keys by identity, IPSECKEY, TLSA, OPENPGPKEY, CAA) so that two
//! exports over the same artifacts differ only in the timestamp comment.

use crate::artifact_store::{write_atomic, ArtifactBundle, ArtifactStore, PUBLIC_FILE_MODE};
use crate::configs::DnsConfig;
use crate::encoding::{self, X25519_KEY_LEN};
use crate::error::{Result, TrustError};
use crate::generate_intermediate_ca::INTERMEDIATE_DER_FILE;
use crate::generate_root_ca::ROOT_DER_FILE;
use crate::generate_server_cert::cert_file_name;
use crate::key_exchange::KEX_PUBLIC_DER_FILE;
use crate::manifest::{live_directory, record_file, ArtifactKind, ArtifactRecord, Manifest, CA_SCOPE};
use crate::naming::{normalize_domain, split_identity};
use crate::openpgp::PGP_BINARY_FILE;
use chrono::{DateTime, SecondsFormat, Utc};
use openssl::x509::X509;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// Type-specific data of one resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// `CERT PKIX 0 0`, DER certificate
    CertPkix(Vec<u8>),
    /// `CERT PGP 0 0`, binary OpenPGP key
    CertPgp(Vec<u8>),
    /// `IPSECKEY 10 0 2 .`, raw X25519 public key
    IpsecKey([u8; X25519_KEY_LEN]),
    /// `TLSA 3 1 1`, hex SHA-256 of the SPKI
    Tlsa(String),
    OpenPgpKey(Vec<u8>),
    Caa { tag: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub owner: String,
    pub data: RecordData,
    /// Trailing comment
    pub comment: Option<String>,
}

impl ResourceRecord {
    fn new(owner: impl Into<String>, data: RecordData) -> Self {
        Self {
            owner: owner.into(),
            data,
            comment: None,
        }
    }

    fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn record_type(&self) -> &'static str {
        match self.data {
            RecordData::CertPkix(_) | RecordData::CertPgp(_) => "CERT",
            RecordData::IpsecKey(_) => "IPSECKEY",
            RecordData::Tlsa(_) => "TLSA",
            RecordData::OpenPgpKey(_) => "OPENPGPKEY",
            RecordData::Caa { .. } => "CAA",
        }
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} IN {} ", self.owner, self.record_type())?;
        match &self.data {
            RecordData::CertPkix(der) => write!(f, "PKIX 0 0 {}", encoding::base64(der))?,
            RecordData::CertPgp(key) => write!(f, "PGP 0 0 {}", encoding::base64(key))?,
            // precedence 10, no gateway, algorithm 2
            RecordData::IpsecKey(raw) => write!(f, "10 0 2 . {}", encoding::base64(raw))?,
            // DANE-EE, SPKI, SHA-256
            RecordData::Tlsa(hash) => write!(f, "3 1 1 {}", hash)?,
            RecordData::OpenPgpKey(key) => f.write_str(&encoding::base64(key))?,
            RecordData::Caa { tag, value } => write!(f, "0 {} \"{}\"", tag, value)?,
        }
        if let Some(comment) = &self.comment {
            write!(f, " ; {}", comment)?;
        }
        Ok(())
    }
}

/// Advanced-method WKD URL for an identity
pub fn wkd_url(identity: &str) -> Result<String> {
    let (local, domain) = split_identity(identity)?;
    let domain = normalize_domain(domain)?;
    Ok(format!(
        "https://openpgpkey.{domain}/.well-known/openpgpkey/{domain}/hu/{}?l={}",
        encoding::wkd_hash(local)?,
        local,
        domain = domain
    ))
}

/// Reads artifacts through the manifests and renders zone text
pub struct ZoneExporter<'a> {
    store: &'a ArtifactStore,
    dns: &'a DnsConfig,
}

impl<'a> ZoneExporter<'a> {
    pub fn new(store: &'a ArtifactStore, dns: &'a DnsConfig) -> Self {
        Self { store, dns }
    }

    fn read_record_file(&self, record: &ArtifactRecord, name: &str) -> Result<Vec<u8>> {
        let dir = live_directory(self.store, record)?;
        self.store.read(&record_file(&dir, record, name)?)
    }

    /// All records for `domain`, in zone order
    pub fn records(&self, domain: &str) -> Result<Vec<ResourceRecord>> {
        let domain = normalize_domain(domain)?;
        let apex = format!("{}.", domain);
        let ca = Manifest::load(self.store, CA_SCOPE)?;
        let manifest = Manifest::load(self.store, &domain)?;
        let mut records = Vec::new();

        if let Some(root) = ca.first(ArtifactKind::RootCa) {
            let der = self.read_record_file(root, ROOT_DER_FILE)?;
            records.push(
                ResourceRecord::new(format!("_root-ca.{}", apex), RecordData::CertPkix(der))
                    .comment("root CA"),
            );
        }
        if let Some(intermediate) = ca.first(ArtifactKind::IntermediateCa) {
            let der = self.read_record_file(intermediate, INTERMEDIATE_DER_FILE)?;
            records.push(
                ResourceRecord::new(
                    format!("_intermediate-ca.{}", apex),
                    RecordData::CertPkix(der),
                )
                .comment("intermediate CA"),
            );
        }

        let mut tlsa = None;
        if let Some(server) = manifest.get(ArtifactKind::ServerCert, &domain) {
            let der = self.read_record_file(server, &cert_file_name(&domain, "der"))?;
            let cert = X509::from_der(&der)
                .map_err(|e| TrustError::encoding(format!("certificate for {}", domain), e))?;
            tlsa = Some(encoding::spki_sha256_hex(&cert)?);
            records.push(
                ResourceRecord::new(apex.as_str(), RecordData::CertPkix(der))
                    .comment("server certificate"),
            );
        }

        let mut openpgpkeys = Vec::new();
        for pgp in manifest.all(ArtifactKind::Openpgp) {
            let key = self.read_record_file(pgp, PGP_BINARY_FILE)?;
            let (local, _) = split_identity(&pgp.name)?;
            let owner = format!("{}._openpgpkey.{}", encoding::wkd_hash(local)?, apex);
            records.push(
                ResourceRecord::new(apex.as_str(), RecordData::CertPgp(key.clone()))
                    .comment(format!("OpenPGP key {}", pgp.name)),
            );
            openpgpkeys.push(
                ResourceRecord::new(owner, RecordData::OpenPgpKey(key))
                    .comment(format!("WKD {}", wkd_url(&pgp.name)?)),
            );
        }

        if let Some(kex) = manifest.get(ArtifactKind::KeyExchange, &domain) {
            let der = self.read_record_file(kex, KEX_PUBLIC_DER_FILE)?;
            let raw = encoding::x25519_raw_public_key(&der)?;
            records.push(
                ResourceRecord::new(apex.as_str(), RecordData::IpsecKey(raw))
                    .comment("X25519 raw public key"),
            );
        }

        if let Some(hash) = tlsa {
            records.push(
                ResourceRecord::new(
                    format!("_{}._tcp.{}", self.dns.tlsa_port, apex),
                    RecordData::Tlsa(hash),
                )
                .comment("DANE-EE"),
            );
        }
        records.extend(openpgpkeys);
        records.extend(self.caa_records(&domain));
        debug!(domain = %domain, records = records.len(), "Collected zone records");
        Ok(records)
    }

    fn caa_records(&self, domain: &str) -> Vec<ResourceRecord> {
        let caa = |tag: &'static str, value: String| {
            ResourceRecord::new("@", RecordData::Caa { tag, value })
        };
        vec![
            caa("issue", self.dns.caa_issue.clone()),
            // no wildcard issuance
            caa("issuewild", ";".to_string()),
            caa(
                "iodef",
                format!("mailto:{}@{}", self.dns.caa_iodef_mailbox, domain),
            ),
        ]
    }

    /// Zone text for `domain` stamped with `generated_at`
    pub fn export_at(&self, domain: &str, generated_at: DateTime<Utc>) -> Result<String> {
        let records = self.records(domain)?;
        let domain = normalize_domain(domain)?;
        let mut zone = String::new();
        zone.push_str(&format!("; Explicit trust records for {}\n", domain));
        zone.push_str(&format!(
            "; generated {}\n",
            generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        zone.push_str(&format!("$ORIGIN {}.\n", domain));
        zone.push_str(&format!("$TTL {}\n", self.dns.ttl));
        for record in &records {
            zone.push_str(&record.to_string());
            zone.push('\n');
        }
        Ok(zone)
    }

    pub fn export(&self, domain: &str) -> Result<String> {
        self.export_at(domain, Utc::now())
    }

    /// Export and persist to `dns/records/<domain>.zone`
    pub fn write(&self, domain: &str) -> Result<PathBuf> {
        let zone = self.export(domain)?;
        let path = self.store.zone_path(&normalize_domain(domain)?);
        write_atomic(&path, zone.as_bytes(), PUBLIC_FILE_MODE)?;
        info!(domain, path = %path.display(), "Wrote zone file");
        Ok(path)
    }

    /// Materialise the WKD advanced-method tree for `domain`
    pub fn export_wkd(&self, domain: &str) -> Result<PathBuf> {
        let domain = normalize_domain(domain)?;
        let manifest = Manifest::load(self.store, &domain)?;
        let keys = manifest.all(ArtifactKind::Openpgp);
        if keys.is_empty() {
            return Err(TrustError::missing(
                format!("WKD export for {}", domain),
                "an OpenPGP key for the domain",
            ));
        }
        let base = format!(".well-known/openpgpkey/{}", domain);
        let mut bundle = ArtifactBundle::new().public(format!("{}/policy", base), Vec::new());
        for pgp in keys {
            let key = self.read_record_file(pgp, PGP_BINARY_FILE)?;
            let (local, _) = split_identity(&pgp.name)?;
            bundle = bundle.public(format!("{}/hu/{}", base, encoding::wkd_hash(local)?), key);
        }
        let dir = self.store.wkd_dir(&domain);
        self.store.commit(&dir, &bundle)?;
        info!(domain = %domain, path = %dir.display(), "Exported Web Key Directory");
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_rendering() {
        let tlsa = ResourceRecord::new("_443._tcp.example.com.", RecordData::Tlsa("ab".repeat(32)));
        assert_eq!(
            tlsa.to_string(),
            format!("_443._tcp.example.com. IN TLSA 3 1 1 {}", "ab".repeat(32))
        );

        let ipsec = ResourceRecord::new("example.com.", RecordData::IpsecKey([0u8; 32]))
            .comment("X25519 raw public key");
        assert_eq!(
            ipsec.to_string(),
            "example.com. IN IPSECKEY 10 0 2 . AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA= ; X25519 raw public key"
        );

        let cert = ResourceRecord::new("example.com.", RecordData::CertPkix(vec![1, 2, 3]));
        assert_eq!(cert.to_string(), "example.com. IN CERT PKIX 0 0 AQID");
        let pgp = ResourceRecord::new("example.com.", RecordData::CertPgp(vec![1, 2, 3]));
        assert_eq!(pgp.to_string(), "example.com. IN CERT PGP 0 0 AQID");
    }

    #[test]
    fn test_caa_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let dns = DnsConfig::default();
        let exporter = ZoneExporter::new(&store, &dns);
        let lines: Vec<String> = exporter
            .caa_records("example.com")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "@ IN CAA 0 issue \"letsencrypt.org\"",
                "@ IN CAA 0 issuewild \";\"",
                "@ IN CAA 0 iodef \"mailto:security@example.com\"",
            ]
        );
    }

    #[test]
    fn test_empty_store_exports_only_caa() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let dns = DnsConfig::default();
        let zone = ZoneExporter::new(&store, &dns)
            .export_at("Example.com", Utc::now())
            .unwrap();
        assert!(zone.contains("$ORIGIN example.com.\n$TTL 3600\n"));
        let records: Vec<&str> = zone.lines().filter(|l| l.contains(" IN ")).collect();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|l| l.contains(" IN CAA ")));
    }

    #[test]
    fn test_wkd_url() {
        assert_eq!(
            wkd_url("Joe.Doe@Example.ORG").unwrap(),
            "https://openpgpkey.example.org/.well-known/openpgpkey/example.org/hu/iy9q119eutrkn8s1mk4r39qejnbu3n5q?l=Joe.Doe"
        );
    }

    #[test]
    fn test_wkd_export_requires_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let dns = DnsConfig::default();
        assert!(matches!(
            ZoneExporter::new(&store, &dns).export_wkd("example.com"),
            Err(TrustError::MissingDependency { .. })
        ));
    }
}
