//! Trust plane operations
//!
//! [`TrustPlane`] ties the generators to the artifact store. Every mutating
//! operation takes the advisory lock for its scope, checks the target
//! directory, generates, commits the artifact set as a unit and only then
//! records it in the manifest.

use crate::artifact_store::{ArtifactBundle, ArtifactStore};
use crate::backup::Snapshot;
use crate::configs::AppConfig;
use crate::dns_records::ZoneExporter;
use crate::encoding;
use crate::error::{Result, TrustError};
use crate::generate_intermediate_ca::{
    Ed448IntermediateCABuilder, IntermediateCa, CHAIN_FILE, INTERMEDIATE_CERT_FILE,
    INTERMEDIATE_KEY_FILE,
};
use crate::generate_root_ca::{
    CaCertificate, Ed448RootCABuilder, RootCa, ROOT_CERT_FILE, ROOT_KEY_FILE,
};
use crate::generate_server_cert::{Ed25519ServerCertBuilder, IssuanceDecision, IssuanceMode};
use crate::key_exchange::KexKeyPair;
use crate::lockfile::Lockfile;
use crate::manifest::{
    live_directory, record_file, ArtifactKind, ArtifactRecord, GenerationSource, Manifest, CA_SCOPE,
};
use crate::naming::{normalize_domain, split_identity};
use crate::openpgp::{self, GnuPg, PgpEngine};
use crate::pki_generator::{authority_key_id, subject_key_id};
use crate::rotation::{
    self, Regenerated, Regenerator, RotationReport, RotationScope, RotationTarget,
};
use crate::secure_key::SecureKey;
use crate::status::{self, StatusReport};
use chrono::Utc;
use openssl::x509::X509;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result of a certificate issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub decision: IssuanceDecision,
    pub record: ArtifactRecord,
}

pub struct TrustPlane {
    store: ArtifactStore,
    config: AppConfig,
    pgp: Box<dyn PgpEngine>,
}

impl TrustPlane {
    /// Open the store named in `config` with the GnuPG engine
    pub fn open(config: AppConfig) -> Result<Self> {
        let store = ArtifactStore::open(&config.store_path)?;
        let engine = GnuPg::new(&config.openpgp.gpg_binary, store.gnupg_home());
        Ok(Self {
            store,
            config,
            pgp: Box::new(engine),
        })
    }

    pub fn with_engine(config: AppConfig, engine: Box<dyn PgpEngine>) -> Result<Self> {
        let store = ArtifactStore::open(&config.store_path)?;
        Ok(Self {
            store,
            config,
            pgp: engine,
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn record(
        &self,
        kind: ArtifactKind,
        name: &str,
        dir: &Path,
        bundle: &ArtifactBundle,
        source: GenerationSource,
        fingerprint: String,
    ) -> ArtifactRecord {
        ArtifactRecord {
            kind,
            name: name.to_string(),
            directory: self.store.relative(dir),
            files: bundle.file_names(),
            source,
            fingerprint,
            created_at: Utc::now(),
            not_after: None,
            replaced_backup: None,
        }
    }

    /// Snapshot `dir` if it exists, returning the snapshot relative to the store
    fn backup_if_live(&self, dir: &Path) -> Result<Option<PathBuf>> {
        if dir.is_dir() {
            let snapshot = Snapshot::take(&self.store, dir, Utc::now())?;
            Ok(Some(self.store.relative(&snapshot.path)))
        } else {
            Ok(None)
        }
    }

    /// Add `record` to `manifest` once its artifact set is committed.
    ///
    /// The artifact is already live here, so a failed save is reported
    /// against the committed directory.
    fn record_committed(
        &self,
        manifest: &mut Manifest,
        record: ArtifactRecord,
        committed: &Path,
    ) -> Result<()> {
        manifest.upsert(record);
        manifest.save(&self.store).map_err(|cause| {
            TrustError::filesystem(
                committed,
                format!(
                    "artifact set is live but manifest {:?} was not updated; \
                     re-run the operation to make the store consistent: {}",
                    manifest.scope, cause
                ),
            )
        })
    }

    // ================= CA hierarchy =================

    /// Create (or replace) the Ed448 root CA.
    ///
    /// An existing `ca/` tree is snapshotted first; replacement does not
    /// proceed if the snapshot fails.
    pub fn create_root_ca(&self, common_name: &str, validity_days: u32) -> Result<ArtifactRecord> {
        let _lock = Lockfile::acquire(&self.store, CA_SCOPE, "root-ca")?;
        let dir = self.store.root_ca_dir();
        self.store.prepare(&dir)?;
        let mut manifest = Manifest::load(&self.store, CA_SCOPE)?;

        let ca_tree = self.store.root().join("ca");
        let replaced_backup = if dir.is_dir() {
            self.backup_if_live(&ca_tree)?
        } else {
            None
        };

        let mut builder = Ed448RootCABuilder::new()
            .subject_common_name(common_name.to_string())
            .organization(self.config.ca.organization.clone())
            .validity_days(validity_days);
        if let Some(country) = &self.config.ca.country {
            builder = builder.country(country.clone());
        }
        let root = builder.build()?;
        let bundle = root.bundle()?;
        self.store.commit(&dir, &bundle)?;

        let mut record = self.record(
            ArtifactKind::RootCa,
            common_name,
            &dir,
            &bundle,
            GenerationSource::SelfSigned,
            encoding::spki_sha256_hex(&root.0.certificate)?,
        );
        record.not_after = Some(root.0.certificate.not_after().to_string());
        record.replaced_backup = replaced_backup;
        manifest.remove_kind(ArtifactKind::RootCa);
        // an intermediate signed by the old root no longer chains to anything live
        if let Some(retired) = manifest.first(ArtifactKind::IntermediateCa) {
            warn!(
                intermediate = %retired.name,
                "Root CA replaced; intermediate CA retired until it is recreated"
            );
            manifest.remove_kind(ArtifactKind::IntermediateCa);
        }
        self.record_committed(&mut manifest, record.clone(), &dir)?;
        info!(path = %dir.display(), fingerprint = %record.fingerprint, "Root CA stored");
        Ok(record)
    }

    fn load_root(&self) -> Result<RootCa> {
        let manifest = Manifest::load(&self.store, CA_SCOPE)?;
        let record = manifest
            .first(ArtifactKind::RootCa)
            .ok_or_else(|| TrustError::signing("root CA", "root CA key material is absent"))?;
        let dir = live_directory(&self.store, record)
            .map_err(|e| TrustError::signing("root CA", e))?;
        let key = SecureKey::from_pem_file("root CA", &dir.join(ROOT_KEY_FILE))?;
        let certificate = read_certificate(&dir.join(ROOT_CERT_FILE), "root CA")?;
        Ok(RootCa(CaCertificate { key, certificate }))
    }

    /// Create (or replace) the intermediate CA under the existing root
    pub fn create_intermediate_ca(
        &self,
        common_name: &str,
        validity_days: u32,
    ) -> Result<ArtifactRecord> {
        let _lock = Lockfile::acquire(&self.store, CA_SCOPE, "intermediate-ca")?;
        let dir = self.store.intermediate_ca_dir();
        self.store.prepare(&dir)?;
        let root = self.load_root()?;
        let mut manifest = Manifest::load(&self.store, CA_SCOPE)?;
        let replaced_backup = self.backup_if_live(&dir)?;

        let mut builder = Ed448IntermediateCABuilder::new(&root.0.key, &root.0.certificate)
            .subject_common_name(common_name.to_string())
            .organization(self.config.ca.organization.clone())
            .validity_days(validity_days);
        if let Some(country) = &self.config.ca.country {
            builder = builder.country(country.clone());
        }
        let intermediate = builder.build()?;
        let bundle = intermediate.bundle()?;
        self.store.commit(&dir, &bundle)?;

        let mut record = self.record(
            ArtifactKind::IntermediateCa,
            common_name,
            &dir,
            &bundle,
            GenerationSource::SignedBy {
                issuer: root.0.common_name(),
            },
            encoding::spki_sha256_hex(&intermediate.ca.certificate)?,
        );
        record.not_after = Some(intermediate.ca.certificate.not_after().to_string());
        record.replaced_backup = replaced_backup;
        manifest.remove_kind(ArtifactKind::IntermediateCa);
        self.record_committed(&mut manifest, record.clone(), &dir)?;
        info!(path = %dir.display(), fingerprint = %record.fingerprint, "Intermediate CA stored");
        Ok(record)
    }

    /// Root and intermediate with the configured names and validity
    pub fn init_ca(&self) -> Result<(ArtifactRecord, ArtifactRecord)> {
        let ca = &self.config.ca;
        let defaults = &self.config.defaults;
        let root = self.create_root_ca(&ca.root_common_name, defaults.root_ca_validity_days)?;
        let intermediate = self.create_intermediate_ca(
            &ca.intermediate_common_name,
            defaults.intermediate_ca_validity_days,
        )?;
        Ok((root, intermediate))
    }

    fn load_intermediate(&self) -> Result<IntermediateCa> {
        let manifest = Manifest::load(&self.store, CA_SCOPE)?;
        let record = manifest.first(ArtifactKind::IntermediateCa).ok_or_else(|| {
            TrustError::missing("CA-signed certificate issuance", "an intermediate CA")
        })?;
        let dir = live_directory(&self.store, record)?;
        let key = SecureKey::from_pem_file(
            "intermediate CA",
            &record_file(&dir, record, INTERMEDIATE_KEY_FILE)?,
        )?;
        let certificate = read_certificate(
            &record_file(&dir, record, INTERMEDIATE_CERT_FILE)?,
            "intermediate CA",
        )?;
        if let Some(root) = manifest.first(ArtifactKind::RootCa) {
            let root_dir = live_directory(&self.store, root)?;
            let root_cert = read_certificate(&root_dir.join(ROOT_CERT_FILE), "root CA")?;
            if authority_key_id(&certificate) != subject_key_id(&root_cert) {
                return Err(TrustError::signing(
                    "intermediate CA",
                    format!("not issued by the current root CA {}", root.name),
                ));
            }
        }
        let chain_pem = self.store.read(&record_file(&dir, record, CHAIN_FILE)?)?;
        let chain = X509::stack_from_pem(&chain_pem)
            .map_err(|e| TrustError::signing("intermediate CA chain", e))?;
        Ok(IntermediateCa {
            ca: CaCertificate { key, certificate },
            chain,
        })
    }

    // ================= Domain artifacts =================

    /// Issue the server certificate for `domain`
    pub fn issue_certificate(
        &self,
        domain: &str,
        validity_days: u32,
        requested: IssuanceMode,
    ) -> Result<IssuedCertificate> {
        let domain = normalize_domain(domain)?;
        let _lock = Lockfile::acquire(&self.store, &domain, "issue")?;
        self.issue_locked(&domain, validity_days, requested, None)
    }

    fn issue_locked(
        &self,
        domain: &str,
        validity_days: u32,
        requested: IssuanceMode,
        replaced_backup: Option<&Path>,
    ) -> Result<IssuedCertificate> {
        let ca = Manifest::load(&self.store, CA_SCOPE)?;
        let decision = IssuanceDecision::resolve(
            requested,
            ca.first(ArtifactKind::IntermediateCa).is_some(),
            self.config.issuance.self_signed_fallback,
        )?;
        if let IssuanceDecision::Downgraded(reason) = decision {
            warn!(domain, %reason, "CA-signed issuance downgraded to self-signed");
        }

        let dir = self.store.cert_dir(domain);
        self.store.prepare(&dir)?;
        let mut manifest = Manifest::load(&self.store, domain)?;
        let intermediate = match decision.effective_mode() {
            IssuanceMode::CaSigned => Some(self.load_intermediate()?),
            IssuanceMode::SelfSigned => None,
        };
        let mut builder = Ed25519ServerCertBuilder::new(domain.to_string()).validity_days(validity_days);
        if let Some(intermediate) = &intermediate {
            builder = builder.issuer(intermediate);
        }
        let cert = builder.build()?;
        let bundle = cert.bundle()?;
        self.store.commit(&dir, &bundle)?;

        let source = match &intermediate {
            Some(intermediate) => GenerationSource::SignedBy {
                issuer: intermediate.ca.common_name(),
            },
            None => GenerationSource::SelfSigned,
        };
        let mut record = self.record(
            ArtifactKind::ServerCert,
            &cert.domain,
            &dir,
            &bundle,
            source,
            cert.spki_sha256()?,
        );
        record.not_after = Some(cert.certificate.not_after().to_string());
        record.replaced_backup = replaced_backup.map(|p| self.store.relative(p));
        self.record_committed(&mut manifest, record.clone(), &dir)?;
        info!(domain, %decision, fingerprint = %record.fingerprint, "Server certificate stored");
        Ok(IssuedCertificate { decision, record })
    }

    /// Generate the domain's X25519 key-exchange key
    pub fn generate_kex(&self, domain: &str) -> Result<ArtifactRecord> {
        let domain = normalize_domain(domain)?;
        let _lock = Lockfile::acquire(&self.store, &domain, "kex")?;
        self.generate_kex_locked(&domain, None)
    }

    fn generate_kex_locked(&self, domain: &str, replaced_backup: Option<&Path>) -> Result<ArtifactRecord> {
        let dir = self.store.kex_dir(domain);
        self.store.prepare(&dir)?;
        let mut manifest = Manifest::load(&self.store, domain)?;
        let pair = KexKeyPair::generate(domain)?;
        let bundle = pair.bundle()?;
        self.store.commit(&dir, &bundle)?;

        let mut record = self.record(
            ArtifactKind::KeyExchange,
            &pair.domain,
            &dir,
            &bundle,
            GenerationSource::Generated,
            pair.fingerprint(),
        );
        record.replaced_backup = replaced_backup.map(|p| self.store.relative(p));
        self.record_committed(&mut manifest, record.clone(), &dir)?;
        Ok(record)
    }

    /// Generate an OpenPGP key for an email identity under its domain
    pub fn generate_pgp_key(&self, identity: &str, expiry: &str) -> Result<ArtifactRecord> {
        let identity = identity.trim();
        let (_, domain) = split_identity(identity)?;
        let domain = normalize_domain(domain)?;
        let _lock = Lockfile::acquire(&self.store, &domain, "pgp")?;
        let dir = self.store.pgp_dir(&domain, identity);
        self.store.prepare(&dir)?;
        let mut manifest = Manifest::load(&self.store, &domain)?;

        let key = openpgp::generate_pgp_key(self.pgp.as_ref(), identity, expiry)?;
        let bundle = key.bundle();
        self.store.commit(&dir, &bundle)?;
        let record = self.record(
            ArtifactKind::Openpgp,
            &key.identity,
            &dir,
            &bundle,
            GenerationSource::OpenpgpEngine,
            key.fingerprint.clone(),
        );
        self.record_committed(&mut manifest, record.clone(), &dir)?;
        Ok(record)
    }

    // ================= Publication =================

    fn exporter(&self) -> ZoneExporter<'_> {
        ZoneExporter::new(&self.store, &self.config.dns)
    }

    /// Zone text for `domain`; absent artifacts are skipped
    pub fn export_zone(&self, domain: &str) -> Result<String> {
        self.exporter().export(domain)
    }

    pub fn write_zone(&self, domain: &str) -> Result<PathBuf> {
        let domain = normalize_domain(domain)?;
        let _lock = Lockfile::acquire(&self.store, &domain, "export")?;
        self.exporter().write(&domain)
    }

    pub fn export_wkd(&self, domain: &str) -> Result<PathBuf> {
        let domain = normalize_domain(domain)?;
        let _lock = Lockfile::acquire(&self.store, &domain, "export-wkd")?;
        self.exporter().export_wkd(&domain)
    }

    // ================= Rotation and status =================

    /// Rotate `scope` for `domain` with backup-before-replace
    pub fn rotate(&self, domain: &str, scope: RotationScope) -> Result<RotationReport> {
        let domain = normalize_domain(domain)?;
        let _lock = Lockfile::acquire(&self.store, &domain, "rotate")?;
        Ok(rotation::rotate(&self.store, self, &domain, scope)?)
    }

    pub fn status(&self, domain: &str) -> Result<StatusReport> {
        status::inspect(&self.store, domain)
    }
}

impl Regenerator for TrustPlane {
    fn live_directory(&self, domain: &str, target: RotationTarget) -> Result<Option<PathBuf>> {
        let manifest = Manifest::load(&self.store, domain)?;
        let kind = match target {
            RotationTarget::Cert => ArtifactKind::ServerCert,
            RotationTarget::Kex => ArtifactKind::KeyExchange,
        };
        manifest
            .get(kind, domain)
            .map(|record| live_directory(&self.store, record))
            .transpose()
    }

    fn regenerate(
        &self,
        domain: &str,
        target: RotationTarget,
        backup: Option<&Path>,
    ) -> Result<Regenerated> {
        match target {
            RotationTarget::Cert => {
                // keep the mode the certificate was issued in
                let manifest = Manifest::load(&self.store, domain)?;
                let mode = match manifest.get(ArtifactKind::ServerCert, domain).map(|r| &r.source) {
                    Some(GenerationSource::SelfSigned) => IssuanceMode::SelfSigned,
                    _ => IssuanceMode::CaSigned,
                };
                let issued = self.issue_locked(
                    domain,
                    self.config.defaults.cert_validity_days,
                    mode,
                    backup,
                )?;
                Ok(Regenerated {
                    fingerprint: issued.record.fingerprint,
                    decision: Some(issued.decision),
                })
            }
            RotationTarget::Kex => Ok(Regenerated {
                fingerprint: self.generate_kex_locked(domain, backup)?.fingerprint,
                decision: None,
            }),
        }
    }
}

fn read_certificate(path: &Path, artifact: &str) -> Result<X509> {
    let pem = std::fs::read(path).map_err(|e| {
        TrustError::signing(artifact, format!("cannot read {}: {}", path.display(), e))
    })?;
    X509::from_pem(&pem).map_err(|e| TrustError::signing(artifact, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openpgp::tests::FakeEngine;
    use crate::generate_server_cert::DowngradeReason;
    use crate::rotation::RotationStage;
    use std::fs;

    fn plane(dir: &Path) -> TrustPlane {
        let mut config = AppConfig::default();
        config.store_path = dir.join("trust");
        TrustPlane::with_engine(config, Box::new(FakeEngine::default())).unwrap()
    }

    fn zone_lines(zone: &str) -> Vec<&str> {
        zone.lines().filter(|l| l.contains(" IN ")).collect()
    }

    #[test]
    fn test_init_ca_records_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let (root, intermediate) = plane.init_ca().unwrap();
        assert_eq!(root.source, GenerationSource::SelfSigned);
        assert_eq!(
            intermediate.source,
            GenerationSource::SignedBy {
                issuer: "Explicit Trust Root CA".to_string()
            }
        );
        assert!(plane.store().root_ca_dir().join(ROOT_KEY_FILE).exists());
        assert!(plane.store().intermediate_ca_dir().join(CHAIN_FILE).exists());
        assert!(plane.status("example.com").unwrap().is_consistent());
    }

    #[test]
    fn test_intermediate_without_root_is_signing_error() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        assert!(matches!(
            plane.create_intermediate_ca("Intermediate", 30),
            Err(TrustError::Signing { .. })
        ));
    }

    #[test]
    fn test_ca_signed_issue_without_intermediate_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let issued = plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        assert!(issued.decision.is_downgraded());
        assert_eq!(issued.record.source, GenerationSource::SelfSigned);
        assert!(!issued.record.files.iter().any(|f| f == "fullchain.pem"));
    }

    #[test]
    fn test_disabled_fallback_is_missing_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store_path = dir.path().join("trust");
        config.issuance.self_signed_fallback = false;
        let plane = TrustPlane::with_engine(config, Box::new(FakeEngine::default())).unwrap();
        assert!(matches!(
            plane.issue_certificate("example.com", 30, IssuanceMode::CaSigned),
            Err(TrustError::MissingDependency { .. })
        ));
        assert!(!plane.store().cert_dir("example.com").exists());
    }

    #[test]
    fn test_ca_signed_issue_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.init_ca().unwrap();
        let issued = plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        assert_eq!(issued.decision, IssuanceDecision::Issued(IssuanceMode::CaSigned));
        assert!(issued.record.files.iter().any(|f| f == "fullchain.pem"));

        let report = plane.status("example.com").unwrap();
        assert!(report.is_consistent(), "{:?}", report.findings);
        assert_eq!(report.entries.len(), 3);
    }

    #[test]
    fn test_status_flags_tampered_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane
            .issue_certificate("example.com", 30, IssuanceMode::SelfSigned)
            .unwrap();
        // swap in a different certificate behind the manifest's back
        let other = Ed25519ServerCertBuilder::new("example.com".to_string())
            .build()
            .unwrap();
        let der_path = plane.store().cert_dir("example.com").join("example.com.der");
        fs::write(&der_path, other.certificate.to_der().unwrap()).unwrap();

        let report = plane.status("example.com").unwrap();
        assert!(!report.is_consistent());
        assert!(report.findings[0].contains("manifest fingerprint"));
    }

    #[test]
    fn test_zone_with_only_server_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane
            .issue_certificate("example.com", 30, IssuanceMode::SelfSigned)
            .unwrap();
        let zone = plane.export_zone("example.com").unwrap();
        let lines = zone_lines(&zone);

        assert_eq!(lines.iter().filter(|l| l.contains(" IN CERT PKIX ")).count(), 1);
        assert_eq!(lines.iter().filter(|l| l.contains(" IN TLSA 3 1 1 ")).count(), 1);
        assert_eq!(lines.iter().filter(|l| l.contains(" IN CAA ")).count(), 3);
        assert!(!zone.contains("CERT PGP"));
        assert!(!zone.contains("IPSECKEY"));
        assert!(!zone.contains("OPENPGPKEY"));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_full_zone_order_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.init_ca().unwrap();
        plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        plane.generate_kex("example.com").unwrap();
        plane.generate_pgp_key("bob@example.com", "2y").unwrap();
        plane.generate_pgp_key("alice@example.com", "1y").unwrap();

        let exporter = plane.exporter();
        let first = exporter
            .export_at("example.com", Utc::now())
            .unwrap();
        let second = exporter.export("example.com").unwrap();
        let strip = |zone: &str| -> Vec<String> {
            zone.lines()
                .filter(|l| !l.starts_with("; generated"))
                .map(str::to_string)
                .collect()
        };
        assert_eq!(strip(&first), strip(&second));

        let types: Vec<&str> = zone_lines(&first)
            .iter()
            .map(|l| l.split_whitespace().nth(2).unwrap())
            .collect();
        assert_eq!(
            types,
            vec![
                "CERT", "CERT", "CERT", "CERT", "CERT", "IPSECKEY", "TLSA", "OPENPGPKEY",
                "OPENPGPKEY", "CAA", "CAA", "CAA"
            ]
        );
        assert!(first.contains("_root-ca.example.com. IN CERT PKIX"));
        assert!(first.contains("_intermediate-ca.example.com. IN CERT PKIX"));
        assert!(first.contains("kei1q4tipxxu1yj79k9kfukdhfy631xe._openpgpkey.example.com. IN OPENPGPKEY"));
        // PGP keys sorted by identity: alice before bob
        let alice = first.find("OpenPGP key alice@example.com").unwrap();
        let bob = first.find("OpenPGP key bob@example.com").unwrap();
        assert!(alice < bob);
    }

    #[test]
    fn test_write_zone_and_wkd() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.generate_pgp_key("alice@example.com", "2y").unwrap();
        let zone_path = plane.write_zone("example.com").unwrap();
        assert!(fs::read_to_string(&zone_path).unwrap().contains("OPENPGPKEY"));

        let wkd = plane.export_wkd("example.com").unwrap();
        let base = wkd.join(".well-known/openpgpkey/example.com");
        assert_eq!(fs::read(base.join("policy")).unwrap(), b"");
        assert!(base.join("hu/kei1q4tipxxu1yj79k9kfukdhfy631xe").is_file());
    }

    #[test]
    fn test_rotate_cert_keeps_mode_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.init_ca().unwrap();
        let before = plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        let der_path = plane.store().cert_dir("example.com").join("example.com.der");
        let old_der = fs::read(&der_path).unwrap();

        let report = plane.rotate("example.com", RotationScope::Cert).unwrap();
        let step = &report.steps[0];
        assert_ne!(step.fingerprint, before.record.fingerprint);
        let backup = step.backup.as_ref().unwrap();
        assert_eq!(fs::read(backup.join("example.com.der")).unwrap(), old_der);
        assert_ne!(fs::read(&der_path).unwrap(), old_der);

        let manifest = Manifest::load(plane.store(), "example.com").unwrap();
        let record = manifest.get(ArtifactKind::ServerCert, "example.com").unwrap();
        assert!(matches!(record.source, GenerationSource::SignedBy { .. }));
        assert!(record.replaced_backup.is_some());
        assert!(plane.status("example.com").unwrap().is_consistent());
    }

    #[test]
    fn test_rotate_reports_lock_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let _held = Lockfile::acquire(plane.store(), "example.com", "issue").unwrap();
        assert!(matches!(
            plane.rotate("example.com", RotationScope::Kex),
            Err(TrustError::Filesystem { .. })
        ));
    }

    #[test]
    fn test_rotation_failure_surfaces_stage() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.generate_kex("example.com").unwrap();
        fs::write(plane.store().root().join("backup"), b"blocked").unwrap();
        match plane.rotate("example.com", RotationScope::Kex) {
            Err(TrustError::Rotation(failure)) => {
                assert_eq!(failure.stage, RotationStage::BackingUp);
                assert!(!failure.is_partial());
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.steps.len())),
        }
    }

    #[test]
    fn test_root_replacement_retires_intermediate() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.init_ca().unwrap();
        plane.create_root_ca("New Root", 365).unwrap();

        let ca = Manifest::load(plane.store(), CA_SCOPE).unwrap();
        assert!(ca.first(ArtifactKind::IntermediateCa).is_none());
        let issued = plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        assert!(issued.decision.is_downgraded());
        assert!(plane.status("example.com").unwrap().is_consistent());
        let zone = plane.export_zone("example.com").unwrap();
        assert!(zone.contains("_root-ca.example.com."));
        assert!(!zone.contains("_intermediate-ca.example.com."));

        // a fresh intermediate chains to the new root again
        plane.create_intermediate_ca("New Intermediate", 90).unwrap();
        let issued = plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        assert_eq!(issued.decision, IssuanceDecision::Issued(IssuanceMode::CaSigned));
        let report = plane.status("example.com").unwrap();
        assert!(report.is_consistent(), "{:?}", report.findings);
    }

    #[test]
    fn test_intermediate_from_previous_root_cannot_sign() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.init_ca().unwrap();
        let stale = Manifest::load(plane.store(), CA_SCOPE)
            .unwrap()
            .first(ArtifactKind::IntermediateCa)
            .cloned()
            .unwrap();
        plane.create_root_ca("New Root", 365).unwrap();

        // put the old intermediate back behind the new root
        let mut ca = Manifest::load(plane.store(), CA_SCOPE).unwrap();
        ca.upsert(stale);
        ca.save(plane.store()).unwrap();

        assert!(matches!(
            plane.issue_certificate("example.com", 30, IssuanceMode::CaSigned),
            Err(TrustError::Signing { .. })
        ));
        assert!(!plane.store().cert_dir("example.com").exists());
    }

    #[test]
    fn test_rotation_reports_issuance_decision() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let report = plane.rotate("example.com", RotationScope::All).unwrap();

        let cert = &report.steps[0];
        assert!(cert.is_first_generation());
        assert_eq!(
            cert.decision,
            Some(IssuanceDecision::Downgraded(DowngradeReason::IntermediateCaMissing))
        );
        assert_eq!(report.steps[1].decision, None);

        plane.init_ca().unwrap();
        plane
            .issue_certificate("example.com", 30, IssuanceMode::CaSigned)
            .unwrap();
        let report = plane.rotate("example.com", RotationScope::Cert).unwrap();
        assert_eq!(
            report.steps[0].decision,
            Some(IssuanceDecision::Issued(IssuanceMode::CaSigned))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_protected_artifact_blocks_issue_before_keygen() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let cert_dir = plane.store().cert_dir("example.com");
        fs::create_dir_all(&cert_dir).unwrap();
        let protected = cert_dir.join("example.com.key");
        fs::write(&protected, b"foreign key").unwrap();
        if fs::metadata(&protected).unwrap().uid() == 0 {
            // root ignores permission bits
            return;
        }
        fs::set_permissions(&protected, fs::Permissions::from_mode(0o400)).unwrap();

        assert!(matches!(
            plane.issue_certificate("example.com", 30, IssuanceMode::SelfSigned),
            Err(TrustError::Filesystem { .. })
        ));
        assert_eq!(fs::read(&protected).unwrap(), b"foreign key");
        assert_eq!(fs::read_dir(&cert_dir).unwrap().count(), 1);
        let manifest = Manifest::load(plane.store(), "example.com").unwrap();
        assert!(manifest.get(ArtifactKind::ServerCert, "example.com").is_none());
    }

    #[test]
    fn test_manifest_failure_names_committed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        // occupy the manifest's temporary file name so the save fails
        let manifests = plane.store().manifest_dir();
        fs::create_dir_all(
            manifests
                .join(format!(".example.com.json.tmp-{}", std::process::id()))
                .join("blocker"),
        )
        .unwrap();

        match plane.generate_kex("example.com") {
            Err(TrustError::Filesystem { path, reason }) => {
                assert_eq!(path, plane.store().kex_dir("example.com"));
                assert!(reason.contains("manifest"), "{}", reason);
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.fingerprint)),
        }
        assert!(plane.store().kex_dir("example.com").join("x25519.key").exists());
    }

    #[test]
    fn test_ca_scope_cannot_be_issued_for() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        plane.init_ca().unwrap();
        assert!(matches!(
            plane.issue_certificate("_ca", 30, IssuanceMode::CaSigned),
            Err(TrustError::Csr { .. })
        ));
        assert!(matches!(plane.generate_kex("_CA."), Err(TrustError::Csr { .. })));
        let ca = Manifest::load(plane.store(), CA_SCOPE).unwrap();
        assert!(ca.first(ArtifactKind::ServerCert).is_none());
        assert!(ca.first(ArtifactKind::KeyExchange).is_none());
    }
}
