//! Store inspection
//!
//! Lists what the manifests record for a domain and cross-checks the
//! artifacts against each other. Inconsistencies become findings in the
//! report; only an unreadable manifest is an error.

use crate::artifact_store::ArtifactStore;
use crate::encoding;
use crate::error::{Result, TrustError};
use crate::generate_intermediate_ca::INTERMEDIATE_DER_FILE;
use crate::generate_root_ca::ROOT_DER_FILE;
use crate::generate_server_cert::{cert_file_name, FULLCHAIN_FILE};
use crate::key_exchange::KEX_PUBLIC_DER_FILE;
use crate::manifest::{
    live_directory, record_file, ArtifactKind, ArtifactRecord, GenerationSource, Manifest, CA_SCOPE,
};
use crate::naming::normalize_domain;
use crate::openpgp::PGP_FINGERPRINT_FILE;
use crate::pki_generator::{authority_key_id, common_name, subject_key_id};
use openssl::asn1::Asn1Time;
use openssl::x509::X509;
use std::fmt;

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub domain: String,
    /// CA records first, then the domain's own
    pub entries: Vec<ArtifactRecord>,
    pub findings: Vec<String>,
}

impl StatusReport {
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trust material for {}", self.domain)?;
        if self.entries.is_empty() {
            writeln!(f, "  (no artifacts)")?;
        }
        for entry in &self.entries {
            write!(
                f,
                "  {:<18} {:<32} {}",
                entry.kind.to_string(),
                entry.name,
                source_label(&entry.source)
            )?;
            if let Some(not_after) = &entry.not_after {
                write!(f, ", valid until {}", not_after)?;
            }
            writeln!(f)?;
            writeln!(f, "  {:<18} fingerprint {}", "", entry.fingerprint)?;
        }
        if self.findings.is_empty() {
            writeln!(f, "All checks passed")
        } else {
            writeln!(f, "Findings:")?;
            for finding in &self.findings {
                writeln!(f, "  - {}", finding)?;
            }
            Ok(())
        }
    }
}

fn source_label(source: &GenerationSource) -> String {
    match source {
        GenerationSource::SelfSigned => "self-signed".to_string(),
        GenerationSource::SignedBy { issuer } => format!("signed by {}", issuer),
        GenerationSource::Generated => "generated".to_string(),
        GenerationSource::OpenpgpEngine => "OpenPGP engine".to_string(),
    }
}

struct Inspector<'a> {
    store: &'a ArtifactStore,
    findings: Vec<String>,
}

impl Inspector<'_> {
    fn check(&mut self, outcome: Result<()>) {
        if let Err(e) = outcome {
            self.findings.push(e.to_string());
        }
    }

    fn certificate(&self, record: &ArtifactRecord, file: &str) -> Result<X509> {
        let dir = live_directory(self.store, record)?;
        let der = self.store.read(&record_file(&dir, record, file)?)?;
        X509::from_der(&der).map_err(|e| TrustError::encoding(format!("{} {}", record.kind, record.name), e))
    }

    /// Live public key matches the manifest, and the certificate is in date
    fn check_certificate(&self, record: &ArtifactRecord, cert: &X509) -> Result<()> {
        let live = encoding::spki_sha256_hex(cert)?;
        if live != record.fingerprint {
            return Err(mismatch(record, "public key differs from the manifest fingerprint"));
        }
        let now = Asn1Time::days_from_now(0).map_err(|e| TrustError::encoding("current time", e))?;
        let remaining = now
            .diff(cert.not_after())
            .map_err(|e| TrustError::encoding("certificate validity", e))?;
        if remaining.days < 0 || (remaining.days == 0 && remaining.secs < 0) {
            return Err(mismatch(record, "certificate has expired"));
        }
        Ok(())
    }
}

fn mismatch(record: &ArtifactRecord, reason: &str) -> TrustError {
    TrustError::signing(format!("{} {}", record.kind, record.name), reason)
}

fn issued_by(child: &X509, parent: &X509, record: &ArtifactRecord) -> Result<()> {
    if authority_key_id(child) != subject_key_id(parent) {
        return Err(mismatch(
            record,
            &format!(
                "authorityKeyIdentifier does not match {}",
                common_name(parent.subject_name())
            ),
        ));
    }
    let parent_key = parent
        .public_key()
        .map_err(|e| TrustError::encoding("issuer public key", e))?;
    let verified = child
        .verify(&parent_key)
        .map_err(|e| TrustError::signing(format!("{} {}", record.kind, record.name), e))?;
    if !verified {
        return Err(mismatch(record, "signature does not verify under the issuer key"));
    }
    Ok(())
}

/// Build the status report for `domain`
pub fn inspect(store: &ArtifactStore, domain: &str) -> Result<StatusReport> {
    let domain = normalize_domain(domain)?;
    let ca = Manifest::load(store, CA_SCOPE)?;
    let manifest = Manifest::load(store, &domain)?;
    let mut inspector = Inspector {
        store,
        findings: Vec::new(),
    };

    let root = ca.first(ArtifactKind::RootCa).and_then(|record| {
        let cert = inspector.certificate(record, ROOT_DER_FILE);
        match cert {
            Ok(cert) => {
                let outcome = inspector.check_certificate(record, &cert);
                inspector.check(outcome);
                Some(cert)
            }
            Err(e) => {
                inspector.check(Err(e));
                None
            }
        }
    });

    let intermediate = ca.first(ArtifactKind::IntermediateCa).and_then(|record| {
        match inspector.certificate(record, INTERMEDIATE_DER_FILE) {
            Ok(cert) => {
                let outcome = inspector.check_certificate(record, &cert);
                inspector.check(outcome);
                match &root {
                    Some(root) => {
                        inspector.check(issued_by(&cert, root, record));
                        let ok = matches!(
                            (cert.pathlen(), root.pathlen()),
                            (Some(child), Some(parent)) if child < parent
                        );
                        if !ok {
                            inspector.check(Err(mismatch(
                                record,
                                "path length is not below the root's",
                            )));
                        }
                    }
                    None => inspector.check(Err(mismatch(record, "no root CA recorded"))),
                }
                Some(cert)
            }
            Err(e) => {
                inspector.check(Err(e));
                None
            }
        }
    });

    if let Some(record) = manifest.get(ArtifactKind::ServerCert, &domain) {
        match inspector.certificate(record, &cert_file_name(&domain, "der")) {
            Ok(cert) => {
                let outcome = inspector.check_certificate(record, &cert);
                inspector.check(outcome);
                let has_fullchain = record.files.iter().any(|f| f == FULLCHAIN_FILE);
                match (&record.source, &intermediate) {
                    (GenerationSource::SignedBy { .. }, Some(ica)) => {
                        inspector.check(issued_by(&cert, ica, record));
                        if !has_fullchain {
                            inspector.check(Err(mismatch(record, "CA-signed but fullchain.pem is missing")));
                        }
                    }
                    (GenerationSource::SignedBy { .. }, None) => {
                        inspector.check(Err(mismatch(record, "CA-signed but no intermediate CA recorded")))
                    }
                    _ => {
                        if has_fullchain {
                            inspector.check(Err(mismatch(record, "self-signed but carries fullchain.pem")));
                        }
                    }
                }
            }
            Err(e) => inspector.check(Err(e)),
        }
    }

    if let Some(record) = manifest.get(ArtifactKind::KeyExchange, &domain) {
        let outcome = live_directory(store, record)
            .and_then(|dir| record_file(&dir, record, KEX_PUBLIC_DER_FILE))
            .and_then(|path| store.read(&path))
            .and_then(|der| {
                encoding::x25519_raw_public_key(&der)?;
                if encoding::sha256_hex(&der) == record.fingerprint {
                    Ok(())
                } else {
                    Err(mismatch(record, "public key differs from the manifest fingerprint"))
                }
            });
        inspector.check(outcome);
    }

    for record in manifest.all(ArtifactKind::Openpgp) {
        let outcome = live_directory(store, record)
            .and_then(|dir| record_file(&dir, record, PGP_FINGERPRINT_FILE))
            .and_then(|path| store.read_to_string(&path))
            .and_then(|fingerprint| {
                if fingerprint.trim() == record.fingerprint {
                    Ok(())
                } else {
                    Err(mismatch(record, "fingerprint file differs from the manifest"))
                }
            });
        inspector.check(outcome);
    }

    let mut entries: Vec<ArtifactRecord> = ca.artifacts.values().cloned().collect();
    entries.extend(manifest.artifacts.values().cloned());
    Ok(StatusReport {
        domain,
        entries,
        findings: inspector.findings,
    })
}
