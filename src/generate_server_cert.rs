//! Server Certificate Generation Module
//!
//! Issues the Ed25519 end-entity certificate a domain publishes in DNS, either
//! self-signed or signed by the intermediate CA:
//!
//! **Certificate Chain**: Root CA → Intermediate CA → Server Certificate
//!
//! # X.509 Extensions
//! - **Basic Constraints**: `CA:false` (critical)
//! - **Key Usage**: `digitalSignature` (critical)
//! - **Extended Key Usage**: `serverAuth`, `clientAuth`
//! - **Subject Alternative Name**: `DNS:<domain>`, `DNS:*.<domain>`
//! - **Authority Key Identifier**: intermediate's key identifier (CA-signed only)
//!
//! # Issuance decision
//! Whether a certificate ends up CA-signed is an explicit [`IssuanceDecision`]:
//! an operator-requested self-signed certificate is `Issued(SelfSigned)`, while
//! a CA-signed request that finds no intermediate is `Downgraded(..)`. The two
//! never collapse into one another.
//!
//! # Example
//! ```rust,no_run
//! use trustplane::generate_server_cert::Ed25519ServerCertBuilder;
//! # fn example() -> trustplane::error::Result<()> {
//! let cert = Ed25519ServerCertBuilder::new("example.com".to_string())
//!     .validity_days(365)
//!     .build()?;
//! let bundle = cert.bundle()?;
//! # Ok(())
//! # }
//! ```

use crate::artifact_store::ArtifactBundle;
use crate::encoding;
use crate::error::{Result, TrustError};
use crate::generate_intermediate_ca::IntermediateCa;
use crate::naming::{domain_artifact_name, normalize_domain};
use crate::pki_generator::{self, CertificateProfile, Issuer};
use crate::secure_key::SecureKey;
use openssl::pkey::Id;
use openssl::x509::X509;
use std::fmt;
use tracing::info;

pub const FULLCHAIN_FILE: &str = "fullchain.pem";

/// `<domain>.<ext>` inside the certificate directory
pub fn cert_file_name(domain: &str, extension: &str) -> String {
    format!("{}.{}", domain_artifact_name(domain), extension)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceMode {
    SelfSigned,
    CaSigned,
}

impl fmt::Display for IssuanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuanceMode::SelfSigned => f.write_str("self-signed"),
            IssuanceMode::CaSigned => f.write_str("CA-signed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeReason {
    /// CA-signed issuance was requested but no intermediate CA exists
    IntermediateCaMissing,
}

impl fmt::Display for DowngradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowngradeReason::IntermediateCaMissing => f.write_str("no intermediate CA is present"),
        }
    }
}

/// Outcome of resolving the requested mode against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceDecision {
    Issued(IssuanceMode),
    /// Issued self-signed in place of a CA-signed request
    Downgraded(DowngradeReason),
}

impl IssuanceDecision {
    /// Resolve a requested mode.
    ///
    /// A CA-signed request without an intermediate is downgraded only when
    /// `allow_fallback` is set; otherwise it is a `MissingDependency` error.
    pub fn resolve(
        requested: IssuanceMode,
        intermediate_present: bool,
        allow_fallback: bool,
    ) -> Result<Self> {
        match (requested, intermediate_present) {
            (IssuanceMode::SelfSigned, _) => Ok(Self::Issued(IssuanceMode::SelfSigned)),
            (IssuanceMode::CaSigned, true) => Ok(Self::Issued(IssuanceMode::CaSigned)),
            (IssuanceMode::CaSigned, false) if allow_fallback => {
                Ok(Self::Downgraded(DowngradeReason::IntermediateCaMissing))
            }
            (IssuanceMode::CaSigned, false) => Err(TrustError::missing(
                "CA-signed certificate issuance",
                "an intermediate CA (self-signed fallback is disabled)",
            )),
        }
    }

    /// The mode the certificate is actually issued in
    pub fn effective_mode(&self) -> IssuanceMode {
        match self {
            IssuanceDecision::Issued(mode) => *mode,
            IssuanceDecision::Downgraded(_) => IssuanceMode::SelfSigned,
        }
    }

    pub fn is_downgraded(&self) -> bool {
        matches!(self, IssuanceDecision::Downgraded(_))
    }
}

impl fmt::Display for IssuanceDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuanceDecision::Issued(mode) => write!(f, "issued {}", mode),
            IssuanceDecision::Downgraded(reason) => {
                write!(f, "downgraded to self-signed: {}", reason)
            }
        }
    }
}

/// An issued server certificate and its key
#[derive(Debug)]
pub struct ServerCert {
    pub domain: String,
    pub key: SecureKey,
    pub certificate: X509,
    /// `[leaf, intermediate, root]` when CA-signed
    pub fullchain: Option<Vec<X509>>,
}

impl ServerCert {
    pub fn mode(&self) -> IssuanceMode {
        if self.fullchain.is_some() {
            IssuanceMode::CaSigned
        } else {
            IssuanceMode::SelfSigned
        }
    }

    pub fn spki_sha256(&self) -> Result<String> {
        encoding::spki_sha256_hex(&self.certificate)
    }

    pub fn bundle(&self) -> Result<ArtifactBundle> {
        let der = encoding::certificate_der(&self.certificate)?;
        let pem = self
            .certificate
            .to_pem()
            .map_err(|e| TrustError::encoding(format!("certificate for {}", self.domain), e))?;
        let mut bundle = ArtifactBundle::new()
            .secret(cert_file_name(&self.domain, "key"), self.key.to_pem()?)
            .public(cert_file_name(&self.domain, "crt"), pem)
            .public(
                cert_file_name(&self.domain, "b64"),
                format!("{}\n", encoding::base64(&der)),
            )
            .public(
                cert_file_name(&self.domain, "spki.sha256"),
                format!("{}\n", self.spki_sha256()?),
            )
            .public(cert_file_name(&self.domain, "der"), der);

        if let Some(chain) = &self.fullchain {
            let mut pem = Vec::new();
            for cert in chain {
                pem.extend(
                    cert.to_pem()
                        .map_err(|e| TrustError::encoding("full chain", e))?,
                );
            }
            bundle = bundle.public(FULLCHAIN_FILE, pem);
        }
        Ok(bundle)
    }
}

// ================= Ed25519 Server Certificate Builder =================

/// Builder for an Ed25519 key pair and server certificate
///
/// Without an issuer the certificate is self-signed. With
/// [`issuer`](Self::issuer) it is signed by the intermediate CA and the full
/// chain is assembled leaf first.
pub struct Ed25519ServerCertBuilder<'a> {
    domain: String,
    validity_days: u32,
    issuer: Option<&'a IntermediateCa>,
}

impl<'a> Ed25519ServerCertBuilder<'a> {
    pub fn new(domain: String) -> Self {
        Self {
            domain,
            validity_days: 365,
            issuer: None,
        }
    }

    /// Set validity period in days
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Sign with the intermediate CA instead of self-signing
    pub fn issuer(mut self, intermediate: &'a IntermediateCa) -> Self {
        self.issuer = Some(intermediate);
        self
    }

    /// Generate the key, request and certificate
    ///
    /// # Errors
    /// - `Csr` if the domain is malformed
    /// - `Extension` if the domain already carries a wildcard
    /// - `Signing` if the intermediate key is unusable or does not match
    pub fn build(self) -> Result<ServerCert> {
        let domain = normalize_domain(&self.domain)?;
        let name = pki_generator::subject_name(&domain, None, None)?;
        let label = format!("certificate for {}", domain);
        let key = SecureKey::new(
            label.as_str(),
            pki_generator::generate_key(Id::ED25519, &label)?,
        )?;
        let request = pki_generator::build_request(&name, &key)?;
        let profile = CertificateProfile::Leaf {
            domain: domain.clone(),
        };

        let (certificate, fullchain) = match self.issuer {
            None => {
                let cert = pki_generator::sign_request(
                    &request,
                    &profile,
                    self.validity_days,
                    Issuer::SelfSigned(&key),
                )?;
                (cert, None)
            }
            Some(intermediate) => {
                let cert = pki_generator::sign_request(
                    &request,
                    &profile,
                    self.validity_days,
                    Issuer::Ca {
                        certificate: &intermediate.ca.certificate,
                        key: &intermediate.ca.key,
                    },
                )?;
                let mut chain = Vec::with_capacity(intermediate.chain.len() + 1);
                chain.push(cert.clone());
                chain.extend(intermediate.chain.iter().cloned());
                pki_generator::verify_chain(&chain)?;
                (cert, Some(chain))
            }
        };

        let cert = ServerCert {
            domain,
            key,
            certificate,
            fullchain,
        };
        info!(
            domain = %cert.domain,
            mode = %cert.mode(),
            validity_days = self.validity_days,
            "Issued Ed25519 server certificate"
        );
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_intermediate_ca::Ed448IntermediateCABuilder;
    use crate::generate_root_ca::Ed448RootCABuilder;
    use crate::pki_generator::{authority_key_id, subject_key_id};

    fn intermediate() -> IntermediateCa {
        let root = Ed448RootCABuilder::new()
            .subject_common_name("Test Root CA".to_string())
            .validity_days(60)
            .build()
            .unwrap();
        Ed448IntermediateCABuilder::new(&root.0.key, &root.0.certificate)
            .subject_common_name("Test Intermediate CA".to_string())
            .validity_days(30)
            .build()
            .unwrap()
    }

    #[test]
    fn test_decision_keeps_intent_and_environment_apart() {
        assert_eq!(
            IssuanceDecision::resolve(IssuanceMode::SelfSigned, true, false).unwrap(),
            IssuanceDecision::Issued(IssuanceMode::SelfSigned)
        );
        assert_eq!(
            IssuanceDecision::resolve(IssuanceMode::CaSigned, true, true).unwrap(),
            IssuanceDecision::Issued(IssuanceMode::CaSigned)
        );
        let downgraded = IssuanceDecision::resolve(IssuanceMode::CaSigned, false, true).unwrap();
        assert!(downgraded.is_downgraded());
        assert_eq!(downgraded.effective_mode(), IssuanceMode::SelfSigned);
        assert!(matches!(
            IssuanceDecision::resolve(IssuanceMode::CaSigned, false, false),
            Err(TrustError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_self_signed_certificate() {
        let cert = Ed25519ServerCertBuilder::new("Example.COM.".to_string())
            .validity_days(30)
            .build()
            .unwrap();
        assert_eq!(cert.domain, "example.com");
        assert_eq!(cert.mode(), IssuanceMode::SelfSigned);
        assert_eq!(cert.key.algorithm(), Id::ED25519);
        assert!(cert.certificate.verify(&cert.certificate.public_key().unwrap()).unwrap());

        let bundle = cert.bundle().unwrap();
        assert!(bundle.get(FULLCHAIN_FILE).is_none());
        assert_eq!(
            bundle.file_names(),
            vec![
                "example.com.key",
                "example.com.crt",
                "example.com.b64",
                "example.com.spki.sha256",
                "example.com.der"
            ]
        );
    }

    #[test]
    fn test_ca_signed_certificate_and_fullchain() {
        let intermediate = intermediate();
        let cert = Ed25519ServerCertBuilder::new("example.com".to_string())
            .validity_days(10)
            .issuer(&intermediate)
            .build()
            .unwrap();

        assert_eq!(cert.mode(), IssuanceMode::CaSigned);
        assert_eq!(
            authority_key_id(&cert.certificate),
            subject_key_id(&intermediate.ca.certificate)
        );
        assert_eq!(cert.certificate.pathlen(), None);

        let bundle = cert.bundle().unwrap();
        let chain = X509::stack_from_pem(bundle.get(FULLCHAIN_FILE).unwrap()).unwrap();
        let names: Vec<String> = chain
            .iter()
            .map(|c| pki_generator::common_name(c.subject_name()))
            .collect();
        assert_eq!(names, vec!["example.com", "Test Intermediate CA", "Test Root CA"]);
    }

    #[test]
    fn test_spki_hash_is_stable() {
        let cert = Ed25519ServerCertBuilder::new("example.com".to_string())
            .build()
            .unwrap();
        let first = cert.spki_sha256().unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, cert.spki_sha256().unwrap());
        let bundle = cert.bundle().unwrap();
        assert_eq!(
            std::str::from_utf8(bundle.get("example.com.spki.sha256").unwrap())
                .unwrap()
                .trim(),
            first
        );
    }

    #[test]
    fn test_wildcard_and_malformed_domains() {
        assert!(matches!(
            Ed25519ServerCertBuilder::new("*.example.com".to_string()).build(),
            Err(TrustError::Extension { .. })
        ));
        assert!(matches!(
            Ed25519ServerCertBuilder::new("exa mple.com".to_string()).build(),
            Err(TrustError::Csr { .. })
        ));
    }
}
