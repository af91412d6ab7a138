//! Intermediate CA Certificate Generation Module
//!
//! Generates the issuing CA that sits between the root and the leaf
//! certificates, so the root key can stay offline.
//!
//! # PKI Hierarchy Position
//! ```text
//! Root CA (self-signed)
//!   └── Intermediate CA (signed by Root) ← This module
//!       └── Server Certificate (signed by Intermediate)
//! ```
//!
//! # Certificate Properties
//! - **Signed by**: Root CA, from an Ed448-signed certificate request
//! - **Key Usage**: keyCertSign, cRLSign (critical)
//! - **Basic Constraints**: CA=true, pathlen=0 (can only sign end-entity certs)
//! - **Authority Key Identifier**: the root's subject key identifier
//! - **Default Validity**: 1825 days (5 years)
//!
//! The module also produces `chain.pem`, the intermediate followed by the root.

use crate::artifact_store::ArtifactBundle;
use crate::encoding;
use crate::error::{Result, TrustError};
use crate::generate_root_ca::CaCertificate;
use crate::pki_generator::{self, CertificateProfile, Issuer};
use crate::secure_key::SecureKey;
use openssl::pkey::Id;
use openssl::x509::X509;
use tracing::info;

pub const INTERMEDIATE_KEY_FILE: &str = "intermediate.key";
pub const INTERMEDIATE_CERT_FILE: &str = "intermediate.crt";
pub const INTERMEDIATE_DER_FILE: &str = "intermediate.der";
pub const INTERMEDIATE_B64_FILE: &str = "intermediate.b64";
pub const CHAIN_FILE: &str = "chain.pem";

/// Intermediate CA plus the chain it anchors to
pub struct IntermediateCa {
    pub ca: CaCertificate,
    /// `[intermediate, root]`
    pub chain: Vec<X509>,
}

impl IntermediateCa {
    /// Concatenated PEM of the chain, intermediate first
    pub fn chain_pem(&self) -> Result<Vec<u8>> {
        let mut pem = Vec::new();
        for cert in &self.chain {
            pem.extend(
                cert.to_pem()
                    .map_err(|e| TrustError::encoding("CA chain", e))?,
            );
        }
        Ok(pem)
    }

    pub fn bundle(&self) -> Result<ArtifactBundle> {
        let der = encoding::certificate_der(&self.ca.certificate)?;
        let pem = self
            .ca
            .certificate
            .to_pem()
            .map_err(|e| TrustError::encoding("intermediate CA certificate", e))?;
        Ok(ArtifactBundle::new()
            .secret(INTERMEDIATE_KEY_FILE, self.ca.key.to_pem()?)
            .public(INTERMEDIATE_CERT_FILE, pem)
            .public(INTERMEDIATE_B64_FILE, format!("{}\n", encoding::base64(&der)))
            .public(INTERMEDIATE_DER_FILE, der)
            .public(CHAIN_FILE, self.chain_pem()?))
    }
}

// ================= Ed448 Intermediate CA Builder =================

/// Builder for an Ed448 intermediate CA signed by the root
///
/// The intermediate key signs its own request; the root verifies it and
/// issues a certificate with `pathlen=0` and an authority key identifier
/// pointing at the root.
pub struct Ed448IntermediateCABuilder<'a> {
    subject_common_name: String,
    organization: Option<String>,
    country: Option<String>,
    validity_days: u32,
    root_key: &'a SecureKey,
    root_cert: &'a X509,
}

impl<'a> Ed448IntermediateCABuilder<'a> {
    /// Create a new intermediate CA builder
    ///
    /// # Arguments
    /// * `root_key` - Root CA private key that signs the intermediate
    /// * `root_cert` - Root CA certificate (issuer information)
    pub fn new(root_key: &'a SecureKey, root_cert: &'a X509) -> Self {
        Self {
            subject_common_name: String::new(),
            organization: None,
            country: None,
            validity_days: 1825, // Default 5 years
            root_key,
            root_cert,
        }
    }

    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = Some(org);
        self
    }

    pub fn country(mut self, country: String) -> Self {
        self.country = Some(country);
        self
    }

    /// Set validity period in days
    ///
    /// Should be shorter than the root CA validity and longer than leaf
    /// certificate validity.
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Generate the intermediate key, request and root-signed certificate
    ///
    /// # Errors
    /// - `Signing` if the root key is not Ed448, does not match the root
    ///   certificate, or the root's path length forbids a subordinate CA
    /// - `KeyGeneration`, `Csr`, `Extension` as for the root
    pub fn build(self) -> Result<IntermediateCa> {
        let name = pki_generator::subject_name(
            &self.subject_common_name,
            self.organization.as_deref(),
            self.country.as_deref(),
        )?;
        let key = SecureKey::new(
            "intermediate CA",
            pki_generator::generate_key(Id::ED448, "intermediate CA")?,
        )?;
        let request = pki_generator::build_request(&name, &key)?;
        let certificate = pki_generator::sign_request(
            &request,
            &CertificateProfile::IntermediateCa,
            self.validity_days,
            Issuer::Ca {
                certificate: self.root_cert,
                key: self.root_key,
            },
        )?;

        let chain = vec![certificate.clone(), self.root_cert.clone()];
        pki_generator::verify_chain(&chain)?;
        info!(
            subject = %self.subject_common_name,
            issuer = %pki_generator::common_name(self.root_cert.subject_name()),
            validity_days = self.validity_days,
            "Generated Ed448 intermediate CA"
        );
        Ok(IntermediateCa {
            ca: CaCertificate { key, certificate },
            chain,
        })
    }
}
