//! Root CA Certificate Generation Module
//!
//! Generates the self-signed trust anchor at the top of the hierarchy.
//!
//! # PKI Hierarchy Position
//! ```text
//! Root CA (self-signed, Ed448, pathlen=1) ← This module
//!   └── Intermediate CA (signed by Root, Ed448, pathlen=0)
//!       └── Server Certificate (signed by Intermediate, Ed25519, CA=false)
//! ```
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Key**: Ed448
//! - **Key Usage**: keyCertSign, cRLSign (critical)
//! - **Basic Constraints**: CA=true, pathlen=1 (critical)
//! - **Subject Key Identifier**: computed from the public key
//! - **Default Validity**: 3650 days
//!
//! # Example
//! ```rust,no_run
//! use trustplane::generate_root_ca::Ed448RootCABuilder;
//! # fn example() -> trustplane::error::Result<()> {
//! let root = Ed448RootCABuilder::new()
//!     .subject_common_name("Example Root CA".to_string())
//!     .organization("Example Corporation".to_string())
//!     .validity_days(3650)
//!     .build()?;
//! let bundle = root.bundle()?;
//! # Ok(())
//! # }
//! ```

use crate::artifact_store::ArtifactBundle;
use crate::encoding;
use crate::error::Result;
use crate::pki_generator::{self, CertificateProfile, Issuer};
use crate::secure_key::SecureKey;
use openssl::pkey::Id;
use openssl::x509::X509;
use tracing::info;

pub const ROOT_KEY_FILE: &str = "root.key";
pub const ROOT_CERT_FILE: &str = "root.crt";
pub const ROOT_DER_FILE: &str = "root.der";
pub const ROOT_B64_FILE: &str = "root.b64";

/// A CA certificate together with its private key
#[derive(Debug)]
pub struct CaCertificate {
    pub key: SecureKey,
    pub certificate: X509,
}

impl CaCertificate {
    pub fn common_name(&self) -> String {
        pki_generator::common_name(self.certificate.subject_name())
    }
}

/// Root CA as stored: key, PEM certificate, DER and Base64 of DER
#[derive(Debug)]
pub struct RootCa(pub CaCertificate);

impl RootCa {
    pub fn bundle(&self) -> Result<ArtifactBundle> {
        let der = encoding::certificate_der(&self.0.certificate)?;
        let pem = self
            .0
            .certificate
            .to_pem()
            .map_err(|e| crate::error::TrustError::encoding("root CA certificate", e))?;
        Ok(ArtifactBundle::new()
            .secret(ROOT_KEY_FILE, self.0.key.to_pem()?)
            .public(ROOT_CERT_FILE, pem)
            .public(ROOT_B64_FILE, format!("{}\n", encoding::base64(&der)))
            .public(ROOT_DER_FILE, der))
    }
}

// ================= Ed448 Root CA Builder =================

/// Builder for the Ed448 key pair and self-signed root CA certificate
///
/// Root CAs have `pathlen=1`, allowing exactly one intermediate layer below
/// them. Keep the resulting private key offline once the intermediate exists.
pub struct Ed448RootCABuilder {
    subject_common_name: String,
    organization: Option<String>,
    country: Option<String>,
    validity_days: u32,
}

impl Default for Ed448RootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Ed448RootCABuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: None,
            country: None,
            validity_days: 3650,
        }
    }

    /// Set the common name (CN) for the certificate
    ///
    /// For root CAs, this should clearly identify the CA's purpose and organization.
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: String) -> Self {
        self.organization = Some(org);
        self
    }

    /// Set the country (C) for the certificate (2-letter ISO code)
    pub fn country(mut self, country: String) -> Self {
        self.country = Some(country);
        self
    }

    /// Set validity period in days
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Build the Ed448 key pair and self-signed root CA certificate
    ///
    /// # Errors
    /// - `KeyGeneration` if the backend cannot produce an Ed448 key
    /// - `Csr` if the common name is empty or a name field is malformed
    /// - `Signing` / `Extension` if certificate assembly fails
    pub fn build(self) -> Result<RootCa> {
        let name = pki_generator::subject_name(
            &self.subject_common_name,
            self.organization.as_deref(),
            self.country.as_deref(),
        )?;
        let key = SecureKey::new(
            "root CA",
            pki_generator::generate_key(Id::ED448, "root CA")?,
        )?;
        let request = pki_generator::build_request(&name, &key)?;
        let certificate = pki_generator::sign_request(
            &request,
            &CertificateProfile::RootCa,
            self.validity_days,
            Issuer::SelfSigned(&key),
        )?;
        info!(
            subject = %self.subject_common_name,
            validity_days = self.validity_days,
            "Generated Ed448 root CA"
        );
        Ok(RootCa(CaCertificate { key, certificate }))
    }
}
