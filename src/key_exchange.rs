//! X25519 key-exchange key generation
//!
//! Produces the static X25519 key a domain publishes in its IPSECKEY record.
//! Besides PEM and DER the public key is rendered as the bare 32-byte value,
//! in Base64 (the IPSECKEY gateway key) and hex.
//!
//! The key is long-lived. It identifies the domain's key-exchange endpoint and
//! does not replace fresh ephemeral keys negotiated per session.

use crate::artifact_store::ArtifactBundle;
use crate::encoding::{self, X25519_KEY_LEN};
use crate::error::{Result, TrustError};
use crate::naming::normalize_domain;
use crate::pki_generator;
use crate::secure_key::SecureKey;
use openssl::pkey::{Id, PKey};
use tracing::{info, warn};

pub const KEX_KEY_FILE: &str = "x25519.key";
pub const KEX_PUBLIC_PEM_FILE: &str = "x25519.pub.pem";
pub const KEX_PUBLIC_DER_FILE: &str = "x25519.pub.der";
pub const KEX_RAW_B64_FILE: &str = "x25519.raw.b64";
pub const KEX_RAW_HEX_FILE: &str = "x25519.raw.hex";

#[derive(Debug)]
pub struct KexKeyPair {
    pub domain: String,
    pub key: SecureKey,
    /// DER SubjectPublicKeyInfo
    pub public_der: Vec<u8>,
    pub raw_public: [u8; X25519_KEY_LEN],
}

impl KexKeyPair {
    /// Generate a fresh X25519 pair for `domain`
    pub fn generate(domain: &str) -> Result<Self> {
        let domain = normalize_domain(domain)?;
        let label = format!("key-exchange key for {}", domain);
        let key = SecureKey::new(
            label.as_str(),
            pki_generator::generate_key(Id::X25519, &label)?,
        )?;
        let public_der = key.public_key_der()?;
        let raw_public = encoding::x25519_raw_public_key(&public_der)?;

        warn!(
            domain = %domain,
            "X25519 key is static; it is not a substitute for per-session ephemeral key exchange"
        );
        let pair = Self {
            domain,
            key,
            public_der,
            raw_public,
        };
        info!(domain = %pair.domain, fingerprint = %pair.fingerprint(), "Generated X25519 key-exchange key");
        Ok(pair)
    }

    pub fn raw_base64(&self) -> String {
        encoding::base64(&self.raw_public)
    }

    pub fn raw_hex(&self) -> String {
        hex::encode(self.raw_public)
    }

    pub fn fingerprint(&self) -> String {
        encoding::sha256_hex(&self.public_der)
    }

    pub fn bundle(&self) -> Result<ArtifactBundle> {
        let public_pem = PKey::public_key_from_der(&self.public_der)
            .and_then(|k| k.public_key_to_pem())
            .map_err(|e| TrustError::encoding(format!("X25519 public key for {}", self.domain), e))?;
        Ok(ArtifactBundle::new()
            .secret(KEX_KEY_FILE, self.key.to_pem()?)
            .public(KEX_PUBLIC_PEM_FILE, public_pem)
            .public(KEX_PUBLIC_DER_FILE, self.public_der.clone())
            .public(KEX_RAW_B64_FILE, format!("{}\n", self.raw_base64()))
            .public(KEX_RAW_HEX_FILE, format!("{}\n", self.raw_hex())))
    }
}
