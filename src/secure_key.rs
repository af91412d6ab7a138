//! Private key material held in memory
//!
//! Keys are kept as PKCS#8 DER inside a [`SecretBox`], zeroized on drop and
//! reconstructed into an OpenSSL key only for the duration of a single signing
//! operation. `Debug` output never includes the bytes.

use crate::error::{Result, TrustError};
use openssl::pkey::{Id, PKey, Private};
use secrecy::{ExposeSecret, SecretBox};
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

/// Secure container for one private key
pub struct SecureKey {
    label: String,
    algorithm: Id,
    pkcs8_der: SecretBox<Vec<u8>>,
}

impl SecureKey {
    /// Move a freshly generated key into secure storage
    pub fn new(label: impl Into<String>, key: PKey<Private>) -> Result<Self> {
        let label = label.into();
        let der = key
            .private_key_to_pkcs8()
            .map_err(|e| TrustError::encoding(label.clone(), e))?;
        Ok(Self {
            algorithm: key.id(),
            pkcs8_der: SecretBox::new(Box::new(der)),
            label,
        })
    }

    /// Load a PKCS#8 PEM private key from the artifact store
    pub fn from_pem_file(label: impl Into<String>, path: &Path) -> Result<Self> {
        let label = label.into();
        let pem = Zeroizing::new(std::fs::read(path).map_err(|e| {
            TrustError::signing(
                label.clone(),
                format!("cannot read private key {}: {}", path.display(), e),
            )
        })?);
        let key = PKey::private_key_from_pem(&pem).map_err(|e| {
            TrustError::signing(
                label.clone(),
                format!("cannot parse private key {}: {}", path.display(), e),
            )
        })?;
        Self::new(label, key)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn algorithm(&self) -> Id {
        self.algorithm
    }

    /// Run `f` with the reconstructed OpenSSL key; the key is dropped on return.
    pub fn with_pkey<T>(&self, f: impl FnOnce(&PKey<Private>) -> Result<T>) -> Result<T> {
        let pkey = PKey::private_key_from_pkcs8(self.pkcs8_der.expose_secret())
            .map_err(|e| TrustError::signing(self.label.clone(), e))?;
        f(&pkey)
    }

    /// PKCS#8 PEM for writing to a mode-restricted file
    pub fn to_pem(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.with_pkey(|pkey| {
            pkey.private_key_to_pem_pkcs8()
                .map(Zeroizing::new)
                .map_err(|e| TrustError::encoding(self.label.clone(), e))
        })
    }

    /// DER SubjectPublicKeyInfo of the matching public key
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.with_pkey(|pkey| {
            pkey.public_key_to_der()
                .map_err(|e| TrustError::encoding(self.label.clone(), e))
        })
    }
}

impl fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureKey")
            .field("label", &self.label)
            .field("algorithm", &self.algorithm)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_no_leak() {
        let key = SecureKey::new("leaf", PKey::generate_ed25519().unwrap()).unwrap();
        let pem = key.to_pem().unwrap();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("<redacted>"));
        assert!(!debug_str.contains("BEGIN"));
        assert!(!debug_str.contains(&String::from_utf8_lossy(&pem[..]).to_string()));
    }

    #[test]
    fn test_pem_round_trip_preserves_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = SecureKey::new("root", PKey::generate_ed448().unwrap()).unwrap();
        let path = dir.path().join("root.key");
        std::fs::write(&path, &key.to_pem().unwrap()[..]).unwrap();

        let loaded = SecureKey::from_pem_file("root", &path).unwrap();
        assert_eq!(loaded.algorithm(), Id::ED448);
        assert_eq!(loaded.public_key_der().unwrap(), key.public_key_der().unwrap());
    }

    #[test]
    fn test_unreadable_key_is_signing_error() {
        let err = SecureKey::from_pem_file("intermediate CA", Path::new("/nonexistent.key"))
            .unwrap_err();
        assert!(matches!(err, TrustError::Signing { .. }));
    }
}
