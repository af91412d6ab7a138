//! Derived encodings of keys and certificates
//!
//! Every function here is a pure transform of its input: the same certificate
//! or key always yields byte-identical output.

use crate::error::{Result, TrustError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use data_encoding::{Encoding, Specification};
use openssl::x509::X509Ref;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// DER SubjectPublicKeyInfo prefix for an X25519 key (RFC 8410):
/// SEQUENCE(42) { SEQUENCE(5) { OID 1.3.101.110 } BIT STRING(33) { 0 unused bits, ...
const X25519_SPKI_HEADER: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// Length of a raw X25519 public key
pub const X25519_KEY_LEN: usize = 32;

/// z-base-32 alphabet used by the Web Key Directory hash
const ZBASE32_SYMBOLS: &str = "ybndrfg8ejkmcpqxot1uwisza345h769";

pub fn base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn base64_decode(artifact: &str, text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| TrustError::encoding(artifact, e))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// DER encoding of a certificate
pub fn certificate_der(cert: &X509Ref) -> Result<Vec<u8>> {
    cert.to_der()
        .map_err(|e| TrustError::encoding("certificate", e))
}

/// DER SubjectPublicKeyInfo of a certificate's public key
pub fn spki_der(cert: &X509Ref) -> Result<Vec<u8>> {
    cert.public_key()
        .and_then(|key| key.public_key_to_der())
        .map_err(|e| TrustError::encoding("certificate public key", e))
}

/// SHA-256 over the SPKI, hex encoded: the association data of a `TLSA 3 1 1` record
pub fn spki_sha256_hex(cert: &X509Ref) -> Result<String> {
    Ok(sha256_hex(&spki_der(cert)?))
}

/// Extract the raw 32-byte X25519 public key from its DER SPKI encoding.
///
/// The encapsulation is checked byte for byte; anything other than the fixed
/// RFC 8410 header followed by exactly 32 key bytes is rejected.
pub fn x25519_raw_public_key(spki_der: &[u8]) -> Result<[u8; X25519_KEY_LEN]> {
    let raw = spki_der
        .strip_prefix(&X25519_SPKI_HEADER[..])
        .ok_or_else(|| {
            TrustError::encoding("X25519 public key", "not an X25519 SubjectPublicKeyInfo")
        })?;
    raw.try_into().map_err(|_| {
        TrustError::encoding(
            "X25519 public key",
            format!("expected {} key bytes, found {}", X25519_KEY_LEN, raw.len()),
        )
    })
}

fn zbase32() -> Result<Encoding> {
    let mut spec = Specification::new();
    spec.symbols.push_str(ZBASE32_SYMBOLS);
    spec.encoding()
        .map_err(|e| TrustError::encoding("z-base-32 alphabet", e))
}

/// Web Key Directory hash of an email local part.
///
/// The local part is lowercased, hashed with SHA-1 and rendered in z-base-32,
/// giving 32 lowercase characters. Only the local part contributes, so
/// `alice@example.com` and `alice@example.org` hash identically.
pub fn wkd_hash(local_part: &str) -> Result<String> {
    let digest = Sha1::digest(local_part.to_lowercase().as_bytes());
    Ok(zbase32()?.encode(&digest))
}
