//! Certificate request construction and signing shared by all builders
//!
//! Every certificate in the trust plane is produced the same way: the subject
//! key signs an `X509Req`, the issuer checks that signature and then signs an
//! X.509v3 certificate carrying the extension profile of the certificate type.

use crate::error::{Result, TrustError};
use crate::secure_key::SecureKey;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509NameRef, X509Ref, X509Req, X509ReqBuilder, X509};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const X509_REQ_VERSION_1: i32 = 0;
const SERIAL_BITS: i32 = 128;
pub const ROOT_CA_PATH_LENGTH: u32 = 1;
pub const INTERMEDIATE_CA_PATH_LENGTH: u32 = 0; // Can only sign end-entity certs, not other CAs

/// Extension set applied when signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateProfile {
    RootCa,
    IntermediateCa,
    /// End-entity certificate for `domain` and `*.domain`
    Leaf { domain: String },
}

impl CertificateProfile {
    fn label(&self) -> String {
        match self {
            CertificateProfile::RootCa => "root CA".to_string(),
            CertificateProfile::IntermediateCa => "intermediate CA".to_string(),
            CertificateProfile::Leaf { domain } => format!("certificate for {}", domain),
        }
    }
}

/// Who signs the certificate
pub enum Issuer<'a> {
    /// The subject's own key; issuer name equals subject name
    SelfSigned(&'a SecureKey),
    /// A CA certificate and its private key
    Ca {
        certificate: &'a X509Ref,
        key: &'a SecureKey,
    },
}

/// Build a subject name with CN and optional O / C
pub fn subject_name(
    common_name: &str,
    organization: Option<&str>,
    country: Option<&str>,
) -> Result<X509Name> {
    let invalid = |e: openssl::error::ErrorStack| TrustError::csr(common_name, e);
    if common_name.trim().is_empty() {
        return Err(TrustError::csr(common_name, "common name is empty"));
    }
    let mut name_builder = X509Name::builder().map_err(invalid)?;
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .map_err(invalid)?;
    if let Some(org) = organization.filter(|o| !o.is_empty()) {
        name_builder
            .append_entry_by_nid(Nid::ORGANIZATIONNAME, org)
            .map_err(invalid)?;
    }
    if let Some(country) = country.filter(|c| !c.is_empty()) {
        if country.len() != 2 {
            return Err(TrustError::csr(common_name, format!("country {:?} is not a two-letter code", country)));
        }
        name_builder
            .append_entry_by_nid(Nid::COUNTRYNAME, country)
            .map_err(invalid)?;
    }
    Ok(name_builder.build())
}

/// Common name of a certificate subject, for messages and manifests
pub fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .unwrap_or_default()
}

/// Generate a key pair of the given EdDSA/ECDH family
pub fn generate_key(algorithm: Id, artifact: &str) -> Result<PKey<Private>> {
    let generated = match algorithm {
        Id::ED448 => PKey::generate_ed448(),
        Id::ED25519 => PKey::generate_ed25519(),
        Id::X25519 => PKey::generate_x25519(),
        other => {
            return Err(TrustError::key_generation(
                artifact,
                format!("unsupported algorithm {:?}", other),
            ))
        }
    };
    generated.map_err(|e| TrustError::key_generation(artifact, e))
}

/// Create a certificate request signed by the subject key (proof of possession)
pub fn build_request(subject: &X509NameRef, key: &SecureKey) -> Result<X509Req> {
    let cn = common_name(subject);
    let invalid = |e: openssl::error::ErrorStack| TrustError::csr(cn.clone(), e);
    key.with_pkey(|pkey| {
        let mut builder = X509ReqBuilder::new().map_err(invalid)?;
        builder.set_version(X509_REQ_VERSION_1).map_err(invalid)?;
        builder.set_subject_name(subject).map_err(invalid)?;
        builder.set_pubkey(pkey).map_err(invalid)?;
        // EdDSA signs the message directly; no separate digest
        builder.sign(pkey, MessageDigest::null()).map_err(invalid)?;
        Ok(builder.build())
    })
}

/// Sign `request` under `profile`, either self-signed or by a CA
pub fn sign_request(
    request: &X509Req,
    profile: &CertificateProfile,
    validity_days: u32,
    issuer: Issuer<'_>,
) -> Result<X509> {
    let label = profile.label();
    let subject_cn = common_name(request.subject_name());
    let signing = |e: openssl::error::ErrorStack| TrustError::signing(label.clone(), e);
    let extension = |e: openssl::error::ErrorStack| TrustError::extension(subject_cn.clone(), e);

    if validity_days == 0 {
        return Err(TrustError::csr(subject_cn.as_str(), "validity must be at least one day"));
    }

    let request_key = request
        .public_key()
        .map_err(|e| TrustError::csr(subject_cn.clone(), e))?;
    if !request
        .verify(&request_key)
        .map_err(|e| TrustError::csr(subject_cn.clone(), e))?
    {
        return Err(TrustError::csr(subject_cn.as_str(), "request signature does not verify"));
    }

    let (issuer_cert, signing_key) = match issuer {
        Issuer::SelfSigned(key) => {
            if *profile == CertificateProfile::IntermediateCa {
                return Err(TrustError::signing(label.as_str(), "intermediate CA cannot be self-signed"));
            }
            let own = key.public_key_der()?;
            let requested = request_key.public_key_to_der().map_err(signing)?;
            if own != requested {
                return Err(TrustError::signing(label.as_str(), "request key does not match signing key"));
            }
            (None, key)
        }
        Issuer::Ca { certificate, key } => {
            check_issuer(certificate, key, profile, &label)?;
            (Some(certificate), key)
        }
    };

    let mut builder = X509::builder().map_err(signing)?;
    builder.set_version(X509_VERSION_3).map_err(signing)?;

    // Random 128-bit serial
    let mut serial = BigNum::new().map_err(signing)?;
    serial
        .rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)
        .map_err(signing)?;
    let asn1_serial = serial.to_asn1_integer().map_err(signing)?;
    builder.set_serial_number(&asn1_serial).map_err(signing)?;

    builder
        .set_subject_name(request.subject_name())
        .map_err(signing)?;
    let issuer_name = match issuer_cert {
        Some(ca) => ca.subject_name(),
        None => request.subject_name(),
    };
    builder.set_issuer_name(issuer_name).map_err(signing)?;

    let not_before = Asn1Time::days_from_now(0).map_err(signing)?;
    builder.set_not_before(&not_before).map_err(signing)?;
    let not_after = Asn1Time::days_from_now(validity_days).map_err(signing)?;
    builder.set_not_after(&not_after).map_err(signing)?;
    builder.set_pubkey(&request_key).map_err(signing)?;

    match profile {
        CertificateProfile::RootCa | CertificateProfile::IntermediateCa => {
            let pathlen = if *profile == CertificateProfile::RootCa {
                ROOT_CA_PATH_LENGTH
            } else {
                INTERMEDIATE_CA_PATH_LENGTH
            };
            let bc = BasicConstraints::new()
                .critical()
                .ca()
                .pathlen(pathlen)
                .build()
                .map_err(extension)?;
            builder.append_extension(bc).map_err(extension)?;
            let ku = KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .map_err(extension)?;
            builder.append_extension(ku).map_err(extension)?;
        }
        CertificateProfile::Leaf { domain } => {
            if domain.contains('*') {
                return Err(TrustError::extension(
                    domain.clone(),
                    "domain already contains a wildcard; SAN adds *.domain itself",
                ));
            }
            // CA:false, end-entity
            let bc = BasicConstraints::new()
                .critical()
                .build()
                .map_err(extension)?;
            builder.append_extension(bc).map_err(extension)?;
            let ku = KeyUsage::new()
                .critical()
                .digital_signature()
                .build()
                .map_err(extension)?;
            builder.append_extension(ku).map_err(extension)?;
            let eku = ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .map_err(extension)?;
            builder.append_extension(eku).map_err(extension)?;
            let san = SubjectAlternativeName::new()
                .dns(domain)
                .dns(&format!("*.{}", domain))
                .build(&builder.x509v3_context(issuer_cert, None))
                .map_err(extension)?;
            builder.append_extension(san).map_err(extension)?;
        }
    }

    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(issuer_cert, None))
        .map_err(extension)?;
    builder.append_extension(ski).map_err(extension)?;

    if let Some(ca) = issuer_cert {
        // keyid:always copies the issuer's subjectKeyIdentifier
        let aki = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(Some(ca), None))
            .map_err(extension)?;
        builder.append_extension(aki).map_err(extension)?;
    }

    signing_key.with_pkey(|pkey| {
        builder
            .sign(pkey, MessageDigest::null())
            .map_err(|e| TrustError::signing(label.clone(), e))
    })?;
    Ok(builder.build())
}

/// The issuing CA must be an Ed448 CA whose key matches its certificate and
/// whose path length leaves room for the requested profile.
fn check_issuer(
    certificate: &X509Ref,
    key: &SecureKey,
    profile: &CertificateProfile,
    label: &str,
) -> Result<()> {
    if key.algorithm() != Id::ED448 {
        return Err(TrustError::signing(
            label,
            format!("{} key is {:?}, expected Ed448", key.label(), key.algorithm()),
        ));
    }
    let cert_key_der = certificate
        .public_key()
        .and_then(|k| k.public_key_to_der())
        .map_err(|e| TrustError::signing(label, e))?;
    if cert_key_der != key.public_key_der()? {
        return Err(TrustError::signing(
            label,
            format!("{} key does not match its certificate", key.label()),
        ));
    }
    let issuer_pathlen = certificate.pathlen();
    match profile {
        CertificateProfile::IntermediateCa => match issuer_pathlen {
            Some(len) if len > INTERMEDIATE_CA_PATH_LENGTH => Ok(()),
            _ => Err(TrustError::signing(
                label,
                format!("{} path length does not permit a subordinate CA", key.label()),
            )),
        },
        CertificateProfile::RootCa => Err(TrustError::signing(label, "root CA must be self-signed")),
        CertificateProfile::Leaf { .. } => Ok(()),
    }
}

/// Subject key identifier bytes of a certificate
pub fn subject_key_id(cert: &X509Ref) -> Option<Vec<u8>> {
    cert.subject_key_id().map(|id| id.as_slice().to_vec())
}

/// Authority key identifier bytes of a certificate
pub fn authority_key_id(cert: &X509Ref) -> Option<Vec<u8>> {
    cert.authority_key_id().map(|id| id.as_slice().to_vec())
}

/// Check an ordered leaf-to-root chain: every entry names the next as issuer,
/// carries its key identifier, and verifies under its key.
pub fn verify_chain(chain: &[X509]) -> Result<()> {
    for pair in chain.windows(2) {
        let (child, parent) = (&pair[0], &pair[1]);
        let child_cn = common_name(child.subject_name());
        let parent_cn = common_name(parent.subject_name());
        let broken = |reason: String| {
            TrustError::signing(format!("chain link {} -> {}", child_cn, parent_cn), reason)
        };
        let same_name = child
            .issuer_name()
            .try_cmp(parent.subject_name())
            .map_err(|e| broken(e.to_string()))?;
        if same_name != std::cmp::Ordering::Equal {
            return Err(broken("issuer name does not match parent subject".to_string()));
        }
        if authority_key_id(child) != subject_key_id(parent) {
            return Err(broken("authorityKeyIdentifier does not match parent subjectKeyIdentifier".to_string()));
        }
        let parent_key = parent.public_key().map_err(|e| broken(e.to_string()))?;
        if !child.verify(&parent_key).map_err(|e| broken(e.to_string()))? {
            return Err(broken("signature does not verify under parent key".to_string()));
        }
    }
    Ok(())
}
