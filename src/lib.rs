//! Trust Plane - DNS-anchored explicit trust material
//!
//! Generates and maintains the cryptographic material a domain publishes in
//! DNS, and renders it as zone records:
//!
//! ```text
//! Root CA (Ed448, self-signed, pathlen=1)
//!   └── Intermediate CA (Ed448, signed by Root, pathlen=0)
//!       └── Server certificate (Ed25519, CA=false)   -> CERT PKIX, TLSA 3 1 1
//! X25519 key-exchange key                            -> IPSECKEY
//! OpenPGP key per identity                           -> CERT PGP, OPENPGPKEY, WKD
//! Issuance policy                                    -> CAA
//! ```
//!
//! Server certificates are CA-signed when an intermediate exists. Without one
//! they fall back to self-signed, and the fallback is reported as a
//! downgrade rather than hidden.
//!
//! # Store Layout
//!
//! Everything lives under one store root (`trust/` by default):
//!
//! - `ca/root`, `ca/intermediate`: CA keys, certificates and the chain
//! - `certs/<domain>`: leaf key, certificate, fullchain and SPKI digest
//! - `kex/<domain>`: X25519 key in PEM, DER, raw base64 and raw hex
//! - `pgp/<domain>/<identity>`: exported OpenPGP public keys
//! - `dns/records/<domain>.zone`, `dns/wkd/<domain>`: published output
//! - `manifests/`: one JSON manifest per domain plus `_ca.json`
//! - `backup/<timestamp>`: verified copies taken before replacement
//! - `locks/`: advisory locks, one per domain or the CA hierarchy
//!
//! Private keys are written `0600` in `0700` directories. An artifact set is
//! staged next to its destination and swapped in with a rename, so readers
//! see the old set or the new set and never a mix.
//!
//! # Example
//!
//! ```no_run
//! use trustplane::configs::AppConfig;
//! use trustplane::generate_server_cert::IssuanceMode;
//! use trustplane::trust_plane::TrustPlane;
//!
//! fn publish() -> trustplane::error::Result<()> {
//!     let plane = TrustPlane::open(AppConfig::load()?)?;
//!     plane.init_ca()?;
//!     let issued = plane.issue_certificate("example.com", 365, IssuanceMode::CaSigned)?;
//!     println!("{}", issued.decision);
//!     plane.generate_kex("example.com")?;
//!     print!("{}", plane.export_zone("example.com")?);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Library operations return [`error::TrustError`], which names the artifact
//! or operation that failed. The binary wraps these in `anyhow` with context.

pub mod artifact_store;
pub mod backup;
pub mod configs;
pub mod dns_records;
pub mod encoding;
pub mod error;
pub mod generate_intermediate_ca;
pub mod generate_root_ca;
pub mod generate_server_cert;
pub mod key_exchange;
pub mod lockfile;
pub mod manifest;
pub mod naming;
pub mod openpgp;
pub mod pki_generator;
pub mod rotation;
pub mod secure_key;
pub mod status;
pub mod trust_plane;
