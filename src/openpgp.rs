//! OpenPGP key generation through an external engine
//!
//! Key-ring management stays with the OpenPGP engine. The trust plane asks it
//! for a primary Ed25519 key (sign, certify) with a Curve25519 encryption
//! subkey, then exports the public key in binary and armored form for the DNS
//! records and the Web Key Directory.

use crate::artifact_store::{set_mode, ArtifactBundle, SECRET_DIR_MODE};
use crate::encoding;
use crate::error::{Result, TrustError};
use crate::naming::{normalize_domain, split_identity};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

pub const PGP_ARMORED_FILE: &str = "public.asc";
pub const PGP_BINARY_FILE: &str = "public.pgp";
pub const PGP_B64_FILE: &str = "public.b64";
pub const PGP_FINGERPRINT_FILE: &str = "fingerprint";

/// Operations the trust plane needs from an OpenPGP implementation
pub trait PgpEngine {
    /// Create primary + encryption subkey for `identity`, returning the fingerprint
    fn generate(&self, identity: &str, expiry: &str) -> Result<String>;
    /// Binary (RFC 4880 transferable) public key
    fn export_binary(&self, fingerprint: &str) -> Result<Vec<u8>>;
    /// ASCII-armored public key
    fn export_armored(&self, fingerprint: &str) -> Result<Vec<u8>>;
    /// Fingerprint of the newest key carrying `identity`, if any
    fn fingerprint(&self, identity: &str) -> Result<Option<String>>;
}

/// Public half of an OpenPGP key as published
#[derive(Debug, Clone)]
pub struct PgpKey {
    pub identity: String,
    /// Domain part of the identity, normalised
    pub domain: String,
    pub fingerprint: String,
    pub binary: Vec<u8>,
    pub armored: Vec<u8>,
}

impl PgpKey {
    pub fn bundle(&self) -> ArtifactBundle {
        ArtifactBundle::new()
            .public(PGP_ARMORED_FILE, self.armored.clone())
            .public(PGP_BINARY_FILE, self.binary.clone())
            .public(PGP_B64_FILE, format!("{}\n", encoding::base64(&self.binary)))
            .public(PGP_FINGERPRINT_FILE, format!("{}\n", self.fingerprint))
    }
}

/// Expiry as the engine understands it: `0`/`never`, or a count with an
/// optional `d`, `w`, `m` or `y` unit.
pub fn validate_expiry(expiry: &str) -> Result<()> {
    if expiry == "never" || expiry == "0" {
        return Ok(());
    }
    let digits = expiry.trim_end_matches(['d', 'w', 'm', 'y']);
    let unit_len = expiry.len() - digits.len();
    if digits.is_empty() || unit_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(TrustError::csr(
            expiry,
            "expiry must be a number with an optional d/w/m/y unit, or \"never\"",
        ));
    }
    Ok(())
}

/// Generate and export an OpenPGP key for an email identity
pub fn generate_pgp_key(engine: &dyn PgpEngine, identity: &str, expiry: &str) -> Result<PgpKey> {
    let identity = identity.trim();
    let (_, domain) = split_identity(identity)?;
    let domain = normalize_domain(domain)?;
    validate_expiry(expiry)?;

    let fingerprint = engine.generate(identity, expiry)?;
    let binary = engine.export_binary(&fingerprint)?;
    let armored = engine.export_armored(&fingerprint)?;
    if binary.is_empty() {
        return Err(TrustError::encoding(
            format!("OpenPGP key {}", fingerprint),
            "engine exported an empty key",
        ));
    }
    info!(identity, fingerprint = %fingerprint, expiry, "Generated OpenPGP key");
    Ok(PgpKey {
        identity: identity.to_string(),
        domain,
        fingerprint,
        binary,
        armored,
    })
}

/// Primary-key fingerprints from `--with-colons` listing output, in order
pub fn parse_fingerprints(colons: &str) -> Vec<String> {
    let mut fingerprints = Vec::new();
    let mut after_primary = false;
    for line in colons.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first() {
            Some(&"pub") | Some(&"sec") => after_primary = true,
            Some(&"fpr") if after_primary => {
                if let Some(fpr) = fields.get(9).filter(|f| !f.is_empty()) {
                    fingerprints.push(fpr.to_string());
                }
                after_primary = false;
            }
            _ => {}
        }
    }
    fingerprints
}

// ================= GnuPG engine =================

/// Engine backed by the `gpg` binary with a store-local home directory
#[derive(Debug, Clone)]
pub struct GnuPg {
    binary: PathBuf,
    home: PathBuf,
}

impl GnuPg {
    pub fn new(binary: impl Into<PathBuf>, home: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            home: home.into(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn ensure_home(&self) -> Result<()> {
        fs::create_dir_all(&self.home).map_err(|e| TrustError::filesystem(&self.home, e))?;
        set_mode(&self.home, SECRET_DIR_MODE)
    }

    /// Run gpg in batch mode; `fail` maps a failure to the caller's error
    fn run(&self, args: &[&str], fail: impl Fn(String) -> TrustError) -> Result<Vec<u8>> {
        self.ensure_home()?;
        debug!(binary = %self.binary.display(), ?args, "Running gpg");
        let output = Command::new(&self.binary)
            .arg("--homedir")
            .arg(&self.home)
            .args(["--batch", "--no-tty", "--quiet"])
            .args(args)
            .output()
            .map_err(|e| fail(format!("cannot run {}: {}", self.binary.display(), e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("gpg exited with {}: {}", output.status, stderr.trim())));
        }
        Ok(output.stdout)
    }
}

/// Arguments for an unprotected Ed25519 primary key.
///
/// `--yes` lets batch mode create a key for a user ID that already has one;
/// the newest key is then the last one listed for the identity.
fn quick_generate_args<'a>(identity: &'a str, expiry: &'a str) -> [&'a str; 10] {
    [
        "--pinentry-mode",
        "loopback",
        "--passphrase",
        "",
        "--yes",
        "--quick-generate-key",
        identity,
        "ed25519",
        "sign,cert",
        expiry,
    ]
}

impl PgpEngine for GnuPg {
    fn generate(&self, identity: &str, expiry: &str) -> Result<String> {
        let artifact = format!("OpenPGP key for {}", identity);
        let keygen = |reason: String| TrustError::key_generation(artifact.as_str(), reason);
        self.run(&quick_generate_args(identity, expiry), keygen)?;
        let fingerprint = self
            .fingerprint(identity)?
            .ok_or_else(|| keygen("key not found after generation".to_string()))?;
        self.run(
            &[
                "--pinentry-mode",
                "loopback",
                "--passphrase",
                "",
                "--quick-add-key",
                fingerprint.as_str(),
                "cv25519",
                "encr",
                expiry,
            ],
            keygen,
        )?;
        Ok(fingerprint)
    }

    fn export_binary(&self, fingerprint: &str) -> Result<Vec<u8>> {
        self.run(&["--export", fingerprint], |reason| {
            TrustError::encoding(format!("OpenPGP key {}", fingerprint), reason)
        })
    }

    fn export_armored(&self, fingerprint: &str) -> Result<Vec<u8>> {
        self.run(&["--armor", "--export", fingerprint], |reason| {
            TrustError::encoding(format!("OpenPGP key {}", fingerprint), reason)
        })
    }

    fn fingerprint(&self, identity: &str) -> Result<Option<String>> {
        let pattern = format!("<{}>", identity);
        let listing = match self.run(
            &["--with-colons", "--list-keys", pattern.as_str()],
            |reason| TrustError::encoding(format!("OpenPGP key listing for {}", identity), reason),
        ) {
            Ok(listing) => listing,
            // gpg exits non-zero when nothing matches
            Err(TrustError::Encoding { reason, .. }) if reason.contains("No public key") => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        Ok(parse_fingerprints(&String::from_utf8_lossy(&listing)).pop())
    }
}
