use crate::error::{Result, TrustError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_PATH: &str = "trustplane.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub ca: CaSubject,
    #[serde(default)]
    pub issuance: IssuancePolicy,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub openpgp: OpenPgpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            defaults: Defaults::default(),
            ca: CaSubject::default(),
            issuance: IssuancePolicy::default(),
            dns: DnsConfig::default(),
            openpgp: OpenPgpConfig::default(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("trust")
}

#[derive(Debug, Deserialize, Clone)]
pub struct Defaults {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_cert_validity")]
    pub cert_validity_days: u32,
    #[serde(default = "default_root_ca_validity")]
    pub root_ca_validity_days: u32,
    #[serde(default = "default_intermediate_ca_validity")]
    pub intermediate_ca_validity_days: u32,
    #[serde(default = "default_pgp_expiry")]
    pub pgp_expiry: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            cert_validity_days: default_cert_validity(),
            root_ca_validity_days: default_root_ca_validity(),
            intermediate_ca_validity_days: default_intermediate_ca_validity(),
            pgp_expiry: default_pgp_expiry(),
        }
    }
}

fn default_domain() -> String {
    "example.com".to_string()
}

fn default_cert_validity() -> u32 {
    365
}

fn default_root_ca_validity() -> u32 {
    3650 // 10 years
}

fn default_intermediate_ca_validity() -> u32 {
    1825 // 5 years
}

fn default_pgp_expiry() -> String {
    "2y".to_string()
}

/// Distinguished name fields shared by both CA certificates
#[derive(Debug, Deserialize, Clone)]
pub struct CaSubject {
    #[serde(default = "default_root_cn")]
    pub root_common_name: String,
    #[serde(default = "default_intermediate_cn")]
    pub intermediate_common_name: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default)]
    pub country: Option<String>,
}

impl Default for CaSubject {
    fn default() -> Self {
        Self {
            root_common_name: default_root_cn(),
            intermediate_common_name: default_intermediate_cn(),
            organization: default_organization(),
            country: None,
        }
    }
}

fn default_root_cn() -> String {
    "Explicit Trust Root CA".to_string()
}

fn default_intermediate_cn() -> String {
    "Explicit Trust Intermediate CA".to_string()
}

fn default_organization() -> String {
    "Explicit Trust Plane".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuancePolicy {
    /// Fall back to a self-signed leaf when no intermediate CA exists.
    /// When false, CA-signed issuance without an intermediate is an error.
    #[serde(default = "default_true")]
    pub self_signed_fallback: bool,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self {
            self_signed_fallback: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_tlsa_port")]
    pub tlsa_port: u16,
    #[serde(default = "default_caa_issue")]
    pub caa_issue: String,
    #[serde(default = "default_iodef_mailbox")]
    pub caa_iodef_mailbox: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            tlsa_port: default_tlsa_port(),
            caa_issue: default_caa_issue(),
            caa_iodef_mailbox: default_iodef_mailbox(),
        }
    }
}

fn default_ttl() -> u32 {
    3600
}

fn default_tlsa_port() -> u16 {
    443
}

fn default_caa_issue() -> String {
    "letsencrypt.org".to_string()
}

fn default_iodef_mailbox() -> String {
    "security".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenPgpConfig {
    #[serde(default = "default_gpg_binary")]
    pub gpg_binary: PathBuf,
}

impl Default for OpenPgpConfig {
    fn default() -> Self {
        Self {
            gpg_binary: default_gpg_binary(),
        }
    }
}

fn default_gpg_binary() -> PathBuf {
    PathBuf::from("gpg")
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| {
            TrustError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&config_str)
            .map_err(|e| TrustError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(config_str: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(config_str)
    }

    /// Load `trustplane.toml` from the working directory, or defaults if it is absent
    pub fn load() -> Result<Self> {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::from_file(DEFAULT_CONFIG_PATH)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_documented_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.store_path, PathBuf::from("trust"));
        assert_eq!(config.defaults.domain, "example.com");
        assert_eq!(config.defaults.cert_validity_days, 365);
        assert_eq!(config.defaults.root_ca_validity_days, 3650);
        assert_eq!(config.defaults.intermediate_ca_validity_days, 1825);
        assert_eq!(config.defaults.pgp_expiry, "2y");
        assert!(config.issuance.self_signed_fallback);
        assert_eq!(config.dns.caa_issue, "letsencrypt.org");
        assert_eq!(config.dns.tlsa_port, 443);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::from_toml(
            r#"
            store_path = "/srv/trust"

            [defaults]
            domain = "corp.example"

            [issuance]
            self_signed_fallback = false

            [dns]
            ttl = 300
            "#,
        )
        .unwrap();
        assert_eq!(config.store_path, PathBuf::from("/srv/trust"));
        assert_eq!(config.defaults.domain, "corp.example");
        assert_eq!(config.defaults.cert_validity_days, 365);
        assert!(!config.issuance.self_signed_fallback);
        assert_eq!(config.dns.ttl, 300);
        assert_eq!(config.dns.caa_iodef_mailbox, "security");
    }

    #[test]
    fn test_unreadable_file_is_config_error() {
        let err = AppConfig::from_file("/nonexistent/trustplane.toml").unwrap_err();
        assert!(matches!(err, TrustError::Config(_)));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        assert!(AppConfig::from_toml("[defaults]\ncert_validity_days = \"soon\"").is_err());
    }
}
