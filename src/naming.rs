//! Artifact naming and identity validation
//!
//! Domain names become directory and file names with `*` spelled out as
//! `_wildcard_`; email identities map `@` to `_at_` and `.` to `_`.

use crate::error::{Result, TrustError};
use crate::manifest::CA_SCOPE;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Filesystem-safe name for a domain
pub fn domain_artifact_name(domain: &str) -> String {
    domain.replace('*', "_wildcard_")
}

/// Filesystem-safe name for an email identity
pub fn identity_artifact_name(identity: &str) -> String {
    identity.replace('@', "_at_").replace('.', "_")
}

/// Validate a domain used as a certificate subject.
///
/// Accepts a trailing dot and normalises to lowercase without it. Labels must
/// be LDH (letters, digits, hyphen) with no leading or trailing hyphen; `*` is
/// tolerated only as a whole leftmost label so the caller can reject it with a
/// more specific extension error.
pub fn normalize_domain(domain: &str) -> Result<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(TrustError::csr(domain, "domain is empty"));
    }
    if trimmed.len() > MAX_DOMAIN_LEN {
        return Err(TrustError::csr(domain, "domain exceeds 253 characters"));
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower == CA_SCOPE {
        return Err(TrustError::csr(domain, "name is reserved for the CA hierarchy"));
    }
    for (index, label) in lower.split('.').enumerate() {
        if label == "*" && index == 0 {
            continue;
        }
        if label.is_empty() {
            return Err(TrustError::csr(domain, "empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(TrustError::csr(domain, format!("label {:?} exceeds 63 characters", label)));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(TrustError::csr(domain, format!("label {:?} starts or ends with '-'", label)));
        }
        if let Some(c) = label
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(TrustError::csr(domain, format!("invalid character {:?}", c)));
        }
    }
    Ok(lower)
}

/// Split an email identity into `(local_part, domain)`.
pub fn split_identity(identity: &str) -> Result<(&str, &str)> {
    let (local, domain) = identity
        .rsplit_once('@')
        .ok_or_else(|| TrustError::csr(identity, "identity is not an email address"))?;
    if local.is_empty() || domain.is_empty() {
        return Err(TrustError::csr(identity, "identity is not an email address"));
    }
    if local.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
        return Err(TrustError::csr(identity, "local part contains forbidden characters"));
    }
    Ok((local, domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_is_spelled_out() {
        assert_eq!(domain_artifact_name("*.example.com"), "_wildcard_.example.com");
        assert_eq!(domain_artifact_name("example.com"), "example.com");
    }

    #[test]
    fn test_identity_name_mapping() {
        assert_eq!(identity_artifact_name("alice@example.com"), "alice_at_example_com");
        assert_eq!(identity_artifact_name("j.doe@mail.example.org"), "j_doe_at_mail_example_org");
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.COM.").unwrap(), "example.com");
        assert_eq!(normalize_domain("*.example.com").unwrap(), "*.example.com");
        assert!(matches!(normalize_domain(""), Err(TrustError::Csr { .. })));
        assert!(matches!(normalize_domain("exa mple.com"), Err(TrustError::Csr { .. })));
        assert!(matches!(normalize_domain("-bad.example.com"), Err(TrustError::Csr { .. })));
        assert!(matches!(normalize_domain("a..b"), Err(TrustError::Csr { .. })));
        assert!(matches!(normalize_domain("www.*.example.com"), Err(TrustError::Csr { .. })));
    }

    #[test]
    fn test_ca_scope_is_not_a_domain() {
        for name in ["_ca", "_CA", "_ca."] {
            assert!(matches!(normalize_domain(name), Err(TrustError::Csr { .. })), "{}", name);
        }
        assert_eq!(normalize_domain("_ca.example.com").unwrap(), "_ca.example.com");
    }

    #[test]
    fn test_split_identity() {
        assert_eq!(split_identity("alice@example.com").unwrap(), ("alice", "example.com"));
        assert!(split_identity("alice").is_err());
        assert!(split_identity("@example.com").is_err());
        assert!(split_identity("alice@").is_err());
    }
}
