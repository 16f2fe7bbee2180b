//! RAM ARN canonicalization
//!
//! All mapper lookups key on a canonical ARN so that a principal maps the
//! same way regardless of how it authenticated. In particular, STS
//! assumed-role ARNs like `acs:ram::ACCOUNTID:assumed-role/ROLE/SESSION` are
//! collapsed to their RAM equivalent `acs:ram::ACCOUNTID:role/ROLE` with the
//! transient session name stripped.

use crate::{Error, Result};

/// Resource prefixes that identify a RAM principal
const KNOWN_PREFIXES: &[&str] = &["role", "user", "assumed-role", "federated-user"];

/// Canonicalize a RAM or STS principal ARN.
///
/// Rules, applied in order:
/// 1. `assumed-role/<role>/<session>` becomes `role/<role>`; a session
///    segment on a `role/` resource is stripped the same way (the identity
///    service reports assumed roles in both spellings)
/// 2. `federated-user/...` is left intact
/// 3. `user/<name>` and two-segment `role/<name>` are left intact
///
/// Canonicalization is idempotent; callers that use the result as a map key
/// lower-case it afterwards.
pub fn canonicalize(arn: &str) -> Result<String> {
    let parts: Vec<&str> = arn.splitn(5, ':').collect();
    if parts.len() != 5 {
        return Err(Error::InvalidArn(format!("not enough sections in {arn:?}")));
    }
    if parts[0] != "acs" {
        return Err(Error::InvalidArn(format!("unexpected partition in {arn:?}")));
    }
    let service = parts[1];
    if service != "ram" && service != "sts" {
        return Err(Error::InvalidArn(format!(
            "unexpected service {service:?} in {arn:?}"
        )));
    }
    let account = parts[3];
    if account.is_empty() || !account.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArn(format!(
            "malformed account id {account:?} in {arn:?}"
        )));
    }

    let resource = parts[4];
    let kind = resource.split('/').next().unwrap_or_default();
    if !KNOWN_PREFIXES.contains(&kind) {
        return Err(Error::InvalidArn(format!(
            "unrecognized resource {resource:?} in {arn:?}"
        )));
    }

    let segments: Vec<&str> = resource.split('/').collect();
    match (kind, segments.len()) {
        ("assumed-role", 3) | ("role", 3) => {
            Ok(format!("acs:ram::{}:role/{}", account, segments[1]))
        }
        ("assumed-role", _) => Err(Error::InvalidArn(format!(
            "assumed-role resource {resource:?} must be assumed-role/<role>/<session>"
        ))),
        _ => Ok(arn.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_session_from_assumed_role() {
        let canonical =
            canonicalize("acs:sts::111122223333:assumed-role/Admin/sess1").unwrap();
        assert_eq!(canonical, "acs:ram::111122223333:role/Admin");
        assert!(!canonical.contains("sess1"));
    }

    #[test]
    fn strips_session_from_role_spelled_assumed_arns() {
        let canonical = canonicalize("acs:ram::111122223333:role/Admin/sess1").unwrap();
        assert_eq!(canonical, "acs:ram::111122223333:role/Admin");
    }

    #[test]
    fn leaves_users_and_roles_intact() {
        for arn in [
            "acs:ram::111122223333:user/alice",
            "acs:ram::111122223333:role/dev",
            "acs:sts::111122223333:federated-user/bob",
        ] {
            assert_eq!(canonicalize(arn).unwrap(), arn);
        }
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let arns = [
            "acs:sts::111122223333:assumed-role/Admin/sess1",
            "acs:ram::111122223333:user/alice",
            "acs:ram::111122223333:role/dev-*",
        ];
        for arn in arns {
            let once = canonicalize(arn).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn rejects_malformed_arns() {
        // wrong partition
        assert!(canonicalize("aws:iam::111122223333:user/alice").is_err());
        // unknown service
        assert!(canonicalize("acs:oss::111122223333:bucket/b").is_err());
        // non-digit account
        assert!(canonicalize("acs:ram::acct:user/alice").is_err());
        // unknown resource prefix
        assert!(canonicalize("acs:ram::111122223333:group/dev").is_err());
        // missing sections
        assert!(canonicalize("acs:ram:user/alice").is_err());
        // assumed-role without session
        assert!(canonicalize("acs:sts::111122223333:assumed-role/Admin").is_err());
    }
}
