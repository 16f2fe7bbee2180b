//! Bearer token construction and verification
//!
//! A token is a presigned `sts:GetCallerIdentity` request, base64-encoded
//! behind a version prefix. The generator builds one from ambient
//! credentials; the verifier replays it against a trusted STS endpoint and
//! extracts the caller's identity. Neither side shares state beyond the wire
//! format defined here.

pub mod generator;
pub mod verifier;

pub use generator::{Generator, GetTokenOptions};
pub use verifier::Verifier;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Version prefix for v1 (presigned URL) tokens
pub const V1_PREFIX: &str = "k8s-ack-v1.";
/// Version prefix for v2 (signed request envelope) tokens
pub const V2_PREFIX: &str = "k8s-ack-v2.";
/// Maximum accepted token size on the wire
pub const MAX_TOKEN_LEN_BYTES: usize = 1024 * 4;

/// Presigned STS URLs are valid for 15 minutes after their Timestamp
pub(crate) const PRESIGNED_URL_EXPIRATION_MINUTES: i64 = 15;
/// Default public STS endpoint
pub(crate) const DEFAULT_STS_ENDPOINT: &str = "sts.aliyuncs.com";
/// Query signature scheme version
pub(crate) const STS_SIGN_VERSION: &str = "1.0";
/// STS API version
pub(crate) const STS_API_VERSION: &str = "2015-04-01";
/// Timestamp layout STS expects (RFC3339, UTC, seconds precision)
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Token version tag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenVersion {
    /// Presigned-URL token
    V1,
    /// Signed request-envelope token
    V2,
}

impl TokenVersion {
    /// The wire prefix for this version
    pub fn prefix(&self) -> &'static str {
        match self {
            TokenVersion::V1 => V1_PREFIX,
            TokenVersion::V2 => V2_PREFIX,
        }
    }
}

/// A bearer token plus the instant the generator considers it expired
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// Opaque wire form, `k8s-ack-v<n>.<base64>`
    pub token: String,
    /// Client-side expiry; the presigned URL itself enforces expiry
    /// server-side
    pub expiration: DateTime<Utc>,
}

/// Identity returned on successful verification
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Identity {
    /// Raw RAM resource name returned by `sts:GetCallerIdentity`
    pub arn: String,
    /// Canonical lower-cased representation; assumed-role ARNs collapse to
    /// their RAM `role/` equivalent. This is the sole key used for mapping
    /// lookups.
    pub canonical_arn: String,
    /// 16-digit RAM account number
    pub account_id: String,
    /// Stable principal id (role id for assumed roles, user id otherwise)
    pub user_id: String,
    /// STS session name, empty for non-session identities. Only trustworthy
    /// when role assumption is restricted; arbitrary callers can pick nearly
    /// any string here.
    pub session_name: String,
    /// Access key that signed the presigned request, kept for audit
    pub access_key_id: String,
}

/// Encode a payload into the wire form for `version`
pub fn encode(payload: &str, version: TokenVersion) -> String {
    format!("{}{}", version.prefix(), STANDARD.encode(payload))
}

/// Decode a wire token into its version and raw payload bytes.
///
/// Rejects oversize tokens, unknown prefixes, and undecodable base64.
pub fn decode(token: &str) -> Result<(TokenVersion, Vec<u8>)> {
    if token.len() > MAX_TOKEN_LEN_BYTES {
        return Err(Error::format("token is too large"));
    }
    let (version, rest) = if let Some(rest) = token.strip_prefix(V1_PREFIX) {
        (TokenVersion::V1, rest)
    } else if let Some(rest) = token.strip_prefix(V2_PREFIX) {
        (TokenVersion::V2, rest)
    } else {
        return Err(Error::format("token is missing expected prefix"));
    };
    let payload = STANDARD
        .decode(rest)
        .map_err(|e| Error::format(e.to_string()))?;
    Ok((version, payload))
}

/// `ExecCredential` envelope consumed by kubectl exec-credential plugins
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    /// Client authentication API version
    pub api_version: String,
    /// Always `ExecCredential`
    pub kind: String,
    /// Token and expiry
    pub status: ExecCredentialStatus,
}

/// Status half of the `ExecCredential` envelope
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    /// When the credential stops being usable
    pub expiration_timestamp: String,
    /// The bearer token
    pub token: String,
}

/// Render the `client.authentication.k8s.io/v1beta1` ExecCredential JSON
/// for a token.
pub fn format_json(token: &Token) -> String {
    let cred = ExecCredential {
        api_version: "client.authentication.k8s.io/v1beta1".to_string(),
        kind: "ExecCredential".to_string(),
        status: ExecCredentialStatus {
            expiration_timestamp: token
                .expiration
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            token: token.token.clone(),
        },
    };
    // serialization of a plain struct cannot fail
    serde_json::to_string(&cred).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encode_decode_round_trip() {
        let url = "https://sts.aliyuncs.com/?Action=GetCallerIdentity";
        let token = encode(url, TokenVersion::V1);
        assert!(token.starts_with(V1_PREFIX));

        let (version, payload) = decode(&token).unwrap();
        assert_eq!(version, TokenVersion::V1);
        assert_eq!(payload, url.as_bytes());
    }

    #[test]
    fn decode_rejects_unknown_prefix() {
        let err = decode("k8s-aws-v1.aGVsbG8=").unwrap_err();
        assert!(err.to_string().contains("missing expected prefix"));
    }

    #[test]
    fn decode_rejects_oversize_tokens() {
        let token = format!("{}{}", V1_PREFIX, "A".repeat(MAX_TOKEN_LEN_BYTES));
        let err = decode(&token).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let err = decode("k8s-ack-v1.!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn decode_handles_v2_prefix() {
        let token = encode("{}", TokenVersion::V2);
        let (version, payload) = decode(&token).unwrap();
        assert_eq!(version, TokenVersion::V2);
        assert_eq!(payload, b"{}");
    }

    #[test]
    fn format_json_is_an_exec_credential() {
        let token = Token {
            token: "k8s-ack-v1.abc".into(),
            expiration: Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap(),
        };
        let rendered = format_json(&token);
        let parsed: ExecCredential = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.api_version, "client.authentication.k8s.io/v1beta1");
        assert_eq!(parsed.kind, "ExecCredential");
        assert_eq!(parsed.status.token, "k8s-ack-v1.abc");
        assert_eq!(parsed.status.expiration_timestamp, "2026-08-02T12:00:00Z");
    }
}
