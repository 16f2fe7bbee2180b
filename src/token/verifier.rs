//! Token verification against a trusted STS endpoint
//!
//! Verification is a fixed pipeline with no state between calls:
//! parse, validate, rewrite host, replay, extract identity, canonicalize.
//! The signature of a presigned request covers only its query parameters,
//! so the verifier is free to swap the host for its own trusted endpoint.
//! That rewrite is what defeats tokens trying to point the verifier at an
//! attacker-controlled server.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::arn::canonicalize;
use crate::token::generator::sts_endpoint;
use crate::token::{decode, Identity, TokenVersion};
use crate::{Error, Result};

/// Pattern a v1 token's host must match before the rewrite
const HOST_PATTERN: &str = r"^sts(\.[a-z1-9\-]+)?\.aliyuncs\.com(\.cn)?$";

/// Environment variable bounding the idle connection pool
const MAX_IDLE_CONNS_ENV: &str = "STS_MAX_IDLE_CONNS_PER_HOST";
const DEFAULT_MAX_IDLE_CONNS: usize = 5;

const USER_AGENT_V1: &str = concat!("ack-ram-authenticator/v1/", env!("CARGO_PKG_VERSION"));
const USER_AGENT_V2: &str = concat!("ack-ram-authenticator/v2/", env!("CARGO_PKG_VERSION"));

/// Query parameters (lower-cased) a token may carry
const ALLOWED_PARAMS: &[&str] = &[
    "action",
    "durationseconds",
    "signatureversion",
    "signaturenonce",
    "signaturemethod",
    "accesskeyid",
    "timestamp",
    "signature",
    "format",
    "version",
    "rolesessionname",
    "rolearn",
    "securitytoken",
    "clusterid",
    // v2
    "x-acs-action",
    "x-acs-version",
    "authorization",
    "x-acs-signature-nonce",
    "x-acs-date",
    "x-acs-content-sha256",
    "x-acs-content-sm3",
    "x-acs-security-token",
    "ackclusterid",
];

/// Validates bearer tokens by replaying them against STS
pub struct Verifier {
    http: reqwest::Client,
    cluster_id: String,
    /// Trusted replay base, scheme included (`https://sts.aliyuncs.com`)
    sts_base: String,
    host_pattern: Regex,
}

/// A parsed, validated, host-rewritten request ready for replay
#[derive(Debug)]
struct ParsedRequest {
    url: Url,
    headers: Vec<(String, String)>,
    access_key_id: String,
    user_agent: &'static str,
}

impl Verifier {
    /// Create a verifier bound to `cluster_id`, replaying against the STS
    /// endpoint for `region` (the public endpoint when region is empty).
    pub fn new(region: Option<&str>, cluster_id: &str) -> Result<Self> {
        Self::with_endpoint(cluster_id, &sts_endpoint(region))
    }

    /// Create a verifier replaying against an explicit endpoint. The
    /// endpoint may carry a scheme; plain authorities default to https.
    pub fn with_endpoint(cluster_id: &str, endpoint: &str) -> Result<Self> {
        if cluster_id.is_empty() {
            return Err(Error::invalid_config("clusterID is required"));
        }

        let max_idle = std::env::var(MAX_IDLE_CONNS_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 1)
            .unwrap_or(DEFAULT_MAX_IDLE_CONNS);
        debug!(max_idle, "sts idle connection pool size");

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(max_idle)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::sts(format!("failed to build http client: {e}")))?;

        let sts_base = if endpoint.contains("://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{endpoint}")
        };

        Ok(Self {
            http,
            cluster_id: cluster_id.to_string(),
            sts_base,
            host_pattern: Regex::new(HOST_PATTERN).expect("host pattern compiles"),
        })
    }

    /// Verify a token. On success returns the RAM identity that created it.
    pub async fn verify(&self, token: &str) -> Result<Identity> {
        let (version, payload) = decode(token)?;
        let payload = String::from_utf8(payload)
            .map_err(|_| Error::format("token payload is not valid utf-8"))?;

        let parsed = match version {
            TokenVersion::V1 => self.parse_v1(&payload)?,
            TokenVersion::V2 => self.parse_v2(&payload)?,
        };

        let mut request = self
            .http
            .get(parsed.url.clone())
            .header("accept", "application/json")
            .header("user-agent", parsed.user_agent);
        for (key, value) in &parsed.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "error during GET to sts");
            Error::sts(e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::sts(format!("error reading http result: {e}")))?;
        if status != 200 {
            error!(status, "error from sts (expected 200)");
            return Err(Error::sts_response(status, Some(body)));
        }

        extract_identity(&parsed.access_key_id, &body)
    }

    /// Parse and validate a v1 presigned-URL payload, returning the
    /// host-rewritten request. Pure with respect to the network.
    fn parse_v1(&self, payload: &str) -> Result<ParsedRequest> {
        let parsed = Url::parse(payload).map_err(|e| Error::format(e.to_string()))?;

        if parsed.scheme() != "https" {
            return Err(Error::format(format!(
                "unexpected scheme {:?} in pre-signed URL",
                parsed.scheme()
            )));
        }

        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), None) => host.to_string(),
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (None, _) => return Err(Error::format("missing host in pre-signed URL")),
        };
        if !self.host_pattern.is_match(&host) {
            return Err(Error::format(format!(
                "unexpected hostname {host:?} in pre-signed URL"
            )));
        }

        if parsed.path() != "/" {
            return Err(Error::format("unexpected path in pre-signed URL"));
        }

        let params = validated_params(parsed.query_pairs().map(|(k, v)| {
            (k.into_owned(), v.into_owned())
        }))?;

        if params.get("action").map(String::as_str) != Some("GetCallerIdentity") {
            return Err(Error::format("unexpected action parameter in pre-signed URL"));
        }
        self.check_cluster_id(params.get("clusterid").map(String::as_str))?;

        let access_key_id = params.get("accesskeyid").cloned().unwrap_or_default();

        // Rewrite the host to the trusted endpoint, keeping the original
        // (still percent-encoded) query untouched so the signature holds.
        let rewritten = Url::parse(&format!(
            "{}/?{}",
            self.sts_base,
            parsed.query().unwrap_or_default()
        ))
        .map_err(|e| Error::format(e.to_string()))?;

        Ok(ParsedRequest {
            url: rewritten,
            headers: Vec::new(),
            access_key_id,
            user_agent: USER_AGENT_V1,
        })
    }

    /// Parse and validate a v2 request-envelope payload.
    ///
    /// v2 tokens carry their signature in an `Authorization` header rather
    /// than a query parameter. Validation here is structural; the replay to
    /// STS is what decides whether the signature itself holds.
    fn parse_v2(&self, payload: &str) -> Result<ParsedRequest> {
        let envelope: V2Envelope =
            serde_json::from_str(payload).map_err(|e| Error::format(e.to_string()))?;

        if !envelope.method.is_empty() && envelope.method != "GET" {
            return Err(Error::format(format!(
                "unexpected method {:?} in signed request",
                envelope.method
            )));
        }
        if envelope.path != "/" {
            return Err(Error::format("unexpected path in signed request"));
        }
        if let Some(host) = &envelope.host {
            if !self.host_pattern.is_match(host) {
                return Err(Error::format(format!(
                    "unexpected hostname {host:?} in signed request"
                )));
            }
        }

        let query = validated_params(envelope.query.iter().map(|(k, v)| (k.clone(), v.clone())))?;
        let headers = validated_params(
            envelope.headers.iter().map(|(k, v)| (k.clone(), v.clone())),
        )?;

        if headers.get("x-acs-action").map(String::as_str) != Some("GetCallerIdentity") {
            return Err(Error::format("unexpected action in signed request"));
        }
        let cluster = query
            .get("ackclusterid")
            .or_else(|| headers.get("ackclusterid"))
            .map(String::as_str);
        self.check_cluster_id(cluster)?;

        let authorization = headers
            .get("authorization")
            .ok_or_else(|| Error::format("missing authorization header in signed request"))?;
        let access_key_id = access_key_from_authorization(authorization)?;

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &envelope.query {
            serializer.append_pair(key, value);
        }
        let url = Url::parse(&format!("{}/?{}", self.sts_base, serializer.finish()))
            .map_err(|e| Error::format(e.to_string()))?;

        Ok(ParsedRequest {
            url,
            headers: envelope
                .headers
                .into_iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("host"))
                .collect(),
            access_key_id,
            user_agent: USER_AGENT_V2,
        })
    }

    fn check_cluster_id(&self, cluster_id: Option<&str>) -> Result<()> {
        let cluster_id = cluster_id.unwrap_or_default();
        if cluster_id != self.cluster_id {
            return Err(Error::format(format!(
                "unexpected clusterid {cluster_id} in token"
            )));
        }
        Ok(())
    }
}

/// On-the-wire shape of a v2 token payload
#[derive(Debug, Deserialize)]
struct V2Envelope {
    #[serde(default)]
    method: String,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    query: Vec<(String, String)>,
}

fn default_path() -> String {
    "/".to_string()
}

/// Check every key against the allow-list and collapse to a lower-cased
/// map, rejecting keys that appear more than once.
fn validated_params(
    pairs: impl Iterator<Item = (String, String)>,
) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for (key, value) in pairs {
        let lower = key.to_lowercase();
        if !ALLOWED_PARAMS.contains(&lower.as_str()) {
            return Err(Error::format(format!(
                "non-whitelisted query parameter {key:?}"
            )));
        }
        if params.insert(lower, value).is_some() {
            return Err(Error::format(
                "query parameter with multiple values not supported",
            ));
        }
    }
    Ok(params)
}

/// Pull the access key id out of an ACS3-style authorization header
/// (`ACS3-HMAC-SHA256 Credential=<key>,SignedHeaders=...,Signature=...`).
fn access_key_from_authorization(authorization: &str) -> Result<String> {
    let credential = authorization
        .split([' ', ','])
        .find_map(|part| part.trim().strip_prefix("Credential="))
        .ok_or_else(|| Error::format("authorization header missing Credential"))?;
    let access_key = credential.split('/').next().unwrap_or_default();
    if access_key.is_empty() {
        return Err(Error::format("authorization header missing access key"));
    }
    Ok(access_key.to_string())
}

/// Response body of `sts:GetCallerIdentity`
#[derive(Debug, Default, Deserialize)]
struct CallerIdentity {
    #[serde(rename = "AccountId", default)]
    account_id: String,
    #[serde(rename = "Arn", default)]
    arn: String,
    #[serde(rename = "PrincipalId", default)]
    principal_id: String,
    #[serde(rename = "UserId", default)]
    #[allow(dead_code)]
    user_id: String,
    #[serde(rename = "RoleId", default)]
    #[allow(dead_code)]
    role_id: String,
    #[serde(rename = "IdentityType", default)]
    #[allow(dead_code)]
    identity_type: String,
}

/// Build the verified identity from the replayed response body.
///
/// `PrincipalId` is either `<userId>:<sessionName>` for assumed roles or a
/// bare `<userId>` for RAM users.
fn extract_identity(access_key_id: &str, body: &str) -> Result<Identity> {
    let caller: CallerIdentity =
        serde_json::from_str(body).map_err(|e| Error::sts(e.to_string()))?;

    // mapping lookups key on the lower-cased canonical form, so the
    // verifier hands it out that way
    let canonical_arn = canonicalize(&caller.arn)
        .map_err(|e| Error::sts(format!("invalid arn in sts response: {e}")))?
        .to_lowercase();

    let parts: Vec<&str> = caller.principal_id.split(':').collect();
    let (user_id, session_name) = match parts.as_slice() {
        [user_id] => (user_id.to_string(), String::new()),
        [user_id, session] => (user_id.to_string(), session.to_string()),
        _ => {
            return Err(Error::sts(format!(
                "malformed PrincipalId {:?}",
                caller.principal_id
            )))
        }
    };

    Ok(Identity {
        arn: caller.arn,
        canonical_arn,
        account_id: caller.account_id,
        user_id,
        session_name,
        access_key_id: access_key_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, StaticProvider};
    use crate::token::generator::Generator;
    use crate::token::{encode, TokenVersion};
    use std::sync::Arc;

    const ACCESS_KEY: &str = "LTAI5txxxxxxxxxxxxxxxxxx";

    fn verifier(cluster_id: &str) -> Verifier {
        Verifier::with_endpoint(cluster_id, "sts.aliyuncs.com").unwrap()
    }

    async fn generate(cluster_id: &str) -> String {
        let provider = Arc::new(StaticProvider::new(Credentials {
            access_key_id: ACCESS_KEY.into(),
            access_key_secret: "secret".into(),
            security_token: None,
        }));
        Generator::new(provider)
            .unwrap()
            .get(cluster_id)
            .await
            .unwrap()
            .token
    }

    #[tokio::test]
    async fn happy_v1_verify_against_mock_sts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Regex("Action=GetCallerIdentity".into()))
            .with_status(200)
            .with_body(
                r#"{"Arn":"acs:ram::111122223333:role/Admin/sess1",
                    "AccountId":"111122223333",
                    "PrincipalId":"33333:sess1",
                    "IdentityType":"AssumedRoleUser"}"#,
            )
            .create_async()
            .await;

        let token = generate("c123").await;
        let verifier = Verifier::with_endpoint("c123", &server.url()).unwrap();
        let identity = verifier.verify(&token).await.unwrap();

        assert_eq!(identity.account_id, "111122223333");
        assert_eq!(identity.user_id, "33333");
        assert_eq!(identity.session_name, "sess1");
        assert_eq!(identity.access_key_id, ACCESS_KEY);
        assert_eq!(identity.canonical_arn, "acs:ram::111122223333:role/admin");
    }

    #[tokio::test]
    async fn cluster_mismatch_is_a_format_error() {
        let token = generate("c123").await;
        let err = verifier("c999").verify(&token).await.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("unexpected clusterid c123 in token"));
    }

    #[test]
    fn spoofed_host_is_rejected() {
        let url =
            "https://sts.evil.aliyuncs.com.cn.attacker.tld/?Action=GetCallerIdentity&ClusterId=c123";
        let err = verifier("c123").parse_v1(url).unwrap_err();
        assert!(err.to_string().contains("unexpected hostname"));
    }

    #[test]
    fn regional_host_is_accepted_and_rewritten() {
        let url = "https://sts.cn-hangzhou.aliyuncs.com/?Action=GetCallerIdentity&ClusterId=c123&AccessKeyId=LTAI5t";
        let parsed = verifier("c123").parse_v1(url).unwrap();
        assert_eq!(parsed.url.host_str(), Some("sts.aliyuncs.com"));
        assert_eq!(parsed.access_key_id, "LTAI5t");
    }

    #[test]
    fn cn_suffix_host_is_accepted() {
        let url = "https://sts.aliyuncs.com.cn/?Action=GetCallerIdentity&ClusterId=c123";
        assert!(verifier("c123").parse_v1(url).is_ok());
    }

    #[test]
    fn non_whitelisted_parameter_is_rejected() {
        let url = "https://sts.aliyuncs.com/?Action=GetCallerIdentity&ClusterId=c123&Attack=1";
        let err = verifier("c123").parse_v1(url).unwrap_err();
        assert!(err
            .to_string()
            .contains("non-whitelisted query parameter \"Attack\""));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let url = "https://sts.aliyuncs.com/?Action=GetCallerIdentity&Action=GetCallerIdentity&ClusterId=c123";
        let err = verifier("c123").parse_v1(url).unwrap_err();
        assert!(err.to_string().contains("multiple values"));
    }

    #[test]
    fn plain_http_scheme_is_rejected() {
        let url = "http://sts.aliyuncs.com/?Action=GetCallerIdentity&ClusterId=c123";
        let err = verifier("c123").parse_v1(url).unwrap_err();
        assert!(err.to_string().contains("unexpected scheme"));
    }

    #[test]
    fn non_root_path_is_rejected() {
        let url = "https://sts.aliyuncs.com/admin?Action=GetCallerIdentity&ClusterId=c123";
        let err = verifier("c123").parse_v1(url).unwrap_err();
        assert!(err.to_string().contains("unexpected path"));
    }

    #[test]
    fn wrong_action_is_rejected() {
        let url = "https://sts.aliyuncs.com/?Action=AssumeRole&ClusterId=c123";
        let err = verifier("c123").parse_v1(url).unwrap_err();
        assert!(err.to_string().contains("unexpected action"));
    }

    #[tokio::test]
    async fn sts_failure_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Any)
            .with_status(403)
            .with_body("signature does not match")
            .create_async()
            .await;

        let token = generate("c123").await;
        let verifier = Verifier::with_endpoint("c123", &server.url()).unwrap();
        let err = verifier.verify(&token).await.unwrap_err();
        match err {
            Error::Sts {
                status,
                body,
                raise_to_user,
                ..
            } => {
                assert_eq!(status, Some(403));
                assert_eq!(body.as_deref(), Some("signature does not match"));
                assert!(raise_to_user);
            }
            other => panic!("expected Sts error, got {other:?}"),
        }
    }

    #[test]
    fn extract_identity_splits_principal_id() {
        let body = r#"{"Arn":"acs:ram::111122223333:user/alice",
                       "AccountId":"111122223333",
                       "PrincipalId":"2777"}"#;
        let id = extract_identity("LTAI5t", body).unwrap();
        assert_eq!(id.user_id, "2777");
        assert_eq!(id.session_name, "");

        let body = r#"{"Arn":"acs:sts::111122223333:assumed-role/Admin/s",
                       "AccountId":"111122223333",
                       "PrincipalId":"33333:s"}"#;
        let id = extract_identity("LTAI5t", body).unwrap();
        assert_eq!(id.user_id, "33333");
        assert_eq!(id.session_name, "s");

        let body = r#"{"Arn":"acs:ram::111122223333:user/alice",
                       "AccountId":"111122223333",
                       "PrincipalId":"a:b:c"}"#;
        let err = extract_identity("LTAI5t", body).unwrap_err();
        assert!(err.to_string().contains("malformed PrincipalId"));
    }

    #[test]
    fn extract_identity_requires_a_valid_arn() {
        let body = r#"{"Arn":"not-an-arn","AccountId":"1","PrincipalId":"2"}"#;
        assert!(extract_identity("k", body).is_err());
    }

    fn v2_payload(cluster_id: &str) -> String {
        serde_json::json!({
            "method": "GET",
            "path": "/",
            "host": "sts.cn-hangzhou.aliyuncs.com",
            "headers": [
                ["authorization",
                 "ACS3-HMAC-SHA256 Credential=LTAI5tv2key,SignedHeaders=x-acs-date,Signature=abc"],
                ["x-acs-action", "GetCallerIdentity"],
                ["x-acs-version", "2015-04-01"],
                ["x-acs-date", "2026-08-02T12:00:00Z"]
            ],
            "query": [["AckClusterId", cluster_id]]
        })
        .to_string()
    }

    #[test]
    fn v2_envelope_parses_and_extracts_access_key() {
        let parsed = verifier("c123").parse_v2(&v2_payload("c123")).unwrap();
        assert_eq!(parsed.access_key_id, "LTAI5tv2key");
        assert_eq!(parsed.url.host_str(), Some("sts.aliyuncs.com"));
        assert!(parsed
            .headers
            .iter()
            .any(|(k, _)| k == "x-acs-action"));
    }

    #[test]
    fn v2_envelope_enforces_cluster_binding() {
        let err = verifier("c999").parse_v2(&v2_payload("c123")).unwrap_err();
        assert!(err.to_string().contains("unexpected clusterid c123"));
    }

    #[test]
    fn v2_envelope_rejects_unknown_headers() {
        let payload = serde_json::json!({
            "path": "/",
            "headers": [["x-evil-header", "1"],
                        ["authorization", "Credential=LTAI5t"],
                        ["x-acs-action", "GetCallerIdentity"]],
            "query": [["AckClusterId", "c123"]]
        })
        .to_string();
        let err = verifier("c123").parse_v2(&payload).unwrap_err();
        assert!(err.to_string().contains("non-whitelisted"));
    }

    #[tokio::test]
    async fn verify_round_trip_recovers_generator_access_key() {
        // the codec + parse pipeline must hand back the signing key id even
        // before any network call happens
        let token = generate("c123").await;
        let (_, payload) = crate::token::decode(&token).unwrap();
        let parsed = verifier("c123")
            .parse_v1(std::str::from_utf8(&payload).unwrap())
            .unwrap();
        assert_eq!(parsed.access_key_id, ACCESS_KEY);
    }

    #[test]
    fn garbage_payload_is_a_format_error() {
        let token = encode("not a url at all", TokenVersion::V1);
        let (_, payload) = crate::token::decode(&token).unwrap();
        let err = verifier("c123")
            .parse_v1(std::str::from_utf8(&payload).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
