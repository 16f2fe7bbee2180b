//! Token generation from ambient credentials
//!
//! Builds a presigned `sts:GetCallerIdentity` request bound to a cluster id
//! and encodes it as a v1 bearer token. When an assume-role ARN is supplied
//! the ambient credentials are first exchanged for role credentials via
//! `sts:AssumeRole`, and the presigned request is signed with those.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::warn;
use uuid::Uuid;

use crate::credentials::{CredentialProvider, Credentials};
use crate::token::{
    encode, Token, TokenVersion, DEFAULT_STS_ENDPOINT, PRESIGNED_URL_EXPIRATION_MINUTES,
    STS_API_VERSION, STS_SIGN_VERSION, TIMESTAMP_FORMAT,
};
use crate::{Error, Result};

/// Safety margin subtracted from the presigned-URL validity window
const TOKEN_EXPIRATION_MARGIN_MINUTES: i64 = 1;

/// Session-name prefix for assume-role exchanges
const ROLE_SESSION_NAME: &str = "ack-ram-authenticator";

/// Seconds the assumed credentials are requested for
const ASSUME_ROLE_DURATION_SECS: &str = "3600";

pub(crate) const USER_AGENT: &str = concat!("ack-ram-authenticator/", env!("CARGO_PKG_VERSION"));

/// Options controlling token generation
#[derive(Clone, Debug, Default)]
pub struct GetTokenOptions {
    /// Cluster the token is bound to (required, non-empty)
    pub cluster_id: String,
    /// Region selecting the `sts-vpc` endpoint for the AssumeRole exchange
    pub region: Option<String>,
    /// Role to assume before signing, if any
    pub assume_role_arn: Option<String>,
}

/// Provides new bearer tokens for the authenticator
pub struct Generator {
    provider: Arc<dyn CredentialProvider>,
    http: reqwest::Client,
}

impl Generator {
    /// Create a generator around a credential provider
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::credential(format!("failed to build http client: {e}")))?;
        Ok(Self { provider, http })
    }

    /// Get a token for `cluster_id` using the provider's credentials
    pub async fn get(&self, cluster_id: &str) -> Result<Token> {
        self.get_with_options(&GetTokenOptions {
            cluster_id: cluster_id.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Get a token by first assuming `role_arn`
    pub async fn get_with_role(&self, cluster_id: &str, role_arn: &str) -> Result<Token> {
        self.get_with_options(&GetTokenOptions {
            cluster_id: cluster_id.to_string(),
            assume_role_arn: Some(role_arn.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Get a token using explicit options
    pub async fn get_with_options(&self, options: &GetTokenOptions) -> Result<Token> {
        if options.cluster_id.is_empty() {
            return Err(Error::invalid_config("ClusterID is required"));
        }

        let mut credentials = self.provider.credentials().await?;

        if let Some(role_arn) = options.assume_role_arn.as_deref() {
            let endpoint = sts_endpoint(options.region.as_deref());
            credentials = self.assume_role(&endpoint, &credentials, role_arn).await?;
        }

        let now = Utc::now();
        let url = build_presigned_url(&credentials, &options.cluster_id, now, Uuid::new_v4());
        let expiration = now
            + Duration::minutes(PRESIGNED_URL_EXPIRATION_MINUTES - TOKEN_EXPIRATION_MARGIN_MINUTES);

        Ok(Token {
            token: encode(&url, TokenVersion::V1),
            expiration,
        })
    }

    /// Exchange `credentials` for temporary role credentials via
    /// `sts:AssumeRole` against `endpoint`.
    async fn assume_role(
        &self,
        endpoint: &str,
        credentials: &Credentials,
        role_arn: &str,
    ) -> Result<Credentials> {
        let now = Utc::now();
        let session_name = format!(
            "{ROLE_SESSION_NAME}-{}",
            now.timestamp_nanos_opt().unwrap_or_default()
        );

        let mut params = common_params(credentials, now, Uuid::new_v4());
        params.push(("Action".into(), "AssumeRole".into()));
        params.push(("RoleArn".into(), role_arn.to_string()));
        params.push(("RoleSessionName".into(), session_name));
        params.push(("DurationSeconds".into(), ASSUME_ROLE_DURATION_SECS.into()));

        let signature = sign_v1(&params, &credentials.access_key_secret);
        let query = assemble_query(&params, &signature);
        let base = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };
        let url = format!("{base}/?{query}");

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| Error::assume_role(format!("{role_arn}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::assume_role(format!("{role_arn}: reading response: {e}")))?;
        if !status.is_success() {
            warn!(role = %role_arn, status = %status, "AssumeRole rejected");
            return Err(Error::assume_role(format!(
                "{role_arn}: status {status}: {body}"
            )));
        }

        let parsed: AssumeRoleResponse = serde_json::from_str(&body)
            .map_err(|e| Error::assume_role(format!("{role_arn}: malformed response: {e}")))?;
        let creds = parsed.credentials;

        // STS reports when the assumed credentials lapse; a response we
        // cannot date is a response we cannot trust.
        DateTime::parse_from_rfc3339(&creds.expiration).map_err(|e| {
            Error::assume_role(format!(
                "failed to parse assumed credential expiration {:?}: {e}",
                creds.expiration
            ))
        })?;

        Ok(Credentials {
            access_key_id: creds.access_key_id,
            access_key_secret: creds.access_key_secret,
            security_token: Some(creds.security_token).filter(|t| !t.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResponse {
    #[serde(rename = "Credentials")]
    credentials: AssumedCredentials,
}

#[derive(Debug, Deserialize)]
struct AssumedCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "AccessKeySecret")]
    access_key_secret: String,
    #[serde(rename = "SecurityToken", default)]
    security_token: String,
    #[serde(rename = "Expiration", default)]
    expiration: String,
}

/// Resolve the STS endpoint for a region; no region means the public default
pub(crate) fn sts_endpoint(region: Option<&str>) -> String {
    match region {
        Some(r) if !r.is_empty() => format!("sts-vpc.{r}.aliyuncs.com"),
        _ => DEFAULT_STS_ENDPOINT.to_string(),
    }
}

/// Build the presigned `GetCallerIdentity` URL for `cluster_id`.
///
/// Pure function of its inputs so the construction is testable without a
/// clock or RNG.
pub(crate) fn build_presigned_url(
    credentials: &Credentials,
    cluster_id: &str,
    now: DateTime<Utc>,
    nonce: Uuid,
) -> String {
    let mut params = common_params(credentials, now, nonce);
    params.push(("Action".into(), "GetCallerIdentity".into()));
    params.push(("ClusterId".into(), cluster_id.to_string()));

    let signature = sign_v1(&params, &credentials.access_key_secret);
    let query = assemble_query(&params, &signature);
    format!("https://{DEFAULT_STS_ENDPOINT}/?{query}")
}

/// Query parameters shared by every v1-signed STS call
fn common_params(
    credentials: &Credentials,
    now: DateTime<Utc>,
    nonce: Uuid,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("SignatureVersion".into(), STS_SIGN_VERSION.into()),
        ("Format".into(), "JSON".into()),
        (
            "Timestamp".into(),
            now.format(TIMESTAMP_FORMAT).to_string(),
        ),
        (
            "AccessKeyId".into(),
            credentials.access_key_id.clone(),
        ),
        ("SignatureMethod".into(), "HMAC-SHA1".into()),
        ("Version".into(), STS_API_VERSION.into()),
        ("SignatureNonce".into(), nonce.to_string()),
    ];
    if let Some(token) = credentials.security_token.as_deref() {
        if !token.is_empty() {
            params.push(("SecurityToken".into(), token.to_string()));
        }
    }
    params
}

/// Percent-encode a single query component the way STS canonicalizes them
fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Compute the v1 signature over `params`.
///
/// The string to sign is `GET&%2F&<escaped sorted query>`; the key is the
/// access key secret with `&` appended; the digest is HMAC-SHA1, base64.
pub(crate) fn sign_v1(params: &[(String, String)], secret: &str) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in sorted {
        serializer.append_pair(key, value);
    }
    let canonical_query = serializer.finish();

    let string_to_sign = format!("GET&%2F&{}", query_escape(&canonical_query));

    let mut mac = Hmac::<Sha1>::new_from_slice(format!("{secret}&").as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(string_to_sign.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Assemble the final query string: the parameters in construction order
/// followed by the signature.
fn assemble_query(params: &[(String, String)], signature: &str) -> String {
    let mut query = String::new();
    for (key, value) in params {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(key);
        query.push('=');
        query.push_str(&query_escape(value));
    }
    format!("{query}&Signature={}", query_escape(signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticProvider;
    use crate::token::{decode, MAX_TOKEN_LEN_BYTES, V1_PREFIX};
    use chrono::TimeZone;

    fn creds() -> Credentials {
        Credentials {
            access_key_id: "LTAI5txxxxxxxxxxxxxxxxxx".into(),
            access_key_secret: "secret".into(),
            security_token: None,
        }
    }

    fn sts_creds() -> Credentials {
        Credentials {
            security_token: Some("sts-token+value/with=specials".into()),
            ..creds()
        }
    }

    #[test]
    fn presigned_url_carries_the_expected_parameters() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let nonce = Uuid::new_v4();
        let url = build_presigned_url(&creds(), "c123", now, nonce);

        let parsed = url::Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("sts.aliyuncs.com"));
        assert_eq!(parsed.path(), "/");

        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("Action").as_deref(), Some("GetCallerIdentity"));
        assert_eq!(get("ClusterId").as_deref(), Some("c123"));
        assert_eq!(get("AccessKeyId").as_deref(), Some("LTAI5txxxxxxxxxxxxxxxxxx"));
        assert_eq!(get("SignatureMethod").as_deref(), Some("HMAC-SHA1"));
        assert_eq!(get("SignatureVersion").as_deref(), Some("1.0"));
        assert_eq!(get("Version").as_deref(), Some("2015-04-01"));
        assert_eq!(get("Timestamp").as_deref(), Some("2026-08-02T12:00:00Z"));
        assert_eq!(get("SignatureNonce").as_deref(), Some(nonce.to_string().as_str()));

        // HMAC-SHA1 digests are 20 bytes, so the base64 signature is 28
        let signature = get("Signature").unwrap();
        assert_eq!(signature.len(), 28);
    }

    #[test]
    fn security_token_is_included_and_survives_escaping() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let url = build_presigned_url(&sts_creds(), "c123", now, Uuid::new_v4());
        let parsed = url::Url::parse(&url).unwrap();
        let token = parsed
            .query_pairs()
            .find(|(k, _)| k == "SecurityToken")
            .map(|(_, v)| v.into_owned());
        assert_eq!(token.as_deref(), Some("sts-token+value/with=specials"));
    }

    #[test]
    fn signing_is_deterministic_and_order_independent() {
        let params = vec![
            ("Action".to_string(), "GetCallerIdentity".to_string()),
            ("ClusterId".to_string(), "c123".to_string()),
        ];
        let reversed: Vec<(String, String)> = params.iter().rev().cloned().collect();
        assert_eq!(sign_v1(&params, "secret"), sign_v1(&reversed, "secret"));
        assert_ne!(sign_v1(&params, "secret"), sign_v1(&params, "other"));
    }

    #[tokio::test]
    async fn generated_token_fits_the_wire_limit() {
        let generator = Generator::new(Arc::new(StaticProvider::new(sts_creds()))).unwrap();
        let token = generator.get("c123").await.unwrap();

        assert!(token.token.len() <= MAX_TOKEN_LEN_BYTES);
        assert!(token.token.starts_with(V1_PREFIX));

        let (_, payload) = decode(&token.token).unwrap();
        let url = String::from_utf8(payload).unwrap();
        assert!(url.starts_with("https://sts.aliyuncs.com/?"));

        // one minute of cushion under the 15-minute presigned validity
        let remaining = token.expiration - Utc::now();
        assert!(remaining <= Duration::minutes(14));
        assert!(remaining > Duration::minutes(13));
    }

    #[tokio::test]
    async fn empty_cluster_id_is_rejected() {
        let generator = Generator::new(Arc::new(StaticProvider::new(creds()))).unwrap();
        let err = generator.get("").await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn assume_role_uses_exchanged_credentials() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{
            "RequestId": "1",
            "Credentials": {
                "AccessKeyId": "STS.assumed",
                "AccessKeySecret": "assumed-secret",
                "SecurityToken": "assumed-token",
                "Expiration": "2030-01-01T00:00:00Z"
            }
        }"#;
        let mock = server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Regex("Action=AssumeRole".into()))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let generator = Generator::new(Arc::new(StaticProvider::new(creds()))).unwrap();
        let assumed = generator
            .assume_role(&server.url(), &creds(), "acs:ram::111122223333:role/ops")
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(assumed.access_key_id, "STS.assumed");
        assert_eq!(assumed.security_token.as_deref(), Some("assumed-token"));
    }

    #[tokio::test]
    async fn assume_role_rejects_malformed_expiration() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{
            "Credentials": {
                "AccessKeyId": "STS.assumed",
                "AccessKeySecret": "assumed-secret",
                "SecurityToken": "t",
                "Expiration": "not-a-time"
            }
        }"#;
        server
            .mock("GET", "/")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let generator = Generator::new(Arc::new(StaticProvider::new(creds()))).unwrap();
        let err = generator
            .assume_role(&server.url(), &creds(), "acs:ram::111122223333:role/ops")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AssumeRole(_)));
        assert!(err.to_string().contains("expiration"));
    }
}
