//! Cloud credential resolution
//!
//! The token generator consumes a [`CredentialProvider`] capability rather
//! than a process-wide singleton, so tests and callers can inject whatever
//! chain they need. Shipped providers: explicit static credentials, the
//! `ALIBABA_CLOUD_*` environment, the `~/.acs/credentials` profile file, and
//! a short-lived file-cache decorator around any of them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Environment variable selecting the credentials profile
pub const CREDENTIALS_PROFILE_ENV: &str = "ALIBABA_CLOUD_CREDENTIALS_PROFILE";

const ACCESS_KEY_ID_ENV: &str = "ALIBABA_CLOUD_ACCESS_KEY_ID";
const ACCESS_KEY_SECRET_ENV: &str = "ALIBABA_CLOUD_ACCESS_KEY_SECRET";
const SECURITY_TOKEN_ENV: &str = "ALIBABA_CLOUD_SECURITY_TOKEN";

/// Default lifetime of a file-cached credential entry
const DEFAULT_CACHE_TTL_MINUTES: i64 = 10;

/// A set of RAM credentials
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Credentials {
    /// Access key id
    pub access_key_id: String,
    /// Access key secret used for request signing
    pub access_key_secret: String,
    /// STS security token, present for temporary credentials
    #[serde(default)]
    pub security_token: Option<String>,
}

/// Capability that yields RAM credentials and handles its own renewal
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve a currently-valid set of credentials
    async fn credentials(&self) -> Result<Credentials>;
}

/// Provider returning a fixed set of credentials
pub struct StaticProvider(Credentials);

impl StaticProvider {
    /// Wrap explicit credentials
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Provider reading the `ALIBABA_CLOUD_*` environment variables
#[derive(Default)]
pub struct EnvProvider;

#[async_trait]
impl CredentialProvider for EnvProvider {
    async fn credentials(&self) -> Result<Credentials> {
        let access_key_id = std::env::var(ACCESS_KEY_ID_ENV)
            .map_err(|_| Error::credential(format!("{ACCESS_KEY_ID_ENV} is not set")))?;
        let access_key_secret = std::env::var(ACCESS_KEY_SECRET_ENV)
            .map_err(|_| Error::credential(format!("{ACCESS_KEY_SECRET_ENV} is not set")))?;
        if access_key_id.is_empty() || access_key_secret.is_empty() {
            return Err(Error::credential("empty credentials in environment"));
        }
        Ok(Credentials {
            access_key_id,
            access_key_secret,
            security_token: std::env::var(SECURITY_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
        })
    }
}

/// On-disk shape of `~/.acs/credentials`
#[derive(Debug, Default, Deserialize, Serialize)]
struct AcsCredentials {
    #[serde(rename = "AcsAccessKeyId", default)]
    access_key_id: String,
    #[serde(rename = "AcsAccessKeySecret", default)]
    access_key_secret: String,
    #[serde(rename = "AcsAccessSecurityToken", default)]
    security_token: String,
}

/// Provider reading the `~/.acs/credentials` profile file
pub struct ProfileProvider {
    path: PathBuf,
    profile: String,
}

impl ProfileProvider {
    /// Provider for the profile named by `ALIBABA_CLOUD_CREDENTIALS_PROFILE`
    /// (default `"default"`), reading `~/.acs/credentials`.
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::credential("could not determine home directory"))?;
        Ok(Self {
            path: home.join(".acs").join("credentials"),
            profile: current_profile(),
        })
    }

    /// Provider reading an explicit path (used by tests)
    pub fn with_path(path: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            profile: profile.into(),
        }
    }

    /// The profile this provider resolves
    pub fn profile(&self) -> &str {
        &self.profile
    }
}

/// The active credentials profile name, from the environment or `"default"`
pub fn current_profile() -> String {
    std::env::var(CREDENTIALS_PROFILE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

#[async_trait]
impl CredentialProvider for ProfileProvider {
    async fn credentials(&self) -> Result<Credentials> {
        let loaded: Option<AcsCredentials> = load_json(&self.path);
        let creds = loaded.ok_or_else(|| {
            Error::credential(format!(
                "no usable credentials in {} for profile {:?}",
                self.path.display(),
                self.profile
            ))
        })?;
        if creds.access_key_id.is_empty() || creds.access_key_secret.is_empty() {
            return Err(Error::credential(format!(
                "incomplete credentials in {}",
                self.path.display()
            )));
        }
        Ok(Credentials {
            access_key_id: creds.access_key_id,
            access_key_secret: creds.access_key_secret,
            security_token: Some(creds.security_token).filter(|t| !t.is_empty()),
        })
    }
}

/// Load a JSON file, treating I/O and parse failures as "no content".
///
/// Callers must handle `None` as a valid outcome.
fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Provider trying a list of providers in order, first success wins
pub struct ChainProvider {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainProvider {
    /// Chain explicit providers
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// The default resolution chain: environment, then the profile file
    pub fn default_chain() -> Result<Self> {
        Ok(Self::new(vec![
            Arc::new(EnvProvider),
            Arc::new(ProfileProvider::from_env()?),
        ]))
    }
}

#[async_trait]
impl CredentialProvider for ChainProvider {
    async fn credentials(&self) -> Result<Credentials> {
        let mut last = Error::credential("no credential providers configured");
        for provider in &self.providers {
            match provider.credentials().await {
                Ok(credentials) => return Ok(credentials),
                Err(e) => {
                    debug!(error = %e, "credential provider missed, trying next");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CachedEntry {
    credentials: Credentials,
    expiration: DateTime<Utc>,
}

/// Short-lived file cache around another provider.
///
/// Entries are keyed by cluster id + profile + assumed role so different
/// invocations never share credentials. Unreadable or stale cache files fall
/// through to the inner provider.
pub struct FileCacheProvider {
    inner: Arc<dyn CredentialProvider>,
    cache_path: PathBuf,
    ttl: Duration,
}

impl FileCacheProvider {
    /// Wrap `inner` with a cache under `~/.acs/ack-ram-authenticator/`
    pub fn new(
        inner: Arc<dyn CredentialProvider>,
        cluster_id: &str,
        profile: &str,
        role_arn: Option<&str>,
    ) -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::credential("could not determine home directory"))?;
        let dir = home.join(".acs").join("ack-ram-authenticator");
        Ok(Self::with_dir(inner, dir, cluster_id, profile, role_arn))
    }

    /// Wrap `inner` with a cache rooted at an explicit directory
    pub fn with_dir(
        inner: Arc<dyn CredentialProvider>,
        dir: PathBuf,
        cluster_id: &str,
        profile: &str,
        role_arn: Option<&str>,
    ) -> Self {
        let role_key = role_arn.unwrap_or("none").replace(['/', ':'], "_");
        let file = format!("cache-{cluster_id}-{profile}-{role_key}.json");
        Self {
            inner,
            cache_path: dir.join(file),
            ttl: Duration::minutes(DEFAULT_CACHE_TTL_MINUTES),
        }
    }

    fn read_fresh(&self) -> Option<Credentials> {
        let entry: CachedEntry = load_json(&self.cache_path)?;
        if entry.expiration <= Utc::now() {
            return None;
        }
        Some(entry.credentials)
    }

    fn write(&self, credentials: &Credentials) {
        let entry = CachedEntry {
            credentials: credentials.clone(),
            expiration: Utc::now() + self.ttl,
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.cache_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = serde_json::to_vec(&entry)?;
            std::fs::write(&self.cache_path, data)
        };
        if let Err(e) = write() {
            debug!(path = %self.cache_path.display(), error = %e, "unable to persist credential cache");
        }
    }
}

#[async_trait]
impl CredentialProvider for FileCacheProvider {
    async fn credentials(&self) -> Result<Credentials> {
        if let Some(cached) = self.read_fresh() {
            debug!(path = %self.cache_path.display(), "using cached credentials");
            return Ok(cached);
        }
        let fresh = self.inner.credentials().await?;
        self.write(&fresh);
        Ok(fresh)
    }
}
