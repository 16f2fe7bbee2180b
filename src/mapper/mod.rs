//! Identity mapping backends
//!
//! A mapper resolves a canonical RAM ARN to a Kubernetes username + groups.
//! Three backends exist: the static config snapshot ([`file`]), the
//! hot-reloaded JSON file ([`dynamicfile`]), and the RAMIdentityMapping
//! custom-resource stream ([`crd`]). The [`AggregateMapper`] composes them
//! in lookup order; the first hit wins.
//!
//! Every backend serves lookups from an internally-consistent snapshot:
//! a concurrent reader sees either the old state or the new one, never a
//! half-applied reload.

pub mod crd;
pub mod dynamicfile;
pub mod file;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

use crate::arn::canonicalize;
use crate::config::{IdentityMapping, RoleMapping, UserMapping};
use crate::{Error, Result};

/// Capability shared by every mapping backend
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Backend name, for logs and config
    fn name(&self) -> &'static str;

    /// Start background work (watchers, controllers). Returns once the
    /// backend is ready to serve lookups; `stop` unwinds it.
    async fn start(self: Arc<Self>, stop: watch::Receiver<bool>) -> Result<()>;

    /// Resolve a canonical ARN, or `Err(NotMapped)`
    fn map(&self, canonical_arn: &str) -> Result<IdentityMapping>;

    /// Whether principals of this account are admitted without an explicit
    /// mapping
    fn is_account_allowed(&self, account_id: &str) -> bool;
}

/// Immutable `{users, roles, accounts}` snapshot served by the file-backed
/// mappers. Keys are lower-cased canonical ARNs.
#[derive(Debug, Default)]
pub(crate) struct MapStore {
    users: HashMap<String, UserMapping>,
    roles: HashMap<String, RoleMapping>,
    accounts: HashSet<String>,
}

impl MapStore {
    /// Build a snapshot, canonicalizing and lower-casing every key.
    /// Records whose ARN does not parse are dropped with a warning.
    pub(crate) fn build(
        users: &[UserMapping],
        roles: &[RoleMapping],
        accounts: &[String],
    ) -> Self {
        let mut store = Self::default();
        for user in users {
            match canonicalize(&user.user_arn.to_lowercase()) {
                Ok(key) => {
                    store.users.insert(key, user.clone());
                }
                Err(e) => warn!(arn = %user.user_arn, error = %e, "dropping unparseable user mapping"),
            }
        }
        for role in roles {
            match canonicalize(&role.role_arn.to_lowercase()) {
                Ok(key) => {
                    store.roles.insert(key, role.clone());
                }
                Err(e) => warn!(arn = %role.role_arn, error = %e, "dropping unparseable role mapping"),
            }
        }
        store.accounts = accounts.iter().cloned().collect();
        store
    }

    /// Exact-match lookup, users before roles
    pub(crate) fn lookup(&self, canonical_arn: &str) -> Option<IdentityMapping> {
        let key = canonical_arn.to_lowercase();
        if let Some(user) = self.users.get(&key) {
            return Some(IdentityMapping {
                identity_arn: key,
                username: user.username.clone(),
                groups: user.groups.clone(),
            });
        }
        if let Some(role) = self.roles.get(&key) {
            return Some(IdentityMapping {
                identity_arn: key,
                username: role.username.clone(),
                groups: role.groups.clone(),
            });
        }
        None
    }

    pub(crate) fn is_account_allowed(&self, account_id: &str) -> bool {
        self.accounts.contains(account_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> (usize, usize, usize) {
        (self.users.len(), self.roles.len(), self.accounts.len())
    }
}

/// Ordered composition of mapping backends
pub struct AggregateMapper {
    mappers: Vec<Arc<dyn Mapper>>,
}

impl AggregateMapper {
    /// Compose `mappers` in lookup order
    pub fn new(mappers: Vec<Arc<dyn Mapper>>) -> Self {
        Self { mappers }
    }

    /// Start every backend, failing fast on the first that cannot start
    pub async fn start(&self, stop: watch::Receiver<bool>) -> Result<()> {
        for mapper in &self.mappers {
            mapper.clone().start(stop.clone()).await?;
        }
        Ok(())
    }

    /// Resolve a canonical ARN through the backends in order
    pub fn map(&self, canonical_arn: &str) -> Result<IdentityMapping> {
        for mapper in &self.mappers {
            match mapper.map(canonical_arn) {
                Ok(mapping) => return Ok(mapping),
                Err(Error::NotMapped) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotMapped)
    }

    /// Whether any backend admits the account
    pub fn is_account_allowed(&self, account_id: &str) -> bool {
        self.mappers.iter().any(|m| m.is_account_allowed(account_id))
    }
}
