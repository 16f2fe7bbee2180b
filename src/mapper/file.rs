//! Static mapper backed by the loaded config file
//!
//! The snapshot is built once at construction and never changes; reloads
//! happen by restarting the process with a new config.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::{ClusterConfig, IdentityMapping};
use crate::mapper::{MapStore, Mapper};
use crate::{Error, Result};

/// Mapper serving the mappings embedded in the config file
pub struct StaticMapper {
    store: MapStore,
}

impl StaticMapper {
    /// Build the snapshot from a loaded config
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            store: MapStore::build(&config.map_users, &config.map_roles, &config.map_accounts),
        }
    }
}

#[async_trait]
impl Mapper for StaticMapper {
    fn name(&self) -> &'static str {
        "config-map"
    }

    async fn start(self: Arc<Self>, _stop: watch::Receiver<bool>) -> Result<()> {
        Ok(())
    }

    fn map(&self, canonical_arn: &str) -> Result<IdentityMapping> {
        self.store.lookup(canonical_arn).ok_or(Error::NotMapped)
    }

    fn is_account_allowed(&self, account_id: &str) -> bool {
        self.store.is_account_allowed(account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        serde_yaml::from_str(
            r#"
clusterId: c123
mapUsers:
  - userarn: acs:ram::111122223333:user/Alice
    username: alice
    groups: [system:masters]
mapRoles:
  - rolearn: acs:ram::111122223333:role/dev
    username: dev:{{SessionName}}
    groups: [developers]
mapAccounts: ["444455556666"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_users_then_roles() {
        let mapper = StaticMapper::new(&config());

        let user = mapper.map("acs:ram::111122223333:user/alice").unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.groups, vec!["system:masters"]);

        let role = mapper.map("acs:ram::111122223333:role/dev").unwrap();
        assert_eq!(role.username, "dev:{{SessionName}}");
    }

    #[test]
    fn misses_return_not_mapped() {
        let mapper = StaticMapper::new(&config());
        assert!(matches!(
            mapper.map("acs:ram::111122223333:user/mallory"),
            Err(Error::NotMapped)
        ));
    }

    #[test]
    fn account_allow_list_is_membership_only() {
        let mapper = StaticMapper::new(&config());
        assert!(mapper.is_account_allowed("444455556666"));
        assert!(!mapper.is_account_allowed("111122223333"));
    }
}
