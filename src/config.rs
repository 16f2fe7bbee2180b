//! Authenticator configuration
//!
//! The server loads a YAML config file carrying the cluster id, the static
//! identity mappings, and which mapper backends to run. Mapping record types
//! here are shared by every backend: the static config snapshot, the dynamic
//! file, and the CRD stream all resolve to an [`IdentityMapping`].

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::token::Identity;
use crate::{Error, Result};

/// A mapping from a RAM user ARN to a Kubernetes username + groups
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct UserMapping {
    /// ARN of the RAM user
    #[serde(rename = "userarn")]
    pub user_arn: String,
    /// Kubernetes username; may contain `{{AccountID}}`-style placeholders
    pub username: String,
    /// Kubernetes groups
    #[serde(default)]
    pub groups: Vec<String>,
}

/// A mapping from a RAM role ARN to a Kubernetes username + groups
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RoleMapping {
    /// ARN of the RAM role
    #[serde(rename = "rolearn")]
    pub role_arn: String,
    /// Kubernetes username; may contain `{{AccountID}}`-style placeholders
    pub username: String,
    /// Kubernetes groups
    #[serde(default)]
    pub groups: Vec<String>,
}

/// The resolved record every mapper backend returns on a hit
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityMapping {
    /// Canonical ARN the lookup matched on
    pub identity_arn: String,
    /// Username template, unresolved
    pub username: String,
    /// Group list, unresolved
    pub groups: Vec<String>,
}

impl IdentityMapping {
    /// Resolve `{{AccountID}}` / `{{SessionName}}` / `{{AccessKeyID}}`
    /// placeholders in the username and groups against a verified identity.
    pub fn render(&self, identity: &Identity) -> (String, Vec<String>) {
        let username = interpolate(&self.username, identity);
        let groups = self
            .groups
            .iter()
            .map(|g| interpolate(g, identity))
            .collect();
        (username, groups)
    }
}

fn interpolate(template: &str, identity: &Identity) -> String {
    template
        .replace("{{AccountID}}", &identity.account_id)
        .replace("{{SessionName}}", &identity.session_name)
        .replace("{{AccessKeyID}}", &identity.access_key_id)
}

/// Which mapper backends to run, in lookup order
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    /// Static mappings embedded in this config file
    ConfigMap,
    /// Hot-reloaded JSON file
    DynamicFile,
    /// RAMIdentityMapping custom resources
    Crd,
}

/// Top-level authenticator configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster identifier every token must be bound to
    pub cluster_id: String,

    /// Webhook listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Region used to pick the STS VPC endpoint; empty uses the default
    /// public endpoint
    #[serde(default)]
    pub region: Option<String>,

    /// Mapper backends in lookup order
    #[serde(default = "default_backends")]
    pub backend_mode: Vec<BackendMode>,

    /// Static RAM user mappings
    #[serde(default)]
    pub map_users: Vec<UserMapping>,

    /// Static RAM role mappings
    #[serde(default)]
    pub map_roles: Vec<RoleMapping>,

    /// Accounts whose principals are admitted without an explicit mapping
    #[serde(default)]
    pub map_accounts: Vec<String>,

    /// Path of the hot-reloaded mapping file, for the dynamic-file backend
    #[serde(default)]
    pub dynamic_file_path: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:21362".to_string()
}

fn default_backends() -> Vec<BackendMode> {
    vec![BackendMode::ConfigMap]
}

impl ClusterConfig {
    /// Load and validate a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|e| {
            Error::invalid_config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(Error::invalid_config("clusterID is required"));
        }
        if self.backend_mode.is_empty() {
            return Err(Error::invalid_config(
                "at least one mapper backend must be configured",
            ));
        }
        let unique: BTreeSet<_> = self.backend_mode.iter().collect();
        if unique.len() != self.backend_mode.len() {
            return Err(Error::invalid_config("duplicate mapper backend configured"));
        }
        if self.backend_mode.contains(&BackendMode::DynamicFile)
            && self.dynamic_file_path.is_none()
        {
            return Err(Error::invalid_config(
                "dynamicFilePath is required for the dynamic-file backend",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            arn: "acs:sts::111122223333:assumed-role/Admin/sess1".into(),
            canonical_arn: "acs:ram::111122223333:role/admin".into(),
            account_id: "111122223333".into(),
            user_id: "33333".into(),
            session_name: "sess1".into(),
            access_key_id: "LTAI5txxxxxxxxxxxxxxxxxx".into(),
        }
    }

    #[test]
    fn renders_username_and_group_templates() {
        let mapping = IdentityMapping {
            identity_arn: "acs:ram::111122223333:role/admin".into(),
            username: "admin:{{AccountID}}:{{SessionName}}".into(),
            groups: vec!["system:masters".into(), "acct:{{AccountID}}".into()],
        };
        let (username, groups) = mapping.render(&identity());
        assert_eq!(username, "admin:111122223333:sess1");
        assert_eq!(groups, vec!["system:masters", "acct:111122223333"]);
    }

    #[test]
    fn parses_yaml_config() {
        let yaml = r#"
clusterId: c123
backendMode: [config-map, dynamic-file]
dynamicFilePath: /etc/authenticator/mappings.json
mapUsers:
  - userarn: acs:ram::111122223333:user/alice
    username: alice
    groups: [system:masters]
mapAccounts: ["444455556666"]
"#;
        let config: ClusterConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cluster_id, "c123");
        assert_eq!(
            config.backend_mode,
            vec![BackendMode::ConfigMap, BackendMode::DynamicFile]
        );
        assert_eq!(config.map_users[0].user_arn, "acs:ram::111122223333:user/alice");
        assert_eq!(config.listen_addr, "0.0.0.0:21362");
    }

    #[test]
    fn rejects_empty_cluster_id() {
        let config: ClusterConfig = serde_yaml::from_str("clusterId: \"\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_dynamic_file_backend_without_path() {
        let config: ClusterConfig =
            serde_yaml::from_str("clusterId: c1\nbackendMode: [dynamic-file]").unwrap();
        assert!(config.validate().is_err());
    }
}
