//! Custom-resource mapping backend
//!
//! `RAMIdentityMapping` resources declare mappings cluster-wide. A
//! controller canonicalizes each resource's ARN into its status and keeps
//! two read paths hot: a canonical-ARN index for O(1) exact matches, and a
//! copy-on-write wildcard cache for mappings whose ARN carries `*` or `?`
//! glob metacharacters.

pub mod controller;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::{Api, Client, CustomResource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::config::IdentityMapping;
use crate::mapper::Mapper;
use crate::{Error, Result};

/// Spec of the cluster-scoped `RAMIdentityMapping` custom resource
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ramauthenticator.k8s.alibabacloud.com",
    version = "v1alpha1",
    kind = "RAMIdentityMapping",
    plural = "ramidentitymappings",
    status = "RAMIdentityMappingStatus",
    printcolumn = r#"{"name":"ARN","type":"string","jsonPath":".spec.arn"}"#,
    printcolumn = r#"{"name":"CanonicalARN","type":"string","jsonPath":".status.canonicalARN"}"#,
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RAMIdentityMappingSpec {
    /// RAM ARN of the principal, possibly containing `*`/`?` wildcards
    pub arn: String,
    /// Kubernetes username the principal maps to
    pub username: String,
    /// Kubernetes groups the principal maps to
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Status written back by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RAMIdentityMappingStatus {
    /// Canonicalized, lower-cased form of `spec.arn`
    #[serde(rename = "canonicalARN", default)]
    pub canonical_arn: String,
    /// Stable principal id, when known
    #[serde(rename = "userID", default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
}

/// Whether an ARN pattern contains glob metacharacters.
///
/// `?` matches exactly one character, `*` zero or more.
pub(crate) fn has_wildcard(arn: &str) -> bool {
    arn.contains(['*', '?'])
}

/// Glob matching with `?` (one char) and `*` (any run) semantics
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(star_pos) = star {
            // backtrack: let the last '*' swallow one more character
            pi = star_pos + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

type WildcardMap = HashMap<String, Arc<RAMIdentityMapping>>;

/// Read paths for the CRD backend.
///
/// Exact lookups go through a canonical-ARN index. Wildcard mappings live
/// in a snapshot map behind an atomic pointer: readers clone the current
/// `Arc` and never block writers; writers serialize on a coarse mutex,
/// copy the map, and swap the pointer.
#[derive(Default)]
pub(crate) struct MappingIndex {
    by_canonical: DashMap<String, Arc<RAMIdentityMapping>>,
    by_name: DashMap<String, String>,
    wildcard: RwLock<Arc<WildcardMap>>,
    wildcard_write: Mutex<()>,
}

impl MappingIndex {
    /// Index a resource observed on the watch stream. Resources without a
    /// canonicalized status are skipped; the controller's status write will
    /// bring them back around.
    pub(crate) fn apply(&self, mapping: Arc<RAMIdentityMapping>) {
        let canonical = mapping
            .status
            .as_ref()
            .map(|s| s.canonical_arn.clone())
            .unwrap_or_default();
        if canonical.is_empty() {
            return;
        }

        let name = mapping.name_any();
        if let Some(previous) = self.by_name.insert(name.clone(), canonical.clone()) {
            if previous != canonical {
                self.by_canonical.remove(&previous);
                self.remove_wildcard(&name);
            }
        }
        if has_wildcard(&canonical) {
            self.insert_wildcard(&name, mapping);
        } else {
            self.by_canonical.insert(canonical, mapping);
        }
    }

    /// Drop a deleted resource from the index and the wildcard cache
    pub(crate) fn remove(&self, name: &str) {
        if let Some((_, canonical)) = self.by_name.remove(name) {
            self.by_canonical.remove(&canonical);
        }
        self.remove_wildcard(name);
    }

    /// Copy-on-write insert into the wildcard cache
    pub(crate) fn insert_wildcard(&self, name: &str, mapping: Arc<RAMIdentityMapping>) {
        let _guard = self.wildcard_write.lock();
        let mut next: WildcardMap = (**self.wildcard.read()).clone();
        next.insert(name.to_string(), mapping);
        *self.wildcard.write() = Arc::new(next);
    }

    fn remove_wildcard(&self, name: &str) {
        let _guard = self.wildcard_write.lock();
        if !self.wildcard.read().contains_key(name) {
            return;
        }
        let mut next: WildcardMap = (**self.wildcard.read()).clone();
        next.remove(name);
        *self.wildcard.write() = Arc::new(next);
    }

    /// Exact index hit first, then first glob match over the wildcard
    /// snapshot (name order, for determinism).
    pub(crate) fn lookup(&self, canonical_arn: &str) -> Option<IdentityMapping> {
        let key = canonical_arn.to_lowercase();
        if let Some(mapping) = self.by_canonical.get(&key) {
            return Some(to_identity_mapping(&key, mapping.value()));
        }

        let snapshot = self.wildcard.read().clone();
        let mut names: Vec<&String> = snapshot.keys().collect();
        names.sort();
        for name in names {
            let mapping = &snapshot[name];
            let pattern = mapping
                .status
                .as_ref()
                .map(|s| s.canonical_arn.as_str())
                .unwrap_or_default();
            if !pattern.is_empty() && wildcard_match(pattern, &key) {
                return Some(to_identity_mapping(&key, mapping));
            }
        }
        None
    }
}

fn to_identity_mapping(canonical_arn: &str, mapping: &RAMIdentityMapping) -> IdentityMapping {
    IdentityMapping {
        identity_arn: canonical_arn.to_string(),
        username: mapping.spec.username.clone(),
        groups: mapping.spec.groups.clone(),
    }
}

/// Mapper backed by the RAMIdentityMapping stream
pub struct CrdMapper {
    index: Arc<MappingIndex>,
    client: Option<Client>,
    workers: usize,
}

impl CrdMapper {
    /// Mapper that watches the cluster through `client`
    pub fn new(client: Client) -> Self {
        Self {
            index: Arc::new(MappingIndex::default()),
            client: Some(client),
            workers: controller::DEFAULT_WORKERS,
        }
    }

    /// Mapper serving a pre-populated index, with no controller (tests)
    #[cfg(test)]
    pub(crate) fn with_index(index: Arc<MappingIndex>) -> Self {
        Self {
            index,
            client: None,
            workers: controller::DEFAULT_WORKERS,
        }
    }
}

#[async_trait]
impl Mapper for CrdMapper {
    fn name(&self) -> &'static str {
        "crd"
    }

    async fn start(self: Arc<Self>, stop: watch::Receiver<bool>) -> Result<()> {
        let Some(client) = self.client.clone() else {
            return Ok(());
        };
        let api: Api<RAMIdentityMapping> = Api::all(client);
        info!(workers = self.workers, "starting identity mapping controller");
        tokio::spawn(controller::run(api, self.index.clone(), self.workers, stop));
        Ok(())
    }

    fn map(&self, canonical_arn: &str) -> Result<IdentityMapping> {
        self.index.lookup(canonical_arn).ok_or(Error::NotMapped)
    }

    /// The CRD backend carries no account allow-list
    fn is_account_allowed(&self, _account_id: &str) -> bool {
        false
    }
}
