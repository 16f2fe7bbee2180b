//! Hot-reloaded mapping file
//!
//! Watches a JSON file of `mapRoles` / `mapUsers` / `mapAccounts` entries
//! and swaps the in-memory snapshot whenever the file changes. Editors and
//! `cp` replace files by rename, which kills the watch on the old inode, so
//! the watch loop restarts from scratch after every RENAME/REMOVE event and
//! after any watcher error, with a one second backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{IdentityMapping, RoleMapping, UserMapping};
use crate::mapper::{MapStore, Mapper};
use crate::{Error, Result};

/// Poll interval while the file does not exist, and backoff between watch
/// restarts
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// On-disk shape of the dynamic mapping file
#[derive(Debug, Default, Deserialize)]
struct DynamicFileData {
    #[serde(rename = "mapRoles", default)]
    role_mappings: Vec<RoleMapping>,
    #[serde(rename = "mapUsers", default)]
    user_mappings: Vec<UserMapping>,
    #[serde(rename = "mapAccounts", default)]
    auto_mapped_accounts: Vec<String>,
}

/// Mapper backed by a watched JSON file
pub struct DynamicFileMapper {
    filename: PathBuf,
    store: RwLock<Arc<MapStore>>,
}

enum WatchOutcome {
    /// Stop signal observed
    Stopped,
    /// Watch ended (rename, remove, or error); re-enter load-then-watch
    Restart,
}

impl DynamicFileMapper {
    /// Create a mapper for `filename`; nothing is loaded until
    /// [`Mapper::start`] runs.
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            store: RwLock::new(Arc::new(MapStore::default())),
        }
    }

    /// Load the file and install the parsed snapshot.
    ///
    /// Records lacking an ARN are dropped with an accumulated error while
    /// the survivors still install; an unreadable or undecodable file keeps
    /// the previous snapshot in place.
    fn load(&self) -> Result<()> {
        let content = std::fs::read_to_string(&self.filename).map_err(|e| {
            Error::invalid_config(format!(
                "could not read {}: {e}",
                self.filename.display()
            ))
        })?;

        let (users, roles, accounts, complaints) = parse_map(&content)?;
        self.install(MapStore::build(&users, &roles, &accounts));
        info!(
            file = %self.filename.display(),
            users = users.len(),
            roles = roles.len(),
            accounts = accounts.len(),
            "dynamic mapping file loaded"
        );

        if complaints.is_empty() {
            Ok(())
        } else {
            Err(Error::ParseErrors(complaints))
        }
    }

    fn install(&self, store: MapStore) {
        *self.store.write() = Arc::new(store);
    }

    fn clear(&self) {
        self.install(MapStore::default());
    }

    /// Poll until the file exists. Returns false if stopped first.
    async fn wait_until_available(&self, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            if self.filename.exists() {
                return true;
            }
            tokio::select! {
                _ = stop.changed() => return false,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Attach a filesystem watcher and apply events until the watch dies or
    /// the stop signal fires.
    async fn watch(&self, stop: &mut watch::Receiver<bool>) -> WatchOutcome {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = match notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                return WatchOutcome::Restart;
            }
        };
        if let Err(e) = watcher.watch(&self.filename, RecursiveMode::NonRecursive) {
            error!(error = %e, file = %self.filename.display(), "could not add file to watcher");
            return WatchOutcome::Restart;
        }

        loop {
            tokio::select! {
                _ = stop.changed() => return WatchOutcome::Stopped,
                event = rx.recv() => match event {
                    None => return WatchOutcome::Restart,
                    Some(Err(e)) => {
                        error!(error = %e, "file watcher error");
                        return WatchOutcome::Restart;
                    }
                    Some(Ok(event)) => match event.kind {
                        EventKind::Create(_)
                        | EventKind::Modify(ModifyKind::Data(_))
                        | EventKind::Modify(ModifyKind::Any) => {
                            info!("dynamic file changed, reloading");
                            if let Err(e) = self.load() {
                                warn!(error = %e, "reload failed, keeping previous snapshot");
                            }
                        }
                        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                            if self.filename.exists() {
                                // vi/cp replace the file by rename; the watch
                                // now points at a dead inode
                                info!("dynamic file replaced, reloading");
                                if let Err(e) = self.load() {
                                    warn!(error = %e, "reload failed, keeping previous snapshot");
                                }
                            } else {
                                info!("dynamic file removed, clearing mappings");
                                self.clear();
                            }
                            return WatchOutcome::Restart;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Load-then-watch loop, re-entered after every watch restart
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if !self.wait_until_available(&mut stop).await {
                return;
            }
            if let Err(e) = self.load() {
                warn!(error = %e, "dynamic file load reported errors");
            }
            match self.watch(&mut stop).await {
                WatchOutcome::Stopped => return,
                WatchOutcome::Restart => {
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }
}

/// Parse the dynamic file content.
///
/// An empty file is valid and yields an empty snapshot. Entries missing
/// their ARN are dropped into the returned complaint list.
#[allow(clippy::type_complexity)]
fn parse_map(
    content: &str,
) -> Result<(Vec<UserMapping>, Vec<RoleMapping>, Vec<String>, Vec<String>)> {
    if content.trim().is_empty() {
        return Ok((Vec::new(), Vec::new(), Vec::new(), Vec::new()));
    }

    let data: DynamicFileData = serde_json::from_str(content)
        .map_err(|e| Error::invalid_config(format!("could not unmarshal dynamic file: {e}")))?;

    let mut complaints = Vec::new();
    let mut users = Vec::new();
    for user in data.user_mappings {
        if user.user_arn.is_empty() {
            complaints.push("value for userarn must be supplied".to_string());
        } else {
            users.push(user);
        }
    }
    let mut roles = Vec::new();
    for role in data.role_mappings {
        if role.role_arn.is_empty() {
            complaints.push("value for rolearn must be supplied".to_string());
        } else {
            roles.push(role);
        }
    }

    Ok((users, roles, data.auto_mapped_accounts, complaints))
}

#[async_trait]
impl Mapper for DynamicFileMapper {
    fn name(&self) -> &'static str {
        "dynamic-file"
    }

    async fn start(self: Arc<Self>, stop: watch::Receiver<bool>) -> Result<()> {
        tokio::spawn(self.run(stop));
        Ok(())
    }

    fn map(&self, canonical_arn: &str) -> Result<IdentityMapping> {
        let store = self.store.read().clone();
        store.lookup(canonical_arn).ok_or(Error::NotMapped)
    }

    fn is_account_allowed(&self, account_id: &str) -> bool {
        let store = self.store.read().clone();
        store.is_account_allowed(account_id)
    }
}
