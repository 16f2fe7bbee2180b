//! RAMIdentityMapping controller
//!
//! Watches the resource stream and keeps the read paths of
//! [`MappingIndex`](super::MappingIndex) current. Every applied resource is
//! indexed from its status and queued for a sync; the sync canonicalizes
//! `spec.arn`, writes it back to `status.canonicalARN`, and installs
//! wildcard mappings in the copy-on-write cache. Deletes only reconcile the
//! indexes; there is nothing remote to clean up.
//!
//! Queue discipline: resource names are dispatched to a fixed worker pool
//! by name hash, so a given resource is only ever synced by one worker at a
//! time and its events stay ordered. Failed syncs retry in the worker with
//! exponential backoff.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{has_wildcard, MappingIndex, RAMIdentityMapping};
use crate::arn::canonicalize;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Result;

/// Default size of the sync worker pool
pub(crate) const DEFAULT_WORKERS: usize = 2;

/// Field manager recorded on status patches
const FIELD_MANAGER: &str = "ack-ram-authenticator";

/// Queue depth per worker before event handling backpressures
const WORKER_QUEUE_DEPTH: usize = 64;

/// Sync attempts before a resource is dropped until its next event
const MAX_SYNC_ATTEMPTS: u32 = 5;

struct Ctx {
    api: Api<RAMIdentityMapping>,
    index: Arc<MappingIndex>,
}

/// Run the controller until the stop signal fires.
///
/// The watcher restarts itself on transport errors; workers drain their
/// queued items before exiting.
pub(crate) async fn run(
    api: Api<RAMIdentityMapping>,
    index: Arc<MappingIndex>,
    workers: usize,
    mut stop: watch::Receiver<bool>,
) {
    let ctx = Arc::new(Ctx {
        api: api.clone(),
        index: index.clone(),
    });

    let mut senders = Vec::new();
    let mut handles = Vec::new();
    for worker_id in 0..workers.max(1) {
        let (tx, rx) = mpsc::channel::<String>(WORKER_QUEUE_DEPTH);
        senders.push(tx);
        handles.push(tokio::spawn(worker(worker_id, rx, ctx.clone())));
    }

    let mut stream = watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("identity mapping controller stopping");
                break;
            }
            event = stream.next() => match event {
                None => break,
                Some(Err(e)) => {
                    // the watcher re-establishes the watch on its own
                    warn!(error = %e, "identity mapping watch error");
                }
                Some(Ok(event)) => handle_event(&index, &senders, event).await,
            }
        }
    }

    // closing the queues lets workers drain and exit
    drop(senders);
    for handle in handles {
        let _ = handle.await;
    }
}

async fn handle_event(
    index: &Arc<MappingIndex>,
    senders: &[mpsc::Sender<String>],
    event: watcher::Event<RAMIdentityMapping>,
) {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            let obj = Arc::new(obj);
            index.apply(obj.clone());
            enqueue(senders, obj.name_any()).await;
        }
        watcher::Event::Delete(obj) => {
            let name = obj.name_any();
            debug!(name = %name, "identity mapping deleted");
            index.remove(&name);
        }
        watcher::Event::Init => {}
        watcher::Event::InitDone => {
            info!("identity mapping cache synced");
        }
    }
}

/// Route a resource name to its worker. Hashing by name keeps per-key
/// single-flight and per-key ordering without any shared queue state.
async fn enqueue(senders: &[mpsc::Sender<String>], name: String) {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let slot = (hasher.finish() as usize) % senders.len();
    if senders[slot].send(name).await.is_err() {
        debug!("sync queue closed, dropping event");
    }
}

async fn worker(worker_id: usize, mut queue: mpsc::Receiver<String>, ctx: Arc<Ctx>) {
    while let Some(name) = queue.recv().await {
        let result = retry_with_backoff(
            &RetryConfig::with_max_attempts(MAX_SYNC_ATTEMPTS),
            "sync_identity_mapping",
            || sync(&ctx, &name),
        )
        .await;
        match result {
            Ok(()) => debug!(worker_id, name = %name, "identity mapping synced"),
            Err(e) => error!(worker_id, name = %name, error = %e, "giving up on identity mapping"),
        }
    }
    debug!(worker_id, "sync worker drained");
}

/// Sync one resource: canonicalize its ARN, persist it to status, and
/// install wildcard mappings.
async fn sync(ctx: &Ctx, name: &str) -> Result<()> {
    let Some(obj) = ctx.api.get_opt(name).await? else {
        debug!(name = %name, "identity mapping no longer exists");
        return Ok(());
    };
    if obj.spec.arn.is_empty() {
        return Ok(());
    }

    let canonical = canonicalize(&obj.spec.arn.to_lowercase())?;

    let current = obj
        .status
        .as_ref()
        .map(|s| s.canonical_arn.as_str())
        .unwrap_or_default();
    if current != canonical {
        let patch = json!({"status": {"canonicalARN": canonical}});
        ctx.api
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        info!(name = %name, canonical_arn = %canonical, "canonicalized identity mapping");
    }

    // wildcard mappings go straight into the cache rather than waiting for
    // the status update to come back around the watch
    if has_wildcard(&canonical) {
        let mut updated = obj.clone();
        updated.status = Some(super::RAMIdentityMappingStatus {
            canonical_arn: canonical,
            ..updated.status.unwrap_or_default()
        });
        ctx.index.insert_wildcard(name, Arc::new(updated));
    }

    Ok(())
}
