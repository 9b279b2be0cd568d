use crate::{index::marked_for_deletion, pod::PodRecord, SharedIndex};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use netpol_agent_k8s_api::{self as k8s, watcher, ResourceExt};
use tracing::{debug, info_span, warn};

/// Per-namespace bookkeeping: the labels last applied, resident pods by UID,
/// and the policies installed in the namespace. Set state itself lives in
/// the node-wide managers.
#[derive(Debug, Default)]
pub(crate) struct Namespace {
    pub labels: k8s::Labels,
    pub pods: HashMap<String, PodRecord>,
    pub policies: HashMap<String, k8s::NetworkPolicy>,
}

/// Drives the namespace watch into the index.
///
/// An applied namespace is staged as a delete of the stored incarnation
/// followed by an add, with the lock released between the two steps;
/// another event may interleave, as the original informer callbacks
/// allowed.
pub async fn index_namespaces(
    index: SharedIndex,
    events: impl Stream<Item = watcher::Event<k8s::Namespace>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Applied(ns) => {
                let name = ns.name_unchecked();
                let _span = info_span!("apply", %name).entered();
                if let Err(error) = index.write().delete_namespace(&name) {
                    warn!(%error, "failed to remove stale namespace");
                }
                if marked_for_deletion(&ns.metadata) {
                    debug!("namespace is terminating; treating as delete");
                    continue;
                }
                if let Err(error) = index.write().add_namespace(&ns) {
                    warn!(%error, "failed to add namespace");
                }
            }
            watcher::Event::Deleted(ns) => {
                let name = ns.name_unchecked();
                let _span = info_span!("delete", %name).entered();
                if let Err(error) = index.write().delete_namespace(&name) {
                    warn!(%error, "failed to delete namespace");
                }
            }
            watcher::Event::Restarted(namespaces) => {
                let _span = info_span!("restart").entered();
                if let Err(error) = index.write().reset_namespaces(namespaces) {
                    warn!(%error, "failed to reset namespaces");
                }
            }
        }
    }
}
