use crate::{index::marked_for_deletion, SharedIndex};
use futures::prelude::*;
use netpol_agent_core::names;
use netpol_agent_k8s_api::{self as k8s, watcher, ResourceExt};
use tracing::{debug, info_span, warn};

/// The slice of a pod the store needs to steer set membership.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PodRecord {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub labels: k8s::Labels,
    pub ip: String,
    pub phase: String,
}

/// Only running (or pending-with-IP) pods participate in set membership.
pub(crate) fn valid(pod: &k8s::Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let phase = status.phase.as_deref().unwrap_or_default();
    !matches!(phase, "Failed" | "Succeeded" | "Unknown")
        && status.pod_ip.as_deref().map_or(false, |ip| !ip.is_empty())
}

impl PodRecord {
    pub(crate) fn from_pod(pod: &k8s::Pod) -> Option<Self> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_unchecked();
        let status = pod.status.as_ref()?;
        let ip = status.pod_ip.clone()?;
        Some(Self {
            uid: pod
                .uid()
                .unwrap_or_else(|| format!("{}/{}", namespace, name)),
            node: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            labels: pod.metadata.labels.clone().into(),
            phase: status.phase.clone().unwrap_or_default(),
            namespace,
            name,
            ip,
        })
    }

    /// The label-derived sets this pod's IP belongs to. The deployment
    /// template hash never produces membership.
    pub(crate) fn label_sets(&self) -> Vec<String> {
        self.labels
            .iter()
            .filter(|(k, _)| !names::is_template_hash(k))
            .map(|(k, v)| names::label_set(names::ALL_NAMESPACES, k, v))
            .collect()
    }
}

/// Drives the pod watch into the index.
///
/// An applied pod is staged as a delete of the stored incarnation followed
/// by an add, with the lock released between the two steps; another event
/// may interleave, as the original informer callbacks allowed.
pub async fn index_pods(
    index: SharedIndex,
    events: impl Stream<Item = watcher::Event<k8s::Pod>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Applied(pod) => {
                let ns = pod.namespace().unwrap_or_default();
                let name = pod.name_unchecked();
                let _span = info_span!("apply", %ns, %name).entered();
                if let Err(error) = index.write().delete_pod(&ns, &name) {
                    warn!(%error, "failed to remove stale pod");
                }
                if marked_for_deletion(&pod.metadata) {
                    debug!("pod is terminating; treating as delete");
                    continue;
                }
                if let Err(error) = index.write().add_pod(&pod) {
                    warn!(%error, "failed to add pod");
                }
            }
            watcher::Event::Deleted(pod) => {
                let ns = pod.namespace().unwrap_or_default();
                let name = pod.name_unchecked();
                let _span = info_span!("delete", %ns, %name).entered();
                if let Err(error) = index.write().delete_pod(&ns, &name) {
                    warn!(%error, "failed to delete pod");
                }
            }
            watcher::Event::Restarted(pods) => {
                let _span = info_span!("restart").entered();
                if let Err(error) = index.write().reset_pods(pods) {
                    warn!(%error, "failed to reset pods");
                }
            }
        }
    }
}
