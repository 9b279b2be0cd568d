use crate::{
    namespace::Namespace,
    pod::{self, PodRecord},
    policy,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use netpol_agent_core::names;
use netpol_agent_ipset::IpsetManager;
use netpol_agent_iptables::IptablesManager;
use netpol_agent_k8s_api::{self as k8s, ObjectMeta, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the in-memory model and the two kernel-facing managers, and keeps
/// them converged. Every handler runs under the write half of the shared
/// lock, one lock acquisition per handler: the event loops stage an update
/// as a delete followed by an add with the lock released in between, so
/// another event may interleave, exactly as the watch callbacks allow.
#[derive(Debug)]
pub struct Index {
    pub(crate) namespaces: HashMap<String, Namespace>,

    /// The node-wide address-set manager; every pod-IP set and namespace
    /// list lives here.
    pub(crate) ipsets: IpsetManager,
    pub(crate) iptables: IptablesManager,

    /// Whether the chain skeleton is installed. Flips on the first policy
    /// and back on the last.
    pub(crate) skeleton_installed: bool,
    pub(crate) num_policies: usize,
}

pub(crate) fn marked_for_deletion(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() || meta.deletion_grace_period_seconds.is_some()
}

// === impl Index ===

impl Index {
    pub fn shared(ipsets: IpsetManager, iptables: IptablesManager) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            namespaces: HashMap::default(),
            ipsets,
            iptables,
            skeleton_installed: false,
            num_policies: 0,
        }))
    }

    pub fn num_policies(&self) -> usize {
        self.num_policies
    }

    pub fn skeleton_installed(&self) -> bool {
        self.skeleton_installed
    }

    // --- pods -----------------------------------------------------------

    /// Adds a pod's IP to its namespace set and its label sets. Invalid
    /// pods (terminal phase or no address) are ignored.
    pub fn add_pod(&mut self, pod: &k8s::Pod) -> Result<()> {
        if !pod::valid(pod) {
            debug!("ignoring pod without address");
            return Ok(());
        }
        let record = match PodRecord::from_pod(pod) {
            Some(record) => record,
            None => return Ok(()),
        };
        info!(ip = %record.ip, node = %record.node, "pod created");

        self.ipsets.add_to_set(&record.namespace, &record.ip)?;
        for set in record.label_sets() {
            self.ipsets.add_to_set(&set, &record.ip)?;
        }
        self.namespaces
            .entry(record.namespace.clone())
            .or_default()
            .pods
            .insert(record.uid.clone(), record);
        Ok(())
    }

    /// Removes the stored pod's memberships. The emptied sets are left in
    /// place; `clean` or policy removal destroys them. Unknown pods are a
    /// logged no-op.
    pub fn delete_pod(&mut self, namespace: &str, name: &str) -> Result<()> {
        let Some(record) = self.lookup_pod(namespace, name) else {
            debug!("pod not in store");
            return Ok(());
        };
        info!(ip = %record.ip, "pod deleted");

        self.ipsets.delete_from_set(&record.namespace, &record.ip)?;
        for set in record.label_sets() {
            self.ipsets.delete_from_set(&set, &record.ip)?;
        }
        if let Some(ns) = self.namespaces.get_mut(&record.namespace) {
            ns.pods.remove(&record.uid);
        }
        Ok(())
    }

    fn lookup_pod(&self, namespace: &str, name: &str) -> Option<PodRecord> {
        self.namespaces
            .get(namespace)?
            .pods
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Reconciles the store against a restarted pod watch.
    pub(crate) fn reset_pods(&mut self, pods: Vec<k8s::Pod>) -> Result<()> {
        let live: HashSet<(String, String)> = pods
            .iter()
            .map(|p| (p.namespace().unwrap_or_default(), p.name_unchecked()))
            .collect();
        let stale: Vec<(String, String)> = self
            .namespaces
            .iter()
            .flat_map(|(ns, index)| {
                index
                    .pods
                    .values()
                    .map(|p| (ns.clone(), p.name.clone()))
                    .collect::<Vec<_>>()
            })
            .filter(|key| !live.contains(key))
            .collect();
        for (namespace, name) in stale {
            self.delete_pod(&namespace, &name)?;
        }
        for pod in &pods {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_unchecked();
            self.delete_pod(&namespace, &name)?;
            if !marked_for_deletion(&pod.metadata) {
                self.add_pod(pod)?;
            }
        }
        Ok(())
    }

    // --- namespaces -----------------------------------------------------

    /// Creates the namespace's pod-IP set and enrolls it in the global and
    /// per-label lists.
    pub fn add_namespace(&mut self, ns: &k8s::Namespace) -> Result<()> {
        let name = ns.name_unchecked();
        info!("namespace created");

        self.ipsets.create_set(&name)?;
        self.ipsets.add_to_list(names::ALL_NAMESPACES, &name)?;
        let labels: k8s::Labels = ns.metadata.labels.clone().into();
        for (k, v) in labels.iter() {
            let list = names::label_set(names::ALL_NAMESPACES, k, v);
            debug!(%list, "adding namespace to label list");
            self.ipsets.add_to_list(&list, &name)?;
        }

        self.namespaces.entry(name).or_default().labels = labels;
        Ok(())
    }

    pub fn delete_namespace(&mut self, name: &str) -> Result<()> {
        if !self.namespaces.contains_key(name) {
            debug!("namespace not in store");
            return Ok(());
        }
        info!("namespace deleted");

        let labels = self
            .namespaces
            .get(name)
            .map(|ns| ns.labels.clone())
            .unwrap_or_default();
        for (k, v) in labels.iter() {
            let list = names::label_set(names::ALL_NAMESPACES, k, v);
            self.ipsets.delete_from_list(&list, name)?;
        }
        self.ipsets.delete_from_list(names::ALL_NAMESPACES, name)?;
        self.ipsets.delete_set(name)?;
        self.namespaces.remove(name);
        Ok(())
    }

    /// Reconciles the store against a restarted namespace watch.
    pub(crate) fn reset_namespaces(&mut self, namespaces: Vec<k8s::Namespace>) -> Result<()> {
        let live: HashSet<String> = namespaces.iter().map(|ns| ns.name_unchecked()).collect();
        let stale: Vec<String> = self
            .namespaces
            .keys()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.delete_namespace(&name)?;
        }
        for ns in &namespaces {
            self.delete_namespace(&ns.name_unchecked())?;
            if !marked_for_deletion(&ns.metadata) {
                self.add_namespace(ns)?;
            }
        }
        Ok(())
    }

    // --- network policies -----------------------------------------------

    pub fn add_network_policy(&mut self, np: k8s::NetworkPolicy) -> Result<()> {
        let namespace = np.namespace().unwrap_or_default();
        let name = np.name_unchecked();
        info!("network policy created");

        // The policy's namespace may not have been observed yet; it still
        // belongs in the store (and in the all-namespaces resync below).
        self.namespaces.entry(namespace.clone()).or_default();

        if !self.skeleton_installed {
            // The skeleton's allow rules reference the kube-system set, so
            // it must exist before the chains go in.
            self.ipsets.create_set(names::KUBE_SYSTEM)?;
            self.iptables.init_chain_skeleton()?;
            self.skeleton_installed = true;
        }

        let translation = policy::translate(&np);
        for set in &translation.pod_sets {
            self.ipsets.create_set(set)?;
            self.ipsets.increment_refer_count(set);
        }
        for list in &translation.ns_lists {
            self.ipsets.create_list(list)?;
            self.ipsets.increment_refer_count(list);
        }
        self.sync_all_namespaces_list()?;
        for rule in &translation.rules {
            self.iptables.add_rule(rule)?;
        }

        self.namespaces
            .entry(namespace)
            .or_default()
            .policies
            .insert(name, np);
        self.num_policies += 1;
        debug!(policies = self.num_policies);
        Ok(())
    }

    /// Re-translates the stored policy to delete exactly the rules it
    /// installed; the last policy removal tears the skeleton down.
    pub fn delete_network_policy(&mut self, namespace: &str, name: &str) -> Result<()> {
        let Some(np) = self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.policies.get(name))
        else {
            debug!("network policy not in store");
            return Ok(());
        };
        info!("network policy deleted");

        let translation = policy::translate(np);
        for rule in &translation.rules {
            self.iptables.delete_rule(rule)?;
        }
        for set in &translation.pod_sets {
            self.ipsets.decrement_refer_count(set);
            self.ipsets.delete_set(set)?;
        }
        for list in &translation.ns_lists {
            self.ipsets.decrement_refer_count(list);
            self.ipsets.delete_list(list)?;
        }

        if let Some(ns) = self.namespaces.get_mut(namespace) {
            ns.policies.remove(name);
        }
        self.num_policies -= 1;
        debug!(policies = self.num_policies);

        if self.num_policies == 0 {
            self.iptables.teardown_chain_skeleton()?;
            self.skeleton_installed = false;
        }
        Ok(())
    }

    /// Reconciles the store against a restarted policy watch.
    pub(crate) fn reset_network_policies(
        &mut self,
        policies: Vec<k8s::NetworkPolicy>,
    ) -> Result<()> {
        let live: HashSet<(String, String)> = policies
            .iter()
            .map(|np| (np.namespace().unwrap_or_default(), np.name_unchecked()))
            .collect();
        let stale: Vec<(String, String)> = self
            .namespaces
            .iter()
            .flat_map(|(ns, index)| {
                index
                    .policies
                    .keys()
                    .map(|name| (ns.clone(), name.clone()))
                    .collect::<Vec<_>>()
            })
            .filter(|key| !live.contains(key))
            .collect();
        for (namespace, name) in stale {
            self.delete_network_policy(&namespace, &name)?;
        }
        for np in policies {
            let namespace = np.namespace().unwrap_or_default();
            let name = np.name_unchecked();
            self.delete_network_policy(&namespace, &name)?;
            if !marked_for_deletion(&np.metadata) {
                self.add_network_policy(np)?;
            }
        }
        Ok(())
    }

    /// Ensures every known namespace is a member of the global list.
    fn sync_all_namespaces_list(&mut self) -> Result<()> {
        let known: Vec<String> = self.namespaces.keys().cloned().collect();
        for name in known {
            self.ipsets.add_to_list(names::ALL_NAMESPACES, &name)?;
        }
        Ok(())
    }
}
