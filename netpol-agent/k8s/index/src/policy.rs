//! Translation of one network policy into the sets, lists, and filter rules
//! that realize it.
//!
//! Translation is pure and deterministic: removing a policy re-translates it
//! and deletes exactly the rules that were installed, so no per-rule
//! bookkeeping is kept between events.

use crate::{index::marked_for_deletion, SharedIndex};
use futures::prelude::*;
use netpol_agent_core::names;
use netpol_agent_iptables::{self as iptm, chains, Rule};
use netpol_agent_k8s_api::{self as k8s, watcher, IntOrString, ResourceExt, Selector};
use tracing::{debug, info_span, warn};

/// Everything a policy requires of the kernel: the pod-IP sets and namespace
/// lists to materialize (internal names, creation order), and the rules to
/// append. Rules embed the hashed external set names.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Translation {
    pub pod_sets: Vec<String>,
    pub ns_lists: Vec<String>,
    pub rules: Vec<Rule>,
}

/// One peer of a policy rule. The API object models this as three
/// mutually-exclusive optional fields; peers carrying more than one are
/// resolved by precedence with a warning.
#[derive(Clone, Debug)]
enum Peer {
    Pods(Selector),
    Namespaces(Selector),
    Block { cidr: String, except: Vec<String> },
}

#[derive(Clone, Debug)]
struct PortSpec {
    protocol: String,
    port: Option<String>,
}

/// A direction's chain targets and match orientation. Ingress matches the
/// target set as destination and peers as source; egress is the mirror
/// image.
struct Direction {
    port_chain: &'static str,
    peer_chain: &'static str,
    target_dir: &'static str,
    peer_dir: &'static str,
    cidr_flag: &'static str,
}

const INGRESS: Direction = Direction {
    port_chain: chains::INGRESS_PORT,
    peer_chain: chains::INGRESS_FROM,
    target_dir: iptm::DST,
    peer_dir: iptm::SRC,
    cidr_flag: iptm::SRC_CIDR,
};

const EGRESS: Direction = Direction {
    port_chain: chains::EGRESS_PORT,
    peer_chain: chains::EGRESS_TO,
    target_dir: iptm::SRC,
    peer_dir: iptm::DST,
    cidr_flag: iptm::DST_CIDR,
};

struct DirRule {
    peers: Vec<Peer>,
    ports: Vec<PortSpec>,
}

pub(crate) fn translate(np: &k8s::NetworkPolicy) -> Translation {
    let ns = np.namespace().unwrap_or_default();
    let spec = np.spec.clone().unwrap_or_default();
    let mut out = Translation::default();

    let selector = Selector::from(spec.pod_selector.clone());
    let mut targets = Vec::new();
    if selector.selects_all() {
        targets.push(ns.clone());
    } else {
        for (k, v) in selector.match_label_pairs() {
            targets.push(names::label_set(&ns, k, v));
        }
    }
    out.pod_sets.extend(targets.iter().cloned());

    let (ingress, egress) = directions(&spec);

    if ingress {
        let rules: Vec<DirRule> = spec
            .ingress
            .iter()
            .flatten()
            .map(|r| DirRule {
                peers: parse_peers(r.from.as_deref().unwrap_or_default()),
                ports: parse_ports(r.ports.as_deref().unwrap_or_default()),
            })
            .collect();
        emit_direction(&INGRESS, &ns, &targets, &rules, &mut out);
    }

    if egress {
        let rules: Vec<DirRule> = spec
            .egress
            .iter()
            .flatten()
            .map(|r| DirRule {
                peers: parse_peers(r.to.as_deref().unwrap_or_default()),
                ports: parse_ports(r.ports.as_deref().unwrap_or_default()),
            })
            .collect();
        emit_direction(&EGRESS, &ns, &targets, &rules, &mut out);
    }

    out.pod_sets = dedup(out.pod_sets);
    out.ns_lists = dedup(out.ns_lists);
    out
}

/// Which directions the policy covers. An absent or empty `policyTypes`
/// list translates both.
fn directions(spec: &k8s::NetworkPolicySpec) -> (bool, bool) {
    match spec.policy_types.as_deref() {
        None | Some([]) => (true, true),
        Some(types) => (
            types.iter().any(|t| t == "Ingress"),
            types.iter().any(|t| t == "Egress"),
        ),
    }
}

fn emit_direction(
    dir: &Direction,
    ns: &str,
    targets: &[String],
    rules: &[DirRule],
    out: &mut Translation,
) {
    let ports: Vec<&PortSpec> = rules.iter().flat_map(|r| r.ports.iter()).collect();
    let peers: Vec<&Peer> = rules.iter().flat_map(|r| r.peers.iter()).collect();

    // A selector carrying only expressions names no sets; the policy can
    // only fall back to a namespace-wide deny through the global list.
    if targets.is_empty() {
        out.ns_lists.push(names::ALL_NAMESPACES.to_string());
        out.rules.push(Rule::new(
            dir.port_chain,
            match_set(names::ALL_NAMESPACES, dir.target_dir)
                .into_iter()
                .chain(jump(iptm::REJECT)),
        ));
        return;
    }

    for target in targets {
        if ports.is_empty() && peers.is_empty() {
            // Default-deny: the direction is covered but no rule admits
            // anything.
            out.rules.push(Rule::new(
                dir.port_chain,
                match_set(target, dir.target_dir)
                    .into_iter()
                    .chain(jump(iptm::REJECT)),
            ));
            continue;
        }

        if ports.is_empty() {
            out.rules.push(Rule::new(
                dir.port_chain,
                match_set(target, dir.target_dir)
                    .into_iter()
                    .chain(jump(dir.peer_chain)),
            ));
        } else {
            for port in &ports {
                let mut specs = vec![iptm::PROTOCOL.to_string(), port.protocol.clone()];
                if let Some(p) = &port.port {
                    specs.push(iptm::DPORT.to_string());
                    specs.push(p.clone());
                }
                specs.extend(match_set(target, dir.target_dir));
                specs.extend(jump(dir.peer_chain));
                out.rules.push(Rule {
                    chain: dir.port_chain.to_string(),
                    specs,
                });
            }
        }

        if peers.is_empty() {
            // Port-gated allow-all: anything that passed the port chain is
            // admitted.
            out.rules.push(Rule::new(
                dir.peer_chain,
                match_set(target, dir.target_dir)
                    .into_iter()
                    .chain(jump(iptm::ACCEPT)),
            ));
            continue;
        }

        for peer in &peers {
            match peer {
                Peer::Pods(sel) => {
                    let sources = if sel.has_match_labels() {
                        sel.match_label_pairs()
                            .map(|(k, v)| names::label_set(ns, k, v))
                            .collect()
                    } else {
                        vec![ns.to_string()]
                    };
                    for source in sources {
                        out.pod_sets.push(source.clone());
                        out.rules.push(pair_rule(dir, &source, target));
                    }
                }
                Peer::Namespaces(sel) => {
                    let sources = if sel.has_match_labels() {
                        sel.match_label_pairs()
                            .map(|(k, v)| names::label_set(names::ALL_NAMESPACES, k, v))
                            .collect()
                    } else {
                        vec![names::ALL_NAMESPACES.to_string()]
                    };
                    for source in sources {
                        out.ns_lists.push(source.clone());
                        out.rules.push(pair_rule(dir, &source, target));
                    }
                }
                Peer::Block { cidr, except } => {
                    for exception in except {
                        out.rules.push(Rule::new(
                            dir.peer_chain,
                            match_set(target, dir.target_dir)
                                .into_iter()
                                .chain([dir.cidr_flag.to_string(), exception.clone()])
                                .chain(jump(iptm::REJECT)),
                        ));
                    }
                    out.rules.push(Rule::new(
                        dir.peer_chain,
                        match_set(target, dir.target_dir)
                            .into_iter()
                            .chain([dir.cidr_flag.to_string(), cidr.clone()])
                            .chain(jump(iptm::ACCEPT)),
                    ));
                }
            }
        }
    }
}

/// A peer-to-target ACCEPT in the direction's peer chain, source match
/// first.
fn pair_rule(dir: &Direction, peer_set: &str, target: &str) -> Rule {
    let (first, second) = if dir.target_dir == iptm::SRC {
        ((target, dir.target_dir), (peer_set, dir.peer_dir))
    } else {
        ((peer_set, dir.peer_dir), (target, dir.target_dir))
    };
    Rule::new(
        dir.peer_chain,
        match_set(first.0, first.1)
            .into_iter()
            .chain(match_set(second.0, second.1))
            .chain(jump(iptm::ACCEPT)),
    )
}

fn match_set(internal: &str, direction: &str) -> Vec<String> {
    vec![
        iptm::MATCH.to_string(),
        iptm::SET_MODULE.to_string(),
        iptm::MATCH_SET.to_string(),
        names::external_name(internal),
        direction.to_string(),
    ]
}

fn jump(target: &str) -> [String; 2] {
    [iptm::JUMP.to_string(), target.to_string()]
}

fn parse_peers(peers: &[k8s::NetworkPolicyPeer]) -> Vec<Peer> {
    peers.iter().filter_map(parse_peer).collect()
}

fn parse_peer(peer: &k8s::NetworkPolicyPeer) -> Option<Peer> {
    let kinds = usize::from(peer.pod_selector.is_some())
        + usize::from(peer.namespace_selector.is_some())
        + usize::from(peer.ip_block.is_some());
    if kinds > 1 {
        warn!("policy peer sets multiple selector kinds; applying the most specific");
    }

    if let Some(sel) = &peer.pod_selector {
        return Some(Peer::Pods(sel.clone().into()));
    }
    if let Some(sel) = &peer.namespace_selector {
        return Some(Peer::Namespaces(sel.clone().into()));
    }
    if let Some(block) = &peer.ip_block {
        if block.cidr.parse::<ipnet::IpNet>().is_err() {
            warn!(cidr = %block.cidr, "ignoring peer with malformed CIDR");
            return None;
        }
        let except = block
            .except
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| {
                let ok = e.parse::<ipnet::IpNet>().is_ok();
                if !ok {
                    warn!(cidr = %e, "dropping malformed CIDR exception");
                }
                ok
            })
            .collect();
        return Some(Peer::Block {
            cidr: block.cidr.clone(),
            except,
        });
    }

    debug!("ignoring empty policy peer");
    None
}

fn parse_ports(ports: &[k8s::NetworkPolicyPort]) -> Vec<PortSpec> {
    ports
        .iter()
        .map(|p| {
            let port = p.port.as_ref().map(|p| match p {
                IntOrString::Int(i) => i.to_string(),
                IntOrString::String(name) => {
                    // Named ports cannot be resolved without the pod spec;
                    // pass the name through and let the backend refuse it.
                    warn!(port = %name, "policy references a named port");
                    name.clone()
                }
            });
            PortSpec {
                protocol: p.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
                port,
            }
        })
        .collect()
}

/// Order-preserving dedup for the set/list name vectors.
fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = ahash::AHashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// Drives the network-policy watch into the index.
///
/// An applied policy is staged as a delete of the stored incarnation
/// followed by an add, with the lock released between the two steps;
/// another event may interleave, as the original informer callbacks
/// allowed.
pub async fn index_network_policies(
    index: SharedIndex,
    events: impl Stream<Item = watcher::Event<k8s::NetworkPolicy>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Applied(np) => {
                let ns = np.namespace().unwrap_or_default();
                let name = np.name_unchecked();
                let _span = info_span!("apply", %ns, %name).entered();
                if let Err(error) = index.write().delete_network_policy(&ns, &name) {
                    warn!(%error, "failed to remove stale network policy");
                }
                if marked_for_deletion(&np.metadata) {
                    debug!("policy is terminating; treating as delete");
                    continue;
                }
                if let Err(error) = index.write().add_network_policy(np) {
                    warn!(%error, "failed to add network policy");
                }
            }
            watcher::Event::Deleted(np) => {
                let ns = np.namespace().unwrap_or_default();
                let name = np.name_unchecked();
                let _span = info_span!("delete", %ns, %name).entered();
                if let Err(error) = index.write().delete_network_policy(&ns, &name) {
                    warn!(%error, "failed to delete network policy");
                }
            }
            watcher::Event::Restarted(policies) => {
                let _span = info_span!("restart").entered();
                if let Err(error) = index.write().reset_network_policies(policies) {
                    warn!(%error, "failed to reset network policies");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};
    use netpol_agent_k8s_api::{labels, LabelSelector, LabelSelectorRequirement};

    fn policy(spec: k8s::NetworkPolicySpec) -> k8s::NetworkPolicy {
        k8s::NetworkPolicy {
            metadata: netpol_agent_k8s_api::ObjectMeta {
                namespace: Some("ns1".to_string()),
                name: Some("np".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn match_labels(labels: labels::Map) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels),
            ..Default::default()
        }
    }

    #[test]
    fn translation_is_deterministic() {
        let np = policy(k8s::NetworkPolicySpec {
            pod_selector: match_labels(convert_args!(btreemap!("app" => "web", "tier" => "fe"))),
            ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                from: Some(vec![
                    k8s::NetworkPolicyPeer {
                        pod_selector: Some(match_labels(convert_args!(btreemap!("app" => "client")))),
                        ..Default::default()
                    },
                    k8s::NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector::default()),
                        ..Default::default()
                    },
                ]),
                ports: Some(vec![k8s::NetworkPolicyPort {
                    port: Some(IntOrString::Int(80)),
                    protocol: Some("tcp".to_string()),
                    ..Default::default()
                }]),
            }]),
            ..Default::default()
        });
        assert_eq!(translate(&np), translate(&np));
    }

    #[test]
    fn absent_policy_types_translates_both_directions() {
        let np = policy(k8s::NetworkPolicySpec::default());
        let t = translate(&np);
        let chains_hit: Vec<&str> = t.rules.iter().map(|r| r.chain.as_str()).collect();
        assert!(chains_hit.contains(&chains::INGRESS_PORT));
        assert!(chains_hit.contains(&chains::EGRESS_PORT));
    }

    #[test]
    fn empty_pod_selector_targets_the_namespace_set() {
        let np = policy(k8s::NetworkPolicySpec {
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        });
        let t = translate(&np);
        assert_eq!(t.pod_sets, ["ns1"]);
        assert_eq!(t.rules.len(), 1);
        assert_eq!(t.rules[0].chain, chains::INGRESS_PORT);
        assert_eq!(t.rules[0].specs.last().unwrap(), iptm::REJECT);
    }

    #[test]
    fn expression_only_selector_denies_via_global_list() {
        let np = policy(k8s::NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: "app".to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                }]),
                match_labels: None,
            },
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        });
        let t = translate(&np);
        assert!(t.pod_sets.is_empty());
        assert_eq!(t.ns_lists, [names::ALL_NAMESPACES]);
        assert_eq!(t.rules.len(), 1);
        assert!(t.rules[0]
            .specs
            .contains(&names::external_name(names::ALL_NAMESPACES)));
        assert_eq!(t.rules[0].specs.last().unwrap(), iptm::REJECT);
    }

    #[test]
    fn named_ports_pass_through() {
        let np = policy(k8s::NetworkPolicySpec {
            pod_selector: match_labels(convert_args!(btreemap!("app" => "web"))),
            ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                from: None,
                ports: Some(vec![k8s::NetworkPolicyPort {
                    port: Some(IntOrString::String("metrics".to_string())),
                    protocol: Some("tcp".to_string()),
                    ..Default::default()
                }]),
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        });
        let t = translate(&np);
        let port_rule = t
            .rules
            .iter()
            .find(|r| r.chain == chains::INGRESS_PORT)
            .unwrap();
        let dport = port_rule
            .specs
            .windows(2)
            .find(|w| w[0] == iptm::DPORT)
            .unwrap();
        assert_eq!(dport[1], "metrics");
    }

    #[test]
    fn shared_sets_are_deduplicated() {
        let np = policy(k8s::NetworkPolicySpec {
            pod_selector: match_labels(convert_args!(btreemap!("app" => "web"))),
            ingress: Some(vec![
                k8s::NetworkPolicyIngressRule {
                    from: Some(vec![k8s::NetworkPolicyPeer {
                        pod_selector: Some(match_labels(convert_args!(btreemap!("app" => "web")))),
                        ..Default::default()
                    }]),
                    ports: None,
                },
            ]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        });
        let t = translate(&np);
        assert_eq!(t.pod_sets, ["ns1-app:web"]);
    }
}
