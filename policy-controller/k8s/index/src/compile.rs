use crate::{
    index::{NamespaceRecord, Watched},
    selector::Snapshot,
};
use sdn_policy_controller_core::{matches::fragment, Destination, Peer, Port, PortError, Protocol};
use sdn_policy_controller_k8s_api::{
    self as k8s, labels::selects_all, IntOrString, NetworkPolicyPeer, NetworkPolicyPort,
};

/// A `NetworkPolicy` compiled against the index's current state.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CompiledPolicy {
    /// The source policy, retained so that it may be recompiled when its inputs change.
    pub policy: k8s::NetworkPolicy,

    /// Set when the flows depend on the labels of namespaces.
    pub watches_namespaces: bool,

    /// Set when the flows depend on the labels or IPs of pods in the policy's namespace.
    pub watches_pods: bool,

    /// Sorted, deduplicated match fragments.
    pub flows: Vec<String>,
}

/// Describes a policy construct that cannot be expressed as flows.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CompileError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("peers that combine a podSelector and a namespaceSelector are not supported")]
    CombinedPeer,

    #[error("ipBlock peers are not supported")]
    IpBlock,

    #[error("peers must set a podSelector or a namespaceSelector")]
    EmptyPeer,
}

// === impl CompiledPolicy ===

impl CompiledPolicy {
    /// A policy that admits nothing.
    pub(crate) fn deny_all(policy: k8s::NetworkPolicy) -> Self {
        Self {
            policy,
            watches_namespaces: false,
            watches_pods: false,
            flows: vec![],
        }
    }

    pub(crate) fn watches(&self, watched: Watched<'_>) -> bool {
        match watched {
            Watched::Namespaces => self.watches_namespaces,
            Watched::Pods(_) => self.watches_pods,
        }
    }
}

/// Compiles a policy into match fragments for its namespace.
///
/// Each ingress rule contributes the cartesian product of the policy's destinations, the rule's
/// peers, and the rule's ports. An empty pod selector on the policy selects the whole namespace,
/// which the namespace's `reg1` match already expresses, so it does not make the policy depend
/// on pods.
pub(crate) fn compile(
    snapshot: &Snapshot<'_>,
    ns: &NamespaceRecord,
    policy: &k8s::NetworkPolicy,
) -> Result<CompiledPolicy, CompileError> {
    let mut compiled = CompiledPolicy::deny_all(policy.clone());
    let Some(spec) = policy.spec.as_ref() else {
        return Ok(compiled);
    };

    let destinations = if selects_all(&spec.pod_selector) {
        vec![Destination::Namespace]
    } else {
        compiled.watches_pods = true;
        snapshot
            .select_pods(&ns.name, &spec.pod_selector)
            .into_iter()
            .map(Destination::Pod)
            .collect()
    };

    let mut flows = Vec::new();
    for rule in spec.ingress.iter().flatten() {
        let ports = match rule.ports.as_deref() {
            None | Some([]) => vec![Port::Any],
            Some(ports) => ports.iter().map(port_match).collect::<Result<Vec<_>, _>>()?,
        };

        let peers = match rule.from.as_deref() {
            None | Some([]) => vec![Peer::Any],
            Some(peers) => {
                let mut matches = Vec::new();
                for p in peers {
                    matches.extend(peer_matches(snapshot, ns, p, &mut compiled)?);
                }
                matches
            }
        };

        for dst in &destinations {
            for peer in &peers {
                for port in &ports {
                    flows.push(fragment(dst, peer, port));
                }
            }
        }
    }

    flows.sort();
    flows.dedup();
    compiled.flows = flows;
    Ok(compiled)
}

fn port_match(port: &NetworkPolicyPort) -> Result<Port, PortError> {
    let protocol = Protocol::from_optional(port.protocol.as_deref())?;
    if let Some(end) = port.end_port {
        return Err(PortError::Range(end));
    }
    match &port.port {
        None => Ok(Port::Protocol(protocol)),
        Some(IntOrString::Int(port)) => Port::number(protocol, *port),
        Some(IntOrString::String(name)) => Err(PortError::NamedPort(name.clone())),
    }
}

fn peer_matches(
    snapshot: &Snapshot<'_>,
    ns: &NamespaceRecord,
    peer: &NetworkPolicyPeer,
    compiled: &mut CompiledPolicy,
) -> Result<Vec<Peer>, CompileError> {
    if peer.ip_block.is_some() {
        return Err(CompileError::IpBlock);
    }

    match (&peer.pod_selector, &peer.namespace_selector) {
        (Some(pods), None) => {
            if selects_all(pods) {
                // Every pod in the policy's own namespace.
                return Ok(vec![Peer::Namespace(ns.vnid)]);
            }
            compiled.watches_pods = true;
            Ok(snapshot
                .select_pods(&ns.name, pods)
                .into_iter()
                .map(|ip| Peer::Pod { vnid: ns.vnid, ip })
                .collect())
        }

        (None, Some(namespaces)) => {
            if selects_all(namespaces) {
                return Ok(vec![Peer::Any]);
            }
            compiled.watches_namespaces = true;
            Ok(snapshot
                .select_namespaces(namespaces)
                .into_iter()
                .map(Peer::Namespace)
                .collect())
        }

        (Some(_), Some(_)) => Err(CompileError::CombinedPeer),
        (None, None) => Err(CompileError::EmptyPeer),
    }
}
