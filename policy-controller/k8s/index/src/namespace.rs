use crate::index::{Index, Watched};
use sdn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Annotates a namespace with its ingress isolation policy.
pub const NETWORK_POLICY_ANNOTATION: &str = "net.beta.kubernetes.io/network-policy";

const DEFAULT_DENY: &str = "DefaultDeny";

/// The parts of a `Namespace` that network policies depend on.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct NamespaceSnapshot {
    pub labels: k8s::Labels,
    pub isolated: bool,
}

/// The value of the isolation annotation, e.g. `{"ingress":{"isolation":"DefaultDeny"}}`.
#[derive(Debug, Deserialize)]
struct NamespaceNetworkPolicy {
    ingress: Option<NamespaceIngressPolicy>,
}

#[derive(Debug, Deserialize)]
struct NamespaceIngressPolicy {
    isolation: Option<String>,
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        let name = ns.name_any();
        let snapshot = NamespaceSnapshot {
            isolated: is_isolated(&name, &ns.metadata),
            labels: ns.metadata.labels.into(),
        };
        self.apply_namespace(name, snapshot);
    }

    fn delete(&mut self, name: String) {
        self.delete_namespace(name);
    }
}

impl Index {
    #[instrument(skip(self, snapshot), fields(isolated = snapshot.isolated))]
    pub(crate) fn apply_namespace(&mut self, name: String, snapshot: NamespaceSnapshot) {
        let labels_changed = match self.kube_namespaces.get(&name) {
            Some(prior) if *prior == snapshot => {
                debug!("No changes");
                return;
            }
            Some(prior) => prior.labels != snapshot.labels,
            None => true,
        };
        let isolated = snapshot.isolated;
        self.kube_namespaces.insert(name.clone(), snapshot);

        let mut dirty = if labels_changed {
            // Any policy in any namespace may select this namespace.
            self.refresh_policies(Watched::Namespaces)
        } else {
            Default::default()
        };

        // If the NetNamespace doesn't exist yet, its record is initialized from this snapshot
        // once it is created.
        if let Some(vnid) = self.vnid(&name) {
            if let Some(ns) = self.namespaces.get_mut(&vnid) {
                if ns.isolated != isolated {
                    debug!(vnid, "Isolation changed");
                    ns.isolated = isolated;
                    dirty.insert(vnid);
                }
            }
        }

        self.sync_namespaces(dirty);
    }

    /// Removes a namespace's labels.
    ///
    /// Its rules are not removed here: deleting a namespace also deletes its `NetNamespace`,
    /// which tears them down.
    #[instrument(skip(self))]
    pub(crate) fn delete_namespace(&mut self, name: String) {
        if let Some(pending) = self.pending_policies.remove(&name) {
            debug!(policies = pending.len(), "Dropping pending NetworkPolicies");
        }
        if self.kube_namespaces.remove(&name).is_none() {
            return;
        }
        let dirty = self.refresh_policies(Watched::Namespaces);
        self.sync_namespaces(dirty);
    }
}

/// Determines whether a namespace's annotation requests default-deny ingress isolation.
///
/// A missing or unparsable annotation leaves the namespace non-isolated.
fn is_isolated(name: &str, meta: &k8s::ObjectMeta) -> bool {
    let Some(annotation) = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(NETWORK_POLICY_ANNOTATION))
    else {
        return false;
    };

    match serde_json::from_str::<NamespaceNetworkPolicy>(annotation) {
        Ok(policy) => {
            policy
                .ingress
                .and_then(|ingress| ingress.isolation)
                .as_deref()
                == Some(DEFAULT_DENY)
        }
        Err(error) => {
            warn!(
                namespace = %name,
                %annotation,
                %error,
                "Namespace has unparsable {NETWORK_POLICY_ANNOTATION} annotation"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn meta(annotation: Option<&str>) -> k8s::ObjectMeta {
        k8s::ObjectMeta {
            name: Some("ns".to_string()),
            annotations: annotation.map(|a| {
                btreemap! { NETWORK_POLICY_ANNOTATION.to_string() => a.to_string() }
            }),
            ..Default::default()
        }
    }

    #[test]
    fn isolation_annotation() {
        for (annotation, isolated) in [
            (None, false),
            (Some(r#"{"ingress":{"isolation":"DefaultDeny"}}"#), true),
            (Some(r#"{"ingress":{"isolation":"DefaultAllow"}}"#), false),
            (Some(r#"{"ingress":{}}"#), false),
            (Some(r#"{}"#), false),
            (Some("DefaultDeny"), false),
        ] {
            assert_eq!(
                is_isolated("ns", &meta(annotation)),
                isolated,
                "{annotation:?}"
            );
        }
    }
}
