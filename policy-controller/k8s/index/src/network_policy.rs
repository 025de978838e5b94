use crate::index::Index;
use sdn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use tracing::{debug, instrument, warn};

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, policy: k8s::NetworkPolicy) {
        let Some(namespace) = policy.namespace() else {
            warn!(name = %policy.name_any(), "NetworkPolicy has no namespace");
            return;
        };
        self.apply_policy(namespace, policy);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_policy(namespace, name);
    }
}

impl Index {
    #[instrument(skip(self, policy), fields(name = %policy.name_any()))]
    fn apply_policy(&mut self, namespace: String, policy: k8s::NetworkPolicy) {
        let Some(vnid) = self.vnid(&namespace) else {
            // Compiled once the namespace's NetNamespace is observed.
            debug!("Deferring NetworkPolicy until the namespace's VNID is known");
            self.pending_policies
                .entry(namespace)
                .or_default()
                .insert(policy.name_any(), policy);
            return;
        };

        if self.update_policy(vnid, policy) {
            self.sync_namespaces([vnid]);
        }
    }

    #[instrument(skip(self))]
    fn delete_policy(&mut self, namespace: String, name: String) {
        if let Some(pending) = self.pending_policies.get_mut(&namespace) {
            pending.remove(&name);
            if pending.is_empty() {
                self.pending_policies.remove(&namespace);
            }
        }

        let Some(vnid) = self.vnid(&namespace) else {
            return;
        };
        let removed = self
            .namespaces
            .get_mut(&vnid)
            .and_then(|ns| ns.policies.remove(&name));
        if removed.is_some() {
            debug!(vnid, "Removed NetworkPolicy");
            self.sync_namespaces([vnid]);
        }
    }
}
