use crate::index::{Index, NamespaceRecord, Watched};
use sdn_policy_controller_core::Vnid;
use sdn_policy_controller_k8s_api as k8s;
use tracing::{debug, instrument, warn};

impl kubert::index::IndexClusterResource<k8s::NetNamespace> for Index {
    fn apply(&mut self, netns: k8s::NetNamespace) {
        self.apply_net_namespace(netns.netname, netns.netid);
    }

    fn delete(&mut self, name: String) {
        self.delete_net_namespace(name);
    }
}

impl Index {
    /// Starts tracking a namespace once its vnid is known.
    ///
    /// The record inherits the namespace's isolation and takes a reference for each local pod
    /// already indexed. Policies that were waiting on the vnid are compiled.
    #[instrument(skip(self))]
    pub(crate) fn apply_net_namespace(&mut self, name: String, vnid: Vnid) {
        match self.vnid(&name) {
            Some(prior) if prior == vnid => {
                debug!("No changes");
                return;
            }
            Some(prior) => {
                warn!(prior, "Ignoring VNID change for namespace");
                return;
            }
            None => {}
        }
        if let Some(ns) = self.namespaces.get(&vnid) {
            warn!(existing = %ns.name, "Got NetNamespace for already-existing VNID");
            return;
        }

        let isolated = self
            .kube_namespaces
            .get(&name)
            .is_some_and(|ns| ns.isolated);
        let refs = self
            .pods
            .get(&name)
            .map_or(0, |pods| pods.values().filter(|pod| pod.local).count());
        debug!(isolated, refs, "Tracking namespace");
        let mut ns = NamespaceRecord::new(name.clone(), vnid, isolated, refs);
        if self.stale_vnids.remove(&vnid) {
            // Rules from a prior owner of the vnid may still be installed.
            ns.in_use = true;
        }
        self.vnids.insert(name.clone(), vnid);
        self.namespaces.insert(vnid, ns);

        for (_, policy) in self.pending_policies.remove(&name).into_iter().flatten() {
            self.update_policy(vnid, policy);
        }

        // Policies elsewhere may select the new namespace.
        let mut dirty = self.refresh_policies(Watched::Namespaces);
        dirty.insert(vnid);
        self.sync_namespaces(dirty);
    }

    /// Stops tracking a namespace.
    ///
    /// If the namespace's rules are still installed, they are removed; when that fails, the vnid
    /// is remembered so that the next resync removes them. Its policies are held as pending in
    /// case the namespace is assigned a new vnid.
    #[instrument(skip(self))]
    pub(crate) fn delete_net_namespace(&mut self, name: String) {
        let Some(vnid) = self.vnids.remove(&name) else {
            return;
        };
        let Some(mut ns) = self.namespaces.remove(&vnid) else {
            return;
        };
        debug!(vnid, "Untracking namespace");

        if ns.in_use {
            ns.refs = 0;
            ns.sync(&*self.flows, &self.metrics);
            if ns.in_use {
                warn!(vnid, "Rules remain installed; retrying on resync");
                self.stale_vnids.insert(vnid);
            }
        }

        if !ns.policies.is_empty() {
            let pending = self.pending_policies.entry(name).or_default();
            for (name, compiled) in ns.policies {
                pending.insert(name, compiled.policy);
            }
        }

        let dirty = self.refresh_policies(Watched::Namespaces);
        self.sync_namespaces(dirty);
    }
}
