use crate::{index::NamespaceRecord, namespace::NamespaceSnapshot, pod::PodSnapshot};
use ahash::AHashMap as HashMap;
use sdn_policy_controller_core::Vnid;
use sdn_policy_controller_k8s_api::{
    labels::{self, Selector},
    LabelSelector,
};
use std::net::IpAddr;
use tracing::error;

/// A read-only view of the index that label selectors are evaluated against.
pub(crate) struct Snapshot<'a> {
    pub namespaces: &'a HashMap<Vnid, NamespaceRecord>,
    pub kube_namespaces: &'a HashMap<String, NamespaceSnapshot>,
    pub pods: &'a HashMap<String, HashMap<String, PodSnapshot>>,
}

impl Snapshot<'_> {
    /// Returns the vnids of the tracked namespaces whose labels match the selector.
    ///
    /// Namespaces whose `Namespace` resource has not been observed cannot be selected.
    pub(crate) fn select_namespaces(&self, selector: &LabelSelector) -> Vec<Vnid> {
        let labeled = self
            .namespaces
            .values()
            .filter_map(|ns| Some((ns.vnid, &self.kube_namespaces.get(&ns.name)?.labels)));

        if labels::selects_all(selector) {
            return labeled.map(|(vnid, _)| vnid).collect();
        }

        let Some(selector) = Self::selector(selector, "NamespaceSelector") else {
            return vec![];
        };
        labeled
            .filter(|(_, labels)| selector.matches(labels))
            .map(|(vnid, _)| vnid)
            .collect()
    }

    /// Returns the IPs of the pods in `namespace` whose labels match the selector.
    pub(crate) fn select_pods(&self, namespace: &str, selector: &LabelSelector) -> Vec<IpAddr> {
        let Some(pods) = self.pods.get(namespace) else {
            return vec![];
        };

        if labels::selects_all(selector) {
            return pods.values().map(|pod| pod.ip).collect();
        }

        let Some(selector) = Self::selector(selector, "PodSelector") else {
            return vec![];
        };
        pods.values()
            .filter(|pod| selector.matches(&pod.labels))
            .map(|pod| pod.ip)
            .collect()
    }

    fn selector(selector: &LabelSelector, kind: &'static str) -> Option<Selector> {
        match Selector::try_from(selector) {
            Ok(selector) => Some(selector),
            Err(error) => {
                // Admission validation should have rejected the policy.
                error!(%error, "Invalid {kind}; selecting nothing");
                None
            }
        }
    }
}
