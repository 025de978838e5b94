use crate::{
    index::{Index, Watched},
    SharedIndex,
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use sdn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, instrument, trace, warn};

/// The parts of a `Pod` that network policies depend on.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PodSnapshot {
    pub ip: IpAddr,
    pub labels: k8s::Labels,

    /// Set when the pod is scheduled on this node.
    pub local: bool,
}

/// Filters pod updates before they reach the index.
///
/// Pods change far more often than the fields policies depend on. The gate remembers what it
/// last forwarded for each pod so that status churn does not contend on the index's lock.
#[derive(Debug)]
pub struct PodGate {
    index: SharedIndex,
    node_name: String,
    seen: HashMap<(String, String), PodSnapshot>,
}

// === impl PodSnapshot ===

impl PodSnapshot {
    /// Returns `None` for pods that are not attached to the pod network: host-network pods and
    /// pods that have not been assigned an IP.
    pub(crate) fn from_pod(pod: &k8s::Pod, node_name: &str) -> Option<Self> {
        let spec = pod.spec.as_ref()?;
        if spec.host_network == Some(true) {
            return None;
        }

        let Some(ip) = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
        else {
            trace!(pod = %pod.name_any(), "Pod IP is not set");
            return None;
        };
        let ip = match ip.parse() {
            Ok(ip) => ip,
            Err(error) => {
                debug!(pod = %pod.name_any(), %ip, %error, "Ignoring pod with invalid IP");
                return None;
            }
        };

        Some(Self {
            ip,
            labels: pod.metadata.labels.clone().into(),
            local: spec.node_name.as_deref() == Some(node_name),
        })
    }
}

// === impl Index ===

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let Some(namespace) = pod.namespace() else {
            warn!(name = %pod.name_any(), "Pod has no namespace");
            return;
        };
        let name = pod.name_any();
        match PodSnapshot::from_pod(&pod, &self.cluster_info().node_name) {
            Some(snapshot) => self.apply_pod(namespace, name, snapshot),
            None => self.delete_pod(namespace, name),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(namespace, name);
    }
}

impl Index {
    #[instrument(skip(self, snapshot), fields(ip = %snapshot.ip))]
    pub(crate) fn apply_pod(&mut self, namespace: String, name: String, snapshot: PodSnapshot) {
        let pods = self.pods.entry(namespace.clone()).or_default();
        let local = snapshot.local;
        let prior = pods.insert(name, snapshot.clone());

        let selectable_changed = match &prior {
            Some(prior) if *prior == snapshot => {
                trace!("No changes");
                return;
            }
            Some(prior) => prior.ip != snapshot.ip || prior.labels != snapshot.labels,
            None => true,
        };

        let mut dirty = if selectable_changed {
            self.refresh_policies(Watched::Pods(&namespace))
        } else {
            Default::default()
        };

        let was_local = prior.is_some_and(|p| p.local);
        if local && !was_local {
            dirty.extend(self.add_ref(&namespace));
        } else if was_local && !local {
            dirty.extend(self.release_ref(&namespace));
        }

        self.sync_namespaces(dirty);
    }

    #[instrument(skip(self))]
    pub(crate) fn delete_pod(&mut self, namespace: String, name: String) {
        let Some(pods) = self.pods.get_mut(&namespace) else {
            return;
        };
        let Some(pod) = pods.remove(&name) else {
            return;
        };
        if pods.is_empty() {
            self.pods.remove(&namespace);
        }
        debug!(ip = %pod.ip, "Removed pod");

        let mut dirty = self.refresh_policies(Watched::Pods(&namespace));
        if pod.local {
            dirty.extend(self.release_ref(&namespace));
        }
        self.sync_namespaces(dirty);
    }
}

// === impl PodGate ===

impl PodGate {
    pub fn new(index: SharedIndex) -> Self {
        let node_name = index.read().cluster_info().node_name.clone();
        Self {
            index,
            node_name,
            seen: HashMap::default(),
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for PodGate {
    fn apply(&mut self, pod: k8s::Pod) {
        let Some(namespace) = pod.namespace() else {
            warn!(name = %pod.name_any(), "Pod has no namespace");
            return;
        };
        let name = pod.name_any();
        let snapshot = PodSnapshot::from_pod(&pod, &self.node_name);

        let key = (namespace, name);
        if self.seen.get(&key) == snapshot.as_ref() {
            return;
        }
        let (namespace, name) = key.clone();
        match snapshot {
            Some(snapshot) => {
                self.seen.insert(key, snapshot.clone());
                self.index.write().apply_pod(namespace, name, snapshot);
            }
            None => {
                self.seen.remove(&key);
                self.index.write().delete_pod(namespace, name);
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = (namespace, name);
        if self.seen.remove(&key).is_some() {
            let (namespace, name) = key;
            self.index.write().delete_pod(namespace, name);
        }
    }
}
