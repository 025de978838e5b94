//! This module holds the index's state and the logic that keeps the flow table in sync with it,
//! without dealing with the specifics of how resources are laid out in the Kubernetes API (e.g.
//! annotation handling is done in the resource-specific modules).

use crate::{
    compile::{compile, CompiledPolicy},
    metrics::IndexMetrics,
    namespace::NamespaceSnapshot,
    pod::PodSnapshot,
    selector::Snapshot,
    ClusterInfo,
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use sdn_policy_controller_core::{Flow, FlowMatch, FlowTable, Transaction, Vnid};
use sdn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds all indexing state. Every watch task updates it while holding the shared lock, so each
/// flow-table transaction observes a consistent view of policies, isolation, and references.
#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    pub(crate) flows: Arc<dyn FlowTable>,
    pub(crate) metrics: IndexMetrics,

    /// Tracked namespaces, by vnid.
    pub(crate) namespaces: HashMap<Vnid, NamespaceRecord>,

    /// Vnids by namespace name. Every entry has a corresponding record in `namespaces`.
    pub(crate) vnids: HashMap<String, Vnid>,

    /// Namespace labels and isolation, by namespace name.
    pub(crate) kube_namespaces: HashMap<String, NamespaceSnapshot>,

    /// Pods with a known IP, by namespace and then by name.
    pub(crate) pods: HashMap<String, HashMap<String, PodSnapshot>>,

    /// Policies in namespaces whose vnid is not yet known, by namespace and then by name.
    pub(crate) pending_policies: HashMap<String, HashMap<String, k8s::NetworkPolicy>>,

    /// Vnids of untracked namespaces whose rules could not be removed.
    pub(crate) stale_vnids: BTreeSet<Vnid>,
}

/// The policy state of a namespace whose vnid is known.
#[derive(Debug)]
pub(crate) struct NamespaceRecord {
    pub name: String,
    pub vnid: Vnid,
    pub isolated: bool,

    /// The number of consumers that require this namespace's rules to be installed.
    pub refs: usize,

    /// Whether the namespace's rules were installed by the last committed transaction.
    pub in_use: bool,

    /// Compiled policies, by name.
    pub policies: BTreeMap<String, CompiledPolicy>,
}

/// The class of input that changed, used to select which compiled policies must be refreshed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Watched<'a> {
    /// Namespace labels changed, or namespaces were added or removed.
    Namespaces,

    /// Pod labels or IPs changed in the given namespace.
    Pods(&'a str),
}

// === impl Index ===

impl Index {
    pub fn shared(
        cluster_info: impl Into<Arc<ClusterInfo>>,
        flows: Arc<dyn FlowTable>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cluster_info: cluster_info.into(),
            flows,
            metrics,
            namespaces: HashMap::default(),
            vnids: HashMap::default(),
            kube_namespaces: HashMap::default(),
            pods: HashMap::default(),
            pending_policies: HashMap::default(),
            stale_vnids: BTreeSet::new(),
        }))
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    /// Returns the vnid assigned to a namespace, if it is known.
    pub fn vnid(&self, namespace: &str) -> Option<Vnid> {
        self.vnids.get(namespace).copied()
    }

    /// Returns the names of the namespaces that are assigned the given vnid.
    pub fn namespaces_for_vnid(&self, vnid: Vnid) -> Vec<String> {
        let mut names = self
            .vnids
            .iter()
            .filter(|(_, v)| **v == vnid)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Adds a reference to a namespace's rules, installing them if this is the first reference.
    pub fn ref_vnid(&mut self, vnid: Vnid) {
        let Some(ns) = self.namespaces.get_mut(&vnid) else {
            debug!(vnid, "Ignoring reference to unknown VNID");
            return;
        };
        ns.refs += 1;
        ns.sync(&*self.flows, &self.metrics);
    }

    /// Releases a reference to a namespace's rules, removing them if this was the last reference.
    pub fn unref_vnid(&mut self, vnid: Vnid) {
        let Some(ns) = self.namespaces.get_mut(&vnid) else {
            debug!(vnid, "Ignoring release of unknown VNID");
            return;
        };
        if ns.refs == 0 {
            warn!(vnid, "Refcounting error on VNID");
            return;
        }
        ns.refs -= 1;
        ns.sync(&*self.flows, &self.metrics);
    }

    /// Reinstalls the rules of every tracked namespace and removes the rules left behind by
    /// untracked namespaces.
    ///
    /// This repairs the flow table after a failed transaction, or after rules were removed out
    /// from under the controller.
    pub fn resync(&mut self) {
        let vnids = self.namespaces.keys().copied().collect::<Vec<_>>();
        debug!(namespaces = vnids.len(), stale = self.stale_vnids.len(), "Resyncing");
        self.remove_stale_rules();
        self.sync_namespaces(vnids);
    }

    /// Removes the rules of untracked namespaces whose teardown failed, forgetting each vnid once
    /// its rules are gone.
    fn remove_stale_rules(&mut self) {
        let flows = &*self.flows;
        let metrics = &self.metrics;
        self.stale_vnids.retain(|&vnid| {
            let mut tx = Transaction::new(flows);
            tx.delete_flows(FlowMatch::namespace(vnid));
            metrics.flow_transactions.inc();
            match tx.commit() {
                Ok(()) => {
                    debug!(vnid, "Removed rules of untracked VNID");
                    false
                }
                Err(error) => {
                    metrics.flow_transaction_failures.inc();
                    error!(vnid, %error, "Failed to remove flows for VNID");
                    true
                }
            }
        });
    }

    pub(crate) fn sync_namespaces(&mut self, vnids: impl IntoIterator<Item = Vnid>) {
        for vnid in vnids {
            if let Some(ns) = self.namespaces.get_mut(&vnid) {
                ns.sync(&*self.flows, &self.metrics);
            }
        }
    }

    /// Adjusts the reference count of a namespace by name.
    ///
    /// Returns the namespace's vnid when the namespace moved into or out of use, in which case
    /// the caller must sync it.
    pub(crate) fn add_ref(&mut self, namespace: &str) -> Option<Vnid> {
        let vnid = self.vnid(namespace)?;
        let ns = self.namespaces.get_mut(&vnid)?;
        ns.refs += 1;
        (ns.refs == 1).then_some(vnid)
    }

    pub(crate) fn release_ref(&mut self, namespace: &str) -> Option<Vnid> {
        let vnid = self.vnid(namespace)?;
        let ns = self.namespaces.get_mut(&vnid)?;
        if ns.refs == 0 {
            warn!(vnid, %namespace, "Refcounting error on VNID");
            return None;
        }
        ns.refs -= 1;
        (ns.refs == 0).then_some(vnid)
    }

    /// Compiles a policy against the current state, falling back to deny-all when the policy
    /// cannot be expressed as flows.
    pub(crate) fn compile_policy(
        &self,
        ns: &NamespaceRecord,
        policy: k8s::NetworkPolicy,
    ) -> CompiledPolicy {
        let snapshot = Snapshot {
            namespaces: &self.namespaces,
            kube_namespaces: &self.kube_namespaces,
            pods: &self.pods,
        };
        self.metrics.policy_compiles.inc();
        match compile(&snapshot, ns, &policy) {
            Ok(compiled) => compiled,
            Err(error) => {
                self.metrics.policy_compile_failures.inc();
                info!(
                    namespace = %ns.name,
                    name = %policy.name_any(),
                    %error,
                    "Unsupported NetworkPolicy; treating as deny-all"
                );
                CompiledPolicy::deny_all(policy)
            }
        }
    }

    /// Compiles and stores a policy in a tracked namespace.
    ///
    /// Returns true if the policy's flows changed.
    pub(crate) fn update_policy(&mut self, vnid: Vnid, policy: k8s::NetworkPolicy) -> bool {
        let Some(ns) = self.namespaces.get(&vnid) else {
            return false;
        };
        let name = policy.name_any();
        let compiled = self.compile_policy(ns, policy);
        match self.namespaces.get_mut(&vnid) {
            Some(ns) => ns.insert_policy(name, compiled),
            None => false,
        }
    }

    /// Recompiles every policy that depends on the changed class of input.
    ///
    /// Returns the vnids of the namespaces whose compiled flows changed. Each must be synced once
    /// by the caller.
    pub(crate) fn refresh_policies(&mut self, watched: Watched<'_>) -> BTreeSet<Vnid> {
        let mut updates = Vec::new();
        for ns in self.namespaces.values() {
            if let Watched::Pods(namespace) = watched {
                // Pod selectors only select pods in the policy's own namespace.
                if ns.name != namespace {
                    continue;
                }
            }
            for (name, policy) in &ns.policies {
                if policy.watches(watched) {
                    let compiled = self.compile_policy(ns, policy.policy.clone());
                    updates.push((ns.vnid, name.clone(), compiled));
                }
            }
        }

        let mut changed = BTreeSet::new();
        for (vnid, name, compiled) in updates {
            if let Some(ns) = self.namespaces.get_mut(&vnid) {
                if ns.insert_policy(name, compiled) {
                    changed.insert(vnid);
                }
            }
        }
        changed
    }

    #[cfg(test)]
    pub(crate) fn namespace(&self, vnid: Vnid) -> Option<&NamespaceRecord> {
        self.namespaces.get(&vnid)
    }
}

// === impl NamespaceRecord ===

impl NamespaceRecord {
    pub(crate) fn new(name: String, vnid: Vnid, isolated: bool, refs: usize) -> Self {
        Self {
            name,
            vnid,
            isolated,
            refs,
            in_use: false,
            policies: BTreeMap::new(),
        }
    }

    /// Stores a compiled policy, returning true if its flows differ from the policy it replaces.
    pub(crate) fn insert_policy(&mut self, name: String, compiled: CompiledPolicy) -> bool {
        let changed = self
            .policies
            .get(&name)
            .is_none_or(|prior| prior.flows != compiled.flows);
        if !changed {
            debug!(namespace = %self.name, %name, "NetworkPolicy is unchanged");
        }
        self.policies.insert(name, compiled);
        changed
    }

    /// Replaces the namespace's rules in the flow table.
    ///
    /// When the namespace is referenced, an isolated namespace gets one rule per compiled flow
    /// (and so denies everything when it has no policies) while a non-isolated namespace gets a
    /// single allow-all rule. An unreferenced namespace has all of its rules removed.
    pub(crate) fn sync(&mut self, flows: &dyn FlowTable, metrics: &IndexMetrics) {
        let in_use = self.refs > 0;
        if !in_use && !self.in_use {
            return;
        }

        debug!(
            vnid = self.vnid,
            namespace = %self.name,
            in_use,
            isolated = self.isolated,
            "Syncing namespace"
        );
        let mut tx = Transaction::new(flows);
        tx.delete_flows(FlowMatch::namespace(self.vnid));
        if in_use {
            if self.isolated {
                let fragments = self
                    .policies
                    .values()
                    .flat_map(|p| p.flows.iter())
                    .collect::<BTreeSet<_>>();
                for fragment in fragments {
                    tx.add_flow(Flow::namespace_policy(self.vnid, fragment));
                }
            } else {
                tx.add_flow(Flow::namespace_allow_all(self.vnid));
            }
        }

        metrics.flow_transactions.inc();
        match tx.commit() {
            Ok(()) => self.in_use = in_use,
            Err(error) => {
                // The record keeps its prior state so that the next sync retries.
                metrics.flow_transaction_failures.inc();
                error!(
                    vnid = self.vnid,
                    namespace = %self.name,
                    %error,
                    "Failed to sync flows for VNID"
                );
            }
        }
    }
}
