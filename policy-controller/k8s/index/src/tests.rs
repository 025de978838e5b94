
use crate::{ClusterInfo, Index, IndexMetrics, SharedIndex, NETWORK_POLICY_ANNOTATION};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sdn_policy_controller_core::{Flow, FlowOp, FlowTable, Vnid};
use sdn_policy_controller_k8s_api::{
    self as k8s, IntOrString, LabelSelector, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

const NODE: &str = "node-0";

#[test]
fn admits_rule_traffic_once_referenced() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, true));
    test.apply_cluster(mk_netns("ns-0", 5));
    test.apply(mk_policy(
        "ns-0",
        "web",
        None,
        Some(vec![mk_rule(
            Some(vec![mk_namespace_peer(None)]),
            Some(vec![mk_port("TCP", 80)]),
        )]),
    ));

    // Nothing is installed until the namespace is used on this node.
    assert_eq!(test.transactions(), Vec::<Vec<String>>::new());

    test.index.write().ref_vnid(5);
    assert_eq!(
        test.transactions(),
        vec![vec![
            "delete table=80, reg1=5".to_string(),
            "add table=80, priority=100, reg1=5, tcp, tp_dst=80, actions=output:NXM_NX_REG2[]"
                .to_string(),
        ]]
    );
    assert_eq!(
        test.rules(5),
        vec!["table=80, priority=100, reg1=5, tcp, tp_dst=80, actions=output:NXM_NX_REG2[]"]
    );

    test.index.write().unref_vnid(5);
    assert_eq!(
        test.transactions(),
        vec![vec!["delete table=80, reg1=5".to_string()]]
    );
    assert!(test.rules(5).is_empty());
}

#[test]
fn non_isolated_namespace_admits_everything() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, false));
    test.apply_cluster(mk_netns("ns-0", 5));
    test.apply(mk_policy(
        "ns-0",
        "web",
        None,
        Some(vec![mk_rule(None, Some(vec![mk_port("TCP", 80)]))]),
    ));
    test.index.write().ref_vnid(5);

    assert_eq!(
        test.rules(5),
        vec!["table=80, priority=100, reg1=5, actions=output:NXM_NX_REG2[]"]
    );
}

#[test]
fn isolated_namespace_without_policies_denies_everything() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, true));
    test.apply_cluster(mk_netns("ns-0", 5));
    test.index.write().ref_vnid(5);

    assert_eq!(
        test.transactions(),
        vec![vec!["delete table=80, reg1=5".to_string()]]
    );
    assert!(test.rules(5).is_empty());
}

#[test]
fn reapplying_state_is_idempotent() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, true));
    test.apply_cluster(mk_netns("ns-0", 5));
    let policy = mk_policy(
        "ns-0",
        "web",
        None,
        Some(vec![mk_rule(None, Some(vec![mk_port("TCP", 80)]))]),
    );
    test.apply(policy.clone());
    test.index.write().ref_vnid(5);
    test.transactions();

    test.apply(policy);
    test.apply_cluster(mk_namespace("ns-0", None, true));
    test.apply_cluster(mk_netns("ns-0", 5));
    assert_eq!(test.transactions(), Vec::<Vec<String>>::new());
}

#[test]
fn unbalanced_release_is_ignored() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, false));
    test.apply_cluster(mk_netns("ns-0", 5));

    test.index.write().unref_vnid(5);
    assert_eq!(test.transactions(), Vec::<Vec<String>>::new());
    assert_eq!(test.index.read().namespace(5).map(|ns| ns.refs), Some(0));

    // References to unknown vnids are ignored.
    test.index.write().ref_vnid(6);
    test.index.write().unref_vnid(6);
    assert_eq!(test.transactions(), Vec::<Vec<String>>::new());
}

#[test]
fn failed_commit_is_retried_by_resync() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, false));
    test.apply_cluster(mk_netns("ns-0", 5));

    test.flows.fail(true);
    test.index.write().ref_vnid(5);
    assert!(test.rules(5).is_empty());
    assert_eq!(test.metrics.flow_transaction_failures.get(), 1);
    assert_eq!(test.index.read().namespace(5).map(|ns| ns.in_use), Some(false));

    test.flows.fail(false);
    test.index.write().resync();
    assert_eq!(
        test.rules(5),
        vec!["table=80, priority=100, reg1=5, actions=output:NXM_NX_REG2[]"]
    );
    assert_eq!(test.index.read().namespace(5).map(|ns| ns.in_use), Some(true));
}

#[test]
fn resync_skips_unused_namespaces() {
    let test = TestConfig::default();
    test.apply_cluster(mk_namespace("ns-0", None, false));
    test.apply_cluster(mk_netns("ns-0", 5));
    test.apply_cluster(mk_namespace("ns-1", None, false));
    test.apply_cluster(mk_netns("ns-1", 6));
    test.index.write().ref_vnid(6);
    test.transactions();

    test.index.write().resync();
    assert_eq!(
        test.transactions(),
        vec![vec![
            "delete table=80, reg1=6".to_string(),
            "add table=80, priority=100, reg1=6, actions=output:NXM_NX_REG2[]".to_string(),
        ]]
    );
}

#[test]
fn looks_up_namespaces_by_vnid() {
    let test = TestConfig::default();
    test.apply_cluster(mk_netns("ns-b", 5));
    test.apply_cluster(mk_netns("ns-a", 7));

    let index = test.index.read();
    assert_eq!(index.vnid("ns-b"), Some(5));
    assert_eq!(index.vnid("ns-c"), None);
    assert_eq!(index.namespaces_for_vnid(7), vec!["ns-a".to_string()]);
    assert_eq!(index.namespaces_for_vnid(8), Vec::<String>::new());
}

// === Helpers ===

struct TestConfig {
    index: SharedIndex,
    flows: Arc<FlowRecorder>,
    metrics: IndexMetrics,
    _tracing: tracing::subscriber::DefaultGuard,
}

/// Records committed transactions and maintains the resulting flow table.
#[derive(Debug, Default)]
struct FlowRecorder {
    fail: AtomicBool,
    transactions: Mutex<Vec<Vec<String>>>,
    installed: Mutex<Vec<Flow>>,
}

impl TestConfig {
    fn apply<T>(&self, resource: T)
    where
        Index: IndexNamespacedResource<T>,
    {
        <Index as IndexNamespacedResource<T>>::apply(&mut self.index.write(), resource)
    }

    fn delete<T>(&self, ns: &str, name: &str)
    where
        Index: IndexNamespacedResource<T>,
    {
        <Index as IndexNamespacedResource<T>>::delete(
            &mut self.index.write(),
            ns.to_string(),
            name.to_string(),
        )
    }

    fn apply_cluster<T>(&self, resource: T)
    where
        Index: IndexClusterResource<T>,
    {
        <Index as IndexClusterResource<T>>::apply(&mut self.index.write(), resource)
    }

    fn delete_cluster<T>(&self, name: &str)
    where
        Index: IndexClusterResource<T>,
    {
        <Index as IndexClusterResource<T>>::delete(&mut self.index.write(), name.to_string())
    }

    /// Returns (and forgets) the transactions committed since the last call.
    fn transactions(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.flows.transactions.lock())
    }

    /// Returns the installed policy rules for a namespace.
    fn rules(&self, vnid: Vnid) -> Vec<String> {
        let prefix = format!("reg1={vnid}, ");
        let mut rules = self
            .flows
            .installed
            .lock()
            .iter()
            .filter(|f| f.matches.starts_with(&prefix))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        rules.sort();
        rules
    }

    fn compiles(&self) -> u64 {
        self.metrics.policy_compiles.get()
    }

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .finish(),
        )
    }
}

impl Default for TestConfig {
    fn default() -> TestConfig {
        let _tracing = Self::init_tracing();
        let flows = Arc::new(FlowRecorder::default());
        let metrics = IndexMetrics::default();
        let cluster = ClusterInfo {
            node_name: NODE.to_string(),
        };
        let index = Index::shared(cluster, flows.clone(), metrics.clone());
        Self {
            index,
            flows,
            metrics,
            _tracing,
        }
    }
}

impl FlowRecorder {
    fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }
}

impl FlowTable for FlowRecorder {
    fn apply(&self, ops: &[FlowOp]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::Acquire) {
            anyhow::bail!("flow table unavailable");
        }

        let mut installed = self.installed.lock();
        for op in ops {
            match op {
                FlowOp::Add(flow) => installed.push(flow.clone()),
                FlowOp::Delete(m) => {
                    let prefix = format!("{}, ", m.matches);
                    installed.retain(|f| !(f.table == m.table && f.matches.starts_with(&prefix)));
                }
            }
        }
        self.transactions
            .lock()
            .push(ops.iter().map(ToString::to_string).collect());
        Ok(())
    }
}

fn mk_labels(labels: Option<(&str, &str)>) -> Option<k8s::labels::Map> {
    labels.map(|(k, v)| btreemap! { k.to_string() => v.to_string() })
}

fn mk_namespace(name: &str, labels: Option<(&str, &str)>, isolated: bool) -> k8s::Namespace {
    let annotations = isolated.then(|| {
        btreemap! {
            NETWORK_POLICY_ANNOTATION.to_string() =>
                r#"{"ingress":{"isolation":"DefaultDeny"}}"#.to_string(),
        }
    });
    k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            labels: mk_labels(labels),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn mk_netns(name: &str, vnid: Vnid) -> k8s::NetNamespace {
    k8s::NetNamespace::new(name, vnid)
}

fn mk_pod(
    ns: &str,
    name: &str,
    node: &str,
    ip: &str,
    labels: Option<(&str, &str)>,
) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: mk_labels(labels),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}

fn mk_selector(labels: Option<(&str, &str)>) -> LabelSelector {
    LabelSelector {
        match_labels: mk_labels(labels),
        match_expressions: None,
    }
}

fn mk_policy(
    ns: &str,
    name: &str,
    pods: Option<(&str, &str)>,
    ingress: Option<Vec<NetworkPolicyIngressRule>>,
) -> k8s::NetworkPolicy {
    k8s::NetworkPolicy {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::NetworkPolicySpec {
            pod_selector: mk_selector(pods),
            ingress,
            ..Default::default()
        }),
    }
}

fn mk_rule(
    from: Option<Vec<NetworkPolicyPeer>>,
    ports: Option<Vec<NetworkPolicyPort>>,
) -> NetworkPolicyIngressRule {
    NetworkPolicyIngressRule { from, ports }
}

fn mk_port(protocol: &str, port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some(protocol.to_string()),
        port: Some(IntOrString::Int(port)),
        end_port: None,
    }
}

fn mk_pod_peer(labels: Option<(&str, &str)>) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(mk_selector(labels)),
        ..Default::default()
    }
}

fn mk_namespace_peer(labels: Option<(&str, &str)>) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(mk_selector(labels)),
        ..Default::default()
    }
}
