use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{counter::Counter, gauge::ConstGauge, MetricType},
    registry::Registry,
};

/// Counts the index's compilations and flow-table transactions.
#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    pub(crate) flow_transactions: Counter,
    pub(crate) flow_transaction_failures: Counter,
    pub(crate) policy_compiles: Counter,
    pub(crate) policy_compile_failures: Counter,
}

#[derive(Debug)]
struct Instrumented(SharedIndex);

/// Registers a collector that reports the index's per-namespace sizes.
pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let flow_transactions = Counter::default();
        prom.register(
            "flow_transactions",
            "Count of flow table transactions",
            flow_transactions.clone(),
        );

        let flow_transaction_failures = Counter::default();
        prom.register(
            "flow_transaction_failures",
            "Count of flow table transactions that failed to commit",
            flow_transaction_failures.clone(),
        );

        let policy_compiles = Counter::default();
        prom.register(
            "policy_compiles",
            "Count of NetworkPolicy compilations",
            policy_compiles.clone(),
        );

        let policy_compile_failures = Counter::default();
        prom.register(
            "policy_compile_failures",
            "Count of NetworkPolicies compiled as deny-all because they are unsupported",
            policy_compile_failures.clone(),
        );

        Self {
            flow_transactions,
            flow_transaction_failures,
            policy_compiles,
            policy_compile_failures,
        }
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut policies_encoder = encoder.encode_descriptor(
            "namespace_policies",
            "The number of NetworkPolicies compiled for a namespace",
            None,
            MetricType::Gauge,
        )?;
        for ns in this.namespaces.values() {
            let labels = [("namespace", ns.name.as_str())];
            let policies = gauge(ns.policies.len());
            policies.encode(policies_encoder.encode_family(&labels)?)?;
        }

        let mut flows_encoder = encoder.encode_descriptor(
            "namespace_flows",
            "The number of compiled flows for a namespace",
            None,
            MetricType::Gauge,
        )?;
        for ns in this.namespaces.values() {
            let labels = [("namespace", ns.name.as_str())];
            let flows = ns.policies.values().map(|p| p.flows.len()).sum::<usize>();
            gauge(flows).encode(flows_encoder.encode_family(&labels)?)?;
        }

        let mut refs_encoder = encoder.encode_descriptor(
            "namespace_references",
            "The number of references held on a namespace's rules",
            None,
            MetricType::Gauge,
        )?;
        for ns in this.namespaces.values() {
            let labels = [("namespace", ns.name.as_str())];
            gauge(ns.refs).encode(refs_encoder.encode_family(&labels)?)?;
        }

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, pods) in &this.pods {
            let labels = [("namespace", ns.as_str())];
            gauge(pods.len()).encode(pods_encoder.encode_family(&labels)?)?;
        }

        let mut pending_encoder = encoder.encode_descriptor(
            "pending_policies",
            "The number of NetworkPolicies waiting for their namespace's VNID",
            None,
            MetricType::Gauge,
        )?;
        for (ns, pending) in &this.pending_policies {
            let labels = [("namespace", ns.as_str())];
            let pending = gauge(pending.len());
            pending.encode(pending_encoder.encode_family(&labels)?)?;
        }

        Ok(())
    }
}

/// A size gauge that saturates rather than wrapping.
fn gauge(n: usize) -> ConstGauge<u32> {
    ConstGauge::new(u32::try_from(n).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn sizes_saturate() {
        let mut reg = Registry::default();
        reg.register("small", "A small size", gauge(3));
        reg.register("huge", "A size that overflows", gauge(usize::MAX));

        let mut text = String::new();
        encode(&mut text, &reg).expect("metrics must encode");
        assert!(text.contains("small 3\n"), "{text}");
        assert!(text.contains(&format!("huge {}\n", u32::MAX)), "{text}");
    }
}
