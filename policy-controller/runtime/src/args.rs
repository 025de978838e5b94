use crate::{
    core::{flows::base_flows, FlowTable, IpNet, Transaction},
    index::{self, ClusterInfo, Index, IndexMetrics, PodGate, SharedIndex},
    k8s, DryRun, OvsOfctl,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "sdn-policy",
    about = "Enforces NetworkPolicies on a node's SDN bridge"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "sdn_policy_controller=info,warn",
        env = "SDN_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the node whose bridge is programmed. Pods scheduled on this node keep their
    /// namespace's rules installed.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// Network CIDR of cluster services. Service traffic bypasses connection tracking.
    #[clap(long, default_value = "172.30.0.0/16")]
    service_network: IpNet,

    #[clap(long, default_value = "br0")]
    bridge: String,

    #[clap(long, default_value = "ovs-ofctl")]
    ofctl_path: PathBuf,

    /// How long `ovs-ofctl` may run before it is killed and the transaction fails.
    #[clap(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    ofctl_timeout_secs: u64,

    /// Logs flow-table transactions instead of applying them.
    #[clap(long)]
    dry_run: bool,

    /// How often every namespace's rules are reinstalled.
    #[clap(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    resync_interval_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            node_name,
            service_network,
            bridge,
            ofctl_path,
            ofctl_timeout_secs,
            dry_run,
            resync_interval_secs,
        } = self;

        let flows: Arc<dyn FlowTable> = if dry_run {
            Arc::new(DryRun::default())
        } else {
            let timeout = Duration::from_secs(ofctl_timeout_secs);
            Arc::new(OvsOfctl::new(ofctl_path, bridge, timeout))
        };

        let mut prom = <Registry>::default();
        let policy_reg = prom.sub_registry_with_prefix("network_policy");
        let metrics = IndexMetrics::register(policy_reg);
        let index = Index::shared(ClusterInfo { node_name }, flows.clone(), metrics);
        index::metrics::register(policy_reg, index.clone());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Namespace rules depend on the connection-tracking plumbing, so it is installed before
        // any watch can commit a namespace.
        let mut tx = Transaction::new(&*flows);
        for flow in base_flows(service_network) {
            tx.add_flow(flow);
        }
        tx.commit().context("failed to install base flows")?;
        info!(%service_network, dry_run, "Installed base flows");

        // Spawn resource watches.

        let net_namespaces = runtime.watch_all::<k8s::NetNamespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), net_namespaces)
                .instrument(info_span!("netnamespaces")),
        );

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        let pods_gate = PodGate::new(index.clone()).shared();
        tokio::spawn(kubert::index::namespaced(pods_gate, pods).instrument(info_span!("pods")));

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        tokio::spawn(
            resync(index, Duration::from_secs(resync_interval_secs))
                .instrument(info_span!("resync")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Periodically reinstalls every namespace's rules, retrying failed transactions and repairing
/// rules that were modified out from under the controller.
async fn resync(index: SharedIndex, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        debug!("Resyncing flows");
        index.write().resync();
    }
}
