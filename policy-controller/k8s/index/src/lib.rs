//! SDN NetworkPolicy Index
//!
//! The index compiles `NetworkPolicy` resources into ingress flow rules for the node's switch and
//! keeps the switch's flow table consistent as the cluster changes. It watches the following
//! cluster resources:
//!
//! - A `NetNamespace` assigns each namespace its virtual network id (vnid). Rules are installed
//!   per vnid, so a namespace is only tracked once its vnid is known.
//! - A `Namespace` may be annotated with an ingress isolation policy. Non-isolated namespaces admit
//!   all traffic; isolated namespaces admit only traffic permitted by their `NetworkPolicy`s. A
//!   namespace's labels may be selected by any policy's `namespaceSelector`.
//! - Each `Pod`'s IP and labels may be selected by the pod selectors of policies in its namespace.
//!   Pods scheduled on this node hold a reference on their namespace's rules.
//! - Each `NetworkPolicy` is compiled into a sorted list of match fragments.
//!
//! ```text
//! [ NetNamespace ] -> [ vnid ] <- [ NetworkPolicy ] -> [ Pod | Namespace ] labels
//!                        |
//!                  [ flow table ]
//! ```
//!
//! A compiled policy records whether its output depends on namespace labels and/or pod labels, so
//! that a label change only recompiles the policies that could observe it. When a namespace's
//! compiled rules, isolation, or reference count change, all of its rules are replaced in a single
//! flow-table transaction.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod compile;
pub mod index;
pub mod metrics;
mod namespace;
mod net_namespace;
mod network_policy;
mod pod;
mod selector;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Index, SharedIndex},
    metrics::IndexMetrics,
    namespace::NETWORK_POLICY_ANNOTATION,
    pod::PodGate,
};

/// Holds node metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The name of the node this controller runs on.
    pub node_name: String,
}
