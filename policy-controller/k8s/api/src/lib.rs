#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod net_namespace;

pub use self::{
    labels::{Labels, Selector, SelectorError},
    net_namespace::NetNamespace,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Pod, PodSpec, PodStatus},
        networking::v1::{
            NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
            NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};
