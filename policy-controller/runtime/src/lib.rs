#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use sdn_policy_controller_core as core;
pub use sdn_policy_controller_k8s_api as k8s;
pub use sdn_policy_controller_k8s_index as index;

mod args;
mod ovs;

pub use self::{
    args::Args,
    ovs::{DryRun, OvsOfctl},
};
