#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod flows;
pub mod matches;

pub use self::{
    flows::{Flow, FlowMatch, FlowOp, FlowTable, Transaction},
    matches::{Destination, Peer, Port, PortError, Protocol},
};
pub use ipnet::IpNet;

/// A virtual network identifier. Every namespace is assigned one, and it tags the namespace's
/// traffic (`reg0` for the source, `reg1` for the destination) as it crosses the switch.
pub type Vnid = u32;
