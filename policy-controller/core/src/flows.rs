//! Flow-table rules and the transactional sink that installs them.
//!
//! Rules are rendered in `ovs-ofctl` syntax. A [`Transaction`] batches additions and deletions so
//! that the switch observes a namespace's rule set change as a single atomic unit.

use crate::Vnid;
use anyhow::Result;
use ipnet::IpNet;
use std::fmt;

/// The conntrack zone used to track connections admitted by network policy.
pub const CONNTRACK_ZONE: u16 = 13877;

/// Holds the per-namespace ingress policy rules.
pub const POLICY_TABLE: u8 = 80;

/// Priority of per-namespace ingress policy rules.
pub const POLICY_PRIORITY: u16 = 100;

/// Delivers a packet to the pod port stored in `reg2`.
const OUTPUT_TO_POD: &str = "output:NXM_NX_REG2[]";

/// A single flow rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Flow {
    pub table: u8,
    pub priority: u16,

    /// Match fields. Empty, or a comma-separated list terminated by `", "`.
    pub matches: String,

    pub actions: String,
}

/// Selects the flows to remove from a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub table: u8,
    pub matches: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowOp {
    Add(Flow),
    Delete(FlowMatch),
}

/// A switch flow table that can apply a batch of modifications atomically.
pub trait FlowTable: fmt::Debug + Send + Sync {
    fn apply(&self, ops: &[FlowOp]) -> Result<()>;
}

/// Accumulates flow modifications until they are committed to a [`FlowTable`].
pub struct Transaction<'t> {
    table: &'t dyn FlowTable,
    ops: Vec<FlowOp>,
}

// === impl Flow ===

impl Flow {
    /// Admits traffic destined to the namespace `vnid` that matches the compiled `fragment`.
    pub fn namespace_policy(vnid: Vnid, fragment: &str) -> Self {
        Self {
            table: POLICY_TABLE,
            priority: POLICY_PRIORITY,
            matches: format!("reg1={vnid}, {fragment}"),
            actions: OUTPUT_TO_POD.to_string(),
        }
    }

    /// Admits all traffic destined to the namespace `vnid`.
    pub fn namespace_allow_all(vnid: Vnid) -> Self {
        Self::namespace_policy(vnid, "")
    }

    fn new(
        table: u8,
        priority: u16,
        matches: impl Into<String>,
        actions: impl Into<String>,
    ) -> Self {
        Self {
            table,
            priority,
            matches: matches.into(),
            actions: actions.into(),
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table={}, priority={}, {}actions={}",
            self.table, self.priority, self.matches, self.actions
        )
    }
}

/// The connection-tracking plumbing that policy rules rely on.
///
/// Traffic to services skips conntrack; all other IP traffic is committed to the policy zone so that
/// replies on established connections are admitted regardless of the namespace's rules.
pub fn base_flows(service_network: IpNet) -> Vec<Flow> {
    vec![
        Flow::new(
            21,
            200,
            format!("ip, nw_dst={service_network}, "),
            "goto_table:30",
        ),
        Flow::new(
            21,
            100,
            "ip, ",
            format!("ct(zone={CONNTRACK_ZONE},commit,table=30)"),
        ),
        Flow::new(
            POLICY_TABLE,
            50,
            "ip, ",
            format!("ct(zone={CONNTRACK_ZONE},commit,table=81)"),
        ),
        Flow::new(81, 100, "ip, ct_state=+trk+est, ", OUTPUT_TO_POD),
        Flow::new(81, 0, "", "drop"),
    ]
}

// === impl FlowMatch ===

impl FlowMatch {
    /// Matches every policy rule installed for the namespace `vnid`.
    pub fn namespace(vnid: Vnid) -> Self {
        Self {
            table: POLICY_TABLE,
            matches: format!("reg1={vnid}"),
        }
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matches.is_empty() {
            write!(f, "table={}", self.table)
        } else {
            write!(f, "table={}, {}", self.table, self.matches)
        }
    }
}

// === impl FlowOp ===

impl fmt::Display for FlowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(flow) => write!(f, "add {flow}"),
            Self::Delete(matches) => write!(f, "delete {matches}"),
        }
    }
}

// === impl Transaction ===

impl<'t> Transaction<'t> {
    pub fn new(table: &'t dyn FlowTable) -> Self {
        Self { table, ops: vec![] }
    }

    pub fn add_flow(&mut self, flow: Flow) {
        self.ops.push(FlowOp::Add(flow));
    }

    pub fn delete_flows(&mut self, matches: FlowMatch) {
        self.ops.push(FlowOp::Delete(matches));
    }

    pub fn ops(&self) -> &[FlowOp] {
        &self.ops
    }

    /// Applies all accumulated modifications as one unit.
    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.table.apply(&self.ops)
    }
}
