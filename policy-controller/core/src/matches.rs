//! Match fragments that compiled network policies are built from.
//!
//! A compiled rule is the concatenation of a [`Destination`], a [`Peer`], and a [`Port`] fragment.
//! Each fragment renders either as an empty string (unrestricted) or as `ovs-ofctl` match fields
//! terminated by `", "`, so fragments may be concatenated in any combination.

use crate::Vnid;
use std::{fmt, net::IpAddr, str::FromStr};

/// Restricts the pods that a rule admits traffic to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Every pod in the policy's namespace.
    Namespace,
    Pod(IpAddr),
}

/// Restricts the sources that a rule admits traffic from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Peer {
    Any,
    Namespace(Vnid),
    Pod { vnid: Vnid, ip: IpAddr },
}

/// Restricts the destination ports that a rule admits traffic to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    Any,

    /// All ports of a protocol.
    Protocol(Protocol),

    Number { protocol: Protocol, port: u16 },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Describes a port specification that cannot be expressed as a flow match.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("policy specifies unrecognized protocol {0:?}")]
    UnsupportedProtocol(String),

    #[error("named port values ({0:?}) are not yet implemented")]
    NamedPort(String),

    #[error("port value out of bounds {0}")]
    OutOfRange(i32),

    #[error("port ranges (endPort {0}) are not supported")]
    Range(i32),
}

/// Joins the fragments of a single compiled rule.
pub fn fragment(dst: &Destination, peer: &Peer, port: &Port) -> String {
    format!("{dst}{peer}{port}")
}

// === impl Destination ===

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => Ok(()),
            Self::Pod(IpAddr::V4(ip)) => write!(f, "ip, nw_dst={ip}, "),
            Self::Pod(IpAddr::V6(ip)) => write!(f, "ipv6, ipv6_dst={ip}, "),
        }
    }
}

// === impl Peer ===

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => Ok(()),
            Self::Namespace(vnid) => write!(f, "reg0={vnid}, "),
            Self::Pod {
                vnid,
                ip: IpAddr::V4(ip),
            } => write!(f, "reg0={vnid}, ip, nw_src={ip}, "),
            Self::Pod {
                vnid,
                ip: IpAddr::V6(ip),
            } => write!(f, "reg0={vnid}, ipv6, ipv6_src={ip}, "),
        }
    }
}

// === impl Port ===

impl Port {
    /// Builds a numeric port match, validating that the port fits in a transport header.
    pub fn number(protocol: Protocol, port: i32) -> Result<Self, PortError> {
        let port = u16::try_from(port).map_err(|_| PortError::OutOfRange(port))?;
        Ok(Self::Number { protocol, port })
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => Ok(()),
            Self::Protocol(protocol) => write!(f, "{protocol}, "),
            Self::Number { protocol, port } => write!(f, "{protocol}, tp_dst={port}, "),
        }
    }
}

// === impl Protocol ===

impl Protocol {
    /// Resolves an optional protocol name; an unset protocol means TCP.
    pub fn from_optional(protocol: Option<&str>) -> Result<Self, PortError> {
        match protocol {
            None => Ok(Self::Tcp),
            Some(p) => p.parse(),
        }
    }
}

impl FromStr for Protocol {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            s => Err(PortError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
        }
    }
}
