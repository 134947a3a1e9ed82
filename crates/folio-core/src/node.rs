//! Node addressing and tier classification
//!
//! Nodes are addressed by URL. Two URLs that differ only by a trailing slash
//! (or by scheme/host case) address the same node, so all comparisons go
//! through the canonical form held by [`NodeUrl`].
//!
//! A node is **local** when its host is loopback, a private-range address, or
//! a link-local / mDNS name; everything else is **remote**.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::{Host, Url};

use crate::error::ReferenceError;

/// Latency tier of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeTier {
    /// Same host or same network; queried first with a short timeout
    Local,
    /// Wide-area node
    Remote,
}

impl fmt::Display for NodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTier::Local => write!(f, "local"),
            NodeTier::Remote => write!(f, "remote"),
        }
    }
}

/// Canonical node URL
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeUrl(String);

impl NodeUrl {
    /// Parse and canonicalize a node URL
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let url = Url::parse(s.trim()).map_err(|e| ReferenceError::InvalidNodeUrl(format!("{s}: {e}")))?;
        if url.host().is_none() {
            return Err(ReferenceError::InvalidNodeUrl(format!("{s}: missing host")));
        }
        Ok(Self(canonicalize(&url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Classify the node by its host
    pub fn tier(&self) -> NodeTier {
        match Url::parse(&self.0).ok().as_ref().and_then(Url::host) {
            Some(host) if is_local_host(&host) => NodeTier::Local,
            _ => NodeTier::Remote,
        }
    }

    pub fn is_local(&self) -> bool {
        self.tier() == NodeTier::Local
    }
}

/// Lowercased scheme and host (done by `url`), no trailing slash on an
/// empty path
fn canonicalize(url: &Url) -> String {
    let s = url.as_str();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        s.strip_suffix('/').unwrap_or(s).to_string()
    } else {
        s.to_string()
    }
}

fn is_local_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.');
            name == "localhost" || name.ends_with(".localhost") || name.ends_with(".local")
        }
        Host::Ipv4(ip) => is_local_v4(ip),
        Host::Ipv6(ip) => is_local_v6(ip),
    }
}

fn is_local_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_local_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_local_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link local fe80::/10
}

/// Classify a raw IP address
pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(&v4),
        IpAddr::V6(v6) => is_local_v6(&v6),
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeUrl").field(&self.0).finish()
    }
}

impl FromStr for NodeUrl {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NodeUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeUrl::parse(&s).map_err(serde::de::Error::custom)
    }
}
