use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::id::NodeId;
use crate::constants::{NODE_GOOD_WINDOW, NODE_MAX_FAILURES};

pub const COMPACT_NODE_LEN: usize = 26;
pub const COMPACT_PEER_LEN: usize = 6;

/// A node as it travels on the wire: id plus IPv4 endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let addr = peer_from_compact(&data[20..])?;
        Some(Self { id, addr })
    }

    /// `None` for IPv6 endpoints, which have no 26-byte form.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..].copy_from_slice(&peer_to_compact(&self.addr)?);
        Some(compact)
    }
}

pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn peer_to_compact(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut compact = [0u8; COMPACT_PEER_LEN];
            compact[..4].copy_from_slice(&v4.ip().octets());
            compact[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(compact)
        }
        SocketAddr::V6(_) => None,
    }
}

/// A routing table entry.
///
/// Good when it answered within the last 15 minutes; bad when it is not
/// good and has failed three queries in a row. Everything else is
/// questionable and kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub failed_queries: u32,
    pub last_seen: Option<SystemTime>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            failed_queries: 0,
            last_seen: None,
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo::new(self.id, self.addr)
    }

    /// Records a successful exchange.
    pub fn touch(&mut self) {
        self.last_seen = Some(SystemTime::now());
        self.failed_queries = 0;
    }

    pub fn fail(&mut self) {
        self.failed_queries = self.failed_queries.saturating_add(1);
    }

    pub fn is_good(&self) -> bool {
        self.last_seen
            .and_then(|seen| seen.elapsed().ok())
            .is_some_and(|age| age < NODE_GOOD_WINDOW)
    }

    pub fn is_bad(&self) -> bool {
        !self.is_good() && self.failed_queries >= NODE_MAX_FAILURES
    }
}
