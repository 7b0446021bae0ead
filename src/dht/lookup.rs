//! Iterative closest-node search.
//!
//! [`Lookup`] is the bookkeeping for one search: a working set of at most k
//! nodes ordered by distance to the target, each flagged as queried,
//! in flight or failed. [`run`] drives it over the transaction layer with
//! at most `DHT_ALPHA` queries outstanding, until no eligible candidate is
//! left and nothing is in flight.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng as _;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use super::error::DhtError;
use super::id::NodeId;
use super::message::{Query, Response};
use super::node::NodeInfo;
use super::rpc::Rpc;
use crate::constants::{DHT_ALPHA, DHT_BUCKET_SIZE, LOOKUP_RETRY_DELAY};

/// A node's state within one lookup.
#[derive(Debug, Clone)]
pub struct LookupNode {
    pub node: NodeInfo,
    queried: bool,
    querying: bool,
    failed: bool,
    /// Write token from a `get_peers` or `get` reply.
    pub token: Option<Bytes>,
    /// Sequence number of the mutable item this node holds, if any.
    pub seq: Option<i64>,
}

impl LookupNode {
    fn new(node: NodeInfo) -> Self {
        Self {
            node,
            queried: false,
            querying: false,
            failed: false,
            token: None,
            seq: None,
        }
    }

    fn is_eligible(&self) -> bool {
        !self.queried && !self.querying && !self.failed
    }

    pub fn is_queried(&self) -> bool {
        self.queried
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

pub struct Lookup {
    our_id: NodeId,
    target: NodeId,
    nodes: Vec<LookupNode>,
}

impl Lookup {
    pub fn new(our_id: NodeId, target: NodeId, seed: impl IntoIterator<Item = NodeInfo>) -> Self {
        let mut lookup = Self {
            our_id,
            target,
            nodes: Vec::with_capacity(DHT_BUCKET_SIZE),
        };
        for node in seed {
            lookup.offer(node);
        }
        lookup
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn nodes(&self) -> &[LookupNode] {
        &self.nodes
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut LookupNode> {
        self.nodes.iter_mut().find(|n| &n.node.id == id)
    }

    pub fn has_candidate(&self) -> bool {
        self.nodes.iter().any(LookupNode::is_eligible)
    }

    /// Picks an eligible node uniformly at random and marks it in flight.
    pub fn next_candidate(&mut self) -> Option<NodeInfo> {
        let mut rng = rand::rng();
        let mut chosen = None;
        let mut seen = 0usize;

        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_eligible() {
                seen += 1;
                if rng.random_range(0..seen) == 0 {
                    chosen = Some(i);
                }
            }
        }

        let node = &mut self.nodes[chosen?];
        node.querying = true;
        Some(node.node)
    }

    /// Adds `node` to the working set if it is new and either the set has
    /// room or it is strictly closer than the current farthest entry.
    pub fn offer(&mut self, node: NodeInfo) -> bool {
        if node.id == self.our_id || self.nodes.iter().any(|n| n.node.id == node.id) {
            return false;
        }

        let distance = node.id.distance(&self.target);
        if self.nodes.len() >= DHT_BUCKET_SIZE {
            match self.nodes.last() {
                Some(farthest) if distance < farthest.node.id.distance(&self.target) => {
                    self.nodes.pop();
                }
                _ => return false,
            }
        }

        self.nodes.push(LookupNode::new(node));
        let target = self.target;
        self.nodes.sort_by_key(|n| n.node.id.distance(&target));
        true
    }

    pub fn on_success(&mut self, id: &NodeId, found: &[NodeInfo]) {
        if let Some(node) = self.node_mut(id) {
            node.querying = false;
            node.queried = true;
        }
        for node in found {
            self.offer(*node);
        }
    }

    pub fn on_failure(&mut self, id: &NodeId) {
        if let Some(node) = self.node_mut(id) {
            node.querying = false;
            node.queried = true;
            node.failed = true;
        }
    }

    /// True once nothing is eligible and nothing is in flight.
    pub fn is_finished(&self) -> bool {
        !self.has_candidate() && !self.nodes.iter().any(|n| n.querying)
    }

    /// The surviving working set, closest first.
    pub fn into_result(self) -> Vec<LookupNode> {
        self.nodes.into_iter().filter(|n| !n.failed).collect()
    }
}

/// What a particular kind of lookup sends and does with each reply.
pub(crate) trait LookupHandler {
    fn query(&self, our_id: NodeId, target: NodeId) -> Query;

    /// Called for every successful reply before its nodes are offered to
    /// the working set. `node` is `None` if the responder was displaced
    /// from the working set while its query was in flight.
    fn on_response(&mut self, node: Option<&mut LookupNode>, response: &Response);
}

/// Drives `lookup` to completion.
///
/// A failed query holds back the next step by `LOOKUP_RETRY_DELAY`; a
/// successful one releases it immediately. Dropping the returned future
/// cancels the lookup.
pub(crate) async fn run<H: LookupHandler>(
    rpc: &Rpc,
    mut lookup: Lookup,
    handler: &mut H,
) -> Vec<LookupNode> {
    let our_id = lookup.our_id;
    let target = lookup.target;
    let mut in_flight = FuturesUnordered::new();
    let mut retry_at: Option<Instant> = None;

    loop {
        if retry_at.is_some_and(|at| Instant::now() >= at) {
            retry_at = None;
        }

        if retry_at.is_none() {
            while in_flight.len() < DHT_ALPHA {
                let Some(node) = lookup.next_candidate() else {
                    break;
                };
                let query = handler.query(our_id, target);
                in_flight.push(async move {
                    let result: Result<Response, DhtError> =
                        rpc.query(node.addr, Some(node.id), query).await;
                    (node.id, result)
                });
            }
        }

        if in_flight.is_empty() {
            match retry_at {
                Some(at) if lookup.has_candidate() => {
                    sleep_until(at).await;
                    continue;
                }
                _ => break,
            }
        }

        let wake = retry_at.unwrap_or_else(Instant::now);
        tokio::select! {
            Some((id, result)) = in_flight.next() => match result {
                Ok(response) => {
                    handler.on_response(lookup.node_mut(&id), &response);
                    lookup.on_success(&id, response.nodes());
                    retry_at = None;
                }
                Err(e) => {
                    trace!("lookup {} query to {} failed: {}", target, id, e);
                    lookup.on_failure(&id);
                    retry_at.get_or_insert_with(|| Instant::now() + LOOKUP_RETRY_DELAY);
                }
            },
            _ = sleep_until(wake), if retry_at.is_some() => {}
        }
    }

    lookup.into_result()
}

/// Plain node search with `find_node`.
pub(crate) struct FindNodeHandler;

impl LookupHandler for FindNodeHandler {
    fn query(&self, our_id: NodeId, target: NodeId) -> Query {
        Query::FindNode { id: our_id, target }
    }

    fn on_response(&mut self, _node: Option<&mut LookupNode>, _response: &Response) {}
}

/// Torrent peer search with `get_peers`, handing peers out as they arrive
/// and keeping each responder's token for the announce that follows.
pub(crate) struct GetPeersHandler<F> {
    pub on_peers: F,
}

impl<F: FnMut(&[SocketAddr])> LookupHandler for GetPeersHandler<F> {
    fn query(&self, our_id: NodeId, target: NodeId) -> Query {
        Query::GetPeers {
            id: our_id,
            info_hash: target,
        }
    }

    fn on_response(&mut self, node: Option<&mut LookupNode>, response: &Response) {
        if let Response::GetPeers { token, values, .. } = response {
            if let Some(node) = node {
                node.token = Some(token.clone());
            }
            if !values.is_empty() {
                (self.on_peers)(values);
            }
        }
    }
}
