use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::bucket::Bucket;
use super::id::NodeId;
use super::node::{Node, NodeInfo};
use crate::constants::{DHT_BUCKET_SIZE, MAX_PEERS_PER_TORRENT, PEER_ANNOUNCE_LIFETIME};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncedPeer {
    pub addr: SocketAddr,
    pub announced_at: SystemTime,
}

impl AnnouncedPeer {
    fn is_stale(&self) -> bool {
        self.announced_at
            .elapsed()
            .map(|age| age >= PEER_ANNOUNCE_LIFETIME)
            .unwrap_or(false)
    }
}

/// Buckets ordered by range, contiguous and together covering the whole
/// identifier space, plus the peers announced to us per info-hash.
///
/// Every mutation sets a dirty flag so the owner knows when to persist.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
    peers: HashMap<NodeId, Vec<AnnouncedPeer>>,
    #[serde(skip)]
    dirty: bool,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            buckets: vec![Bucket::full_range()],
            peers: HashMap::new(),
            dirty: true,
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .partition_point(|b| b.start() <= id)
            .saturating_sub(1)
    }

    /// Inserts a node, splitting the owning bucket while it is full and
    /// covers our own id. Returns the stored node, or `None` when the node
    /// was dropped because its bucket is full and cannot be split.
    pub fn add_node(&mut self, id: NodeId, addr: SocketAddr) -> Option<&Node> {
        let (bucket, index) = self.insert(id, addr)?;
        self.buckets[bucket].nodes().nth(index)
    }

    /// `add_node` followed by marking the node as just contacted.
    pub fn refresh_node(&mut self, id: NodeId, addr: SocketAddr) -> Option<&Node> {
        let (bucket, index) = self.insert(id, addr)?;
        let bucket = &mut self.buckets[bucket];
        bucket.node_at_mut(index).touch();
        bucket.touch();
        self.dirty = true;
        bucket.nodes().nth(index)
    }

    fn insert(&mut self, id: NodeId, addr: SocketAddr) -> Option<(usize, usize)> {
        if id == self.our_id {
            return None;
        }

        loop {
            let index = self.bucket_index(&id);
            let bucket = &mut self.buckets[index];

            if let Some(pos) = bucket.position(&id) {
                if let Some(existing) = bucket.get(&id) {
                    if existing.addr != addr {
                        warn!(
                            "node {} seen at {} but registered at {}",
                            id, addr, existing.addr
                        );
                    }
                }
                return Some((index, pos));
            }

            if bucket.purge_bad_nodes() > 0 {
                self.dirty = true;
            }

            if bucket.add(Node::new(id, addr)) {
                self.dirty = true;
                return Some((index, bucket.len() - 1));
            }

            if !bucket.can_contain(&self.our_id) || !bucket.can_split() {
                debug!("dropping node {}: bucket full", id);
                return None;
            }

            let sibling = bucket.split();
            debug!(
                "split bucket at depth {}, {} buckets",
                sibling.depth(),
                self.buckets.len() + 1
            );
            self.buckets.insert(index + 1, sibling);
            self.dirty = true;
        }
    }

    pub fn mark_failed(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        if let Some(node) = self.buckets[index].get_mut(id) {
            node.fail();
            self.dirty = true;
        }
    }

    /// Clears the failures of a node already in the table.
    pub fn mark_responded(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        if let Some(node) = self.buckets[index].get_mut(id) {
            node.touch();
            self.dirty = true;
        }
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    /// The `count` non-bad nodes closest to `target` by XOR distance.
    ///
    /// Collects from the bucket owning `target` outward through its
    /// neighbours until enough candidates are gathered, then sorts.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let home = self.bucket_index(target);
        let mut candidates: Vec<NodeInfo> = Vec::new();
        collect_usable(&self.buckets[home], &mut candidates);

        let (mut below, mut above) = (home, home + 1);
        while candidates.len() < count && (below > 0 || above < self.buckets.len()) {
            if below > 0 {
                below -= 1;
                collect_usable(&self.buckets[below], &mut candidates);
            }
            if above < self.buckets.len() {
                collect_usable(&self.buckets[above], &mut candidates);
                above += 1;
            }
        }

        candidates.sort_by_key(|n| n.id.distance(target));
        candidates.truncate(count);
        candidates
    }

    /// Picks one non-empty stale bucket uniformly at random.
    pub fn find_bucket_to_refresh(&self) -> Option<&Bucket> {
        let mut rng = rand::rng();
        let mut chosen = None;
        let mut seen = 0usize;

        for bucket in self
            .buckets
            .iter()
            .filter(|b| !b.is_empty() && b.needs_refresh())
        {
            seen += 1;
            if rng.random_range(0..seen) == 0 {
                chosen = Some(bucket);
            }
        }

        chosen
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(Bucket::nodes)
    }

    pub fn add_peer_for_torrent(&mut self, info_hash: NodeId, addr: SocketAddr) {
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| !p.is_stale());

        let now = SystemTime::now();
        if let Some(existing) = peers.iter_mut().find(|p| p.addr == addr) {
            existing.announced_at = now;
        } else if peers.len() < MAX_PEERS_PER_TORRENT {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
        self.dirty = true;
    }

    pub fn find_peers_for_torrent(&mut self, info_hash: &NodeId) -> Vec<SocketAddr> {
        let Some(peers) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };

        let before = peers.len();
        peers.retain(|p| !p.is_stale());
        let found: Vec<SocketAddr> = peers.iter().map(|p| p.addr).collect();

        if found.len() != before {
            self.dirty = true;
        }
        if found.is_empty() {
            self.peers.remove(info_hash);
        }
        found
    }

    /// Ages every bucket and announced peer by `age`.
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age: std::time::Duration) {
        for bucket in &mut self.buckets {
            bucket.backdate(age);
        }
        for peer in self.peers.values_mut().flatten() {
            peer.announced_at -= age;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Checks the bucket invariants of a table read back from disk: ranges
    /// are contiguous, cover the whole space, and hold only their own nodes.
    pub fn is_consistent(&self) -> bool {
        let Some(first) = self.buckets.first() else {
            return false;
        };
        if !first.start().is_zero() {
            return false;
        }

        for pair in self.buckets.windows(2) {
            if pair[0].end() != Some(pair[1].start()) {
                return false;
            }
        }

        self.buckets.last().is_some_and(|b| b.end().is_none())
            && self
                .buckets
                .iter()
                .all(|b| b.len() <= DHT_BUCKET_SIZE && b.nodes().all(|n| b.can_contain(&n.id)))
    }
}

fn collect_usable(bucket: &Bucket, out: &mut Vec<NodeInfo>) {
    out.extend(bucket.nodes().filter(|n| !n.is_bad()).map(Node::info));
}
