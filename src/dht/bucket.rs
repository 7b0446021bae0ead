use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::id::NodeId;
use super::node::Node;
use crate::constants::{BUCKET_REFRESH_WINDOW, DHT_BUCKET_SIZE, DHT_ID_BITS};

/// A k-bucket covering the half-open range `[start, end)`.
///
/// `end == None` stands for 2^160. Every bucket starts at a multiple of its
/// width, so the split point is always `start` with bit `depth` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    start: NodeId,
    end: Option<NodeId>,
    depth: u32,
    last_changed: SystemTime,
    nodes: Vec<Node>,
}

impl Bucket {
    /// The single bucket covering the whole identifier space.
    pub fn full_range() -> Self {
        Self {
            start: NodeId::MIN,
            end: None,
            depth: 0,
            last_changed: SystemTime::now(),
            nodes: Vec::with_capacity(DHT_BUCKET_SIZE),
        }
    }

    pub fn start(&self) -> &NodeId {
        &self.start
    }

    pub fn end(&self) -> Option<&NodeId> {
        self.end.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn can_contain(&self, id: &NodeId) -> bool {
        &self.start <= id && self.end.is_none_or(|end| id < &end)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bad nodes do not count against capacity.
    pub fn is_full(&self) -> bool {
        self.nodes.iter().filter(|n| !n.is_bad()).count() >= DHT_BUCKET_SIZE
    }

    pub fn can_split(&self) -> bool {
        self.depth < DHT_ID_BITS
    }

    pub fn needs_refresh(&self) -> bool {
        self.last_changed
            .elapsed()
            .map(|age| age > BUCKET_REFRESH_WINDOW)
            .unwrap_or(false)
    }

    pub fn touch(&mut self) {
        self.last_changed = SystemTime::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age: std::time::Duration) {
        self.last_changed -= age;
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub(crate) fn node_at_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    /// Adds `node` if there is room and it falls in range.
    pub fn add(&mut self, node: Node) -> bool {
        if self.nodes.len() >= DHT_BUCKET_SIZE || !self.can_contain(&node.id) {
            return false;
        }
        self.nodes.push(node);
        self.touch();
        true
    }

    pub fn purge_bad_nodes(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|n| !n.is_bad());
        before - self.nodes.len()
    }

    /// A uniformly random id inside this bucket, used as a refresh target.
    pub fn random_id(&self) -> NodeId {
        NodeId::random_in_range(&self.start, self.end.as_ref())
    }

    /// Halves the range and returns the upper half as a new bucket.
    ///
    /// `self` keeps `[start, mid)`; nodes move to whichever half contains
    /// them. Both halves end up one level deeper. The caller inserts the
    /// sibling right after `self`.
    pub fn split(&mut self) -> Bucket {
        debug_assert!(self.can_split());
        let mid = self.start.with_bit(self.depth);

        let (upper, lower): (Vec<Node>, Vec<Node>) =
            self.nodes.drain(..).partition(|n| n.id >= mid);
        self.nodes = lower;

        let sibling = Bucket {
            start: mid,
            end: self.end,
            depth: self.depth + 1,
            last_changed: self.last_changed,
            nodes: upper,
        };

        self.end = Some(mid);
        self.depth += 1;
        sibling
    }
}
