use std::time::SystemTime;

use bytes::Bytes;
use tracing::debug;

use super::id::NodeId;
use super::lookup::{LookupHandler, LookupNode};
use super::message::{GetResponse, Query, Response};
use super::storage::{immutable_target, mutable_target, verify_signature, StoredValue};

/// BEP-44 item search with `get`.
///
/// Every reply's token and sequence number are recorded on the responder
/// so a later `put` can reuse them. Values are checked against the target
/// before `on_value` sees them; a lookup may deliver the same item from
/// several nodes.
pub(crate) struct GetHandler<F> {
    /// Only ask for items newer than this.
    pub seq: Option<i64>,
    /// Salt of the mutable item being looked up.
    pub salt: Option<Bytes>,
    pub target: NodeId,
    pub on_value: F,
}

impl<F: FnMut(StoredValue)> LookupHandler for GetHandler<F> {
    fn query(&self, our_id: NodeId, target: NodeId) -> Query {
        Query::Get {
            id: our_id,
            target,
            seq: self.seq,
        }
    }

    fn on_response(&mut self, node: Option<&mut LookupNode>, response: &Response) {
        let Response::Get(reply) = response else {
            return;
        };

        if let Some(node) = node {
            node.token = reply.token.clone();
            node.seq = reply.seq;
        }

        if reply.value.is_none() {
            return;
        }

        match validate(&self.target, self.salt.as_deref(), reply) {
            Some(item) => (self.on_value)(item),
            None => debug!("dropping invalid value for {} from {}", self.target, reply.id),
        }
    }
}

/// Turns a `get` reply into an item if it really is stored under `target`.
pub fn validate(target: &NodeId, salt: Option<&[u8]>, reply: &GetResponse) -> Option<StoredValue> {
    let value = reply.value.clone()?;

    let Some(key) = &reply.key else {
        return (&immutable_target(&value) == target).then(|| StoredValue {
            value,
            key: None,
            salt: None,
            sig: None,
            seq: None,
            refreshed: SystemTime::now(),
        });
    };

    let seq = reply.seq?;
    let sig = reply.sig.as_ref()?;
    if &mutable_target(key, salt) != target {
        return None;
    }
    verify_signature(key, salt, seq, &value, sig).ok()?;

    Some(StoredValue {
        value,
        key: Some(key.clone()),
        salt: salt.filter(|s| !s.is_empty()).map(Bytes::copy_from_slice),
        sig: Some(sig.clone()),
        seq: Some(seq),
        refreshed: SystemTime::now(),
    })
}
