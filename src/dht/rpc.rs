use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::{DhtError, ProtocolError};
use super::id::NodeId;
use super::message::{Body, Message, Query, QueryKind, Response, TransactionId};
use super::routing::RoutingTable;
use crate::constants::{MAX_PENDING_DHT_QUERIES, TRANSACTION_ID_LEN};

struct PendingQuery {
    kind: QueryKind,
    addr: SocketAddr,
    node_id: Option<NodeId>,
    sender: oneshot::Sender<Result<Response, DhtError>>,
}

/// The KRPC transaction layer: owns the socket, numbers outgoing queries and
/// routes replies back to whoever is waiting for them.
///
/// Node bookkeeping happens here: a reply refreshes the responder in the
/// routing table, an error reply or a timeout counts as a failed query.
pub struct Rpc {
    socket: UdpSocket,
    routing_table: Arc<RwLock<RoutingTable>>,
    pending: Mutex<HashMap<TransactionId, PendingQuery>>,
    query_timeout: Duration,
}

impl Rpc {
    pub fn new(
        socket: UdpSocket,
        routing_table: Arc<RwLock<RoutingTable>>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            routing_table,
            pending: Mutex::new(HashMap::new()),
            query_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DhtError> {
        Ok(self.socket.recv_from(buf).await?)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends `query` and waits for the matching reply.
    ///
    /// `node_id` names the routing table entry to charge with a failure if
    /// the query errors or times out; pass `None` for bootstrap addresses.
    pub async fn query(
        &self,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        query: Query,
    ) -> Result<Response, DhtError> {
        let (sender, receiver) = oneshot::channel();
        let transaction_id = self.register(PendingQuery {
            kind: query.kind(),
            addr,
            node_id,
            sender,
        })?;
        let _guard = PendingGuard {
            rpc: self,
            transaction_id: transaction_id.clone(),
        };

        trace!("-> {} {} to {}", query.kind().name(), hex_tid(&transaction_id), addr);
        let data = Message::query(transaction_id, query).encode();
        self.socket.send_to(&data, addr).await?;

        match timeout(self.query_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DhtError::Cancelled),
            Err(_) => {
                if let Some(id) = node_id {
                    self.routing_table.write().mark_failed(&id);
                }
                Err(DhtError::Timeout)
            }
        }
    }

    fn register(&self, query: PendingQuery) -> Result<TransactionId, DhtError> {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING_DHT_QUERIES {
            return Err(DhtError::RateLimited);
        }

        let transaction_id = loop {
            let id: [u8; TRANSACTION_ID_LEN] = rand::random();
            let id = Bytes::copy_from_slice(&id);
            if !pending.contains_key(&id) {
                break id;
            }
        };

        pending.insert(transaction_id.clone(), query);
        Ok(transaction_id)
    }

    /// Completes the transaction a reply or error message belongs to.
    pub fn handle_reply(&self, from: SocketAddr, msg: Message) {
        let pending = {
            let mut pending = self.pending.lock();
            match pending.get(&msg.transaction_id) {
                Some(query) if query.addr == from => pending.remove(&msg.transaction_id),
                Some(query) => {
                    debug!(
                        "reply for {} came from {}, expected {}",
                        hex_tid(&msg.transaction_id),
                        from,
                        query.addr
                    );
                    None
                }
                None => {
                    trace!("unmatched reply {} from {}", hex_tid(&msg.transaction_id), from);
                    None
                }
            }
        };
        let Some(pending) = pending else {
            return;
        };

        let result = match msg.body {
            Body::Response(reply) => Response::parse(pending.kind, &reply),
            Body::Error(error) => Err(DhtError::Remote(error)),
            Body::Query(_) => Err(DhtError::InvalidMessage("query used as reply".into())),
        };

        {
            let mut table = self.routing_table.write();
            match &result {
                Ok(response) => {
                    let reported = *response.id();
                    if let Some(queried) = pending.node_id.filter(|id| *id != reported) {
                        debug!("{} answered as {}, expected {}", from, reported, queried);
                        table.mark_responded(&queried);
                    }
                    table.refresh_node(reported, from);
                }
                Err(e) => {
                    debug!("{} query to {} failed: {}", pending.kind.name(), from, e);
                    if let Some(id) = &pending.node_id {
                        table.mark_failed(id);
                    }
                }
            }
        }

        let _ = pending.sender.send(result);
    }

    /// Answers an incoming query with its handler's outcome.
    pub async fn respond(
        &self,
        addr: SocketAddr,
        transaction_id: TransactionId,
        outcome: Result<Response, ProtocolError>,
    ) -> Result<(), DhtError> {
        let msg = match outcome {
            Ok(response) => Message::response(transaction_id, &response),
            Err(error) => {
                debug!("replying to {} with error {}", addr, error);
                Message::error(transaction_id, error)
            }
        };
        self.socket.send_to(&msg.encode(), addr).await?;
        Ok(())
    }
}

/// Drops the pending entry when the waiting future goes away, whether it
/// completed, timed out or was cancelled with its lookup.
struct PendingGuard<'a> {
    rpc: &'a Rpc,
    transaction_id: TransactionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.rpc.pending.lock().remove(&self.transaction_id);
    }
}

fn hex_tid(tid: &[u8]) -> String {
    hex::encode(tid)
}
