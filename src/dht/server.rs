use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::bucket::Bucket;
use super::config::DhtConfig;
use super::error::{DhtError, ProtocolError};
use super::id::NodeId;
use super::lookup::{self, FindNodeHandler, GetPeersHandler, Lookup, LookupNode};
use super::message::{Body, GetResponse, Message, Query, Response};
use super::node::NodeInfo;
use super::persist;
use super::routing::RoutingTable;
use super::rpc::Rpc;
use super::storage::{StoredValue, ValueStore};
use super::token::TokenManager;
use super::value_lookup::GetHandler;
use crate::bencode::{encode, Value};
use crate::constants::{
    BUCKET_REFRESH_INTERVAL, DHT_BUCKET_SIZE, MAX_DATAGRAM_SIZE, MAX_SALT_SIZE, MAX_VALUE_SIZE,
    PERSIST_CHECK_INTERVAL, SELF_LOOKUP_EMPTY_ROUNDS, SELF_LOOKUP_FAST_INTERVAL,
    SELF_LOOKUP_SLOW_INTERVAL, TOKEN_ROTATION_INTERVAL, VALUE_REPUBLISH_INTERVAL,
};

/// A [BEP-5] DHT node: answers KRPC queries, keeps its routing table fresh
/// and runs lookups on behalf of the rest of the client.
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::{DhtConfig, DhtServer, NodeId};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtServer::bind(DhtConfig::default()).await?;
/// dht.start();
///
/// let info_hash: NodeId = "e5f96f6f38320f0f33959cb4d3d656452117aadb".parse()?;
/// dht.lookup_torrent(info_hash, |peers| println!("found {:?}", peers));
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct DhtServer {
    rpc: Rpc,
    our_id: NodeId,
    local_addr: SocketAddr,
    config: DhtConfig,
    routing_table: Arc<RwLock<RoutingTable>>,
    values: RwLock<ValueStore>,
    values_dirty: AtomicBool,
    tokens: RwLock<TokenManager>,
    active_lookups: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DhtServer {
    /// Binds the socket and restores saved state if `config.state_path`
    /// points at a readable file. Nothing runs until [`start`](Self::start).
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(config.listen_addr).await?;
        let local_addr = socket.local_addr()?;

        let saved = match &config.state_path {
            Some(path) => persist::load(path).await.unwrap_or_else(|e| {
                warn!("discarding saved DHT state {}: {}", path.display(), e);
                None
            }),
            None => None,
        };

        let (routing_table, values) = match saved {
            Some(state) => (state.routing_table, state.values),
            None => (
                RoutingTable::new(config.node_id.unwrap_or_else(NodeId::generate)),
                ValueStore::new(),
            ),
        };
        let our_id = *routing_table.our_id();

        info!(
            "DHT server bound to {} with id {} ({} known nodes)",
            local_addr,
            our_id,
            routing_table.node_count()
        );

        let routing_table = Arc::new(RwLock::new(routing_table));
        Ok(Arc::new(Self {
            rpc: Rpc::new(socket, Arc::clone(&routing_table), config.query_timeout),
            our_id,
            local_addr,
            config,
            routing_table,
            values: RwLock::new(values),
            values_dirty: AtomicBool::new(false),
            tokens: RwLock::new(TokenManager::new()),
            active_lookups: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_count(&self) -> usize {
        self.routing_table.read().node_count()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.values.read().public_key()
    }

    /// Records a node learned out of band, e.g. from a peer's PORT message.
    pub fn add_node(&self, id: NodeId, addr: SocketAddr) -> bool {
        self.routing_table.write().add_node(id, addr).is_some()
    }

    pub fn with_routing_table<R>(&self, f: impl FnOnce(&RoutingTable) -> R) -> R {
        f(&self.routing_table.read())
    }

    pub fn with_values<R>(&self, f: impl FnOnce(&mut ValueStore) -> R) -> R {
        f(&mut self.values.write())
    }

    /// Spawns the receive loop and the self-lookup/bootstrap loop.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).run()));
        tasks.push(tokio::spawn(Arc::clone(self).maintain()));
    }

    /// Runs `work` on the runtime until it finishes or `shutdown` aborts it.
    pub(crate) fn spawn_tracked<Fut>(&self, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(work));
    }

    /// Stops every task and lookup, then writes state to disk.
    pub async fn shutdown(&self) -> Result<(), DhtError> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for (_, lookup) in self.active_lookups.lock().drain() {
            lookup.abort();
        }
        self.save().await
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let mut token_rotation = interval(TOKEN_ROTATION_INTERVAL);
        let mut persist_check = interval(PERSIST_CHECK_INTERVAL);
        let mut bucket_refresh = interval(BUCKET_REFRESH_INTERVAL);
        let mut republish = interval(VALUE_REPUBLISH_INTERVAL);

        for timer in [
            &mut token_rotation,
            &mut persist_check,
            &mut bucket_refresh,
            &mut republish,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer.tick().await;
        }

        loop {
            tokio::select! {
                result = self.rpc.recv_from(&mut buf) => match result {
                    Ok((n, addr)) => self.handle_datagram(&buf[..n], addr).await,
                    Err(e) => debug!("DHT receive failed: {}", e),
                },
                _ = token_rotation.tick() => {
                    self.tokens.write().rotate();
                }
                _ = persist_check.tick() => {
                    if let Err(e) = self.save_if_dirty().await {
                        warn!("failed to persist DHT state: {}", e);
                    }
                }
                _ = bucket_refresh.tick() => {
                    self.refresh_stale_bucket();
                }
                _ = republish.tick() => {
                    let purged = self.values.write().purge_stale();
                    if purged > 0 {
                        debug!("dropped {} expired values", purged);
                        self.values_dirty.store(true, Ordering::Relaxed);
                    }
                    let server = Arc::clone(&self);
                    self.spawn_tracked(async move { server.republish().await });
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let outcome = match Message::parse(data) {
            Ok(Message {
                transaction_id,
                body: Body::Query(query),
            }) => {
                trace!("<- {} from {}", query.kind().name(), from);
                (transaction_id, self.handle_query(from, query))
            }
            Ok(reply) => {
                self.rpc.handle_reply(from, reply);
                return;
            }
            Err(DhtError::BadQuery {
                transaction_id,
                error,
            }) => (transaction_id, Err(error)),
            Err(e) => {
                debug!("Failed to parse DHT message from {}: {}", from, e);
                return;
            }
        };

        let (transaction_id, result) = outcome;
        if let Err(e) = self.rpc.respond(from, transaction_id, result).await {
            debug!("failed to reply to {}: {}", from, e);
        }
    }

    fn handle_query(&self, from: SocketAddr, query: Query) -> Result<Response, ProtocolError> {
        let id = self.our_id;
        let mut table = self.routing_table.write();
        table.refresh_node(*query.sender_id(), from);

        match query {
            Query::Ping { .. } => Ok(Response::Ping { id }),
            Query::FindNode { target, .. } => Ok(Response::FindNode {
                id,
                nodes: table.find_closest(&target, DHT_BUCKET_SIZE),
            }),
            Query::GetPeers { info_hash, .. } => Ok(Response::GetPeers {
                id,
                token: self.tokens.read().create_token(&from),
                values: table.find_peers_for_torrent(&info_hash),
                nodes: table.find_closest(&info_hash, DHT_BUCKET_SIZE),
            }),
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                if !self.tokens.read().validate_token(&token, &from) {
                    debug!("Rejecting announce_peer from {} - invalid token", from);
                    return Err(ProtocolError::bad_token());
                }

                let peer_port = if implied_port { from.port() } else { port };
                let peer = SocketAddr::new(from.ip(), peer_port);
                table.add_peer_for_torrent(info_hash, peer);
                debug!("Stored announced peer {} for info_hash {}", peer, info_hash);
                Ok(Response::AnnouncePeer { id })
            }
            Query::Get { target, seq, .. } => {
                let mut reply = GetResponse::new(id);
                reply.token = Some(self.tokens.read().create_token(&from));
                reply.nodes = table.find_closest(&target, DHT_BUCKET_SIZE);
                drop(table);

                if let Some(item) = self.values.write().find(&target) {
                    reply.seq = item.seq;
                    reply.key = item.key.clone();
                    reply.sig = item.sig.clone();
                    let newer = match (seq, item.seq) {
                        (Some(wanted), Some(stored)) => stored > wanted,
                        _ => true,
                    };
                    if newer {
                        reply.value = Some(item.value.clone());
                    }
                }
                Ok(Response::Get(reply))
            }
            Query::Put { token, request, .. } => {
                drop(table);
                if !self.tokens.read().validate_token(&token, &from) {
                    debug!("Rejecting put from {} - invalid token", from);
                    return Err(ProtocolError::bad_token());
                }

                let target = self.values.write().put(&request)?;
                self.values_dirty.store(true, Ordering::Relaxed);
                debug!("Stored value {} for {}", target, from);
                Ok(Response::Put { id })
            }
        }
    }

    /// Keeps the table populated: bootstraps whenever it is empty and runs
    /// a lookup for our own id, every second while that keeps turning up
    /// new nodes and every minute once it stops.
    async fn maintain(self: Arc<Self>) {
        let mut empty_rounds = 0;

        loop {
            if self.node_count() == 0 {
                if let Err(e) = self.bootstrap().await {
                    warn!("DHT bootstrap failed: {}", e);
                }
            }

            let before = self.node_count();
            self.find_node(self.our_id).await;
            let after = self.node_count();

            if after > before {
                empty_rounds = 0;
            } else {
                empty_rounds += 1;
            }

            let delay = if empty_rounds >= SELF_LOOKUP_EMPTY_ROUNDS {
                SELF_LOOKUP_SLOW_INTERVAL
            } else {
                SELF_LOOKUP_FAST_INTERVAL
            };
            sleep(delay).await;
        }
    }

    /// Asks every configured bootstrap router for nodes near our id.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        info!("Starting DHT bootstrap");

        let mut addrs = Vec::new();
        for host in &self.config.bootstrap_nodes {
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4).take(1)),
                Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
            }
        }

        let queries = addrs.iter().map(|&addr| {
            let query = Query::FindNode {
                id: self.our_id,
                target: self.our_id,
            };
            async move { (addr, self.rpc.query(addr, None, query).await) }
        });

        for (addr, result) in join_all(queries).await {
            match result {
                Ok(response) => {
                    let mut table = self.routing_table.write();
                    for node in response.nodes() {
                        table.add_node(node.id, node.addr);
                    }
                }
                Err(e) => debug!("bootstrap node {} did not answer: {}", addr, e),
            }
        }

        let count = self.node_count();
        if count == 0 {
            warn!("DHT bootstrap found no nodes");
        } else {
            info!("DHT bootstrap complete, {} nodes in routing table", count);
        }
        Ok(())
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        let response = self
            .rpc
            .query(addr, None, Query::Ping { id: self.our_id })
            .await?;
        Ok(*response.id())
    }

    fn seed(&self, target: &NodeId) -> Lookup {
        let closest = self
            .routing_table
            .read()
            .find_closest(target, DHT_BUCKET_SIZE);
        Lookup::new(self.our_id, *target, closest)
    }

    /// Iterative `find_node` search; returns the closest responsive nodes.
    pub async fn find_node(&self, target: NodeId) -> Vec<NodeInfo> {
        lookup::run(&self.rpc, self.seed(&target), &mut FindNodeHandler)
            .await
            .into_iter()
            .map(|n| n.node)
            .collect()
    }

    async fn get_peers_lookup<F>(&self, info_hash: NodeId, on_peers: F) -> Vec<LookupNode>
    where
        F: FnMut(&[SocketAddr]),
    {
        let mut handler = GetPeersHandler { on_peers };
        lookup::run(&self.rpc, self.seed(&info_hash), &mut handler).await
    }

    /// Runs a peer search to completion and returns every distinct peer.
    pub async fn get_peers(&self, info_hash: NodeId) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = Vec::new();
        self.get_peers_lookup(info_hash, |found| {
            for peer in found {
                if !peers.contains(peer) {
                    peers.push(*peer);
                }
            }
        })
        .await;

        info!("DHT get_peers found {} peers for {}", peers.len(), info_hash);
        peers
    }

    /// Starts a background peer search for `info_hash` and announces
    /// ourselves to every responder that handed out a token.
    ///
    /// Returns `false` without doing anything if a lookup for the same
    /// info-hash is already running.
    pub fn lookup_torrent<F>(self: &Arc<Self>, info_hash: NodeId, on_peers: F) -> bool
    where
        F: FnMut(&[SocketAddr]) + Send + 'static,
    {
        let server = Arc::clone(self);
        self.spawn_lookup(info_hash, async move {
            let nodes = server.get_peers_lookup(info_hash, on_peers).await;
            let acked = server.announce_to(info_hash, &nodes).await;
            debug!("announced {} to {} nodes", info_hash, acked);
        })
    }

    /// Finds the nodes closest to `info_hash` and announces to them.
    pub async fn announce(&self, info_hash: NodeId) -> usize {
        let nodes = self.get_peers_lookup(info_hash, |_| {}).await;
        self.announce_to(info_hash, &nodes).await
    }

    async fn announce_to(&self, info_hash: NodeId, nodes: &[LookupNode]) -> usize {
        let (port, implied_port) = match self.config.announce_port {
            Some(port) => (port, false),
            None => (self.local_addr.port(), true),
        };

        let announces = with_tokens(nodes).map(|(node, token)| {
            self.rpc.query(
                node.addr,
                Some(node.id),
                Query::AnnouncePeer {
                    id: self.our_id,
                    info_hash,
                    port,
                    implied_port,
                    token,
                },
            )
        });

        join_all(announces)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    /// Aborts a running background lookup.
    pub fn cancel_lookup(&self, target: &NodeId) -> bool {
        match self.active_lookups.lock().remove(target) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn spawn_lookup<Fut>(self: &Arc<Self>, target: NodeId, work: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut active = self.active_lookups.lock();
        if active.get(&target).is_some_and(|h| !h.is_finished()) {
            debug!("lookup for {} already running", target);
            return false;
        }

        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            work.await;
            server.active_lookups.lock().remove(&target);
        });
        active.insert(target, handle);
        true
    }

    fn refresh_stale_bucket(self: &Arc<Self>) {
        let target = self
            .routing_table
            .read()
            .find_bucket_to_refresh()
            .map(Bucket::random_id);

        if let Some(target) = target {
            debug!("refreshing bucket around {}", target);
            let server = Arc::clone(self);
            self.spawn_lookup(target, async move {
                server.find_node(target).await;
            });
        }
    }

    /// Looks up a BEP-44 item and returns the newest valid copy.
    ///
    /// `salt` must match the one the item was published with; `seq` asks
    /// nodes to omit values not newer than it.
    pub async fn get_value(
        &self,
        target: NodeId,
        salt: Option<Bytes>,
        seq: Option<i64>,
    ) -> Option<StoredValue> {
        let mut best: Option<StoredValue> = None;
        let mut handler = GetHandler {
            seq,
            salt,
            target,
            on_value: |item: StoredValue| {
                if best.as_ref().is_none_or(|b| item.seq > b.seq) {
                    best = Some(item);
                }
            },
        };
        lookup::run(&self.rpc, self.seed(&target), &mut handler).await;
        best
    }

    /// Publishes an immutable item; returns its target.
    pub async fn put_immutable(&self, value: Value) -> Result<NodeId, DhtError> {
        check_size(&value)?;
        let item = self.values.write().make_immutable(value);
        self.values_dirty.store(true, Ordering::Relaxed);
        self.publish(&item).await;
        Ok(item.target())
    }

    /// Signs `value` with this node's key and publishes it under `salt`.
    pub async fn put_mutable(&self, salt: Option<Bytes>, value: Value) -> Result<NodeId, DhtError> {
        check_size(&value)?;
        if salt.as_ref().is_some_and(|s| s.len() > MAX_SALT_SIZE) {
            return Err(ProtocolError::salt_too_big().into());
        }
        let item = self.values.write().make_mutable(salt, value);
        self.values_dirty.store(true, Ordering::Relaxed);
        self.publish(&item).await;
        Ok(item.target())
    }

    /// Stops republishing an item this node authored.
    pub fn unpublish(&self, target: &NodeId) -> bool {
        let removed = self.values.write().remove_announced(target).is_some();
        if removed {
            self.values_dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    /// Collects write tokens near the item's target and `put`s it there.
    async fn publish(&self, item: &StoredValue) -> usize {
        let target = item.target();
        let mut handler = GetHandler {
            seq: None,
            salt: item.salt.clone(),
            target,
            on_value: |_: StoredValue| {},
        };
        let nodes = lookup::run(&self.rpc, self.seed(&target), &mut handler).await;

        let request = item.to_put_request();
        let puts = with_tokens(&nodes).map(|(node, token)| {
            self.rpc.query(
                node.addr,
                Some(node.id),
                Query::Put {
                    id: self.our_id,
                    token,
                    request: request.clone(),
                },
            )
        });

        let stored = join_all(puts)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        info!("published {} to {} nodes", target, stored);
        stored
    }

    async fn republish(&self) {
        let items: Vec<StoredValue> = self.values.read().announced().cloned().collect();
        for item in &items {
            self.publish(item).await;
        }
    }

    /// Writes state to `config.state_path`, if set.
    pub async fn save(&self) -> Result<(), DhtError> {
        let Some(path) = &self.config.state_path else {
            return Ok(());
        };

        let data = {
            let mut table = self.routing_table.write();
            let values = self.values.read();
            let data = persist::encode_state(&table, &values)?;
            table.clear_dirty();
            self.values_dirty.store(false, Ordering::Relaxed);
            data
        };

        if let Err(e) = persist::write_atomic(path, &data).await {
            self.values_dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        debug!("saved DHT state to {}", path.display());
        Ok(())
    }

    async fn save_if_dirty(&self) -> Result<(), DhtError> {
        let dirty =
            self.routing_table.read().is_dirty() || self.values_dirty.load(Ordering::Relaxed);
        if dirty {
            self.save().await
        } else {
            Ok(())
        }
    }
}

fn with_tokens(nodes: &[LookupNode]) -> impl Iterator<Item = (NodeInfo, Bytes)> + '_ {
    nodes
        .iter()
        .filter_map(|n| n.token.clone().map(|token| (n.node, token)))
}

fn check_size(value: &Value) -> Result<(), DhtError> {
    if encode(value).len() > MAX_VALUE_SIZE {
        return Err(ProtocolError::message_too_big().into());
    }
    Ok(())
}
