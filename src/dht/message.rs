use std::net::SocketAddr;

use bytes::Bytes;

use super::error::{DhtError, ProtocolError};
use super::id::NodeId;
use super::node::{peer_from_compact, peer_to_compact, NodeInfo, COMPACT_NODE_LEN};
use crate::bencode::{decode, encode, Value};

pub type TransactionId = Bytes;

/// The six KRPC methods this node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::Ping => "ping",
            QueryKind::FindNode => "find_node",
            QueryKind::GetPeers => "get_peers",
            QueryKind::AnnouncePeer => "announce_peer",
            QueryKind::Get => "get",
            QueryKind::Put => "put",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"ping" => QueryKind::Ping,
            b"find_node" => QueryKind::FindNode,
            b"get_peers" => QueryKind::GetPeers,
            b"announce_peer" => QueryKind::AnnouncePeer,
            b"get" => QueryKind::Get,
            b"put" => QueryKind::Put,
            _ => return None,
        })
    }
}

/// Arguments of a BEP-44 `put`.
///
/// `key` absent means an immutable item; with a key, `seq` and `sig` are
/// required and are checked by the value store, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub value: Value,
    pub key: Option<Bytes>,
    pub salt: Option<Bytes>,
    pub seq: Option<i64>,
    pub sig: Option<Bytes>,
    pub cas: Option<i64>,
}

impl PutRequest {
    pub fn immutable(value: Value) -> Self {
        Self {
            value,
            key: None,
            salt: None,
            seq: None,
            sig: None,
            cas: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: NodeId,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
    Get {
        id: NodeId,
        target: NodeId,
        seq: Option<i64>,
    },
    Put {
        id: NodeId,
        token: Bytes,
        request: PutRequest,
    },
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        match self {
            Query::Ping { .. } => QueryKind::Ping,
            Query::FindNode { .. } => QueryKind::FindNode,
            Query::GetPeers { .. } => QueryKind::GetPeers,
            Query::AnnouncePeer { .. } => QueryKind::AnnouncePeer,
            Query::Get { .. } => QueryKind::Get,
            Query::Put { .. } => QueryKind::Put,
        }
    }

    pub fn sender_id(&self) -> &NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::Get { id, .. }
            | Query::Put { id, .. } => id,
        }
    }

    fn to_args(&self) -> Value {
        let args = Value::dict().insert("id", id_value(self.sender_id()));

        let args = match self {
            Query::Ping { .. } => args,
            Query::FindNode { target, .. } => args.insert("target", id_value(target)),
            Query::GetPeers { info_hash, .. } => args.insert("info_hash", id_value(info_hash)),
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => args
                .insert("info_hash", id_value(info_hash))
                .insert("port", *port as i64)
                .insert("token", token.clone())
                .insert_opt("implied_port", implied_port.then_some(1i64)),
            Query::Get { target, seq, .. } => {
                args.insert("target", id_value(target)).insert_opt("seq", *seq)
            }
            Query::Put { token, request, .. } => args
                .insert("token", token.clone())
                .insert("v", request.value.clone())
                .insert_opt("k", request.key.clone())
                .insert_opt("salt", request.salt.clone())
                .insert_opt("seq", request.seq)
                .insert_opt("sig", request.sig.clone())
                .insert_opt("cas", request.cas),
        };
        args.build()
    }

    fn from_args(kind: QueryKind, args: &Value) -> Result<Self, ProtocolError> {
        let id = required_id(args, b"id")?;

        Ok(match kind {
            QueryKind::Ping => Query::Ping { id },
            QueryKind::FindNode => Query::FindNode {
                id,
                target: required_id(args, b"target")?,
            },
            QueryKind::GetPeers => Query::GetPeers {
                id,
                info_hash: required_id(args, b"info_hash")?,
            },
            QueryKind::AnnouncePeer => {
                let implied_port = args.get_integer(b"implied_port") == Some(1);
                let port = match args.get_integer(b"port") {
                    Some(port) => u16::try_from(port)
                        .map_err(|_| ProtocolError::protocol("invalid port"))?,
                    None if implied_port => 0,
                    None => return Err(ProtocolError::protocol("missing port")),
                };

                Query::AnnouncePeer {
                    id,
                    info_hash: required_id(args, b"info_hash")?,
                    port,
                    implied_port,
                    token: required_bytes(args, b"token")?,
                }
            }
            QueryKind::Get => Query::Get {
                id,
                target: required_id(args, b"target")?,
                seq: args.get_integer(b"seq"),
            },
            QueryKind::Put => Query::Put {
                id,
                token: required_bytes(args, b"token")?,
                request: PutRequest {
                    value: args
                        .get(b"v")
                        .cloned()
                        .ok_or_else(|| ProtocolError::protocol("missing v"))?,
                    key: args.get_bytes(b"k").cloned(),
                    salt: args.get_bytes(b"salt").cloned(),
                    seq: args.get_integer(b"seq"),
                    sig: args.get_bytes(b"sig").cloned(),
                    cas: args.get_integer(b"cas"),
                },
            },
        })
    }
}

/// Body of a BEP-44 `get` reply. Every field but `id` is optional: a node
/// without the item answers with `nodes` (and a `token`) only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub id: NodeId,
    pub token: Option<Bytes>,
    pub nodes: Vec<NodeInfo>,
    pub value: Option<Value>,
    pub key: Option<Bytes>,
    pub sig: Option<Bytes>,
    pub seq: Option<i64>,
}

impl GetResponse {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            token: None,
            nodes: Vec::new(),
            value: None,
            key: None,
            sig: None,
            seq: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<NodeInfo>,
    },
    GetPeers {
        id: NodeId,
        token: Bytes,
        values: Vec<SocketAddr>,
        nodes: Vec<NodeInfo>,
    },
    AnnouncePeer {
        id: NodeId,
    },
    Get(GetResponse),
    Put {
        id: NodeId,
    },
}

impl Response {
    pub fn id(&self) -> &NodeId {
        match self {
            Response::Ping { id }
            | Response::FindNode { id, .. }
            | Response::GetPeers { id, .. }
            | Response::AnnouncePeer { id }
            | Response::Put { id } => id,
            Response::Get(get) => &get.id,
        }
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        match self {
            Response::FindNode { nodes, .. } | Response::GetPeers { nodes, .. } => nodes,
            Response::Get(get) => &get.nodes,
            _ => &[],
        }
    }

    fn to_value(&self) -> Value {
        let dict = Value::dict().insert("id", id_value(self.id()));

        let dict = match self {
            Response::Ping { .. } | Response::AnnouncePeer { .. } | Response::Put { .. } => dict,
            Response::FindNode { nodes, .. } => dict.insert("nodes", compact_nodes(nodes)),
            Response::GetPeers {
                token,
                values,
                nodes,
                ..
            } => {
                let peers: Vec<Value> = values
                    .iter()
                    .filter_map(peer_to_compact)
                    .map(|p| Value::bytes(&p))
                    .collect();

                dict.insert("token", token.clone())
                    .insert_opt("values", (!peers.is_empty()).then_some(peers))
                    .insert("nodes", compact_nodes(nodes))
            }
            Response::Get(get) => dict
                .insert_opt("token", get.token.clone())
                .insert_opt(
                    "nodes",
                    (!get.nodes.is_empty()).then(|| compact_nodes(&get.nodes)),
                )
                .insert_opt("v", get.value.clone())
                .insert_opt("k", get.key.clone())
                .insert_opt("sig", get.sig.clone())
                .insert_opt("seq", get.seq),
        };
        dict.build()
    }

    /// Interprets a reply dictionary as the answer to a `kind` query.
    ///
    /// Replies do not name their method, so the pending transaction's kind
    /// decides the shape.
    pub fn parse(kind: QueryKind, reply: &Value) -> Result<Self, DhtError> {
        let id = required_id(reply, b"id").map_err(invalid)?;
        let nodes = || parse_compact_nodes(reply.get_bytes(b"nodes"));

        Ok(match kind {
            QueryKind::Ping => Response::Ping { id },
            QueryKind::AnnouncePeer => Response::AnnouncePeer { id },
            QueryKind::Put => Response::Put { id },
            QueryKind::FindNode => Response::FindNode { id, nodes: nodes() },
            QueryKind::GetPeers => Response::GetPeers {
                id,
                token: required_bytes(reply, b"token").map_err(invalid)?,
                values: reply
                    .get(b"values")
                    .and_then(Value::as_list)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_bytes)
                            .filter_map(|b| peer_from_compact(b))
                            .collect()
                    })
                    .unwrap_or_default(),
                nodes: nodes(),
            },
            QueryKind::Get => Response::Get(GetResponse {
                id,
                token: reply.get_bytes(b"token").cloned(),
                nodes: nodes(),
                value: reply.get(b"v").cloned(),
                key: reply.get_bytes(b"k").cloned(),
                sig: reply.get_bytes(b"sig").cloned(),
                seq: reply.get_integer(b"seq"),
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query(Query),
    /// The raw `r` dictionary, typed later by [`Response::parse`].
    Response(Value),
    Error(ProtocolError),
}

/// One KRPC datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub transaction_id: TransactionId,
    pub body: Body,
}

impl Message {
    pub fn query(transaction_id: TransactionId, query: Query) -> Self {
        Self {
            transaction_id,
            body: Body::Query(query),
        }
    }

    pub fn response(transaction_id: TransactionId, response: &Response) -> Self {
        Self {
            transaction_id,
            body: Body::Response(response.to_value()),
        }
    }

    pub fn error(transaction_id: TransactionId, error: ProtocolError) -> Self {
        Self {
            transaction_id,
            body: Body::Error(error),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;

        if value.as_dict().is_none() {
            return Err(DhtError::InvalidMessage("expected dict".into()));
        }

        let transaction_id = value
            .get_bytes(b"t")
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let msg_type = value
            .get_str(b"y")
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        let body = match msg_type {
            "q" => Body::Query(parse_query(&value).map_err(|error| DhtError::BadQuery {
                transaction_id: transaction_id.clone(),
                error,
            })?),
            "r" => Body::Response(
                value
                    .get(b"r")
                    .filter(|r| r.as_dict().is_some())
                    .cloned()
                    .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?,
            ),
            "e" => Body::Error(parse_error(&value)?),
            other => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {}",
                    other
                )))
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let msg = Value::dict().insert("t", self.transaction_id.clone());

        let msg = match &self.body {
            Body::Query(query) => msg
                .insert("y", "q")
                .insert("q", query.kind().name())
                .insert("a", query.to_args()),
            Body::Response(reply) => msg.insert("y", "r").insert("r", reply.clone()),
            Body::Error(error) => msg.insert("y", "e").insert(
                "e",
                vec![Value::Integer(error.code), Value::string(&error.message)],
            ),
        };

        encode(&msg.build())
    }
}

fn parse_query(msg: &Value) -> Result<Query, ProtocolError> {
    let name = msg
        .get_bytes(b"q")
        .ok_or_else(|| ProtocolError::protocol("missing query name"))?;

    let kind = QueryKind::from_name(name)
        .ok_or_else(|| ProtocolError::method_unknown(&String::from_utf8_lossy(name)))?;

    let args = msg
        .get(b"a")
        .filter(|a| a.as_dict().is_some())
        .ok_or_else(|| ProtocolError::protocol("missing query args"))?;

    Query::from_args(kind, args)
}

fn parse_error(msg: &Value) -> Result<ProtocolError, DhtError> {
    let error = msg
        .get(b"e")
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    let code = error.first().and_then(Value::as_integer).unwrap_or(0);
    let message = error
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("unknown error");

    Ok(ProtocolError::new(code, message))
}

fn id_value(id: &NodeId) -> Value {
    Value::bytes(id.as_bytes())
}

fn required_id(dict: &Value, key: &[u8]) -> Result<NodeId, ProtocolError> {
    dict.get_bytes(key)
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| missing(key))
}

fn required_bytes(dict: &Value, key: &[u8]) -> Result<Bytes, ProtocolError> {
    dict.get_bytes(key).cloned().ok_or_else(|| missing(key))
}

fn missing(key: &[u8]) -> ProtocolError {
    ProtocolError::protocol(format!(
        "missing or invalid {}",
        String::from_utf8_lossy(key)
    ))
}

fn invalid(err: ProtocolError) -> DhtError {
    DhtError::InvalidMessage(err.message)
}

fn compact_nodes(nodes: &[NodeInfo]) -> Value {
    let compact: Vec<u8> = nodes
        .iter()
        .filter_map(NodeInfo::to_compact)
        .flatten()
        .collect();
    Value::Bytes(Bytes::from(compact))
}

fn parse_compact_nodes(data: Option<&Bytes>) -> Vec<NodeInfo> {
    data.map(|data| {
        data.chunks_exact(COMPACT_NODE_LEN)
            .filter_map(NodeInfo::from_compact)
            .collect()
    })
    .unwrap_or_default()
}
