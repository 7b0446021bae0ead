use super::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::bencode::Value;
use crate::constants::{
    BUCKET_REFRESH_WINDOW, DHT_BUCKET_SIZE, PEER_ANNOUNCE_LIFETIME, VALUE_LIFETIME,
};

fn id(first: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    bytes[19] = 1;
    NodeId(bytes)
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
}

fn hex_id(s: &str) -> NodeId {
    s.parse().unwrap()
}

/// Our id at zero, an empty lower half and a full upper bucket that cannot
/// split.
fn far_full_table() -> RoutingTable {
    let mut table = RoutingTable::new(NodeId::MIN);
    for i in 0..DHT_BUCKET_SIZE as u8 {
        assert!(table.add_node(id(0x80 + i), addr(i as u16)).is_some());
    }
    table
}

fn past(window: Duration) -> Duration {
    window + Duration::from_secs(60)
}

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);
}

#[test]
fn test_node_id_from_bytes_invalid() {
    assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

#[test]
fn test_node_id_distance() {
    let a = NodeId([0u8; 20]);
    let b = NodeId([0xFF; 20]);

    assert_eq!(a.distance(&b), NodeId([0xFF; 20]));
    assert!(a.distance(&a).is_zero());
    assert_eq!(id(0x30).distance(&id(0x31)), b.distance(&b).with_bit(7));
    assert_eq!(id(0x12).distance(&id(0x34)), id(0x34).distance(&id(0x12)));
}

#[test]
fn test_node_id_hex() {
    let hex = "e5f96f6f38320f0f33959cb4d3d656452117aadb";
    let id: NodeId = hex.parse().unwrap();
    assert_eq!(id.to_string(), hex);
    assert!("e5f9".parse::<NodeId>().is_err());
    assert!("zz".repeat(20).parse::<NodeId>().is_err());
}

#[test]
fn test_node_id_with_bit() {
    let zero = NodeId::MIN;
    assert_eq!(zero.with_bit(0).0[0], 0x80);
    assert_eq!(zero.with_bit(9).0[1], 0x40);
    assert_eq!(zero.with_bit(159).0[19], 0x01);
    assert_eq!(zero.with_bit(12).leading_zeros(), 12);
}

#[test]
fn test_random_in_range() {
    let mut min = [0u8; 20];
    min[0] = 0x40;
    let mut max = [0u8; 20];
    max[0] = 0x60;
    let (min, max) = (NodeId(min), NodeId(max));

    for _ in 0..200 {
        let id = NodeId::random_in_range(&min, Some(&max));
        assert!(id >= min && id < max, "{} out of range", id);
    }

    for _ in 0..200 {
        let id = NodeId::random_in_range(&max, None);
        assert!(id >= max);
    }
}

#[test]
fn test_node_info_compact() {
    let info = NodeInfo::new(NodeId([1u8; 20]), addr(6881));

    let compact = info.to_compact().unwrap();
    assert_eq!(compact.len(), 26);
    assert_eq!(&compact[20..], &[10, 0, 0, 1, 0x1A, 0xE1]);

    assert_eq!(NodeInfo::from_compact(&compact), Some(info));
    assert_eq!(NodeInfo::from_compact(&compact[..25]), None);
}

#[test]
fn test_node_info_compact_ipv6() {
    let v6 = SocketAddr::V6(SocketAddrV6::new("::1".parse().unwrap(), 6881, 0, 0));
    assert!(NodeInfo::new(NodeId::MIN, v6).to_compact().is_none());
    assert!(peer_to_compact(&v6).is_none());
}

#[test]
fn test_node_states() {
    let mut node = Node::new(id(1), addr(1));
    assert!(!node.is_good());
    assert!(!node.is_bad());

    node.fail();
    node.fail();
    node.fail();
    assert!(node.is_bad());

    node.touch();
    assert!(node.is_good());
    assert!(!node.is_bad());
    assert_eq!(node.failed_queries, 0);

    node.fail();
    node.fail();
    node.fail();
    assert!(!node.is_bad(), "a good node is never bad");
}

#[test]
fn test_bucket_split() {
    let mut bucket = Bucket::full_range();
    assert!(bucket.add(Node::new(id(0x10), addr(1))));
    assert!(bucket.add(Node::new(id(0x90), addr(2))));

    let upper = bucket.split();

    assert_eq!(bucket.end(), Some(upper.start()));
    assert_eq!(upper.start(), &NodeId::MIN.with_bit(0));
    assert!(upper.end().is_none());
    assert_eq!((bucket.depth(), upper.depth()), (1, 1));
    assert!(bucket.get(&id(0x10)).is_some());
    assert!(upper.get(&id(0x90)).is_some());
    assert_eq!((bucket.len(), upper.len()), (1, 1));

    let next = bucket.split();
    assert_eq!(next.start(), &NodeId::MIN.with_bit(1));
    assert_eq!(bucket.depth(), 2);
}

#[test]
fn test_bucket_capacity() {
    let mut bucket = Bucket::full_range();
    for i in 0..DHT_BUCKET_SIZE as u8 {
        assert!(bucket.add(Node::new(id(i + 1), addr(i as u16))));
    }
    assert!(bucket.is_full());
    assert!(!bucket.add(Node::new(id(0x50), addr(99))));
}

#[test]
fn test_bucket_random_id_in_range() {
    let mut bucket = Bucket::full_range();
    let upper = bucket.split();
    for _ in 0..50 {
        assert!(bucket.can_contain(&bucket.random_id()));
        assert!(upper.can_contain(&upper.random_id()));
    }
}

#[test]
fn test_routing_table_rejects_own_id() {
    let our_id = id(0x42);
    let mut table = RoutingTable::new(our_id);
    assert!(table.add_node(our_id, addr(1)).is_none());
    assert_eq!(table.node_count(), 0);
}

#[test]
fn test_routing_table_refresh_is_idempotent() {
    let mut table = RoutingTable::new(NodeId::MIN);
    table.refresh_node(id(0x20), addr(1));
    table.refresh_node(id(0x20), addr(1));

    assert_eq!(table.node_count(), 1);
    assert!(table.find_node(&id(0x20)).unwrap().is_good());
}

#[test]
fn test_routing_table_drops_ninth_far_node() {
    let mut table = far_full_table();

    assert!(table.add_node(id(0x88), addr(100)).is_none());
    assert_eq!(table.node_count(), DHT_BUCKET_SIZE);
    assert_eq!(table.buckets().len(), 2);
    assert!(table.is_consistent());
}

#[test]
fn test_routing_table_splits_near_own_id() {
    let mut table = RoutingTable::new(NodeId::MIN);
    for i in 1..=40u8 {
        table.add_node(id(i), addr(i as u16));
    }

    assert!(table.buckets().len() > 1);
    assert!(table.is_consistent());
    assert!(table.find_node(&id(1)).is_some());
    assert!(table.find_node(&id(2)).is_some());
    assert!(table.node_count() > DHT_BUCKET_SIZE);
}

#[test]
fn test_routing_table_find_closest() {
    let mut table = RoutingTable::new(NodeId::MIN);
    for first in [0x10, 0x20, 0x30, 0x40, 0x50] {
        table.add_node(id(first), addr(first as u16));
    }

    let closest = table.find_closest(&id(0x31), 3);
    let ids: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![id(0x30), id(0x20), id(0x10)]);

    assert_eq!(table.find_closest(&id(0x31), 20).len(), 5);
}

#[test]
fn test_routing_table_skips_bad_nodes() {
    let mut table = RoutingTable::new(NodeId::MIN);
    table.add_node(id(0x10), addr(1));
    table.add_node(id(0x20), addr(2));

    for _ in 0..3 {
        table.mark_failed(&id(0x10));
    }

    let closest = table.find_closest(&id(0x10), 8);
    assert_eq!(closest.len(), 1);
    assert_eq!(closest[0].id, id(0x20));
}

#[test]
fn test_routing_table_peers() {
    let mut table = RoutingTable::new(NodeId::MIN);
    let info_hash = NodeId([7u8; 20]);

    assert!(table.find_peers_for_torrent(&info_hash).is_empty());

    table.add_peer_for_torrent(info_hash, addr(1));
    table.add_peer_for_torrent(info_hash, addr(1));
    table.add_peer_for_torrent(info_hash, addr(2));

    let peers = table.find_peers_for_torrent(&info_hash);
    assert_eq!(peers, vec![addr(1), addr(2)]);
}

#[test]
fn test_full_bucket_reuses_bad_slot() {
    let mut table = far_full_table();
    assert!(table.add_node(id(0x88), addr(100)).is_none());

    for _ in 0..3 {
        table.mark_failed(&id(0x80));
    }

    assert!(table.add_node(id(0x88), addr(100)).is_some());
    assert!(table.find_node(&id(0x80)).is_none());
    assert_eq!(table.node_count(), DHT_BUCKET_SIZE);
}

#[test]
fn test_only_stale_nonempty_buckets_are_refreshed() {
    let mut table = far_full_table();
    assert_eq!(table.buckets().len(), 2);
    assert!(table.buckets()[0].is_empty());
    assert!(table.buckets().iter().all(|b| !b.needs_refresh()));
    assert!(table.find_bucket_to_refresh().is_none());

    table.backdate(past(BUCKET_REFRESH_WINDOW));
    assert!(table.buckets().iter().all(Bucket::needs_refresh));
    for _ in 0..20 {
        let bucket = table.find_bucket_to_refresh().unwrap();
        assert_eq!(bucket.start(), &NodeId::MIN.with_bit(0));
    }

    table.refresh_node(id(0x80), addr(0));
    assert!(table.find_bucket_to_refresh().is_none());
}

#[test]
fn test_announced_peers_expire() {
    let mut table = RoutingTable::new(NodeId::MIN);
    let info_hash = NodeId([7u8; 20]);

    table.add_peer_for_torrent(info_hash, addr(1));
    table.backdate(past(PEER_ANNOUNCE_LIFETIME));
    table.add_peer_for_torrent(info_hash, addr(2));
    assert_eq!(table.find_peers_for_torrent(&info_hash), vec![addr(2)]);

    table.backdate(past(PEER_ANNOUNCE_LIFETIME));
    assert!(table.find_peers_for_torrent(&info_hash).is_empty());
}

#[test]
fn test_routing_table_serde() {
    let mut table = RoutingTable::new(NodeId::MIN);
    for i in 1..=20u8 {
        table.refresh_node(id(i), addr(i as u16));
    }
    table.add_peer_for_torrent(NodeId([7u8; 20]), addr(9));

    let json = serde_json::to_string(&table).unwrap();
    let mut restored: RoutingTable = serde_json::from_str(&json).unwrap();

    assert!(restored.is_consistent());
    assert!(!restored.is_dirty());
    assert_eq!(restored.our_id(), table.our_id());
    assert_eq!(restored.node_count(), table.node_count());
    assert_eq!(restored.buckets().len(), table.buckets().len());
    assert_eq!(
        restored.find_peers_for_torrent(&NodeId([7u8; 20])),
        vec![addr(9)]
    );
}

#[test]
fn test_token_validation() {
    let mut tokens = TokenManager::new();
    let peer = addr(6881);
    let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6881);

    let token = tokens.create_token(&peer);
    assert_eq!(token.len(), 20);
    assert!(tokens.validate_token(&token, &peer));
    assert!(tokens.validate_token(&token, &addr(7000)), "port is not part of the token");
    assert!(!tokens.validate_token(&token, &other));
    assert!(!tokens.validate_token(b"garbage", &peer));

    tokens.rotate();
    assert!(tokens.validate_token(&token, &peer));

    tokens.rotate();
    assert!(!tokens.validate_token(&token, &peer));
}

#[test]
fn test_find_node_query_encoding() {
    let msg = Message::query(
        Bytes::from_static(b"aa"),
        Query::FindNode {
            id: NodeId(*b"abcdefghij0123456789"),
            target: NodeId(*b"mnopqrstuvwxyz123456"),
        },
    );

    let expected = b"d1:ad2:id20:abcdefghij01234567896:target20:mnopqrstuvwxyz123456e1:q9:find_node1:t2:aa1:y1:qe";
    assert_eq!(msg.encode(), expected.to_vec());
    assert_eq!(Message::parse(expected).unwrap(), msg);
}

#[test]
fn test_query_roundtrip() {
    let queries = vec![
        Query::Ping { id: id(1) },
        Query::AnnouncePeer {
            id: id(1),
            info_hash: id(2),
            port: 6881,
            implied_port: true,
            token: Bytes::from_static(b"tok"),
        },
        Query::Get {
            id: id(1),
            target: id(3),
            seq: Some(4),
        },
        Query::Put {
            id: id(1),
            token: Bytes::from_static(b"tok"),
            request: PutRequest::immutable(Value::string("Hello World!")),
        },
    ];

    for query in queries {
        let msg = Message::query(Bytes::from_static(b"tx"), query);
        assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
    }
}

#[test]
fn test_get_peers_response_roundtrip() {
    let response = Response::GetPeers {
        id: id(1),
        token: Bytes::from_static(b"token"),
        values: vec![addr(1), addr(2)],
        nodes: vec![NodeInfo::new(id(2), addr(3)), NodeInfo::new(id(3), addr(4))],
    };

    let msg = Message::response(Bytes::from_static(b"aa"), &response);
    let parsed = Message::parse(&msg.encode()).unwrap();

    let Body::Response(reply) = parsed.body else {
        panic!("expected response");
    };
    assert_eq!(Response::parse(QueryKind::GetPeers, &reply).unwrap(), response);
}

#[test]
fn test_get_peers_response_always_has_nodes() {
    let response = Response::GetPeers {
        id: id(1),
        token: Bytes::from_static(b"tok"),
        values: Vec::new(),
        nodes: Vec::new(),
    };

    let encoded = Message::response(Bytes::from_static(b"aa"), &response).encode();
    assert!(encoded.windows(9).any(|w| w == b"5:nodes0:"));
}

#[test]
fn test_get_response_roundtrip() {
    let mut get = GetResponse::new(id(1));
    get.token = Some(Bytes::from_static(b"t"));
    get.nodes = vec![NodeInfo::new(id(2), addr(3))];
    get.value = Some(Value::string("Hello World!"));
    get.seq = Some(1);
    let response = Response::Get(get);

    let msg = Message::response(Bytes::from_static(b"aa"), &response);
    let Body::Response(reply) = Message::parse(&msg.encode()).unwrap().body else {
        panic!("expected response");
    };
    assert_eq!(Response::parse(QueryKind::Get, &reply).unwrap(), response);
}

#[test]
fn test_error_roundtrip() {
    let msg = Message::error(Bytes::from_static(b"aa"), ProtocolError::sequence_too_low());
    let parsed = Message::parse(&msg.encode()).unwrap();

    let Body::Error(error) = parsed.body else {
        panic!("expected error");
    };
    assert_eq!(error.code, 302);
}

#[test]
fn test_unknown_method_is_bad_query() {
    let data = b"d1:ad2:id20:abcdefghij0123456789e1:q4:fake1:t2:xy1:y1:qe";
    match Message::parse(data) {
        Err(DhtError::BadQuery {
            transaction_id,
            error,
        }) => {
            assert_eq!(transaction_id.as_ref(), b"xy");
            assert_eq!(error.code, 204);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_missing_argument_is_bad_query() {
    let data = b"d1:ad2:id20:abcdefghij0123456789e1:q9:find_node1:t2:xy1:y1:qe";
    match Message::parse(data) {
        Err(DhtError::BadQuery { error, .. }) => assert_eq!(error.code, 203),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_malformed_messages() {
    assert!(matches!(
        Message::parse(b"not bencode"),
        Err(DhtError::Bencode(_))
    ));
    assert!(matches!(
        Message::parse(b"i42e"),
        Err(DhtError::InvalidMessage(_))
    ));
    assert!(matches!(
        Message::parse(b"d1:y1:qe"),
        Err(DhtError::InvalidMessage(_))
    ));
}

const VECTOR_KEY: &str = "77ff84905a91936367c01360803104f92432fcd904a43511876df5cdf3e7e548";
const VECTOR_SIG: &str = "305ac8aeb6c9c151fa120f120ea2cfb923564e11552d06a5d856091e5e853cff1260d3f39e4999684aa92eb73ffd136e6f4f3ecbfda0ce53a1608ecd7ae21f01";

fn vector_put(seq: i64) -> PutRequest {
    PutRequest {
        value: Value::string("Hello World!"),
        key: Some(Bytes::from(hex::decode(VECTOR_KEY).unwrap())),
        salt: None,
        seq: Some(seq),
        sig: Some(Bytes::from(hex::decode(VECTOR_SIG).unwrap())),
        cas: None,
    }
}

#[test]
fn test_signature_payload() {
    let payload = signature_payload(None, 1, &Value::string("Hello World!"));
    assert_eq!(payload, b"3:seqi1e1:v12:Hello World!".to_vec());

    let salted = signature_payload(Some(b"foobar"), 1, &Value::string("Hello World!"));
    assert_eq!(salted, b"4:salt6:foobar3:seqi1e1:v12:Hello World!".to_vec());
}

#[test]
fn test_immutable_target() {
    let target = immutable_target(&Value::string("Hello World!"));
    assert_eq!(target, hex_id("e5f96f6f38320f0f33959cb4d3d656452117aadb"));
}

#[test]
fn test_mutable_put() {
    let mut store = ValueStore::new();
    let target = store.put(&vector_put(1)).unwrap();

    assert_eq!(target, hex_id("4a533d47ec9c7d95b1ad75f576cffc641853b750"));
    let item = store.find(&target).unwrap();
    assert_eq!(item.seq, Some(1));
    assert_eq!(item.value, Value::string("Hello World!"));
}

#[test]
fn test_mutable_put_bad_signature() {
    let mut store = ValueStore::new();
    let err = store.put(&vector_put(3)).unwrap_err();
    assert_eq!(err.code, 206);
    assert!(store.is_empty());
}

#[test]
fn test_put_value_too_big() {
    let mut store = ValueStore::new();
    let request = PutRequest::immutable(Value::bytes(&[0u8; 1000]));
    assert_eq!(store.put(&request).unwrap_err().code, 205);
}

#[test]
fn test_put_salt_too_big() {
    let mut store = ValueStore::new();
    let mut request = vector_put(1);
    request.salt = Some(Bytes::from(vec![b's'; 65]));
    assert_eq!(store.put(&request).unwrap_err().code, 207);
}

#[test]
fn test_put_sequence_and_cas() {
    let mut author = ValueStore::new();
    let first = author.make_mutable(None, Value::string("one"));
    let second = author.make_mutable(None, Value::string("two"));
    assert_eq!((first.seq, second.seq), (Some(1), Some(2)));
    assert_eq!(first.target(), second.target());

    let mut store = ValueStore::new();
    store.put(&second.to_put_request()).unwrap();
    assert_eq!(
        store.put(&first.to_put_request()).unwrap_err().code,
        302
    );

    let third = author.make_mutable(None, Value::string("three"));
    let mut request = third.to_put_request();
    request.cas = Some(5);
    assert_eq!(store.put(&request).unwrap_err().code, 301);

    request.cas = Some(2);
    let target = store.put(&request).unwrap();
    assert_eq!(store.find(&target).unwrap().value, Value::string("three"));
}

#[test]
fn test_stored_value_is_stale() {
    let mut item = ValueStore::new().make_immutable(Value::string("v"));
    assert!(!item.is_stale());

    item.refreshed -= past(VALUE_LIFETIME);
    assert!(item.is_stale());
}

#[test]
fn test_stale_items_are_dropped() {
    let mut store = ValueStore::new();
    let old = store.put(&PutRequest::immutable(Value::string("old"))).unwrap();
    let new = store.put(&PutRequest::immutable(Value::string("new"))).unwrap();

    store.backdate(&old, past(VALUE_LIFETIME));
    assert!(store.find(&old).is_none());
    assert!(store.find(&new).is_some());
    assert_eq!(store.len(), 1);

    store.backdate(&new, past(VALUE_LIFETIME));
    assert_eq!(store.purge_stale(), 1);
    assert!(store.is_empty());
}

#[test]
fn test_stale_mutable_item_accepts_lower_seq() {
    let mut author = ValueStore::new();
    let first = author.make_mutable(None, Value::string("one"));
    let second = author.make_mutable(None, Value::string("two"));

    let mut store = ValueStore::new();
    let target = store.put(&second.to_put_request()).unwrap();
    store.backdate(&target, past(VALUE_LIFETIME));

    assert_eq!(store.put(&first.to_put_request()).unwrap(), target);
    assert_eq!(store.find(&target).unwrap().seq, Some(1));
}

#[test]
fn test_salted_items_have_distinct_targets() {
    let mut author = ValueStore::new();
    let plain = author.make_mutable(None, Value::string("v"));
    let salted = author.make_mutable(Some(Bytes::from_static(b"salt")), Value::string("v"));

    assert_ne!(plain.target(), salted.target());
    assert_eq!(salted.seq, Some(1));

    let mut store = ValueStore::new();
    assert_eq!(store.put(&salted.to_put_request()).unwrap(), salted.target());
}

#[test]
fn test_value_store_serde() {
    let mut store = ValueStore::new();
    let target = store.put(&vector_put(1)).unwrap();
    store.make_immutable(Value::string("mine"));

    let json = serde_json::to_string(&store).unwrap();
    let mut restored: ValueStore = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.public_key(), store.public_key());
    assert_eq!(restored.announced().count(), 1);
    assert_eq!(restored.find(&target).unwrap().seq, Some(1));
}

#[test]
fn test_validate_value() {
    let value = Value::string("Hello World!");
    let target = immutable_target(&value);

    let mut reply = GetResponse::new(id(1));
    reply.value = Some(value);
    assert!(validate_value(&target, None, &reply).is_some());
    assert!(validate_value(&id(9), None, &reply).is_none());

    let put = vector_put(1);
    let signed_target = mutable_target(put.key.as_ref().unwrap(), None);
    let mut reply = GetResponse::new(id(1));
    reply.value = put.value.clone().into();
    reply.key = put.key.clone();
    reply.sig = put.sig.clone();
    reply.seq = Some(1);
    assert!(validate_value(&signed_target, None, &reply).is_some());

    reply.value = Some(Value::string("Hello World?"));
    assert!(validate_value(&signed_target, None, &reply).is_none());
}

#[test]
fn test_lookup_keeps_closest() {
    let our_id = NodeId([0xFF; 20]);
    let target = NodeId::MIN;
    let seed: Vec<NodeInfo> = (1..=10).map(|i| NodeInfo::new(id(i), addr(i as u16))).collect();

    let mut lookup = Lookup::new(our_id, target, seed);
    assert_eq!(lookup.nodes().len(), DHT_BUCKET_SIZE);
    assert_eq!(lookup.nodes()[0].node.id, id(1));
    assert_eq!(lookup.nodes()[7].node.id, id(8));

    assert!(!lookup.offer(NodeInfo::new(id(9), addr(9))));
    assert!(!lookup.offer(NodeInfo::new(our_id, addr(1))));
    assert!(!lookup.offer(NodeInfo::new(id(3), addr(3))));
    assert!(lookup.offer(NodeInfo::new(id(0), addr(99))));
    assert_eq!(lookup.nodes()[0].node.id, id(0));
    assert!(lookup.nodes().iter().all(|n| n.node.id != id(8)));
}

#[test]
fn test_lookup_state_machine() {
    let target = NodeId::MIN;
    let seed = vec![
        NodeInfo::new(id(1), addr(1)),
        NodeInfo::new(id(2), addr(2)),
    ];
    let mut lookup = Lookup::new(NodeId([0xFF; 20]), target, seed);

    let first = lookup.next_candidate().unwrap();
    let second = lookup.next_candidate().unwrap();
    assert_ne!(first.id, second.id);
    assert!(lookup.next_candidate().is_none());
    assert!(!lookup.is_finished());

    lookup.on_success(&first.id, &[NodeInfo::new(id(3), addr(3))]);
    lookup.on_failure(&second.id);
    assert!(!lookup.is_finished());

    let third = lookup.next_candidate().unwrap();
    assert_eq!(third.id, id(3));
    lookup.on_success(&third.id, &[]);
    assert!(lookup.is_finished());

    let result = lookup.into_result();
    assert_eq!(result.len(), 2);
    assert!(result.iter().all(|n| n.is_queried() && !n.is_failed()));
    assert!(result[0].node.id.distance(&target) < result[1].node.id.distance(&target));
}

async fn spawn_node() -> Arc<DhtServer> {
    spawn_node_with(DhtConfig::default()).await
}

async fn spawn_node_with(config: DhtConfig) -> Arc<DhtServer> {
    let config = DhtConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        bootstrap_nodes: Vec::new(),
        query_timeout: Duration::from_millis(500),
        ..config
    };
    let server = DhtServer::bind(config).await.unwrap();
    server.start();
    server
}

#[tokio::test]
async fn test_ping_populates_both_tables() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    let remote = a.ping(b.local_addr()).await.unwrap();

    assert_eq!(&remote, b.our_id());
    assert!(a.with_routing_table(|t| t.find_node(b.our_id()).is_some_and(Node::is_good)));
    assert!(b.with_routing_table(|t| t.find_node(a.our_id()).is_some()));
}

#[tokio::test]
async fn test_query_timeout() {
    let a = spawn_node().await;
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let err = a.ping(silent.local_addr().unwrap()).await.unwrap_err();
    assert!(matches!(err, DhtError::Timeout));
}

#[tokio::test]
async fn test_lookup_finishes_with_unreachable_nodes() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead = NodeId([0x55; 20]);

    a.ping(b.local_addr()).await.unwrap();
    a.with_routing_table(|t| assert!(t.find_node(&dead).is_none()));
    assert!(a.add_node(dead, silent.local_addr().unwrap()));

    let found = tokio::time::timeout(Duration::from_secs(10), a.find_node(dead))
        .await
        .unwrap();

    let ids: Vec<NodeId> = found.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![*b.our_id()]);
}

#[tokio::test]
async fn test_unknown_method_gets_error_reply() {
    let a = spawn_node().await;
    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client
        .send_to(
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:fake1:t2:xy1:y1:qe",
            a.local_addr(),
        )
        .await
        .unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let reply = Message::parse(&buf[..n]).unwrap();
    assert_eq!(reply.transaction_id.as_ref(), b"xy");
    match reply.body {
        Body::Error(error) => assert_eq!(error.code, 204),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_get_peers_reply_from_empty_node_has_nodes() {
    let a = spawn_node().await;
    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client
        .send_to(
            b"d1:ad2:id20:abcdefghij01234567899:info_hash20:mnopqrstuvwxyz123456e1:q9:get_peers1:t2:xy1:y1:qe",
            a.local_addr(),
        )
        .await
        .unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert!(buf[..n].windows(7).any(|w| w == b"5:nodes"));
    let reply = Message::parse(&buf[..n]).unwrap();
    assert!(matches!(reply.body, Body::Response(_)));
}

#[tokio::test]
async fn test_reply_clears_failures_of_queried_entry() {
    let b = spawn_node().await;
    let our_id = NodeId::generate();
    let listed = NodeId([0x33; 20]);

    let table = Arc::new(parking_lot::RwLock::new(RoutingTable::new(our_id)));
    {
        let mut table = table.write();
        table.add_node(listed, b.local_addr());
        table.mark_failed(&listed);
        table.mark_failed(&listed);
    }

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rpc = Arc::new(Rpc::new(socket, Arc::clone(&table), Duration::from_millis(500)));
    let receiver = tokio::spawn({
        let rpc = Arc::clone(&rpc);
        async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = rpc.recv_from(&mut buf).await {
                if let Ok(msg) = Message::parse(&buf[..n]) {
                    rpc.handle_reply(from, msg);
                }
            }
        }
    });

    let response = rpc
        .query(b.local_addr(), Some(listed), Query::Ping { id: our_id })
        .await
        .unwrap();
    receiver.abort();

    assert_eq!(response.id(), b.our_id());
    let table = table.read();
    assert_eq!(table.find_node(&listed).unwrap().failed_queries, 0);
    assert!(table.find_node(b.our_id()).is_some());
}

#[tokio::test]
async fn test_shutdown_aborts_background_work() {
    let a = spawn_node().await;
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    a.spawn_tracked(async move {
        let _tx = tx;
        std::future::pending::<()>().await;
    });
    a.shutdown().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap();
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_announce_and_get_peers() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    a.ping(b.local_addr()).await.unwrap();

    let info_hash = NodeId([7u8; 20]);
    assert_eq!(a.announce(info_hash).await, 1);

    c.ping(b.local_addr()).await.unwrap();

    let peers = c.get_peers(info_hash).await;
    assert_eq!(peers, vec![a.local_addr()]);
}

#[tokio::test]
async fn test_lookup_torrent_in_background() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    a.ping(b.local_addr()).await.unwrap();

    let info_hash = NodeId([9u8; 20]);
    a.announce(info_hash).await;
    c.ping(b.local_addr()).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    assert!(c.lookup_torrent(info_hash, move |peers| {
        let _ = tx.send(peers.to_vec());
    }));
    assert!(!c.lookup_torrent(info_hash, |_| {}));

    let peers = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peers, vec![a.local_addr()]);

    assert!(!c.cancel_lookup(&NodeId([1u8; 20])));
}

#[tokio::test]
async fn test_put_and_get_immutable() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    a.ping(b.local_addr()).await.unwrap();
    c.ping(b.local_addr()).await.unwrap();

    let target = a.put_immutable(Value::string("Hello World!")).await.unwrap();
    assert_eq!(target, hex_id("e5f96f6f38320f0f33959cb4d3d656452117aadb"));
    assert!(b.with_values(|v| v.find(&target).is_some()));

    let item = c.get_value(target, None, None).await.unwrap();
    assert_eq!(item.value, Value::string("Hello World!"));
    assert!(!item.is_mutable());
}

#[tokio::test]
async fn test_put_and_get_mutable() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    a.ping(b.local_addr()).await.unwrap();
    c.ping(b.local_addr()).await.unwrap();

    let salt = Some(Bytes::from_static(b"profile"));
    let target = a
        .put_mutable(salt.clone(), Value::string("v1"))
        .await
        .unwrap();

    let item = c.get_value(target, salt.clone(), None).await.unwrap();
    assert_eq!(item.seq, Some(1));
    assert_eq!(item.key.as_deref(), Some(&a.public_key()[..]));

    a.put_mutable(salt.clone(), Value::string("v2")).await.unwrap();
    let item = c.get_value(target, salt.clone(), Some(1)).await.unwrap();
    assert_eq!(item.value, Value::string("v2"));
    assert_eq!(item.seq, Some(2));

    assert!(c.get_value(target, salt, Some(2)).await.is_none());
}

#[tokio::test]
async fn test_oversized_put_is_rejected_locally() {
    let a = spawn_node().await;
    let err = a
        .put_immutable(Value::bytes(&[0u8; 2000]))
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::Remote(e) if e.code == 205));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = DhtConfig {
        state_path: Some(dir.path().join("dht.json")),
        ..DhtConfig::default()
    };

    let a = spawn_node_with(config.clone()).await;
    let b = spawn_node().await;
    a.ping(b.local_addr()).await.unwrap();
    a.shutdown().await.unwrap();

    let restored = spawn_node_with(config).await;
    assert_eq!(restored.our_id(), a.our_id());
    assert_eq!(restored.public_key(), a.public_key());
    assert!(restored.with_routing_table(|t| t.find_node(b.our_id()).is_some()));
}
