//! Distributed Hash Table (BEP-5, BEP-44)
//!
//! This module implements the Kademlia-based DHT used by BitTorrent
//! for trackerless peer discovery, plus BEP-44 storage of arbitrary
//! immutable and signed mutable items.
//!
//! The layers, bottom up:
//!
//! - [`NodeId`] - 160-bit identifiers and XOR distance
//! - [`Bucket`] / [`RoutingTable`] - k-buckets that split around our id,
//!   plus the peers announced to us per info-hash
//! - [`TokenManager`] - write tokens for `announce_peer` and `put`
//! - [`Message`] / [`Rpc`] - KRPC codec and the UDP transaction layer
//! - [`Lookup`] - iterative closest-node search
//! - [`ValueStore`] - BEP-44 items held for other nodes and our own
//! - [`DhtServer`] - everything above, wired to a socket

mod bucket;
mod config;
mod error;
mod id;
mod lookup;
mod message;
mod node;
mod persist;
mod routing;
mod rpc;
mod server;
mod storage;
mod token;
mod value_lookup;

pub use bucket::Bucket;
pub use config::DhtConfig;
pub use error::{DhtError, ProtocolError};
pub use id::NodeId;
pub use lookup::{Lookup, LookupNode};
pub use message::{
    Body, GetResponse, Message, PutRequest, Query, QueryKind, Response, TransactionId,
};
pub use node::{peer_from_compact, peer_to_compact, Node, NodeInfo};
pub use persist::PersistedState;
pub use routing::{AnnouncedPeer, RoutingTable};
pub use rpc::Rpc;
pub use server::DhtServer;
pub use storage::{
    immutable_target, mutable_target, signature_payload, verify_signature, StoredValue,
    ValueStore,
};
pub use token::TokenManager;
pub use value_lookup::validate as validate_value;

#[cfg(test)]
mod tests;
