//! rdht - A BitTorrent Mainline DHT node
//!
//! This library implements the Kademlia-style DHT that BitTorrent clients
//! use to find peers without a tracker, following the BEP (BitTorrent
//! Enhancement Proposals) specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 routing, KRPC and lookups; BEP-44 value storage
//! - [`constants`] - Protocol constants and timings

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{DhtConfig, DhtError, DhtServer, Message, NodeId, NodeInfo, RoutingTable};
