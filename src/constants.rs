//! Protocol constants and tuning parameters.
//!
//! Timings follow BEP-5 and BEP-44 where those documents give a number and
//! the behaviour of long-running Mainline nodes where they do not.

use std::time::Duration;

// ============================================================================
// Routing
// ============================================================================

/// Bucket capacity (k in Kademlia)
pub const DHT_BUCKET_SIZE: usize = 8;

/// Identifier width in bits
pub const DHT_ID_BITS: u32 = 160;

/// A node is good if it answered within this window
pub const NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Consecutive failed queries after which a stale node is bad
pub const NODE_MAX_FAILURES: u32 = 3;

/// A bucket untouched for this long needs a refresh lookup
pub const BUCKET_REFRESH_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Announced peers expire after this long without a re-announce
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Upper bound on announced peers remembered per info-hash
pub const MAX_PEERS_PER_TORRENT: usize = 1000;

// ============================================================================
// Lookups
// ============================================================================

/// Maximum concurrent queries per lookup
pub const DHT_ALPHA: usize = 3;

/// Pause before the next step after a failed query
pub const LOOKUP_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Transactions
// ============================================================================

/// Default time to wait for a reply before counting the node as failed
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum outstanding transactions on one socket
pub const MAX_PENDING_DHT_QUERIES: usize = 1024;

/// Transaction id length in bytes
pub const TRANSACTION_ID_LEN: usize = 2;

/// Largest datagram we accept
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// ============================================================================
// Tokens
// ============================================================================

/// Token secret length in bytes
pub const TOKEN_SECRET_LEN: usize = 8;

/// How often the token secret rotates
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Value storage (BEP-44)
// ============================================================================

/// Stored values expire after this long without a put
pub const VALUE_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Locally authored values are re-put this often
pub const VALUE_REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Maximum encoded size of `v`
pub const MAX_VALUE_SIZE: usize = 1000;

/// Maximum salt length
pub const MAX_SALT_SIZE: usize = 64;

// ============================================================================
// Maintenance timers
// ============================================================================

/// Self-lookup interval while the table is still growing
pub const SELF_LOOKUP_FAST_INTERVAL: Duration = Duration::from_secs(1);

/// Self-lookup interval once lookups stop finding nodes
pub const SELF_LOOKUP_SLOW_INTERVAL: Duration = Duration::from_secs(60);

/// Empty self-lookup rounds before backing off
pub const SELF_LOOKUP_EMPTY_ROUNDS: u32 = 3;

/// How often a stale bucket is refreshed
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// How often the dirty flag is checked for persistence
pub const PERSIST_CHECK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Bootstrap
// ============================================================================

/// Default DHT port
pub const DEFAULT_PORT: u16 = 6881;

/// Well-known DHT bootstrap nodes
pub const DHT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
];

// ============================================================================
// KRPC error codes
// ============================================================================

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;
pub const ERROR_MESSAGE_TOO_BIG: i64 = 205;
pub const ERROR_INVALID_SIGNATURE: i64 = 206;
pub const ERROR_SALT_TOO_BIG: i64 = 207;
pub const ERROR_CAS_MISMATCH: i64 = 301;
pub const ERROR_SEQUENCE_TOO_LOW: i64 = 302;
