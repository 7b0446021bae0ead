//! On-disk node state.
//!
//! The routing table, the value store and the node's signing key are
//! written as one JSON document. Binary fields are hex strings so the file
//! stays readable.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::DhtError;
use super::routing::RoutingTable;
use super::storage::ValueStore;

#[derive(Debug, Deserialize)]
pub struct PersistedState {
    pub routing_table: RoutingTable,
    pub values: ValueStore,
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    routing_table: &'a RoutingTable,
    values: &'a ValueStore,
}

pub fn encode_state(routing_table: &RoutingTable, values: &ValueStore) -> Result<Vec<u8>, DhtError> {
    Ok(serde_json::to_vec_pretty(&PersistedStateRef {
        routing_table,
        values,
    })?)
}

/// Reads saved state. `Ok(None)` when there is no file yet or the saved
/// routing table fails its consistency check.
pub async fn load(path: &Path) -> Result<Option<PersistedState>, DhtError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let state: PersistedState = serde_json::from_slice(&data)?;
    if !state.routing_table.is_consistent() {
        warn!("ignoring inconsistent routing table in {}", path.display());
        return Ok(None);
    }

    debug!(
        "loaded {} nodes and {} values from {}",
        state.routing_table.node_count(),
        state.values.len(),
        path.display()
    );
    Ok(Some(state))
}

/// Writes via a sibling temp file and a rename so a crash never leaves a
/// truncated document behind.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), DhtError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub(crate) mod hex_opt {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

pub(crate) mod bencoded {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::bencode::{decode, encode, Value};

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(s).map_err(serde::de::Error::custom)?;
        decode(&raw).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod signing_key_hex {
    use ed25519_dalek::SigningKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &SigningKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SigningKey, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut secret = [0u8; 32];
        hex::decode_to_slice(s, &mut secret).map_err(serde::de::Error::custom)?;
        Ok(SigningKey::from_bytes(&secret))
    }
}
