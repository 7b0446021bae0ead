//! BEP-44 item storage.
//!
//! Immutable items live under `SHA-1(bencode(v))`. Mutable items live under
//! `SHA-1(k || salt)` and carry an Ed25519 signature over
//! `[4:salt<len>:<salt>]3:seqi<seq>e1:v<bencode(v)>`.

use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ProtocolError;
use super::id::NodeId;
use super::message::PutRequest;
use super::persist::{bencoded, hex_opt, signing_key_hex};
use crate::bencode::{encode, encode_to, Value};
use crate::constants::{MAX_SALT_SIZE, MAX_VALUE_SIZE, VALUE_LIFETIME};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    #[serde(with = "bencoded")]
    pub value: Value,
    #[serde(with = "hex_opt")]
    pub key: Option<Bytes>,
    #[serde(with = "hex_opt")]
    pub salt: Option<Bytes>,
    #[serde(with = "hex_opt")]
    pub sig: Option<Bytes>,
    pub seq: Option<i64>,
    pub refreshed: SystemTime,
}

impl StoredValue {
    pub fn is_mutable(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.refreshed
            .elapsed()
            .map(|age| age > VALUE_LIFETIME)
            .unwrap_or(false)
    }

    pub fn target(&self) -> NodeId {
        match &self.key {
            Some(key) => mutable_target(key, self.salt.as_deref()),
            None => immutable_target(&self.value),
        }
    }

    /// The `put` arguments that republish this item.
    pub fn to_put_request(&self) -> PutRequest {
        PutRequest {
            value: self.value.clone(),
            key: self.key.clone(),
            salt: self.salt.clone(),
            seq: self.seq,
            sig: self.sig.clone(),
            cas: None,
        }
    }
}

pub fn immutable_target(value: &Value) -> NodeId {
    NodeId::sha1(&[&encode(value)])
}

pub fn mutable_target(key: &[u8], salt: Option<&[u8]>) -> NodeId {
    match non_empty(salt) {
        Some(salt) => NodeId::sha1(&[key, salt]),
        None => NodeId::sha1(&[key]),
    }
}

/// The byte string a mutable item's signature covers.
pub fn signature_payload(salt: Option<&[u8]>, seq: i64, value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(salt) = non_empty(salt) {
        buf.extend_from_slice(b"4:salt");
        encode_to(&Value::bytes(salt), &mut buf);
    }
    buf.extend_from_slice(b"3:seq");
    encode_to(&Value::Integer(seq), &mut buf);
    buf.extend_from_slice(b"1:v");
    encode_to(value, &mut buf);
    buf
}

pub fn verify_signature(
    key: &[u8],
    salt: Option<&[u8]>,
    seq: i64,
    value: &Value,
    sig: &[u8],
) -> Result<(), ProtocolError> {
    let key: &[u8; 32] = key
        .try_into()
        .map_err(|_| ProtocolError::invalid_signature())?;
    let sig: &[u8; 64] = sig
        .try_into()
        .map_err(|_| ProtocolError::invalid_signature())?;

    let key = VerifyingKey::from_bytes(key).map_err(|_| ProtocolError::invalid_signature())?;
    key.verify(
        &signature_payload(salt, seq, value),
        &Signature::from_bytes(sig),
    )
    .map_err(|_| ProtocolError::invalid_signature())
}

fn non_empty(salt: Option<&[u8]>) -> Option<&[u8]> {
    salt.filter(|s| !s.is_empty())
}

/// Items stored on behalf of other nodes, plus the items this node authored
/// and keeps republishing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValueStore {
    #[serde(with = "signing_key_hex")]
    signing_key: SigningKey,
    entries: HashMap<NodeId, StoredValue>,
    announced: HashMap<NodeId, StoredValue>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::with_signing_key(SigningKey::from_bytes(&rand::random()))
    }

    pub fn with_signing_key(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            entries: HashMap::new(),
            announced: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Validates and stores an incoming `put`, returning the item's target.
    pub fn put(&mut self, request: &PutRequest) -> Result<NodeId, ProtocolError> {
        if encode(&request.value).len() > MAX_VALUE_SIZE {
            return Err(ProtocolError::message_too_big());
        }

        let Some(key) = &request.key else {
            let target = immutable_target(&request.value);
            self.entries.insert(
                target,
                StoredValue {
                    value: request.value.clone(),
                    key: None,
                    salt: None,
                    sig: None,
                    seq: None,
                    refreshed: SystemTime::now(),
                },
            );
            return Ok(target);
        };

        let salt = non_empty(request.salt.as_deref());
        if salt.is_some_and(|s| s.len() > MAX_SALT_SIZE) {
            return Err(ProtocolError::salt_too_big());
        }

        let seq = request
            .seq
            .ok_or_else(|| ProtocolError::protocol("missing seq"))?;
        let sig = request
            .sig
            .as_ref()
            .ok_or_else(ProtocolError::invalid_signature)?;
        verify_signature(key, salt, seq, &request.value, sig)?;

        let target = mutable_target(key, salt);

        if self.entries.get(&target).is_some_and(StoredValue::is_stale) {
            self.entries.remove(&target);
        }

        if let Some(existing) = self.entries.get(&target) {
            let current = existing.seq.unwrap_or(0);
            if seq < current {
                return Err(ProtocolError::sequence_too_low());
            }
            if request.cas.is_some_and(|cas| cas != current) {
                return Err(ProtocolError::cas_mismatch());
            }
        }

        self.entries.insert(
            target,
            StoredValue {
                value: request.value.clone(),
                key: Some(key.clone()),
                salt: salt.map(Bytes::copy_from_slice),
                sig: Some(sig.clone()),
                seq: Some(seq),
                refreshed: SystemTime::now(),
            },
        );
        debug!("stored mutable item {} seq {}", target, seq);
        Ok(target)
    }

    /// Returns a live item, dropping it if it has gone stale.
    pub fn find(&mut self, target: &NodeId) -> Option<&StoredValue> {
        if self.entries.get(target).is_some_and(StoredValue::is_stale) {
            self.entries.remove(target);
        }
        self.entries.get(target)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, target: &NodeId, age: std::time::Duration) {
        if let Some(item) = self.entries.get_mut(target) {
            item.refreshed -= age;
        }
    }

    pub fn purge_stale(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_stale());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers an immutable item this node will publish.
    pub fn make_immutable(&mut self, value: Value) -> StoredValue {
        let item = StoredValue {
            value,
            key: None,
            salt: None,
            sig: None,
            seq: None,
            refreshed: SystemTime::now(),
        };
        self.announced.insert(item.target(), item.clone());
        item
    }

    /// Signs and registers a mutable item under this node's key.
    ///
    /// The sequence number continues from the last value published under
    /// the same salt.
    pub fn make_mutable(&mut self, salt: Option<Bytes>, value: Value) -> StoredValue {
        let salt = salt.filter(|s| !s.is_empty());
        let key = self.public_key();
        let target = mutable_target(&key, salt.as_deref());

        let seq = self
            .announced
            .get(&target)
            .and_then(|prev| prev.seq)
            .map_or(1, |prev| prev + 1);

        let payload = signature_payload(salt.as_deref(), seq, &value);
        let sig = self.signing_key.sign(&payload);

        let item = StoredValue {
            value,
            key: Some(Bytes::copy_from_slice(&key)),
            salt,
            sig: Some(Bytes::copy_from_slice(&sig.to_bytes())),
            seq: Some(seq),
            refreshed: SystemTime::now(),
        };
        self.announced.insert(target, item.clone());
        item
    }

    pub fn announced(&self) -> impl Iterator<Item = &StoredValue> {
        self.announced.values()
    }

    pub fn remove_announced(&mut self, target: &NodeId) -> Option<StoredValue> {
        self.announced.remove(target)
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}
