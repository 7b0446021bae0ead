use std::fmt;
use std::str::FromStr;

use rand::Rng as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use super::error::DhtError;

const ID_LEN: usize = 20;

/// A 160-bit DHT identifier: node ids, info-hashes and BEP-44 targets.
///
/// Stored big-endian, so the derived `Ord` is unsigned magnitude order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; ID_LEN]);

    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    /// SHA-1 of the concatenated parts.
    pub fn sha1(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&hasher.finalize());
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeId(dist)
    }

    /// Returns a copy with bit `bit` set, counting from the most significant
    /// bit (bit 0) down to bit 159.
    pub fn with_bit(&self, bit: u32) -> NodeId {
        debug_assert!(bit < 160);
        let mut id = self.0;
        id[(bit / 8) as usize] |= 0x80 >> (bit % 8);
        NodeId(id)
    }

    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            zeros += byte.leading_zeros();
            if byte != 0 {
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Draws an identifier uniformly from `[min, max)`, where `max == None`
    /// is the exclusive end of the identifier space (2^160).
    ///
    /// Samples an offset below the span width and rejects values at or above
    /// the span, so at most half the draws are retried.
    pub fn random_in_range(min: &NodeId, max: Option<&NodeId>) -> NodeId {
        let span = match max {
            Some(max) => {
                debug_assert!(min < max, "empty identifier range");
                if min >= max {
                    return *min;
                }
                max.wrapping_sub(min)
            }
            None if min.is_zero() => return NodeId::generate(),
            None => NodeId::MIN.wrapping_sub(min),
        };

        let bits = 160 - span.leading_zeros();
        let mut rng = rand::rng();
        loop {
            let mut offset = [0u8; ID_LEN];
            rng.fill(&mut offset);
            mask_to_bits(&mut offset, bits);
            let offset = NodeId(offset);
            if offset < span {
                return min.wrapping_add(&offset);
            }
        }
    }

    fn wrapping_add(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        let mut carry = 0u16;
        for i in (0..ID_LEN).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        NodeId(out)
    }

    fn wrapping_sub(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        let mut borrow = 0i16;
        for i in (0..ID_LEN).rev() {
            let mut diff = self.0[i] as i16 - other.0[i] as i16 - borrow;
            borrow = 0;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            }
            out[i] = diff as u8;
        }
        NodeId(out)
    }
}

fn mask_to_bits(bytes: &mut [u8; ID_LEN], bits: u32) {
    let clear = 160 - bits;
    for (i, byte) in bytes.iter_mut().enumerate() {
        let start = i as u32 * 8;
        if start + 8 <= clear {
            *byte = 0;
        } else if start < clear {
            *byte &= 0xff >> (clear - start);
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for NodeId {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| DhtError::InvalidNodeId)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
