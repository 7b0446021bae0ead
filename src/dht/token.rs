use std::net::SocketAddr;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::constants::TOKEN_SECRET_LEN;

type Secret = [u8; TOKEN_SECRET_LEN];

/// Issues and checks the write tokens handed out in `get_peers` and `get`
/// replies.
///
/// A token is `SHA-1(ip || secret)`. Tokens minted under the previous secret
/// stay valid, so a token lives between one and two rotation periods.
pub struct TokenManager {
    current: Secret,
    previous: Secret,
}

impl TokenManager {
    pub fn new() -> Self {
        let current = rand::random();
        Self {
            current,
            previous: current,
        }
    }

    pub fn create_token(&self, addr: &SocketAddr) -> Bytes {
        token_with_secret(addr, &self.current)
    }

    pub fn validate_token(&self, token: &[u8], addr: &SocketAddr) -> bool {
        token == token_with_secret(addr, &self.current).as_ref()
            || token == token_with_secret(addr, &self.previous).as_ref()
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        debug!("DHT token secret rotated");
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn token_with_secret(addr: &SocketAddr, secret: &Secret) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(addr.ip().to_string().as_bytes());
    hasher.update(secret);
    Bytes::copy_from_slice(&hasher.finalize())
}
