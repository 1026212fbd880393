//! Stateless cookie engine
//!
//! A responder never stores per-peer state for inbound traffic: the cookie it
//! expects from a peer is recomputed on demand from a local secret and the
//! peer's address.
//!
//! Cookie = HMAC-SHA256_k( "ipcookie:v1" || peer_address[16] ), truncated to 96 bits
//!
//! Two generations of `k` are kept. After a rotation the previous secret still
//! verifies, so a cookie handed out just before the rotation stays valid for
//! one more full rotation period.

use crate::secret::SecretKey;
use hmac::{Hmac, Mac};
use ipcookie_common::{Cookie, COOKIE_LEN};
use sha2::Sha256;
use std::net::Ipv6Addr;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Domain separation tag mixed into every cookie
const COOKIE_DOMAIN_TAG: &[u8] = b"ipcookie:v1";

/// Which secret generation a candidate cookie matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Current,
    Previous,
    Invalid,
}

impl Verification {
    pub fn is_valid(self) -> bool {
        !matches!(self, Verification::Invalid)
    }
}

/// Compute the cookie for `peer` under `secret`
pub fn compute(secret: &SecretKey, peer: &Ipv6Addr) -> Cookie {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.expose_secret())
        .expect("HMAC accepts keys of any length");
    mac.update(COOKIE_DOMAIN_TAG);
    mac.update(&peer.octets());
    let digest = mac.finalize().into_bytes();

    let mut raw = [0u8; COOKIE_LEN];
    raw.copy_from_slice(&digest[..COOKIE_LEN]);
    Cookie::new(raw)
}

/// CURRENT/PREVIOUS secret pair
#[derive(Debug, Clone)]
pub struct StatelessEngine {
    current_secret: SecretKey,
    previous_secret: SecretKey,
    rotation_epoch: u64,
}

impl StatelessEngine {
    /// Create an engine with two independent random secrets
    pub fn new() -> Self {
        let current_secret = SecretKey::random();
        let previous_secret = fresh_secret_unlike(&current_secret);
        Self {
            current_secret,
            previous_secret,
            rotation_epoch: 0,
        }
    }

    /// Create an engine from known secrets
    ///
    /// Returns `None` if both secrets are identical.
    pub fn with_secrets(current_secret: SecretKey, previous_secret: SecretKey) -> Option<Self> {
        if current_secret.same_key(&previous_secret) {
            return None;
        }
        Some(Self {
            current_secret,
            previous_secret,
            rotation_epoch: 0,
        })
    }

    /// Cookie we currently expect from `peer`
    pub fn current_cookie(&self, peer: &Ipv6Addr) -> Cookie {
        compute(&self.current_secret, peer)
    }

    /// Match a candidate against CURRENT first, then PREVIOUS
    pub fn check(&self, candidate: &Cookie, peer: &Ipv6Addr) -> Verification {
        if compute(&self.current_secret, peer).ct_eq(candidate) {
            Verification::Current
        } else if compute(&self.previous_secret, peer).ct_eq(candidate) {
            Verification::Previous
        } else {
            Verification::Invalid
        }
    }

    pub fn verify(&self, candidate: &Cookie, peer: &Ipv6Addr) -> bool {
        self.check(candidate, peer).is_valid()
    }

    /// Invalidate PREVIOUS, move CURRENT to PREVIOUS and draw a new CURRENT
    pub fn rotate(&mut self) {
        let next = fresh_secret_unlike(&self.current_secret);
        self.previous_secret = std::mem::replace(&mut self.current_secret, next);
        self.rotation_epoch += 1;

        info!(epoch = self.rotation_epoch, "Rotated stateless cookie secret");
    }

    pub fn rotation_epoch(&self) -> u64 {
        self.rotation_epoch
    }
}

impl Default for StatelessEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_secret_unlike(other: &SecretKey) -> SecretKey {
    loop {
        let candidate = SecretKey::random();
        if !candidate.same_key(other) {
            return candidate;
        }
        debug!("Random secret collided with the outgoing one, drawing again");
    }
}
