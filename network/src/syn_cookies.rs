//! SYN-cookie handshake gating.
//!
//! On first contact from an endpoint we issue a random 256-bit cookie. The
//! peer must return the cookie signed under its node id before it is
//! admitted to the peer directory, binding the identity to the endpoint.
//! Issuance is capped per IP so an attacker cannot fill the store, and
//! cookies expire quickly.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use lattice_crypto::verify_signature;
use lattice_types::{Account, PublicKey, Signature, Timestamp};

/// Cookies are discarded this many seconds after issuance.
pub const SYN_COOKIE_CUTOFF_SECS: u64 = 5;
/// Maximum outstanding cookies per IP address.
pub const MAX_COOKIES_PER_IP: usize = 4;

struct CookieInfo {
    cookie: [u8; 32],
    created_at: Timestamp,
}

/// Outstanding cookie challenges, keyed by endpoint with a per-IP counter.
/// Guarded by its own mutex in the node, separate from the peer directory.
#[derive(Default)]
pub struct SynCookies {
    cookies: HashMap<SocketAddr, CookieInfo>,
    per_ip: HashMap<IpAddr, usize>,
}

impl SynCookies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a cookie for `endpoint`, or `None` when one is already
    /// outstanding or the IP is at its cap.
    pub fn assign(&mut self, endpoint: SocketAddr, now: Timestamp) -> Option<[u8; 32]> {
        if self.cookies.contains_key(&endpoint) {
            return None;
        }
        let ip_count = self.per_ip.entry(endpoint.ip()).or_insert(0);
        if *ip_count >= MAX_COOKIES_PER_IP {
            return None;
        }

        let mut cookie = [0u8; 32];
        getrandom::getrandom(&mut cookie).ok()?;
        *ip_count += 1;
        self.cookies.insert(
            endpoint,
            CookieInfo {
                cookie,
                created_at: now,
            },
        );
        Some(cookie)
    }

    /// Validate a handshake response: the cookie issued to `endpoint` signed
    /// under `node_id`. Consumes the cookie on success.
    pub fn validate(
        &mut self,
        endpoint: SocketAddr,
        node_id: &Account,
        signature: &Signature,
    ) -> bool {
        let Some(info) = self.cookies.get(&endpoint) else {
            return false;
        };
        let valid = verify_signature(&info.cookie, signature, &PublicKey::from(*node_id));
        if valid {
            self.remove(&endpoint);
        }
        valid
    }

    fn remove(&mut self, endpoint: &SocketAddr) {
        if self.cookies.remove(endpoint).is_some() {
            if let Some(count) = self.per_ip.get_mut(&endpoint.ip()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.per_ip.remove(&endpoint.ip());
                }
            }
        }
    }

    /// Drop cookies older than the cutoff.
    pub fn purge(&mut self, now: Timestamp) {
        let stale: Vec<SocketAddr> = self
            .cookies
            .iter()
            .filter(|(_, info)| info.created_at.saturating_elapsed(now) > SYN_COOKIE_CUTOFF_SECS)
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in stale {
            self.remove(&endpoint);
        }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}
