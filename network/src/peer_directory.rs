//! Peer registry.
//!
//! Tracks every peer endpoint we have heard from, when it was last contacted
//! and last attempted, its protocol version, its authenticated node id, and
//! (once the rep crawler has probed it) the representative account it
//! probably hosts and that account's weight. Entries expire after the
//! keepalive cutoff without contact.
//!
//! Peers that never completed the node-id handshake are "legacy" peers and
//! are admitted under tighter caps.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use lattice_types::{Account, Amount, Timestamp};
use rand::seq::SliceRandom;
use tracing::debug;

/// How often keepalives are sent.
pub const KEEPALIVE_PERIOD_SECS: u64 = 60;
/// Silence after which a peer is purged (five keepalive periods).
pub const KEEPALIVE_CUTOFF_SECS: u64 = KEEPALIVE_PERIOD_SECS * 5;
/// Maximum peers admitted per IP address (legacy included).
pub const MAX_PEERS_PER_IP: usize = 4;
/// Maximum legacy (no node id) peers per IP address.
pub const MAX_LEGACY_PEERS_PER_IP: usize = 2;
/// Maximum legacy peers overall.
pub const MAX_LEGACY_PEERS: usize = 250;
/// Peers probed per rep-crawl round.
pub const PEERS_PER_CRAWL: usize = 12;
/// Outbound reachout attempts are suppressed for this long per endpoint.
const ATTEMPT_SUPPRESS_SECS: u64 = 60;

/// Everything known about one peer endpoint.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub endpoint: SocketAddr,
    pub last_contact: Timestamp,
    pub last_attempt: Timestamp,
    pub last_rep_request: Timestamp,
    pub last_rep_response: Timestamp,
    /// Weight of the representative this peer probably hosts.
    pub rep_weight: Amount,
    pub probable_rep_account: Option<Account>,
    pub network_version: u8,
    /// Authenticated identity; `None` for legacy peers.
    pub node_id: Option<Account>,
}

/// Registry of known peers, keyed by endpoint with auxiliary views by
/// staleness, weight, and IP kept consistent under the owner's lock.
pub struct PeerDirectory {
    peers: HashMap<SocketAddr, PeerInfo>,
    /// Recent outbound attempts, for reachout dedup.
    attempts: HashMap<SocketAddr, Timestamp>,
    legacy_peers: usize,
    self_endpoint: SocketAddr,
}

impl PeerDirectory {
    pub fn new(self_endpoint: SocketAddr) -> Self {
        Self {
            peers: HashMap::new(),
            attempts: HashMap::new(),
            legacy_peers: 0,
            self_endpoint,
        }
    }

    /// Endpoints we refuse to track: ourselves, the unspecified address,
    /// and port zero.
    pub fn not_a_peer(&self, endpoint: &SocketAddr) -> bool {
        endpoint.port() == 0
            || endpoint.ip().is_unspecified()
            || *endpoint == self.self_endpoint
    }

    pub fn known_peer(&self, endpoint: &SocketAddr) -> bool {
        self.peers.contains_key(endpoint)
    }

    /// We were contacted by `endpoint`. Refreshes the entry if known.
    /// Returns `true` when a node-id handshake should begin (new endpoint).
    pub fn contacted(&mut self, endpoint: SocketAddr, version: u8, now: Timestamp) -> bool {
        if self.not_a_peer(&endpoint) {
            return false;
        }
        match self.peers.get_mut(&endpoint) {
            Some(info) => {
                info.last_contact = now;
                info.network_version = version;
                false
            }
            None => true,
        }
    }

    fn ip_count(&self, ip: &IpAddr, legacy_only: bool) -> usize {
        self.peers
            .values()
            .filter(|info| info.endpoint.ip() == *ip)
            .filter(|info| !legacy_only || info.node_id.is_none())
            .count()
    }

    /// Admit a peer after (or without) handshake. `node_id == None` marks a
    /// legacy peer. Returns `true` when the peer was already known.
    pub fn insert(
        &mut self,
        endpoint: SocketAddr,
        version: u8,
        node_id: Option<Account>,
        now: Timestamp,
    ) -> bool {
        if self.not_a_peer(&endpoint) {
            return false;
        }
        if let Some(info) = self.peers.get_mut(&endpoint) {
            info.last_contact = now;
            info.network_version = version;
            if info.node_id.is_none() {
                if let Some(id) = node_id {
                    info.node_id = Some(id);
                    self.legacy_peers = self.legacy_peers.saturating_sub(1);
                }
            }
            return true;
        }

        let ip = endpoint.ip();
        if self.ip_count(&ip, false) >= MAX_PEERS_PER_IP {
            debug!(%endpoint, "peer rejected: per-ip cap");
            return false;
        }
        if node_id.is_none() {
            if self.legacy_peers >= MAX_LEGACY_PEERS
                || self.ip_count(&ip, true) >= MAX_LEGACY_PEERS_PER_IP
            {
                debug!(%endpoint, "legacy peer rejected: cap");
                return false;
            }
            self.legacy_peers += 1;
        }
        self.peers.insert(
            endpoint,
            PeerInfo {
                endpoint,
                last_contact: now,
                last_attempt: Timestamp::new(0),
                last_rep_request: Timestamp::new(0),
                last_rep_response: Timestamp::new(0),
                rep_weight: Amount::ZERO,
                probable_rep_account: None,
                network_version: version,
                node_id,
            },
        );
        false
    }

    /// The authenticated node id for an endpoint, if any.
    pub fn node_id(&self, endpoint: &SocketAddr) -> Option<Account> {
        self.peers.get(endpoint).and_then(|info| info.node_id)
    }

    /// Whether we should send an unsolicited keepalive to `endpoint`.
    /// Records the attempt so repeated reachouts are suppressed.
    pub fn reachout(&mut self, endpoint: SocketAddr, now: Timestamp) -> bool {
        if self.not_a_peer(&endpoint) || self.known_peer(&endpoint) {
            return false;
        }
        if let Some(last) = self.attempts.get(&endpoint) {
            if last.saturating_elapsed(now) < ATTEMPT_SUPPRESS_SECS {
                return false;
            }
        }
        self.attempts.insert(endpoint, now);
        true
    }

    /// Up to `count` random peer endpoints.
    pub fn random_set(&self, count: usize) -> Vec<SocketAddr> {
        let mut endpoints: Vec<SocketAddr> = self.peers.keys().copied().collect();
        endpoints.shuffle(&mut rand::thread_rng());
        endpoints.truncate(count);
        endpoints
    }

    /// Fill the eight keepalive slots with random peers.
    pub fn random_fill(&self, slots: &mut [Option<SocketAddr>; 8]) {
        let chosen = self.random_set(slots.len());
        for (slot, endpoint) in slots.iter_mut().zip(chosen.into_iter()) {
            *slot = Some(endpoint);
        }
    }

    /// Peers hosting representatives, heaviest first.
    pub fn representatives(&self, count: usize) -> Vec<PeerInfo> {
        let mut reps: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|info| info.probable_rep_account.is_some() && !info.rep_weight.is_zero())
            .cloned()
            .collect();
        reps.sort_by(|a, b| b.rep_weight.cmp(&a.rep_weight));
        reps.truncate(count);
        reps
    }

    /// Endpoints hosting a specific representative account.
    pub fn endpoints_for_rep(&self, account: &Account) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|info| info.probable_rep_account.as_ref() == Some(account))
            .map(|info| info.endpoint)
            .collect()
    }

    /// All peer endpoints.
    pub fn list(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    /// A random subset sized to the square-root fanout rule.
    pub fn list_fanout(&self) -> Vec<SocketAddr> {
        let fanout = ((self.peers.len() as f64).sqrt().ceil() as usize).max(1) * 2;
        self.random_set(fanout)
    }

    /// Peers to probe this rep-crawl round: least-recently-requested first.
    pub fn rep_crawl_targets(&mut self, now: Timestamp) -> Vec<SocketAddr> {
        let mut candidates: Vec<(&SocketAddr, &PeerInfo)> = self.peers.iter().collect();
        candidates.sort_by_key(|(_, info)| info.last_rep_request);
        let targets: Vec<SocketAddr> = candidates
            .into_iter()
            .take(PEERS_PER_CRAWL)
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in &targets {
            if let Some(info) = self.peers.get_mut(endpoint) {
                info.last_rep_request = now;
            }
        }
        targets
    }

    /// Record a vote that answered a rep-crawl probe. Returns `true` when
    /// the peer's probable representative was newly learned or changed.
    pub fn rep_response(
        &mut self,
        endpoint: SocketAddr,
        account: Account,
        weight: Amount,
        now: Timestamp,
    ) -> bool {
        let Some(info) = self.peers.get_mut(&endpoint) else {
            return false;
        };
        let changed = info.probable_rep_account != Some(account);
        info.probable_rep_account = Some(account);
        info.rep_weight = weight;
        info.last_rep_response = now;
        changed
    }

    /// Sum of the rep weight reachable through known peers.
    pub fn total_weight(&self) -> Amount {
        self.peers.values().map(|info| info.rep_weight).sum()
    }

    /// Remove peers silent past the cutoff. Returns the evicted entries.
    pub fn purge(&mut self, now: Timestamp) -> Vec<PeerInfo> {
        let cutoff = now.as_secs().saturating_sub(KEEPALIVE_CUTOFF_SECS);
        let stale: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|info| info.last_contact.as_secs() < cutoff)
            .map(|info| info.endpoint)
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for endpoint in stale {
            if let Some(info) = self.peers.remove(&endpoint) {
                if info.node_id.is_none() {
                    self.legacy_peers = self.legacy_peers.saturating_sub(1);
                }
                removed.push(info);
            }
        }
        self.attempts
            .retain(|_, attempted| attempted.as_secs() >= cutoff);
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
