//! Authoritative roster of session participants
//!
//! This module tracks which peers the server has admitted, including:
//! - Admission control (capacity, identity uniqueness, duplicate joins)
//! - Joins in progress, which hold a slot while the roster is synchronised
//! - Lookup by address (to attribute inbound packets) and by identity
//!
//! The roster itself never talks to the network. The join and leave
//! procedures in `sync` drive it.

use log::info;
use std::net::SocketAddr;
use std::time::Instant;

/// A remote participant known to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Application-level identity taken from the Join payload
    pub identity: String,
    /// Network address the peer joined from
    pub addr: SocketAddr,
    /// When the peer was admitted
    pub joined_at: Instant,
}

impl Peer {
    pub fn new(identity: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            identity: identity.into(),
            addr,
            joined_at: Instant::now(),
        }
    }
}

/// Result of asking the roster to admit a newcomer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot has been reserved; the join may proceed
    Admit,
    /// The address is already admitted or mid-join (a retransmitted Join)
    AlreadyPresent,
    /// Admitted peers plus joins in progress have reached the capacity
    Full,
    IdentityTaken,
}

/// Manages admitted peers and joins in progress
///
/// Capacity counts both, so two simultaneous joins cannot overshoot the
/// limit while each waits for its roster synchronisation.
#[derive(Debug)]
pub struct Roster {
    /// Admitted peers in admission order
    peers: Vec<Peer>,
    /// Joins in progress: reserved slots not yet visible as peers
    joining: Vec<Peer>,
    /// Maximum number of concurrent peers allowed
    max_peers: usize,
}

impl Roster {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Vec::new(),
            joining: Vec::new(),
            max_peers,
        }
    }

    /// Checks a Join and, if acceptable, reserves a slot for it
    pub fn begin_join(&mut self, identity: &str, addr: SocketAddr) -> Admission {
        if self.find_by_addr(addr).is_some() || self.is_joining(addr) {
            return Admission::AlreadyPresent;
        }
        if self.find_by_identity(identity).is_some()
            || self.joining.iter().any(|peer| peer.identity == identity)
        {
            return Admission::IdentityTaken;
        }
        if self.peers.len() + self.joining.len() >= self.max_peers {
            return Admission::Full;
        }

        self.joining.push(Peer::new(identity, addr));
        Admission::Admit
    }

    /// Promotes a join in progress to an admitted peer
    pub fn finish_join(&mut self, addr: SocketAddr) -> Option<&Peer> {
        let index = self.joining.iter().position(|peer| peer.addr == addr)?;
        let mut peer = self.joining.remove(index);
        peer.joined_at = Instant::now();
        info!("Peer {} admitted from {}", peer.identity, peer.addr);
        self.peers.push(peer);
        self.peers.last()
    }

    /// Releases the slot of a join that failed
    pub fn abandon_join(&mut self, addr: SocketAddr) -> bool {
        let before = self.joining.len();
        self.joining.retain(|peer| peer.addr != addr);
        self.joining.len() != before
    }

    pub fn remove_by_addr(&mut self, addr: SocketAddr) -> Option<Peer> {
        let index = self.peers.iter().position(|peer| peer.addr == addr)?;
        let peer = self.peers.remove(index);
        info!("Peer {} removed", peer.identity);
        Some(peer)
    }

    pub fn remove_by_identity(&mut self, identity: &str) -> Option<Peer> {
        let index = self.peers.iter().position(|peer| peer.identity == identity)?;
        let peer = self.peers.remove(index);
        info!("Peer {} removed", peer.identity);
        Some(peer)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.addr == addr)
    }

    pub fn find_by_identity(&self, identity: &str) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.identity == identity)
    }

    pub fn is_joining(&self, addr: SocketAddr) -> bool {
        self.joining.iter().any(|peer| peer.addr == addr)
    }

    /// Snapshot of the admitted peers, used for fan-out
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|peer| peer.addr).collect()
    }

    /// Drops every peer and join in progress, returning the admitted peers
    pub fn clear(&mut self) -> Vec<Peer> {
        self.joining.clear();
        std::mem::take(&mut self.peers)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
