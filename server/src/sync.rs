//! Session synchronisation: join admission, leave propagation and eviction
//!
//! Every procedure here runs with the `membership` lock held, so at most one
//! roster change is being propagated at a time. Waiting on reliable units
//! never holds the roster lock.

use crate::network::Server;
use crate::roster::{Admission, Peer};
use log::{debug, info, warn};
use shared::packet::validate_identity;
use shared::{Inbound, Outcome, PacketKind, ReliablePacket, SessionEvents, Transport};
use std::net::SocketAddr;
use std::sync::Arc;

/// Reliable units sent as one batch, plus the targets that could not even
/// be sent to
struct FanOut {
    units: Vec<Arc<ReliablePacket>>,
    unsent: Vec<SocketAddr>,
}

impl FanOut {
    /// Waits for every unit and returns the targets that never acknowledged.
    async fn unresponsive(self) -> Vec<SocketAddr> {
        let mut failed = self.unsent;
        for unit in self.units {
            if unit.wait_until_final().await == Outcome::Dead {
                failed.push(unit.target());
            }
        }
        failed
    }
}

impl<T: Transport, E: SessionEvents> Server<T, E> {
    async fn send_all(&self, kind: PacketKind, messages: Vec<(String, SocketAddr)>) -> FanOut {
        let mut fan_out = FanOut {
            units: Vec::with_capacity(messages.len()),
            unsent: Vec::new(),
        };

        for (payload, target) in messages {
            match self.endpoint.send_reliable(kind, payload, target).await {
                Ok(unit) => fan_out.units.push(unit),
                Err(e) => {
                    warn!("Failed to send {:?} to {}: {}", kind, target, e);
                    fan_out.unsent.push(target);
                }
            }
        }
        fan_out
    }

    /// Admits a newcomer
    ///
    /// The newcomer first receives the whole roster (existing peers plus the
    /// host). Only if it acknowledges all of it is it registered, and the
    /// existing peers are told about it. Peers that fail to acknowledge the
    /// announcement are evicted.
    pub(crate) async fn handle_join(&self, inbound: Inbound) {
        let identity = inbound.packet.payload.clone();
        let from = inbound.from;

        if validate_identity(&identity).is_err() || identity == self.identity {
            info!("Refusing join from {}: identity {:?} not allowed", from, identity);
            self.endpoint.refuse(&inbound).await;
            return;
        }

        let admission = self.roster.write().await.begin_join(&identity, from);
        match admission {
            Admission::Admit => {}
            Admission::AlreadyPresent => {
                debug!("Re-acknowledging join from {}", from);
                self.endpoint.acknowledge(&inbound).await;
                return;
            }
            Admission::Full => {
                info!("Refusing join of {} from {}: session is full", identity, from);
                self.endpoint.refuse(&inbound).await;
                return;
            }
            Admission::IdentityTaken => {
                info!("Refusing join from {}: {} is already taken", from, identity);
                self.endpoint.refuse(&inbound).await;
                return;
            }
        }

        // Duplicates were already answered by `begin_join`.
        let _ = self.endpoint.accept(&inbound).await;
        let _membership = self.membership.lock().await;
        let existing = self.roster.read().await.peers();

        let roster = existing
            .iter()
            .map(|peer| peer.identity.clone())
            .chain(std::iter::once(self.identity.clone()))
            .map(|name| (name, from))
            .collect();
        let unreached = self.send_all(PacketKind::Join, roster).await.unresponsive().await;
        if !unreached.is_empty() {
            warn!("{} at {} did not acknowledge the roster; not admitted", identity, from);
            self.roster.write().await.abandon_join(from);
            self.events.on_notice(&format!("{} failed to join", identity));
            return;
        }

        let announcements = existing
            .iter()
            .map(|peer| (identity.clone(), peer.addr))
            .collect();
        let announced = self.send_all(PacketKind::Join, announcements).await;

        // The newcomer already has the roster, so it is admitted before the
        // announcements are known to have landed.
        if self.roster.write().await.finish_join(from).is_none() {
            return;
        }
        info!("{} joined from {}", identity, from);
        self.events.on_join(&identity);

        for addr in announced.unresponsive().await {
            self.evict(addr).await;
        }
    }

    /// Removes a departing peer and tells everyone else
    ///
    /// `identity` must belong to `sender`; a peer cannot log somebody else out.
    pub(crate) async fn handle_leave(&self, sender: &Peer, identity: &str) {
        let _membership = self.membership.lock().await;

        let departed = {
            let mut roster = self.roster.write().await;
            let owner = roster.find_by_identity(identity).map(|peer| peer.addr);
            match owner {
                Some(addr) if addr != sender.addr => {
                    warn!(
                        "Protocol violation: {} at {} tried to remove {}",
                        sender.identity, sender.addr, identity
                    );
                    None
                }
                Some(_) => roster.remove_by_identity(identity),
                None => None,
            }
        };
        let Some(departed) = departed else {
            debug!("Leave for {} matches no peer", identity);
            return;
        };

        info!("{} left the session", departed.identity);
        self.events.on_leave(&departed.identity);

        let remaining = self.roster.read().await.addrs();
        let notices = remaining
            .into_iter()
            .map(|addr| (departed.identity.clone(), addr))
            .collect();
        for addr in self.send_all(PacketKind::Leave, notices).await.unresponsive().await {
            self.evict(addr).await;
        }
    }

    /// Drops an unresponsive peer
    ///
    /// The evicted peer and the remaining peers are told on a best-effort
    /// basis. Nothing here is awaited, so an eviction never cascades.
    pub(crate) async fn evict(&self, addr: SocketAddr) {
        let removed = self.roster.write().await.remove_by_addr(addr);
        let Some(peer) = removed else {
            return;
        };

        warn!("Evicting unresponsive peer {} at {}", peer.identity, peer.addr);
        self.events.on_leave(&peer.identity);
        self.events
            .on_notice(&format!("{} was removed due to lag", peer.identity));

        if let Err(e) = self
            .endpoint
            .send_reliable(PacketKind::SessionEnd, "removed due to lag", peer.addr)
            .await
        {
            debug!("Could not notify {} of eviction: {}", peer.identity, e);
        }

        let remaining = self.roster.read().await.addrs();
        for other in remaining {
            if let Err(e) = self
                .endpoint
                .send_reliable(PacketKind::Leave, peer.identity.clone(), other)
                .await
            {
                debug!("Could not tell {} about eviction of {}: {}", other, peer.identity, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::network::Server;
    use shared::packet::Acknowledgment;
    use shared::sim::{SimNetwork, SimSocket};
    use shared::{
        EventLog, Inbound, Packet, PacketKind, ProtocolConfig, SessionEvent, Transport,
        MAX_DATAGRAM_SIZE,
    };
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, timeout};
    use tokio_test::assert_ok;

    const SERVER: &str = "10.0.0.1:4848";
    const ALICE: &str = "10.0.0.2:5000";
    const BOB: &str = "10.0.0.3:5000";
    const CAROL: &str = "10.0.0.4:5000";

    fn addr(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    async fn start_server(
        net: &Arc<SimNetwork>,
        max_peers: usize,
    ) -> (Arc<Server<SimSocket, EventLog>>, Arc<EventLog>) {
        let config = ProtocolConfig {
            retry_timeout_ms: 40,
            max_attempts: 3,
            max_peers,
            ..ProtocolConfig::default()
        };
        let socket = net.bind(addr(SERVER)).await.unwrap();
        let events = Arc::new(EventLog::new());
        let server = Server::with_transport(socket, config, "host", Arc::clone(&events)).unwrap();
        server.start();
        (server, events)
    }

    /// A scripted peer that acknowledges every sequenced packet and records
    /// what it received.
    struct ScriptedPeer {
        socket: Arc<SimSocket>,
        received: Arc<Mutex<Vec<Packet>>>,
    }

    impl ScriptedPeer {
        async fn join(net: &Arc<SimNetwork>, at: &str, identity: &str) -> Self {
            let socket = Arc::new(net.bind(addr(at)).await.unwrap());
            let received = Arc::new(Mutex::new(Vec::new()));

            let reader = Arc::clone(&socket);
            let log = Arc::clone(&received);
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                while let Ok((len, from)) = reader.recv_from(&mut buf).await {
                    let inbound = Inbound::new(&buf[..len], from);
                    if inbound.packet.kind.is_sequenced() {
                        let ack = Acknowledgment::for_frame(&inbound.packet, &inbound.raw)
                            .to_packet(PacketKind::Ack);
                        let _ = reader.send_to(&ack.encode(), from).await;
                    }
                    log.lock().await.push(inbound.packet);
                }
            });

            let peer = Self { socket, received };
            peer.send(Packet::new(PacketKind::Join, identity).with_sequence(0)).await;
            peer
        }

        async fn send(&self, packet: Packet) {
            assert_ok!(self.socket.send_to(&packet.encode(), addr(SERVER)).await);
        }

        async fn received(&self) -> Vec<Packet> {
            self.received.lock().await.clone()
        }
    }

    async fn wait_for_roster(server: &Server<SimSocket, EventLog>, expected: &[&str]) {
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        let result = timeout(Duration::from_secs(3), async {
            loop {
                let mut names: Vec<String> =
                    server.list_peers().await.into_iter().map(|p| p.identity).collect();
                names.sort();
                if names == expected {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "roster never became {:?}", expected);
    }

    fn joins(packets: &[Packet]) -> Vec<String> {
        packets
            .iter()
            .filter(|p| p.kind == PacketKind::Join)
            .map(|p| p.payload.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_join_exchanges_roster() {
        let net = SimNetwork::new();
        let (server, events) = start_server(&net, 4).await;

        let alice = ScriptedPeer::join(&net, ALICE, "alice").await;
        wait_for_roster(&server, &["alice"]).await;
        let bob = ScriptedPeer::join(&net, BOB, "bob").await;
        wait_for_roster(&server, &["alice", "bob"]).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(joins(&alice.received().await), vec!["host", "bob"]);
        let mut bob_saw = joins(&bob.received().await);
        bob_saw.sort();
        assert_eq!(bob_saw, vec!["alice", "host"]);
        assert!(events.contains(&SessionEvent::Joined("bob".to_string())));
    }

    #[tokio::test]
    async fn test_newcomer_that_never_acknowledges_is_not_admitted() {
        let net = SimNetwork::new();
        let (server, events) = start_server(&net, 4).await;

        let socket = net.bind(addr(ALICE)).await.unwrap();
        let frame = Packet::new(PacketKind::Join, "alice").with_sequence(0).encode();
        assert_ok!(socket.send_to(&frame, addr(SERVER)).await);
        // Never answer the roster Join.

        let failed = SessionEvent::Notice("alice failed to join".to_string());
        timeout(Duration::from_secs(2), async {
            while !events.contains(&failed) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(server.list_peers().await.is_empty());
        assert!(!events.contains(&SessionEvent::Joined("alice".to_string())));
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_evicted_on_join() {
        let net = SimNetwork::new();
        let (server, events) = start_server(&net, 4).await;

        let alice = ScriptedPeer::join(&net, ALICE, "alice").await;
        wait_for_roster(&server, &["alice"]).await;
        let _bob = ScriptedPeer::join(&net, BOB, "bob").await;
        wait_for_roster(&server, &["alice", "bob"]).await;

        net.silence(addr(BOB)).await;
        let _carol = ScriptedPeer::join(&net, CAROL, "carol").await;
        wait_for_roster(&server, &["alice", "carol"]).await;

        assert!(events.contains(&SessionEvent::Left("bob".to_string())));
        assert!(events.contains(&SessionEvent::Notice("bob was removed due to lag".to_string())));

        sleep(Duration::from_millis(50)).await;
        assert!(alice
            .received()
            .await
            .iter()
            .any(|p| p.kind == PacketKind::Leave && p.payload == "bob"));
    }

    #[tokio::test]
    async fn test_leave_is_propagated() {
        let net = SimNetwork::new();
        let (server, events) = start_server(&net, 4).await;

        let alice = ScriptedPeer::join(&net, ALICE, "alice").await;
        wait_for_roster(&server, &["alice"]).await;
        let bob = ScriptedPeer::join(&net, BOB, "bob").await;
        wait_for_roster(&server, &["alice", "bob"]).await;

        bob.send(Packet::new(PacketKind::Leave, "bob").with_sequence(1)).await;
        wait_for_roster(&server, &["alice"]).await;
        assert!(events.contains(&SessionEvent::Left("bob".to_string())));

        sleep(Duration::from_millis(50)).await;
        assert!(alice
            .received()
            .await
            .iter()
            .any(|p| p.kind == PacketKind::Leave && p.payload == "bob"));
        assert!(bob.received().await.iter().any(|p| p.kind == PacketKind::Ack));
    }

    #[tokio::test]
    async fn test_leave_for_someone_else_is_ignored() {
        let net = SimNetwork::new();
        let (server, events) = start_server(&net, 4).await;

        let _alice = ScriptedPeer::join(&net, ALICE, "alice").await;
        wait_for_roster(&server, &["alice"]).await;
        let bob = ScriptedPeer::join(&net, BOB, "bob").await;
        wait_for_roster(&server, &["alice", "bob"]).await;

        bob.send(Packet::new(PacketKind::Leave, "alice").with_sequence(1)).await;
        sleep(Duration::from_millis(50)).await;
        wait_for_roster(&server, &["alice", "bob"]).await;
        assert!(!events.contains(&SessionEvent::Left("alice".to_string())));
    }

    #[tokio::test]
    async fn test_full_session_refuses_join() {
        let net = SimNetwork::new();
        let (server, _events) = start_server(&net, 1).await;

        let _alice = ScriptedPeer::join(&net, ALICE, "alice").await;
        wait_for_roster(&server, &["alice"]).await;

        let bob = ScriptedPeer::join(&net, BOB, "bob").await;
        sleep(Duration::from_millis(100)).await;
        assert!(bob.received().await.iter().any(|p| p.kind == PacketKind::NegAck));
        wait_for_roster(&server, &["alice"]).await;
    }
}
