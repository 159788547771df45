//! Server network layer: inbound routing, fan-out and shutdown

use crate::roster::{Peer, Roster};
use log::{debug, error, info, warn};
use shared::packet::{chat_payload, parse_chat};
use shared::{
    Dispatch, Endpoint, Inbound, Outcome, Packet, PacketKind, ProtocolConfig, ProtocolError,
    SessionEvents, Transport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// The authoritative side of a session
///
/// Owns the roster and drives join, leave and eviction. Inbound datagrams are
/// routed by [`Dispatch::dispatch`], one task per datagram.
pub struct Server<T: Transport, E: SessionEvents> {
    pub(crate) endpoint: Arc<Endpoint<T>>,
    /// The server's own player identity, announced to every newcomer
    pub(crate) identity: String,
    pub(crate) events: Arc<E>,
    pub(crate) roster: RwLock<Roster>,
    /// Serialises membership changes. Lock order: membership, roster, pending.
    pub(crate) membership: Mutex<()>,
}

impl<E: SessionEvents> Server<UdpSocket, E> {
    /// Binds a UDP socket on `host` and the configured server port
    pub async fn bind(
        host: &str,
        config: ProtocolConfig,
        identity: impl Into<String>,
        events: Arc<E>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let addr = format!("{}:{}", host, config.server_port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ProtocolError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("Server listening on {}", addr);

        Self::with_transport(socket, config, identity, events)
    }
}

impl<T: Transport, E: SessionEvents> Server<T, E> {
    pub fn with_transport(
        transport: T,
        config: ProtocolConfig,
        identity: impl Into<String>,
        events: Arc<E>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let identity = identity.into();
        shared::packet::validate_identity(&identity)?;
        let roster = Roster::new(config.max_peers);

        Ok(Arc::new(Self {
            endpoint: Endpoint::new(transport, config)?,
            identity,
            events,
            roster: RwLock::new(roster),
            membership: Mutex::new(()),
        }))
    }

    /// Starts the receive loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.endpoint.spawn_receiver(Arc::clone(self))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &Arc<Endpoint<T>> {
        &self.endpoint
    }

    pub async fn list_peers(&self) -> Vec<Peer> {
        self.roster.read().await.peers()
    }

    /// Sends `packet` unreliably to every peer
    ///
    /// A failure for one peer is logged and does not affect the others.
    pub async fn broadcast(&self, packet: &Packet) {
        self.broadcast_except(packet, None).await;
    }

    async fn broadcast_except(&self, packet: &Packet, exclude: Option<SocketAddr>) {
        let addrs = self.roster.read().await.addrs();

        for addr in addrs {
            if Some(addr) == exclude {
                continue;
            }
            if let Err(e) = self.endpoint.send_packet(packet, addr).await {
                error!("Failed to send {} to {}: {}", packet, addr, e);
            }
        }
    }

    /// Sends an application event to one peer, or to every peer
    ///
    /// Sequenced kinds go out as reliable units (not awaited); StateUpdate
    /// goes out as a plain packet. When fanning out, every peer is attempted
    /// and the last failure is returned.
    pub async fn send_event(
        &self,
        kind: PacketKind,
        payload: impl Into<String>,
        destination: Option<SocketAddr>,
    ) -> Result<(), ProtocolError> {
        if !kind.is_application_event() {
            return Err(ProtocolError::NotAnApplicationEvent(kind));
        }
        let payload = payload.into();
        let targets = match destination {
            Some(addr) => vec![addr],
            None => self.roster.read().await.addrs(),
        };

        let mut result = Ok(());
        for target in targets {
            let sent = if kind.is_sequenced() {
                self.endpoint
                    .send_reliable(kind, payload.clone(), target)
                    .await
                    .map(|_| ())
            } else {
                self.endpoint
                    .send_packet(&Packet::new(kind, payload.clone()), target)
                    .await
            };
            if let Err(e) = sent {
                warn!("Failed to send {:?} event to {}: {}", kind, target, e);
                result = Err(e);
            }
        }
        result
    }

    /// Ends the session for every peer and stops the endpoint
    ///
    /// Each peer gets a reliable SessionEnd. Stragglers are bounded by the
    /// retry budget, so this never blocks indefinitely.
    pub async fn shutdown(&self) {
        let _membership = self.membership.lock().await;
        let peers = self.roster.write().await.clear();

        if !peers.is_empty() {
            info!("Ending session for {} peers", peers.len());
            let mut units = Vec::with_capacity(peers.len());
            for peer in &peers {
                match self
                    .endpoint
                    .send_reliable(PacketKind::SessionEnd, "server shutting down", peer.addr)
                    .await
                {
                    Ok(unit) => units.push((peer, unit)),
                    Err(e) => warn!("Failed to send SessionEnd to {}: {}", peer.identity, e),
                }
            }
            for (peer, unit) in units {
                if unit.wait_until_final().await == Outcome::Dead {
                    warn!("{} did not acknowledge the end of the session", peer.identity);
                }
            }
        }

        self.events.on_session_end();
        self.endpoint.stop();
    }

    async fn handle_chat(&self, sender: &Peer, inbound: &Inbound) {
        let Some((_, message)) = parse_chat(&inbound.packet.payload) else {
            warn!("Malformed chat from {}: {}", sender.identity, inbound.packet);
            return;
        };

        // The roster identity wins over whatever name the sender claimed.
        self.events.on_chat(&sender.identity, message);
        match chat_payload(&sender.identity, message) {
            Ok(payload) => {
                let forward = self.endpoint.stamp(PacketKind::Chat, payload);
                self.broadcast_except(&forward, Some(sender.addr)).await;
            }
            Err(e) => warn!("Not forwarding chat from {}: {}", sender.identity, e),
        }
    }
}

impl<T: Transport, E: SessionEvents> Dispatch for Server<T, E> {
    async fn dispatch(self: Arc<Self>, inbound: Inbound) {
        match inbound.packet.kind {
            PacketKind::Invalid => {
                debug!("Dropping malformed datagram from {}: {}", inbound.from, inbound.packet);
                return;
            }
            // Resolved by the receive loop.
            PacketKind::Ack | PacketKind::NegAck => return,
            PacketKind::Join => {
                self.handle_join(inbound).await;
                return;
            }
            _ => {}
        }

        let sender = self.roster.read().await.find_by_addr(inbound.from).cloned();
        let Some(sender) = sender else {
            if inbound.packet.kind == PacketKind::Leave {
                // A retransmitted Leave after the peer was already removed.
                self.endpoint.acknowledge(&inbound).await;
                debug!("Re-acknowledged Leave from departed {}", inbound.from);
            } else {
                warn!(
                    "Ignoring {} from unregistered sender {}",
                    inbound.packet, inbound.from
                );
            }
            return;
        };

        match inbound.packet.kind {
            PacketKind::Leave => {
                if self.endpoint.accept(&inbound).await {
                    self.handle_leave(&sender, &inbound.packet.payload).await;
                }
            }
            PacketKind::Chat => {
                if self.endpoint.accept(&inbound).await {
                    self.handle_chat(&sender, &inbound).await;
                }
            }
            PacketKind::SessionEnd => {
                if self.endpoint.accept(&inbound).await {
                    warn!("{} sent SessionEnd to the server; ignoring", sender.identity);
                }
            }
            PacketKind::StateUpdate => {
                debug!("Dropping {} from {}", inbound.packet, sender.identity);
            }
            PacketKind::Spawn | PacketKind::Remove => {
                if self.endpoint.accept(&inbound).await {
                    debug!("Dropping {} from {}", inbound.packet, sender.identity);
                }
            }
            PacketKind::Invalid | PacketKind::Ack | PacketKind::NegAck | PacketKind::Join => {}
        }
    }

    fn transport_failed(&self, error: &ProtocolError) {
        error!("Server transport failed: {}", error);
        self.events.on_notice(&format!("network failure: {}", error));
        self.events.on_session_end();
    }
}
