//! Client network layer: login handshake, inbound routing and chat

use log::{debug, error, info, warn};
use shared::packet::{chat_payload, parse_chat, validate_identity};
use shared::{
    DeliveryState, Dispatch, Endpoint, Inbound, Outcome, Packet, PacketKind, ProtocolConfig,
    ProtocolError, ReliablePacket, SessionEvents, Transport,
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::net::UdpSocket;

/// One player's connection to a session server
///
/// Before login completes only the acknowledgment of the outstanding Join is
/// expected from the server; anything else fails the connection. After login
/// every packet kind is handled.
pub struct Client<T: Transport, E: SessionEvents> {
    endpoint: Arc<Endpoint<T>>,
    server_addr: SocketAddr,
    identity: String,
    events: Arc<E>,

    /// The login handshake; set once by `connect`
    join: OnceLock<Arc<ReliablePacket>>,
    /// The session is over (failed, ended by the server, or disconnected)
    finished: AtomicBool,

    /// Identities the server has announced, including the host
    remote_players: Mutex<BTreeSet<String>>,
}

impl<E: SessionEvents> Client<UdpSocket, E> {
    /// Binds an ephemeral UDP socket for talking to `server_addr`
    pub async fn bind(
        server_addr: SocketAddr,
        identity: impl Into<String>,
        config: ProtocolConfig,
        events: Arc<E>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let local = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| ProtocolError::Bind {
                addr: local.to_string(),
                source,
            })?;

        Self::with_transport(socket, server_addr, identity, config, events)
    }
}

impl<T: Transport, E: SessionEvents> Client<T, E> {
    pub fn with_transport(
        transport: T,
        server_addr: SocketAddr,
        identity: impl Into<String>,
        config: ProtocolConfig,
        events: Arc<E>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let identity = identity.into();
        validate_identity(&identity)?;

        Ok(Arc::new(Self {
            endpoint: Endpoint::new(transport, config)?,
            server_addr,
            identity,
            events,
            join: OnceLock::new(),
            finished: AtomicBool::new(false),
            remote_players: Mutex::new(BTreeSet::new()),
        }))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn endpoint(&self) -> &Arc<Endpoint<T>> {
        &self.endpoint
    }

    /// Starts listening and sends the Join
    ///
    /// Returns as soon as the Join is on the wire. Use
    /// [`Client::wait_for_login`] to learn whether the server admitted us.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ProtocolError> {
        let unit = self.endpoint.prepare_reliable(
            PacketKind::Join,
            self.identity.clone(),
            self.server_addr,
        )?;
        if self.join.set(Arc::clone(&unit)).is_err() {
            return Err(ProtocolError::AlreadyConnected);
        }

        info!("Connecting to {} as {}", self.server_addr, self.identity);
        self.endpoint.spawn_receiver(Arc::clone(self));
        if let Err(e) = self.endpoint.launch(&unit).await {
            unit.expire();
            return Err(e);
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            match unit.wait_until_final().await {
                Outcome::Acknowledged => {
                    info!("Logged in to {}", client.server_addr);
                    client
                        .events
                        .on_notice(&format!("connected to {}", client.server_addr));
                }
                Outcome::Dead => {
                    client.close(Some("failed to reach server"));
                }
            }
        });

        Ok(())
    }

    /// Waits until the server acknowledges or refuses the Join
    pub async fn wait_for_login(&self) -> Result<(), ProtocolError> {
        let unit = self.join.get().ok_or(ProtocolError::NotConnected)?;
        match unit.wait_until_final().await {
            Outcome::Acknowledged if !self.is_finished() => Ok(()),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.handshake_done() && !self.is_finished()
    }

    fn handshake_done(&self) -> bool {
        self.join
            .get()
            .map_or(false, |unit| unit.state() == DeliveryState::Acknowledged)
    }

    fn join_in_flight(&self) -> bool {
        self.join
            .get()
            .map_or(false, |unit| unit.state() == DeliveryState::InFlight)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Resolves once the session is over for any reason
    pub async fn closed(&self) {
        self.endpoint.stopped().await;
    }

    /// Remote players currently known, sorted by identity
    pub fn list_peers(&self) -> Vec<String> {
        self.players().iter().cloned().collect()
    }

    pub async fn send_chat(&self, message: &str) -> Result<Arc<ReliablePacket>, ProtocolError> {
        if !self.is_logged_in() {
            return Err(ProtocolError::NotConnected);
        }
        let payload = chat_payload(&self.identity, message)?;
        self.endpoint
            .send_reliable(PacketKind::Chat, payload, self.server_addr)
            .await
    }

    /// Sends an application event to the server
    ///
    /// Sequenced kinds are delivered reliably (not awaited), StateUpdate is
    /// sent as a plain packet.
    pub async fn send_event(
        &self,
        kind: PacketKind,
        payload: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        if !kind.is_application_event() {
            return Err(ProtocolError::NotAnApplicationEvent(kind));
        }
        if !self.is_logged_in() {
            return Err(ProtocolError::NotConnected);
        }

        if kind.is_sequenced() {
            self.endpoint
                .send_reliable(kind, payload, self.server_addr)
                .await
                .map(|_| ())
        } else {
            self.endpoint
                .send_packet(&Packet::new(kind, payload), self.server_addr)
                .await
        }
    }

    /// Leaves the session
    ///
    /// When logged in, a reliable Leave is sent and awaited (bounded by the
    /// retry budget). Remote players are then removed and the endpoint stops.
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        if self.join.get().is_none() {
            return Err(ProtocolError::NotConnected);
        }

        if self.is_logged_in() {
            info!("Leaving session on {}", self.server_addr);
            let unit = self
                .endpoint
                .send_reliable(PacketKind::Leave, self.identity.clone(), self.server_addr)
                .await?;
            if unit.wait_until_final().await == Outcome::Dead {
                warn!("Server did not acknowledge our leave");
            }
        }

        self.close(None);
        Ok(())
    }

    /// Tears the session down. Only the first call has any effect.
    fn close(&self, notice: Option<&str>) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(notice) = notice {
            warn!("{}", notice);
            self.events.on_notice(notice);
        }
        if self.handshake_done() {
            let departed = std::mem::take(&mut *self.players());
            for identity in &departed {
                self.events.on_leave(identity);
            }
            self.events.on_session_end();
        }
        self.endpoint.stop();
        true
    }

    fn players(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.remote_players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_session_packet(&self, packet: &Packet) {
        match packet.kind {
            PacketKind::Join => {
                let added = self.players().insert(packet.payload.clone());
                if added {
                    info!("{} joined", packet.payload);
                    self.events.on_join(&packet.payload);
                }
            }
            PacketKind::Leave => {
                let removed = self.players().remove(&packet.payload);
                if removed {
                    info!("{} left", packet.payload);
                    self.events.on_leave(&packet.payload);
                }
            }
            PacketKind::Chat => match parse_chat(&packet.payload) {
                Some((identity, message)) => self.events.on_chat(identity, message),
                None => warn!("Malformed chat from server: {}", packet),
            },
            PacketKind::SessionEnd => {
                info!("Server ended the session: {}", packet.payload);
                let notice = if packet.payload.is_empty() {
                    "session ended by server".to_string()
                } else {
                    format!("session ended: {}", packet.payload)
                };
                self.close(Some(&notice));
            }
            PacketKind::StateUpdate | PacketKind::Spawn | PacketKind::Remove => {
                debug!("Dropping {}", packet);
            }
            PacketKind::Invalid | PacketKind::Ack | PacketKind::NegAck => {}
        }
    }
}

impl<T: Transport, E: SessionEvents> Dispatch for Client<T, E> {
    async fn dispatch(self: Arc<Self>, inbound: Inbound) {
        if inbound.from != self.server_addr {
            warn!("Ignoring {} from {}: not our server", inbound.packet, inbound.from);
            return;
        }

        match inbound.packet.kind {
            // Resolved by the receive loop before dispatch.
            PacketKind::Ack | PacketKind::NegAck => {
                if !self.handshake_done() && !self.is_finished() && self.join_in_flight() {
                    warn!("Acknowledgment {} does not match our join", inbound.packet);
                    self.close(Some("failed to reach server"));
                }
                return;
            }
            PacketKind::Invalid => {
                debug!("Dropping malformed datagram: {}", inbound.packet);
                return;
            }
            _ => {}
        }

        if self.is_finished() {
            debug!("Session over; dropping {}", inbound.packet);
            return;
        }
        if !self.handshake_done() {
            warn!("Unexpected {} before login", inbound.packet);
            self.close(Some("failed to reach server"));
            return;
        }

        if inbound.packet.kind.is_sequenced() && !self.endpoint.accept(&inbound).await {
            return;
        }
        self.handle_session_packet(&inbound.packet);
    }

    fn transport_failed(&self, error: &ProtocolError) {
        error!("Client transport failed: {}", error);
        self.close(Some(&format!("lost connection to server: {}", error)));
    }
}
