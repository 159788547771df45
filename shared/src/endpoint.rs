//! Endpoint core shared by the client and server roles.
//!
//! An [`Endpoint`] owns the transport, the outbound sequence counter, the set of
//! reliable packets awaiting acknowledgment and a "stopped" flag. The roles add
//! their own state (roster, login) on top and implement [`Dispatch`] to handle
//! inbound packets.
//!
//! Task layout:
//! - one receive loop per endpoint ([`Endpoint::spawn_receiver`]),
//! - one short-lived dispatch task per received datagram,
//! - one retry task per reliable packet ([`Endpoint::send_reliable`]).
//!
//! Acknowledgments are resolved inline by the receive loop before the next
//! datagram is read. A dispatch task for a later datagram therefore always sees
//! the effect of every acknowledgment that arrived before it.
//!
//! Stopping the endpoint is an explicit signal: the receive loop exits, every
//! retry task expires its packet instead of retransmitting, and further sends
//! fail with [`ProtocolError::Stopped`].

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::packet::{trim_padding, Acknowledgment, Packet, PacketKind, Receipt};
use crate::reliable::ReliablePacket;
use crate::transport::Transport;
use crate::{MAX_DATAGRAM_SIZE, SEQUENCE_MODULUS};
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// How many accepted frames are remembered for duplicate suppression.
const DUPLICATE_WINDOW: usize = 512;

/// A decoded datagram together with the bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub packet: Packet,
    pub raw: Vec<u8>,
    pub from: SocketAddr,
}

impl Inbound {
    pub fn new(datagram: &[u8], from: SocketAddr) -> Self {
        let raw = trim_padding(datagram).to_vec();
        Self {
            packet: Packet::decode(&raw),
            raw,
            from,
        }
    }

    pub fn receipt(&self) -> Receipt {
        Receipt::of(&self.raw)
    }
}

/// Role-specific handling of inbound packets.
pub trait Dispatch: Send + Sync + 'static {
    /// Handles one datagram. Runs on its own task.
    fn dispatch(self: Arc<Self>, inbound: Inbound) -> impl Future<Output = ()> + Send;

    /// The transport failed and the endpoint has been stopped.
    fn transport_failed(&self, error: &ProtocolError);
}

/// What the receive loop made of an Ack or NegAck.
#[derive(Debug, Clone)]
pub enum AckResolution {
    Acknowledged(Arc<ReliablePacket>),
    Refused(Arc<ReliablePacket>),
    /// Sequence and receipt match a pending packet addressed to someone else.
    Spoofed,
    Unmatched,
    Malformed,
}

#[derive(Debug, Default)]
struct RecentFrames {
    order: VecDeque<(SocketAddr, u32, Receipt)>,
    members: HashSet<(SocketAddr, u32, Receipt)>,
}

impl RecentFrames {
    /// Records the frame; `false` if it was already recorded.
    fn insert(&mut self, key: (SocketAddr, u32, Receipt)) -> bool {
        if !self.members.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > DUPLICATE_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }
}

pub struct Endpoint<T: Transport> {
    transport: T,
    local_addr: SocketAddr,
    config: ProtocolConfig,
    sequence: AtomicU32,
    pending: Mutex<HashMap<(u32, SocketAddr), Arc<ReliablePacket>>>,
    recent: Mutex<RecentFrames>,
    stopped: watch::Sender<bool>,
}

impl<T: Transport> Endpoint<T> {
    pub fn new(transport: T, config: ProtocolConfig) -> Result<Arc<Self>, ProtocolError> {
        config.validate()?;
        let local_addr = transport.local_addr()?;
        let (stopped, _) = watch::channel(false);

        Ok(Arc::new(Self {
            transport,
            local_addr,
            config,
            sequence: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentFrames::default()),
            stopped,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Hands out the next value of the sequence ring.
    pub fn next_sequence(&self) -> u32 {
        self.sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1) % SEQUENCE_MODULUS)
            })
            .unwrap_or_else(|current| current)
    }

    /// Builds a packet, stamping a fresh sequence number on sequenced kinds.
    pub fn stamp(&self, kind: PacketKind, payload: impl Into<String>) -> Packet {
        let packet = Packet::new(kind, payload);
        if kind.is_sequenced() {
            packet.with_sequence(self.next_sequence())
        } else {
            packet
        }
    }

    /// Fire-and-forget transmission. Nothing is tracked or retried.
    pub async fn send_packet(&self, packet: &Packet, target: SocketAddr) -> Result<(), ProtocolError> {
        self.transmit(&packet.encode(), target).await
    }

    async fn transmit(&self, frame: &[u8], target: SocketAddr) -> Result<(), ProtocolError> {
        if self.is_stopped() {
            return Err(ProtocolError::Stopped);
        }
        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::DatagramTooLarge {
                size: frame.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        self.transport.send_to(frame, target).await?;
        trace!("{} -> {}: {}", self.local_addr, target, String::from_utf8_lossy(frame));
        Ok(())
    }

    /// Sends a sequenced packet that `target` must acknowledge.
    ///
    /// The returned unit is already registered and in flight; a retry task
    /// keeps retransmitting the identical frame until it is acknowledged, the
    /// attempt budget runs out, or the endpoint stops. A failed first
    /// transmission is logged and left to the retry task.
    pub async fn send_reliable(
        self: &Arc<Self>,
        kind: PacketKind,
        payload: impl Into<String>,
        target: SocketAddr,
    ) -> Result<Arc<ReliablePacket>, ProtocolError> {
        let unit = self.prepare_reliable(kind, payload, target)?;
        self.launch(&unit).await?;
        Ok(unit)
    }

    /// Builds an `Unsent` unit with a fresh sequence number. Nothing is
    /// registered or transmitted until [`Endpoint::launch`].
    pub fn prepare_reliable(
        &self,
        kind: PacketKind,
        payload: impl Into<String>,
        target: SocketAddr,
    ) -> Result<Arc<ReliablePacket>, ProtocolError> {
        if !kind.is_sequenced() {
            return Err(ProtocolError::Unsequenced(kind));
        }
        if self.is_stopped() {
            return Err(ProtocolError::Stopped);
        }

        let packet = Packet::new(kind, payload).with_sequence(self.next_sequence());
        let unit = Arc::new(ReliablePacket::new(packet, target));
        if unit.frame().len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::DatagramTooLarge {
                size: unit.frame().len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(unit)
    }

    /// Registers a prepared unit, transmits it and starts its retry task.
    /// Launching a unit twice is a no-op.
    pub async fn launch(self: &Arc<Self>, unit: &Arc<ReliablePacket>) -> Result<(), ProtocolError> {
        if self.is_stopped() {
            return Err(ProtocolError::Stopped);
        }
        if !unit.launch() {
            return Ok(());
        }
        self.pending.lock().await.insert(unit.key(), Arc::clone(unit));

        match self.transmit(unit.frame(), unit.target()).await {
            Ok(()) => debug!("sent {} to {}", unit.packet(), unit.target()),
            Err(e) => warn!(
                "first transmission of {} to {} failed: {}",
                unit.packet(),
                unit.target(),
                e
            ),
        }

        self.spawn_retry(Arc::clone(unit));
        Ok(())
    }

    fn spawn_retry(self: &Arc<Self>, unit: Arc<ReliablePacket>) {
        let endpoint = Arc::clone(self);

        tokio::spawn(async move {
            let max_attempts = endpoint.config.max_attempts;
            let mut attempts = 1;

            loop {
                tokio::select! {
                    _ = unit.wait_until_final() => break,
                    _ = endpoint.stopped() => {
                        if unit.expire() {
                            debug!("{} to {} abandoned: endpoint stopped", unit.packet(), unit.target());
                        }
                        break;
                    }
                    _ = sleep(endpoint.config.retry_timeout()) => {
                        if !unit.is_alive() {
                            break;
                        }
                        if attempts >= max_attempts {
                            if unit.expire() {
                                warn!(
                                    "{} to {} unacknowledged after {} attempts",
                                    unit.packet(),
                                    unit.target(),
                                    attempts
                                );
                            }
                            break;
                        }
                        attempts += 1;
                        debug!(
                            "retransmitting {} to {} (attempt {}/{})",
                            unit.packet(),
                            unit.target(),
                            attempts,
                            max_attempts
                        );
                        if let Err(e) = endpoint.transmit(unit.frame(), unit.target()).await {
                            warn!("retransmission of {} failed: {}", unit.packet(), e);
                        }
                    }
                }
            }

            endpoint.forget(&unit).await;
        });
    }

    async fn forget(&self, unit: &Arc<ReliablePacket>) {
        let mut pending = self.pending.lock().await;
        // After a sequence wrap the key may already belong to a newer unit.
        let same = pending
            .get(&unit.key())
            .map_or(false, |current| Arc::ptr_eq(current, unit));
        if same {
            pending.remove(&unit.key());
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Matches an Ack or NegAck against the pending set.
    ///
    /// Only the address a unit was sent to may resolve it; a matching
    /// acknowledgment from anywhere else is logged and ignored.
    pub async fn resolve_ack(&self, inbound: &Inbound) -> AckResolution {
        let Some(ack) = Acknowledgment::from_packet(&inbound.packet) else {
            debug!("malformed acknowledgment from {}: {}", inbound.from, inbound.packet);
            return AckResolution::Malformed;
        };

        let candidates: Vec<Arc<ReliablePacket>> = {
            let pending = self.pending.lock().await;
            pending
                .values()
                .filter(|unit| unit.matches(&ack))
                .cloned()
                .collect()
        };

        let Some(unit) = candidates.iter().find(|unit| unit.target() == inbound.from) else {
            if let Some(unit) = candidates.first() {
                warn!(
                    "protocol violation: {:?} for {} from {}, expected {}",
                    inbound.packet.kind,
                    unit.packet(),
                    inbound.from,
                    unit.target()
                );
                return AckResolution::Spoofed;
            }
            debug!(
                "{:?} #{:05} from {} matches nothing pending",
                inbound.packet.kind, ack.sequence, inbound.from
            );
            return AckResolution::Unmatched;
        };

        if inbound.packet.kind == PacketKind::NegAck {
            if unit.expire() {
                warn!("{} refused {}", inbound.from, unit.packet());
            }
            AckResolution::Refused(Arc::clone(unit))
        } else {
            if unit.acknowledge() {
                debug!("{} acknowledged {}", inbound.from, unit.packet());
            }
            AckResolution::Acknowledged(Arc::clone(unit))
        }
    }

    /// Acknowledges a sequenced packet. Plain packets are left alone.
    pub async fn acknowledge(&self, inbound: &Inbound) {
        self.answer(inbound, PacketKind::Ack).await;
    }

    /// Refuses a sequenced packet with a NegAck.
    pub async fn refuse(&self, inbound: &Inbound) {
        self.answer(inbound, PacketKind::NegAck).await;
    }

    async fn answer(&self, inbound: &Inbound, kind: PacketKind) {
        if !inbound.packet.kind.is_sequenced() {
            return;
        }
        let reply = Acknowledgment::for_frame(&inbound.packet, &inbound.raw).to_packet(kind);
        if let Err(e) = self.send_packet(&reply, inbound.from).await {
            warn!("failed to send {:?} to {}: {}", kind, inbound.from, e);
        }
    }

    /// Acknowledges `inbound` and reports whether this is its first delivery.
    ///
    /// Retransmissions are acknowledged again (the earlier Ack may have been
    /// lost) but must not be applied twice.
    pub async fn accept(&self, inbound: &Inbound) -> bool {
        self.acknowledge(inbound).await;
        let first = self
            .recent
            .lock()
            .await
            .insert((inbound.from, inbound.packet.sequence, inbound.receipt()));
        if !first {
            debug!("duplicate {} from {}", inbound.packet, inbound.from);
        }
        first
    }

    /// Starts the receive loop. Every datagram is decoded and handed to
    /// `dispatcher` on a task of its own.
    pub fn spawn_receiver<D: Dispatch>(self: &Arc<Self>, dispatcher: Arc<D>) -> JoinHandle<()> {
        let endpoint = Arc::clone(self);

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            info!("listening on {}", endpoint.local_addr);

            loop {
                let received = tokio::select! {
                    _ = endpoint.stopped() => break,
                    received = endpoint.transport.recv_from(&mut buffer) => received,
                };

                match received {
                    Ok((len, from)) => {
                        let inbound = Inbound::new(&buffer[..len], from);
                        if matches!(inbound.packet.kind, PacketKind::Ack | PacketKind::NegAck) {
                            endpoint.resolve_ack(&inbound).await;
                        }
                        tokio::spawn(Arc::clone(&dispatcher).dispatch(inbound));
                    }
                    Err(e) => {
                        if endpoint.is_stopped() {
                            break;
                        }
                        error!("receive on {} failed: {}", endpoint.local_addr, e);
                        endpoint.stop();
                        dispatcher.transport_failed(&ProtocolError::Transport(e));
                        break;
                    }
                }
            }

            debug!("receive loop on {} finished", endpoint.local_addr);
        })
    }

    pub fn stop(&self) {
        if !self.stopped.send_replace(true) {
            info!("endpoint {} stopped", self.local_addr);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once [`Endpoint::stop`] has been called.
    pub async fn stopped(&self) {
        let mut flag = self.stopped.subscribe();
        loop {
            let stopped = *flag.borrow_and_update();
            if stopped || flag.changed().await.is_err() {
                return;
            }
        }
    }
}
