//! Reliable delivery unit: one sequenced packet, the peer that must
//! acknowledge it, and its retransmission state.
//!
//! ```text
//! Unsent ──launch──▶ InFlight ──acknowledge──▶ Acknowledged
//!                       │
//!                       └────────expire───────▶ Dead
//! ```
//!
//! The state lives in a `watch` channel. It is the only mutable state shared
//! between the receive loop (which acknowledges) and the retry task (which
//! expires), and every transition is a compare-and-set through
//! `send_if_modified`, so exactly one of the two terminal states is ever
//! reached. Waiters subscribe to the same channel instead of polling.

use crate::packet::{Acknowledgment, Packet, Receipt};
use std::net::SocketAddr;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Unsent,
    InFlight,
    Acknowledged,
    Dead,
}

impl DeliveryState {
    pub fn is_final(self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(self) -> Option<Outcome> {
        match self {
            DeliveryState::Acknowledged => Some(Outcome::Acknowledged),
            DeliveryState::Dead => Some(Outcome::Dead),
            DeliveryState::Unsent | DeliveryState::InFlight => None,
        }
    }
}

/// What a waiter observes once a unit leaves `InFlight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    Dead,
}

#[derive(Debug)]
pub struct ReliablePacket {
    packet: Packet,
    frame: Vec<u8>,
    receipt: Receipt,
    target: SocketAddr,
    state: watch::Sender<DeliveryState>,
}

impl ReliablePacket {
    /// Wraps an already sequenced packet addressed to `target`.
    pub fn new(packet: Packet, target: SocketAddr) -> Self {
        let frame = packet.encode();
        let receipt = Receipt::of(&frame);
        let (state, _) = watch::channel(DeliveryState::Unsent);
        Self {
            packet,
            frame,
            receipt,
            target,
            state,
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn sequence(&self) -> u32 {
        self.packet.sequence
    }

    /// The exact bytes sent on every attempt.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn receipt(&self) -> Receipt {
        self.receipt
    }

    /// The only address allowed to acknowledge this unit.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn key(&self) -> (u32, SocketAddr) {
        (self.packet.sequence, self.target)
    }

    pub fn state(&self) -> DeliveryState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.state().is_final()
    }

    /// Sequence and receipt agree with `ack`. Sender identity is checked by
    /// the caller against [`ReliablePacket::target`].
    pub fn matches(&self, ack: &Acknowledgment) -> bool {
        self.packet.sequence == ack.sequence && self.receipt == ack.receipt
    }

    pub(crate) fn launch(&self) -> bool {
        self.transition(|state| *state == DeliveryState::Unsent, DeliveryState::InFlight)
    }

    /// Returns `false` if the unit was not in flight.
    pub fn acknowledge(&self) -> bool {
        self.transition(|state| *state == DeliveryState::InFlight, DeliveryState::Acknowledged)
    }

    /// Declares the unit dead. Returns `false` if it had already finished.
    pub fn expire(&self) -> bool {
        self.transition(|state| !state.is_final(), DeliveryState::Dead)
    }

    fn transition(&self, allowed: impl FnOnce(&DeliveryState) -> bool, next: DeliveryState) -> bool {
        self.state.send_if_modified(|state| {
            if allowed(state) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the unit is `Acknowledged` or `Dead`.
    pub async fn wait_until_final(&self) -> Outcome {
        let mut updates = self.state.subscribe();
        loop {
            let current = updates.borrow_and_update().outcome();
            if let Some(outcome) = current {
                return outcome;
            }
            if updates.changed().await.is_err() {
                return Outcome::Dead;
            }
        }
    }
}
