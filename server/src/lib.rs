//! # Session Server Library
//!
//! The authoritative side of a LAN play session. The server owns the roster
//! of participants, admits newcomers only once they hold the full roster,
//! and propagates every join and leave to the other peers reliably.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! A Join is refused (NegAck) when the session is full, the identity is
//! malformed, or it is already in use. Otherwise the newcomer receives one
//! reliable Join per existing participant plus one for the host, and is
//! admitted only if it acknowledges all of them.
//!
//! ### Propagation
//! Existing peers learn about a newcomer (or a departure) through reliable
//! Join and Leave packets, one per peer.
//!
//! ### Eviction
//! A peer that fails to acknowledge a propagation step within the retry
//! budget is removed from the session. It is sent a best-effort SessionEnd
//! and the remaining peers a best-effort Leave.
//!
//! ### Chat Relay
//! Chat from one peer is reported locally and forwarded unreliably to every
//! other peer, stamped with the sender's roster identity.
//!
//! ## Module Organization
//!
//! ### Roster Module (`roster`)
//! Admitted peers and joins in progress, with capacity and uniqueness rules.
//!
//! ### Network Module (`network`)
//! The [`Server`] type: inbound routing, broadcast, application events and
//! shutdown.
//!
//! ### Sync Module (`sync`)
//! Join admission, leave propagation and eviction.

pub mod network;
pub mod roster;
mod sync;

pub use network::Server;
pub use roster::{Admission, Peer, Roster};
