//! # Shared Protocol Library
//!
//! Everything the client and server have in common: the wire codec, the
//! reliable delivery unit, the endpoint core that drives both, and the
//! interface through which accepted events reach the game layer.
//!
//! ## Module Organization
//!
//! ### Packet Module (`packet`)
//! Text framing of the ten packet kinds, acknowledgment bodies and the
//! receipt fingerprint that ties an acknowledgment to one exact frame.
//!
//! ### Reliable Module (`reliable`)
//! The `Unsent → InFlight → Acknowledged | Dead` state machine wrapped around
//! one sequenced packet.
//!
//! ### Endpoint Module (`endpoint`)
//! Sequence ring, pending set, retry tasks, receive loop and cancellation.
//!
//! ### Sim Module (`sim`)
//! In-memory datagram network with scripted loss for tests.
//!
//! ## Delivery Guarantees
//!
//! Sequenced packets sent through [`Endpoint::send_reliable`] are retransmitted
//! until acknowledged or until the attempt budget is spent. Receivers suppress
//! duplicates, so the application sees each reliable event at most once.
//! Nothing is ordered: two packets in flight at the same time may be applied in
//! either order.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod packet;
pub mod reliable;
pub mod sim;
pub mod transport;

pub use config::ProtocolConfig;
pub use endpoint::{AckResolution, Dispatch, Endpoint, Inbound};
pub use error::ProtocolError;
pub use events::{EventLog, SessionEvent, SessionEvents};
pub use packet::{Acknowledgment, Packet, PacketKind, Receipt};
pub use reliable::{DeliveryState, Outcome, ReliablePacket};
pub use transport::Transport;

/// Largest datagram either side will send or read.
pub const MAX_DATAGRAM_SIZE: usize = 1500;
pub const TYPE_TAG_WIDTH: usize = 2;
pub const SEQUENCE_WIDTH: usize = 5;
/// Sequence numbers wrap at this value.
pub const SEQUENCE_MODULUS: u32 = 100_000;
/// Separates payload sub-fields.
pub const DELIMITER: char = ';';
pub const MAX_IDENTITY_LEN: usize = 32;
pub const DEFAULT_SERVER_PORT: u16 = 4848;
