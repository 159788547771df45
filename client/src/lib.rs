//! # Session Client Library
//!
//! The player side of a LAN play session. A client sends one reliable Join
//! to the server, and is logged in once the server acknowledges it. From then
//! on it learns the roster through Join and Leave packets, exchanges chat, and
//! reports everything to a [`shared::SessionEvents`] implementation.
//!
//! ## Login Gating
//!
//! Until the Join is acknowledged the only thing the client expects from the
//! server is that acknowledgment. Any other packet, a refusal (NegAck), or an
//! exhausted retry budget fails the connection attempt and stops the client
//! with a "failed to reach server" notice.
//!
//! ## Session End
//!
//! The session is over when the server sends SessionEnd (shutdown or
//! eviction), when the transport fails, or after [`Client::disconnect`]. In
//! every case remote players are reported as having left and the endpoint
//! stops.

pub mod network;

pub use network::Client;
