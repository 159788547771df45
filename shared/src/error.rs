//! Error type for the protocol layer.
//!
//! Malformed datagrams are not errors: they decode to an `Invalid` packet and
//! are dropped by the handlers. `ProtocolError` covers the things a caller can
//! actually act on, like a transport that cannot be bound or a payload that
//! cannot be framed.

use crate::packet::PacketKind;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The transport could not be bound. This is the only fatal condition
    /// when starting a session.
    #[error("failed to bind transport on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("encoded packet is {size} bytes, datagram limit is {limit}")]
    DatagramTooLarge { size: usize, limit: usize },

    /// A payload field contains the reserved field separator.
    #[error("payload field {0:?} contains the reserved delimiter")]
    ReservedDelimiter(String),

    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),

    #[error("{0:?} packets are protocol-internal and cannot be sent as application events")]
    NotAnApplicationEvent(PacketKind),

    #[error("{0:?} packets carry no sequence number and cannot be delivered reliably")]
    Unsequenced(PacketKind),

    #[error("endpoint has been stopped")]
    Stopped,

    #[error("not connected to a server")]
    NotConnected,

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed configuration file: {0}")]
    ConfigFormat(#[from] serde_json::Error),
}
