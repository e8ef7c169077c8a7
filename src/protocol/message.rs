//! Message and protocol contracts.
//!
//! A concrete protocol supplies its network magic, its version, a message
//! type implementing [`WireMessage`], and a [`MessageRegistry`] routing each
//! command to a decoder and handler. The node core never looks inside
//! payloads itself.

use crate::core::endpoint::Endpoint;
use crate::protocol::registry::MessageRegistry;
use crate::transport::connection::{CloseReason, PeerConnection};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// A message that can be framed into an envelope
pub trait WireMessage: fmt::Debug + Send + Sync + 'static {
    /// Command name, at most 12 ASCII bytes
    fn command(&self) -> &str;

    /// Exact payload size when encoded for `version`
    fn encoded_len(&self, version: u32) -> usize;

    /// Append the payload, exactly `encoded_len(version)` bytes
    fn encode_payload(&self, version: u32, dst: &mut BytesMut);

    /// Opaque message for a framed command with no registered decoder
    fn unknown(command: String, payload: Bytes) -> Self
    where
        Self: Sized;
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Registry type for a protocol's messages and connections
pub type ProtocolRegistry<P> = MessageRegistry<<P as Protocol>::Message, PeerConnection<P>>;

/// Protocol implementation plugged into the node
pub trait Protocol: Send + Sync + Sized + 'static {
    type Message: WireMessage;

    /// Per-connection protocol state, created with every connection
    type Session: Send + Sync + 'static;

    /// Network magic delimiting envelopes
    fn magic(&self) -> [u8; 4];

    /// Highest protocol version spoken locally
    fn version(&self) -> u32;

    /// Client identification string
    fn client_name(&self) -> &str;

    /// Command routing table, fixed for the lifetime of the protocol
    fn registry(&self) -> &ProtocolRegistry<Self>;

    /// Session factory for outbound and accepted connections
    fn new_session(&self, direction: Direction, endpoint: &Endpoint) -> Self::Session;

    /// Called once the socket is established. Returning false closes the connection.
    fn on_connected(&self, connection: &Arc<PeerConnection<Self>>) -> bool;

    /// Called exactly once when a connection closes
    fn on_closed(&self, _connection: &PeerConnection<Self>, _reason: CloseReason) {}
}
