//! # Bitcoin Reference Protocol
//!
//! The handshake and address-gossip subset of the Bitcoin P2P protocol,
//! enough to join a network, negotiate versions and exchange peer addresses.
//!
//! ## Messages
//! - `version` / `verack`: version handshake, see [`handshake`](super::handshake)
//! - `getaddr`: asks for known endpoints (after the handshake only)
//! - `addr`: up to [`MAX_ADDR_ENTRIES`] endpoints, accepted at any time
//!
//! Every other command decodes to [`BitcoinMessage::Unknown`] and is ignored
//! once the handshake is done.

use crate::core::endpoint::{AddrContext, Endpoint};
use crate::core::primitives::{ensure_remaining, VarInt, VarString};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake;
use crate::protocol::message::{Direction, Protocol, ProtocolRegistry, WireMessage};
use crate::protocol::registry::MessageRegistry;
use crate::transport::connection::PeerConnection;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Main network magic
pub const MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];

/// Protocol version spoken by default
pub const PROTOCOL_VERSION: u32 = 60002;

/// Service bit for nodes serving the full chain
pub const NODE_NETWORK: u64 = 1;

/// Largest `addr` message accepted or sent
pub const MAX_ADDR_ENTRIES: usize = 1000;

/// Versions above this carry sender, nonce, user agent and start height
pub const EXTENDED_VERSION_THRESHOLD: i32 = 106;

pub const CLIENT_NAME: &str = "/peernet:0.1.0/";

pub const CMD_VERSION: &str = "version";
pub const CMD_VERACK: &str = "verack";
pub const CMD_GETADDR: &str = "getaddr";
pub const CMD_ADDR: &str = "addr";

/// Payload of a `version` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: Endpoint,
    pub sender: Endpoint,
    pub nonce: u64,
    pub user_agent: VarString,
    pub start_height: i32,
}

impl VersionMessage {
    fn extended(&self) -> bool {
        self.version > EXTENDED_VERSION_THRESHOLD
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 4 + 8 + 8 + Endpoint::encoded_len(0, AddrContext::Handshake);
        if self.extended() {
            len += Endpoint::encoded_len(0, AddrContext::Handshake)
                + 8
                + self.user_agent.encoded_len()
                + 4;
        }
        len
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_i32_le(self.version);
        dst.put_u64_le(self.services);
        dst.put_i64_le(self.timestamp);
        self.receiver.encode(0, AddrContext::Handshake, dst);
        if self.extended() {
            self.sender.encode(0, AddrContext::Handshake, dst);
            dst.put_u64_le(self.nonce);
            self.user_agent.encode(dst);
            dst.put_i32_le(self.start_height);
        }
    }

    /// Decode a `version` payload. Trailing fields of newer versions are ignored.
    pub fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        ensure_remaining(src, 20)?;
        let version = src.get_i32_le();
        let services = src.get_u64_le();
        let timestamp = src.get_i64_le();
        let receiver = Endpoint::decode(src, 0, AddrContext::Handshake)?;

        let mut message = Self {
            version,
            services,
            timestamp,
            receiver,
            sender: Endpoint::from_socket_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            nonce: 0,
            user_agent: VarString::default(),
            start_height: 0,
        };
        if message.extended() {
            message.sender = Endpoint::decode(src, 0, AddrContext::Handshake)?;
            ensure_remaining(src, 8)?;
            message.nonce = src.get_u64_le();
            message.user_agent = VarString::decode(src)?;
            ensure_remaining(src, 4)?;
            message.start_height = src.get_i32_le();
        }
        Ok(message)
    }
}

/// Messages of the reference protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitcoinMessage {
    Version(VersionMessage),
    Verack,
    GetAddr,
    Addr(Vec<Endpoint>),
    /// Framed command without a decoder
    Unknown { command: String, payload: Bytes },
}

impl WireMessage for BitcoinMessage {
    fn command(&self) -> &str {
        match self {
            BitcoinMessage::Version(_) => CMD_VERSION,
            BitcoinMessage::Verack => CMD_VERACK,
            BitcoinMessage::GetAddr => CMD_GETADDR,
            BitcoinMessage::Addr(_) => CMD_ADDR,
            BitcoinMessage::Unknown { command, .. } => command,
        }
    }

    fn encoded_len(&self, version: u32) -> usize {
        match self {
            BitcoinMessage::Version(v) => v.encoded_len(),
            BitcoinMessage::Verack | BitcoinMessage::GetAddr => 0,
            BitcoinMessage::Addr(entries) => {
                VarInt::from(entries.len()).encoded_len()
                    + entries.len() * Endpoint::encoded_len(version, AddrContext::Network)
            }
            BitcoinMessage::Unknown { payload, .. } => payload.len(),
        }
    }

    fn encode_payload(&self, version: u32, dst: &mut BytesMut) {
        match self {
            BitcoinMessage::Version(v) => v.encode(dst),
            BitcoinMessage::Verack | BitcoinMessage::GetAddr => {}
            BitcoinMessage::Addr(entries) => {
                VarInt::from(entries.len()).encode(dst);
                for entry in entries {
                    entry.encode(version, AddrContext::Network, dst);
                }
            }
            BitcoinMessage::Unknown { payload, .. } => dst.extend_from_slice(payload),
        }
    }

    fn unknown(command: String, payload: Bytes) -> Self {
        BitcoinMessage::Unknown { command, payload }
    }
}

fn decode_version(mut payload: Bytes, _version: u32) -> Result<BitcoinMessage> {
    VersionMessage::decode(&mut payload).map(BitcoinMessage::Version)
}

fn decode_empty(command: &'static str, payload: &Bytes) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::MalformedPayload(format!(
            "{command} carries {} unexpected bytes",
            payload.len()
        )))
    }
}

fn decode_addr(mut payload: Bytes, version: u32) -> Result<BitcoinMessage> {
    let count = VarInt::decode(&mut payload)?.0;
    if count > MAX_ADDR_ENTRIES as u64 {
        return Err(ProtocolError::MalformedPayload(format!(
            "addr with {count} entries (max {MAX_ADDR_ENTRIES})"
        )));
    }
    let count = count as usize;
    ensure_remaining(
        &payload,
        count * Endpoint::encoded_len(version, AddrContext::Network),
    )?;
    let entries = (0..count)
        .map(|_| Endpoint::decode(&mut payload, version, AddrContext::Network))
        .collect::<Result<Vec<_>>>()?;
    Ok(BitcoinMessage::Addr(entries))
}

/// Per-connection handshake bookkeeping
#[derive(Debug, Default)]
pub struct BitcoinSession {
    version_sent: AtomicBool,
    remote: Mutex<Option<RemoteInfo>>,
}

/// What the peer announced about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
}

impl BitcoinSession {
    /// Mark our `version` as sent. Returns false if it already was.
    pub fn mark_version_sent(&self) -> bool {
        !self.version_sent.swap(true, Ordering::SeqCst)
    }

    pub fn version_sent(&self) -> bool {
        self.version_sent.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Option<RemoteInfo> {
        self.remote.lock().clone()
    }

    pub(crate) fn set_remote(&self, info: RemoteInfo) {
        *self.remote.lock() = Some(info);
    }
}

/// Connection type used by this protocol
pub type BitcoinConnection = PeerConnection<BitcoinProtocol>;

/// The reference protocol implementation
pub struct BitcoinProtocol {
    magic: [u8; 4],
    version: u32,
    services: u64,
    user_agent: String,
    start_height: i32,
    registry: ProtocolRegistry<BitcoinProtocol>,
}

impl std::fmt::Debug for BitcoinProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitcoinProtocol")
            .field("magic", &self.magic)
            .field("version", &self.version)
            .field("user_agent", &self.user_agent)
            .field("registry", &self.registry)
            .finish()
    }
}

impl BitcoinProtocol {
    /// Main network, [`PROTOCOL_VERSION`]
    pub fn new() -> Result<Self> {
        Self::with_version(PROTOCOL_VERSION)
    }

    pub fn with_version(version: u32) -> Result<Self> {
        Ok(Self {
            magic: MAGIC,
            version,
            services: NODE_NETWORK,
            user_agent: CLIENT_NAME.to_string(),
            start_height: 0,
            registry: Self::build_registry()?,
        })
    }

    /// Use a different network magic
    pub fn magic_bytes(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn start_height(mut self, height: i32) -> Self {
        self.start_height = height;
        self
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    fn build_registry() -> Result<ProtocolRegistry<Self>> {
        MessageRegistry::builder()
            .decoder(CMD_VERSION, decode_version)
            .handshake_handler(CMD_VERSION, handshake::on_version)
            .decoder(CMD_VERACK, |payload: Bytes, _| {
                decode_empty(CMD_VERACK, &payload).map(|_| BitcoinMessage::Verack)
            })
            .handshake_handler(CMD_VERACK, handshake::on_verack)
            .decoder(CMD_ADDR, decode_addr)
            .handshake_handler(CMD_ADDR, on_addr)
            .decoder(CMD_GETADDR, |payload: Bytes, _| {
                decode_empty(CMD_GETADDR, &payload).map(|_| BitcoinMessage::GetAddr)
            })
            .handler(CMD_GETADDR, on_getaddr)
            .build()
    }

    /// Our `version` message for `connection`
    pub fn version_message(&self, connection: &BitcoinConnection) -> VersionMessage {
        let node = connection.node();
        let sender = node
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        VersionMessage {
            version: self.version as i32,
            services: self.services,
            timestamp: i64::from(node.reputation().now()),
            receiver: connection.endpoint(),
            sender: Endpoint::from_socket_addr(sender).with_services(self.services),
            nonce: connection.nonce(),
            user_agent: VarString::new(self.user_agent.clone()),
            start_height: self.start_height,
        }
    }

    /// Send our `version` unless it was already sent
    pub fn send_version(&self, connection: &Arc<BitcoinConnection>) {
        if connection.session().mark_version_sent() {
            trace!(conn_id = connection.id(), "Sending version");
            connection.send(BitcoinMessage::Version(self.version_message(connection)));
        }
    }
}

impl Protocol for BitcoinProtocol {
    type Message = BitcoinMessage;
    type Session = BitcoinSession;

    fn magic(&self) -> [u8; 4] {
        self.magic
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn client_name(&self) -> &str {
        &self.user_agent
    }

    fn registry(&self) -> &ProtocolRegistry<Self> {
        &self.registry
    }

    fn new_session(&self, _direction: Direction, _endpoint: &Endpoint) -> BitcoinSession {
        BitcoinSession::default()
    }

    fn on_connected(&self, connection: &Arc<BitcoinConnection>) -> bool {
        if connection.direction() == Direction::Outbound {
            self.send_version(connection);
        }
        true
    }
}

/// `addr`: feed every entry to the reputation store
fn on_addr(message: &BitcoinMessage, connection: &Arc<BitcoinConnection>) -> bool {
    let BitcoinMessage::Addr(entries) = message else {
        return false;
    };
    debug!(conn_id = connection.id(), entries = entries.len(), "Received addresses");
    let node = connection.node();
    for entry in entries {
        node.learn(*entry);
    }
    true
}

/// `getaddr`: reply with the best known endpoints
fn on_getaddr(_message: &BitcoinMessage, connection: &Arc<BitcoinConnection>) -> bool {
    let entries: Vec<Endpoint> = connection
        .node()
        .reputation()
        .best(MAX_ADDR_ENTRIES)
        .into_iter()
        .map(|r| r.endpoint.with_timestamp(r.last_seen_good()))
        .collect();
    debug!(conn_id = connection.id(), entries = entries.len(), "Answering getaddr");
    connection.send(BitcoinMessage::Addr(entries));
    true
}
