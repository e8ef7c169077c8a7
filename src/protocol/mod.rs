//! # Protocol Layer
//!
//! Contracts between the node core and a concrete protocol, the command
//! routing table, and the Bitcoin reference protocol.
//!
//! ## Components
//! - **Message**: [`WireMessage`] and [`Protocol`] traits
//! - **Registry**: immutable command to decoder/handler table
//! - **Bitcoin**: `version`, `verack`, `getaddr` and `addr`
//! - **Handshake**: version negotiation rules for the reference protocol

pub mod bitcoin;
pub mod handshake;
pub mod message;
pub mod registry;

pub use message::{Direction, Protocol, ProtocolRegistry, WireMessage};
pub use registry::{MessageRegistry, RegistryBuilder};
