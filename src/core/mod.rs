//! # Core Wire Components
//!
//! Envelope framing, variable-width primitives and endpoint addressing.
//!
//! ## Components
//! - **Codec**: envelope framing and checksums, usable as a Tokio codec
//! - **Primitives**: `VarInt` and `VarString` payload encodings
//! - **Endpoint**: the address record exchanged between peers
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Command(12)] [Length(4, LE)] [Checksum(4)] [Payload(Length)]
//! ```
//!
//! ## Safety Limits
//! - Envelopes above the configured maximum are rejected before their payload is buffered
//! - Payload lengths and counts are checked against the remaining bytes before reading

pub mod codec;
pub mod endpoint;
pub mod primitives;
