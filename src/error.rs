//! # Error Types
//!
//! Error handling for the peer-to-peer node core.
//!
//! This module defines every error variant that can surface from framing,
//! connection handling, reputation persistence and the event loop.
//!
//! ## Error Categories
//! - **Framing Errors**: oversized length, checksum mismatch, truncated or malformed payloads
//! - **Protocol Violations**: pre-handshake traffic, handler-requested closes.
//!   These close the connection with a `CloseReason` and never surface here.
//! - **I/O Errors**: socket and file system failures
//! - **Resource Errors**: messages exceeding every available buffer
//! - **Invariant Violations**: connection table divergence, duplicate ids (fatal)
//!
//! Bad magic never produces an error: the decoder resynchronizes silently.
//!
//! ## Example Usage
//! ```rust
//! use peernet::error::{ProtocolError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{info, error};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProtocolError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProtocolError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("peers.dat") {
//!         Ok(contents) => info!(len = contents.len(), "Read snapshot"),
//!         Err(e) => error!(error=%e, "Error reading snapshot"),
//!     }
//! }
//! ```

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_TRUNCATED: &str = "Payload ended before all fields were read";
    pub const ERR_COMMAND_TOO_LONG: &str = "Command exceeds 12 bytes";
    pub const ERR_COMMAND_NOT_ASCII: &str = "Command contains non-ASCII bytes";

    /// Protocol violations
    pub const ERR_PRE_HANDSHAKE: &str = "Non-handshake message received before handshake";
    pub const ERR_DUPLICATE_VERSION: &str = "Two version messages received from peer";
    pub const ERR_SELF_CONNECTION: &str = "Connected to self";
    pub const ERR_OBSOLETE_VERSION: &str = "Peer uses obsolete protocol version";
    pub const ERR_VERACK_BEFORE_VERSION: &str = "verack received before version";

    /// Connection table invariants
    pub const ERR_DUPLICATE_ID: &str = "Connection id already present in table";
    pub const ERR_ID_INDEX_REMOVE: &str = "Connection missing from id index on removal";
    pub const ERR_ENDPOINT_INDEX_REMOVE: &str = "Connection missing from endpoint index on removal";
    pub const ERR_ROLLBACK: &str = "Failed to roll back id index after endpoint conflict";

    /// Persistence
    pub const ERR_DIRECTORY_LOCKED: &str = "Data directory is locked by another instance";

    /// Clock
    pub const ERR_SYSTEM_TIME: &str = "System clock reads before the Unix epoch";
}

/// ProtocolError is the primary error type for all node operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Message too large: {length} bytes (max: {max})")]
    OversizedMessage { length: usize, max: usize },

    #[error("Invalid checksum: expected {expected:02x?}, got {actual:02x?}")]
    ChecksumMismatch { expected: [u8; 4], actual: [u8; 4] },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Truncated payload: {0}")]
    Truncated(&'static str),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Data directory locked: {0}")]
    DirectoryLocked(PathBuf),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Event loop failure: {0}")]
    EventLoop(String),
}

impl ProtocolError {
    /// Errors that signal a logic defect or a broken readiness handle.
    ///
    /// These are never retried and terminate the event loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvariantViolation(_) | ProtocolError::EventLoop(_)
        )
    }

    /// Framing errors that make the byte stream unusable for this connection
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::OversizedMessage { .. }
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::Truncated(_)
                | ProtocolError::MalformedPayload(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::InvariantViolation("x".into()).is_fatal());
        assert!(ProtocolError::EventLoop("poll".into()).is_fatal());
        assert!(!ProtocolError::ConnectionClosed.is_fatal());
        assert!(!ProtocolError::Truncated(constants::ERR_TRUNCATED).is_fatal());
    }

    #[test]
    fn test_framing_classification() {
        let err = ProtocolError::ChecksumMismatch {
            expected: [1, 2, 3, 4],
            actual: [0, 0, 0, 0],
        };
        assert!(err.is_framing());
        assert!(!ProtocolError::AlreadyConnected("10.0.0.1:8333".into()).is_framing());
    }
}
