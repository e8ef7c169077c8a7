//! Version handshake rules.
//!
//! Each side sends `version` and answers the peer's `version` with `verack`.
//! The outbound side speaks first; the inbound side sends its own `version`
//! just before its first `verack`. Both sides settle on the lower of the two
//! versions, and the connection is handshaked once the peer's `verack`
//! arrives.
//!
//! A connection is closed on:
//! - a second `version`
//! - a `version` carrying the nonce of one of our own connections
//! - a peer version below [`MIN_PEER_VERSION`]
//! - `verack` before `version`

use crate::error::constants;
use crate::protocol::bitcoin::{BitcoinConnection, BitcoinMessage, RemoteInfo};
use crate::protocol::message::{Direction, Protocol};
use crate::reputation::record::PeerEvent;
use crate::transport::connection::CloseReason;
use std::sync::Arc;
use tracing::{debug, warn};

/// Version number announced by some old clients for what is really 300
pub const LEGACY_VERSION: u32 = 10300;
pub const LEGACY_VERSION_REMAP: u32 = 300;

/// Oldest peer version accepted
pub const MIN_PEER_VERSION: u32 = 209;

/// Apply the legacy remap to an announced version
pub fn normalize_version(announced: i32) -> u32 {
    let version = u32::try_from(announced).unwrap_or(0);
    if version == LEGACY_VERSION {
        LEGACY_VERSION_REMAP
    } else {
        version
    }
}

/// Version both sides speak
pub fn negotiate_version(local: u32, remote: u32) -> u32 {
    local.min(remote)
}

fn reject(connection: &BitcoinConnection, why: &str) -> bool {
    connection.node().metrics().protocol_error();
    warn!(conn_id = connection.id(), endpoint = %connection.endpoint(), "{why}");
    connection.close(CloseReason::Handshake);
    false
}

/// `version` handler
pub fn on_version(message: &BitcoinMessage, connection: &Arc<BitcoinConnection>) -> bool {
    let BitcoinMessage::Version(version) = message else {
        return false;
    };
    if connection.node().has_local_nonce(version.nonce) {
        return reject(connection, constants::ERR_SELF_CONNECTION);
    }
    if connection.version() != 0 {
        return reject(connection, constants::ERR_DUPLICATE_VERSION);
    }
    let remote = normalize_version(version.version);
    if remote < MIN_PEER_VERSION {
        return reject(connection, constants::ERR_OBSOLETE_VERSION);
    }

    let protocol = connection.protocol();
    let negotiated = negotiate_version(protocol.version(), remote);
    if !connection.set_version(negotiated) {
        return reject(connection, constants::ERR_DUPLICATE_VERSION);
    }
    connection.session().set_remote(RemoteInfo {
        version: version.version,
        services: version.services,
        user_agent: version.user_agent.as_str().to_string(),
        start_height: version.start_height,
    });
    debug!(
        conn_id = connection.id(),
        endpoint = %connection.endpoint(),
        remote,
        negotiated,
        user_agent = version.user_agent.as_str(),
        "Received version"
    );

    if connection.direction() == Direction::Inbound {
        protocol.send_version(connection);
    }
    connection.send(BitcoinMessage::Verack);
    true
}

/// `verack` handler
pub fn on_verack(_message: &BitcoinMessage, connection: &Arc<BitcoinConnection>) -> bool {
    if connection.version() == 0 {
        return reject(connection, constants::ERR_VERACK_BEFORE_VERSION);
    }
    if connection.is_handshaked() {
        return true;
    }
    connection.complete_handshake();
    if connection.direction() == Direction::Outbound {
        connection
            .node()
            .reputation()
            .notify(connection.endpoint(), PeerEvent::ConnectSuccess);
        connection.send(BitcoinMessage::GetAddr);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiates_minimum() {
        assert_eq!(negotiate_version(60002, 70001), 60002);
        assert_eq!(negotiate_version(70001, 60002), 60002);
        assert_eq!(negotiate_version(60002, 60002), 60002);
    }

    #[test]
    fn test_legacy_remap() {
        assert_eq!(normalize_version(10300), 300);
        assert_eq!(normalize_version(10301), 10301);
        assert_eq!(normalize_version(60002), 60002);
    }

    #[test]
    fn test_negative_version_is_obsolete() {
        assert!(normalize_version(-5) < MIN_PEER_VERSION);
        assert!(normalize_version(208) < MIN_PEER_VERSION);
    }
}
