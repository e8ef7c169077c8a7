//! # peernet
//!
//! Core of a peer-to-peer node: checksummed envelope framing, non-blocking
//! connections driven by a single readiness loop and a worker pool, and a
//! reputation store that decides which peers to reconnect to.
//!
//! ## Modules
//! - [`core`]: envelope codec, variable-width primitives, endpoints
//! - [`protocol`]: protocol contracts, message registry, Bitcoin reference protocol
//! - [`transport`]: connections, connection table, event loop and [`Node`] handle
//! - [`reputation`]: per-endpoint history, candidate selection, snapshot file
//! - [`utils`]: buffer pool, metrics, logging, clocks, lock file
//!
//! ## Example
//! ```no_run
//! use peernet::config::NodeConfig;
//! use peernet::protocol::bitcoin::BitcoinProtocol;
//! use peernet::Node;
//!
//! fn main() -> peernet::Result<()> {
//!     let config = NodeConfig::default_with_overrides(|c| {
//!         c.network.listen_address = Some("0.0.0.0:8333".into());
//!         c.network.seed_peers = vec!["203.0.113.7:8333".into()];
//!     });
//!     peernet::utils::logging::init(&config.logging)?;
//!     let node = Node::start(config, BitcoinProtocol::new()?)?;
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     node.metrics().log_metrics();
//!     node.shutdown()
//! }
//! ```

#[cfg(not(unix))]
compile_error!("peernet registers sockets by raw descriptor and supports Unix targets only");

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod reputation;
pub mod transport;
pub mod utils;

pub use crate::core::endpoint::Endpoint;
pub use error::{ProtocolError, Result};
pub use transport::event_loop::Node;
