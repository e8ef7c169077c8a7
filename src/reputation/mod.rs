//! Peer reputation: per-endpoint connection history, candidate selection
//! and the on-disk snapshot.

pub mod persistence;
pub mod record;
pub mod store;

pub use record::{PeerEvent, ReputationPolicy, ReputationRecord};
pub use store::{NotifyOutcome, ReputationStore};
