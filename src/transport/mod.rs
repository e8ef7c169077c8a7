//! Connection handling: the per-connection state machine, the connection
//! table, per-connection task queues and the readiness event loop.
//!
//! Unix only; sockets are registered with the poll handle by raw descriptor.

pub mod connection;
pub mod connection_table;
pub mod event_loop;
pub mod task_queue;

pub use connection::{CloseReason, ConnectionState, PeerConnection};
pub use connection_table::ConnectionTable;
pub use event_loop::{Node, NodeContext};
pub use task_queue::TaskQueue;
