//! # Utility Modules
//!
//! Supporting utilities for buffering, logging, timing and process coordination.
//!
//! ## Components
//! - **Buffer Pool**: bounded free-list of oversized message buffers
//! - **Logging**: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Second-resolution clocks used for reputation timestamps
//! - **Lock File**: Single-instance advisory lock on the data directory

pub mod buffer_pool;
pub mod lock_file;
pub mod logging;
pub mod metrics;
pub mod time;

pub use buffer_pool::BufferPool;
pub use lock_file::LockFile;
pub use metrics::{Metrics, MetricsSnapshot};
pub use time::{Clock, ManualClock, SystemClock};
