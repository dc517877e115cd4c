//! Request dispatch and placement-group work scheduling for a storage node.
//!
//! An [`Osd`] hosts placement groups (PGs), shards of a pool's object space
//! replicated across several nodes. This crate provides the node's core:
//! - **Epoch cache** of cluster maps with persisted history and trimming
//! - **Partition registry** with per-PG locks, creation, split and removal
//! - **Work queues** feeding worker pools, one entry per PG at a time
//! - **Dispatch** that routes client ops, replica ops and peering traffic
//! - **Peering** to agree on PG contents after every placement change
//! - **Heartbeats**, failure reports and PG stats to the monitor
//!
//! Storage and networking are collaborators behind the [`store::ObjectStore`]
//! and [`network::Transport`] traits; [`store::MemStore`] is the in-memory
//! store used by tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use osd_core::store::MemStore;
//! use osd_core::testing::RecordingTransport;
//! use osd_core::{Osd, OsdConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> osd_core::Result<()> {
//!     let config = OsdConfig::new(0)
//!         .with_op_threads(4)
//!         .with_op_complaint_time(Duration::from_secs(30));
//!
//!     let osd = Osd::new(config, Arc::new(MemStore::new()), RecordingTransport::new())?;
//!     osd.init()?;
//!
//!     // Inbound messages go to `osd.dispatch(envelope)`; maps from the
//!     // monitor bring the node up.
//!     osd.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!            transport
//!                │
//!                ▼
//!   ┌──────────────────────────┐
//!   │  dispatch / peering      │──► epoch cache (maps)
//!   └──────────────────────────┘
//!                │ queue PG
//!                ▼
//!   ┌──────────────────────────┐     ┌───────────────────┐
//!   │  work queues             │────►│  worker pools     │
//!   │  op, recovery, scrub ... │     │  (op, disk)       │
//!   └──────────────────────────┘     └───────────────────┘
//!                                              │
//!                                              ▼
//!                                   PG registry + object store
//! ```

pub mod config;
pub mod error;
pub mod map;
pub mod metrics;
pub mod network;
pub mod osd;
pub mod pg;
pub mod store;
pub mod testing;
pub mod types;
pub mod workqueue;

pub use config::{HeartbeatConfig, OsdConfig, RecoveryConfig, ReportConfig, ScrubConfig};
pub use error::{Error, MapError, NetworkError, OpError, Result, StorageError};
pub use map::{MapCache, OsdMap};
pub use metrics::{MetricsSnapshot, OsdMetrics};
pub use osd::{NodeState, Osd};
pub use pg::PgRegistry;
pub use types::{ConnectionId, EntityName, Epoch, Eversion, OsdId, PgId, Tid};
