//! Core interfaces for the shardlog generation coordinator.
//!
//! This crate defines the external collaborators the generation manager
//! consumes, and nothing else:
//!
//! - [`ObjectStore`]: versioned read/write of object data with server-side
//!   version predicates, exclusive creation, object maintenance, and
//!   watch/notify on single objects.
//! - [`FifoClient`]: the FIFO part-log library (create, open, push, list,
//!   metadata).
//! - [`OmapLog`]: the OMAP structured-log primitives (header probe, list,
//!   append).
//!
//! The traits are runtime-agnostic and use `async_trait`. A complete
//! in-memory implementation, [`MemoryObjectStore`], lives here as well and
//! backs the tests of every crate in the workspace.

mod error;
pub mod fifo;
pub mod omap_log;
pub mod store;
mod version;

pub use error::{Error, Result};
pub use fifo::{FifoClient, FifoEntry, FifoInfo};
pub use omap_log::{OmapLog, OmapLogEntry, OmapLogHeader};
pub use store::{MemoryObjectStore, ObjectStore, WatchSink};
pub use version::{ObjectVersion, VERSION_TAG_LEN};
