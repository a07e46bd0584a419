//! Generation lifecycle coordination for sharded logs.
//!
//! A sharded append-only log's physical backing can change format over
//! time: each logical log is a numbered sequence of *generations*, every
//! generation a horizontally sharded set of objects backed either by an
//! OMAP structured log or by a FIFO part log. This crate keeps all
//! independent participants agreeing on that sequence.
//!
//! The authoritative state is a single metadata object holding the ordered
//! entries map under an opaque version. All mutation goes through bounded
//! compare-and-swap retries; a watch/notify channel on the object pulls
//! every other participant to the same view. [`LogBackingGenerations`] owns
//! the in-memory copy, probes shards to infer their backing on first
//! contact, appends generations on format rotation, marks drained prefixes
//! empty, and physically removes them once marked.
//!
//! Consumers implement [`GenerationsListener`] to name shard objects and to
//! receive `handle_init` / `handle_new_gens` / `handle_empty_to` callbacks.

mod error;
pub mod gen_map;
pub mod manager;
pub mod probe;

pub use error::{Error, Result};
pub use gen_map::{
    decode_generations, encode_generations, lowest_nonempty, BackingKind, Generation, Generations,
};
pub use manager::{GenerationsConfig, GenerationsListener, LogBackingGenerations};
pub use probe::{probe_shard, remove_generation, resolve_backing, ShardCheck};
