//! TideStore - the replicated state store behind a coordination service
//!
//! TideStore is a Rust library that provides the deterministic, in-memory,
//! transactionally consistent state machine a replicated log drives: a
//! multi-table store for a service catalog, a hierarchical key/value tree
//! with session locks, ephemeral sessions, ACL records, and the tombstone
//! and watch machinery blocking queries are built on.
//!
//! # Key Features
//!
//! - **Single-writer, multi-reader**: one write transaction at a time,
//!   driven by the log in commit order; reads run against immutable
//!   snapshots and never block the writer
//! - **Monotonic result indexes**: every query returns an index reflecting
//!   the newest relevant write, including tombstoned deletes
//! - **One-shot watches**: table, key-prefix (radix) and per-key watch sets,
//!   fired strictly after the commit that touched them
//! - **Cascading invalidation**: deleting a node, service or check destroys
//!   the sessions that depended on it, releasing or deleting their locks
//! - **Snapshot/restore**: stream the live state without stopping reads and
//!   rebuild an identical store from the stream
//! - **Embeddable**: core only - the replicated log, transports and
//!   leadership belong to the embedding layer
//!
//! # Quick Start
//!
//! ```rust
//! use tidestore::commands::{self, KvsRequest, MessageType, KVS_SET};
//! use tidestore::types::DirEntry;
//! use tidestore::{ApplyOutcome, StateStore};
//!
//! let store = StateStore::new();
//!
//! // Apply a committed log command: set a key at log index 1.
//! let cmd = commands::encode(
//!     MessageType::Kvs,
//!     &KvsRequest::new(KVS_SET, DirEntry::new("config/rate", b"100".to_vec())),
//! )
//! .unwrap();
//! assert_eq!(store.apply(1, &cmd).unwrap(), ApplyOutcome::None);
//!
//! let (idx, entries) = store.kvs_list("config/");
//! assert_eq!(idx, 1);
//! assert_eq!(entries[0].value, b"100");
//! ```
//!
//! # Architecture
//!
//! Every mutation arrives through [`StateStore::apply`] tagged with the log
//! index that committed it. Apply opens one write transaction, performs the
//! mutations, raises the per-table index rows, arms the watches for the
//! touched domains, and publishes the new table root atomically; watch
//! notifications are released only after the commit is visible.
//!
//! The types you'll work with:
//! - [`StateStore`] - the store itself; apply, reads, watch subscriptions
//! - [`commands`] - the wire surface of the log-apply path
//! - [`StateSnapshot`] - a frozen view for streaming to the log layer
//! - [`TombstoneGc`] - suggests tombstone reaps for the log to propose
//!
//! # Non-goals
//!
//! TideStore intentionally does NOT provide:
//! - The replicated log, leader election or any network transport
//! - On-disk durability (the log layer persists the WAL and snapshots)
//! - SQL-style query planning
//! - Transactions spanning multiple applied commands
//! - Cross-datacenter replication

pub mod commands;
pub mod errors;
pub mod types;

mod acl;
mod catalog;
mod db;
mod kv;
mod session;
mod snapshot;
mod store;
mod tombstone;
mod watch;

pub use db::{
    TABLE_ACLS, TABLE_CHECKS, TABLE_KVS, TABLE_NODES, TABLE_SERVICES, TABLE_SESSIONS,
    TABLE_TOMBSTONES,
};
pub use errors::{Result, StoreError};
pub use snapshot::StateSnapshot;
pub use store::{ApplyOutcome, StateStore};
pub use tombstone::TombstoneGc;
