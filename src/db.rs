//! The in-memory multi-table core.
//!
//! Each domain lives in an `Arc`-wrapped ordered map so that a write
//! transaction can copy only the tables it touches (`Arc::make_mut`) and
//! publish the whole set atomically, while read transactions keep a cheap
//! clone of the previous root for as long as they like. Readers never block
//! the writer and the writer never blocks readers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::types::{Acl, DirEntry, HealthCheck, Node, Service, Session};
use crate::watch::WatchEvents;

pub const TABLE_NODES: &str = "nodes";
pub const TABLE_SERVICES: &str = "services";
pub const TABLE_CHECKS: &str = "checks";
pub const TABLE_KVS: &str = "kvs";
pub const TABLE_TOMBSTONES: &str = "tombstones";
pub const TABLE_SESSIONS: &str = "sessions";
pub const TABLE_ACLS: &str = "acls";

pub(crate) const ALL_TABLES: [&str; 7] = [
    TABLE_NODES,
    TABLE_SERVICES,
    TABLE_CHECKS,
    TABLE_KVS,
    TABLE_TOMBSTONES,
    TABLE_SESSIONS,
    TABLE_ACLS,
];

/// One immutable version of the whole database. Cloning is cheap: every
/// table is behind its own `Arc`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    /// node name → node
    pub nodes: Arc<BTreeMap<String, Node>>,
    /// (node, service id) → service
    pub services: Arc<BTreeMap<(String, String), Service>>,
    /// (service name, node, service id)
    pub services_by_name: Arc<BTreeSet<(String, String, String)>>,
    /// (node, check id) → check
    pub checks: Arc<BTreeMap<(String, String), HealthCheck>>,
    /// (service name, node, check id)
    pub checks_by_service: Arc<BTreeSet<(String, String, String)>>,
    /// (status, node, check id)
    pub checks_by_status: Arc<BTreeSet<(String, String, String)>>,
    /// key → live entry
    pub kvs: Arc<BTreeMap<String, DirEntry>>,
    /// (session id, key) — lock holdings, the session_checks analogue for
    /// K/V entries; keeps session destruction O(held keys)
    pub kvs_by_session: Arc<BTreeSet<(String, String)>>,
    /// key → index at which the live entry was removed
    pub tombstones: Arc<BTreeMap<String, u64>>,
    /// session id → session
    pub sessions: Arc<BTreeMap<String, Session>>,
    /// (node, session id)
    pub sessions_by_node: Arc<BTreeSet<(String, String)>>,
    /// (node, check id, session id)
    pub session_checks: Arc<BTreeSet<(String, String, String)>>,
    /// acl id → acl
    pub acls: Arc<BTreeMap<String, Acl>>,
    /// table name → last log index that mutated the table
    pub index: Arc<BTreeMap<String, u64>>,
}

impl Tables {
    pub(crate) fn table_index(&self, table: &str) -> u64 {
        self.index.get(table).copied().unwrap_or(0)
    }

    /// Highest index row among the named tables.
    pub(crate) fn max_index(&self, tables: &[&str]) -> u64 {
        tables
            .iter()
            .map(|t| self.table_index(t))
            .max()
            .unwrap_or(0)
    }

    /// Highest index row across every table: the last log index that
    /// changed anything.
    pub(crate) fn last_index(&self) -> u64 {
        self.index.values().copied().max().unwrap_or(0)
    }
}

/// Iterate the rows of a `(node, id)`-keyed table belonging to one node,
/// in ascending id order.
pub(crate) fn node_rows<'a, V>(
    map: &'a BTreeMap<(String, String), V>,
    node: &'a str,
) -> impl Iterator<Item = (&'a (String, String), &'a V)> {
    map.range((node.to_string(), String::new())..)
        .take_while(move |((n, _), _)| n == node)
}

/// Iterate the members of a triple set whose first element matches.
pub(crate) fn triples_with_first<'a>(
    set: &'a BTreeSet<(String, String, String)>,
    first: &'a str,
) -> impl Iterator<Item = &'a (String, String, String)> {
    set.range((first.to_string(), String::new(), String::new())..)
        .take_while(move |(a, _, _)| a == first)
}

/// Iterate the members of a triple set whose first two elements match.
pub(crate) fn triples_with_pair<'a>(
    set: &'a BTreeSet<(String, String, String)>,
    first: &'a str,
    second: &'a str,
) -> impl Iterator<Item = &'a (String, String, String)> {
    set.range((first.to_string(), second.to_string(), String::new())..)
        .take_while(move |(a, b, _)| a == first && b == second)
}

/// Iterate the members of a pair set whose first element matches.
pub(crate) fn pairs_with_first<'a>(
    set: &'a BTreeSet<(String, String)>,
    first: &'a str,
) -> impl Iterator<Item = &'a (String, String)> {
    set.range((first.to_string(), String::new())..)
        .take_while(move |(a, _)| a == first)
}

/// Iterate the entries of a string-keyed map under a key prefix.
pub(crate) fn prefix_rows<'a, V>(
    map: &'a BTreeMap<String, V>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a V)> {
    map.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

/// The single in-flight write transaction: a working copy of the tables,
/// the notifications to release on commit, and the tombstone-GC hint to
/// deliver once the commit is visible. Dropping the transaction without
/// committing discards all three.
#[derive(Debug)]
pub(crate) struct WriteTxn {
    pub(crate) tables: Tables,
    pub(crate) events: WatchEvents,
    pub(crate) gc_hint: Option<u64>,
}

impl WriteTxn {
    pub(crate) fn new(tables: Tables) -> Self {
        Self {
            tables,
            events: WatchEvents::default(),
            gc_hint: None,
        }
    }

    /// Raise a table's index row and arm its table watch. Every committed
    /// mutation to a domain goes through here.
    pub(crate) fn mark(&mut self, table: &'static str, index: u64) {
        self.bump_index(table, index);
        self.events.touch_table(table);
    }

    /// Raise a table's index row without arming watches. Used by reap,
    /// which removes bookkeeping rather than data a subscriber waits on.
    pub(crate) fn bump_index(&mut self, table: &str, index: u64) {
        let rows = Arc::make_mut(&mut self.tables.index);
        let row = rows.entry(table.to_string()).or_insert(0);
        *row = (*row).max(index);
    }

    /// Record the highest tombstone index written by this transaction so the
    /// GC can be hinted after commit.
    pub(crate) fn hint_gc(&mut self, index: u64) {
        self.gc_hint = Some(self.gc_hint.map_or(index, |cur| cur.max(index)));
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut BTreeMap<String, Node> {
        Arc::make_mut(&mut self.tables.nodes)
    }

    pub(crate) fn services_mut(&mut self) -> &mut BTreeMap<(String, String), Service> {
        Arc::make_mut(&mut self.tables.services)
    }

    pub(crate) fn services_by_name_mut(&mut self) -> &mut BTreeSet<(String, String, String)> {
        Arc::make_mut(&mut self.tables.services_by_name)
    }

    pub(crate) fn checks_mut(&mut self) -> &mut BTreeMap<(String, String), HealthCheck> {
        Arc::make_mut(&mut self.tables.checks)
    }

    pub(crate) fn checks_by_service_mut(&mut self) -> &mut BTreeSet<(String, String, String)> {
        Arc::make_mut(&mut self.tables.checks_by_service)
    }

    pub(crate) fn checks_by_status_mut(&mut self) -> &mut BTreeSet<(String, String, String)> {
        Arc::make_mut(&mut self.tables.checks_by_status)
    }

    pub(crate) fn kvs_mut(&mut self) -> &mut BTreeMap<String, DirEntry> {
        Arc::make_mut(&mut self.tables.kvs)
    }

    pub(crate) fn kvs_by_session_mut(&mut self) -> &mut BTreeSet<(String, String)> {
        Arc::make_mut(&mut self.tables.kvs_by_session)
    }

    pub(crate) fn tombstones_mut(&mut self) -> &mut BTreeMap<String, u64> {
        Arc::make_mut(&mut self.tables.tombstones)
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut BTreeMap<String, Session> {
        Arc::make_mut(&mut self.tables.sessions)
    }

    pub(crate) fn sessions_by_node_mut(&mut self) -> &mut BTreeSet<(String, String)> {
        Arc::make_mut(&mut self.tables.sessions_by_node)
    }

    pub(crate) fn session_checks_mut(&mut self) -> &mut BTreeSet<(String, String, String)> {
        Arc::make_mut(&mut self.tables.session_checks)
    }

    pub(crate) fn acls_mut(&mut self) -> &mut BTreeMap<String, Acl> {
        Arc::make_mut(&mut self.tables.acls)
    }
}
