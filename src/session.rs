//! Sessions: ephemeral objects bound to a node and a set of healthy checks,
//! owning lock holdership over K/V entries.
//!
//! Destruction — explicit, or cascaded from losing the node or any
//! referenced check — walks the session's holdings (via the `kvs_by_session`
//! relation, so the scan is proportional to what the session holds) and
//! applies the session's behaviour: `release` clears the holder, `delete`
//! removes the entries and leaves tombstones.

use tracing::debug;

use crate::db::{pairs_with_first, WriteTxn, TABLE_KVS, TABLE_SESSIONS};
use crate::errors::{Result, StoreError};
use crate::kv::kvs_delete_txn;
use crate::store::StateStore;
use crate::types::{Session, BEHAVIOR_DELETE, BEHAVIOR_RELEASE, HEALTH_CRITICAL};

pub(crate) fn session_create_txn(txn: &mut WriteTxn, index: u64, mut session: Session) -> Result<()> {
    if session.id.is_empty() {
        return Err(StoreError::MissingSessionId);
    }
    if session.behavior.is_empty() {
        session.behavior = BEHAVIOR_RELEASE.to_string();
    } else if session.behavior != BEHAVIOR_RELEASE && session.behavior != BEHAVIOR_DELETE {
        return Err(StoreError::InvalidSessionBehavior(session.behavior));
    }
    if !txn.tables.nodes.contains_key(&session.node) {
        return Err(StoreError::MissingNode);
    }
    for check_id in &session.checks {
        let key = (session.node.clone(), check_id.clone());
        let Some(check) = txn.tables.checks.get(&key) else {
            return Err(StoreError::MissingCheck(check_id.clone()));
        };
        if check.status == HEALTH_CRITICAL {
            return Err(StoreError::CriticalCheck(check_id.clone()));
        }
    }

    session.create_index = index;
    session.modify_index = index;
    txn.sessions_by_node_mut()
        .insert((session.node.clone(), session.id.clone()));
    for check_id in &session.checks {
        txn.session_checks_mut().insert((
            session.node.clone(),
            check_id.clone(),
            session.id.clone(),
        ));
    }
    txn.sessions_mut().insert(session.id.clone(), session);
    txn.mark(TABLE_SESSIONS, index);
    Ok(())
}

/// Destroy a session, whatever the cause, applying its behaviour to every
/// K/V entry it holds. Held keys are processed in ascending key order so the
/// tombstone writes of a `delete` session land deterministically. A session
/// that does not exist is a no-op.
pub(crate) fn invalidate_session_txn(txn: &mut WriteTxn, index: u64, session_id: &str) {
    let Some(session) = txn.sessions_mut().remove(session_id) else {
        return;
    };
    txn.sessions_by_node_mut()
        .remove(&(session.node.clone(), session_id.to_string()));
    for check_id in &session.checks {
        txn.session_checks_mut().remove(&(
            session.node.clone(),
            check_id.clone(),
            session_id.to_string(),
        ));
    }

    let held: Vec<String> = pairs_with_first(&txn.tables.kvs_by_session, session_id)
        .map(|(_, key)| key.clone())
        .collect();
    if !held.is_empty() {
        debug!(session = %session_id, behavior = %session.behavior, held = held.len(),
            "applying session behavior to held entries");
    }
    if session.behavior == BEHAVIOR_DELETE {
        for key in &held {
            kvs_delete_txn(txn, index, key);
        }
    } else {
        for key in &held {
            if let Some(entry) = txn.kvs_mut().get_mut(key) {
                entry.session.clear();
                entry.modify_index = index;
            }
            txn.kvs_by_session_mut()
                .remove(&(session_id.to_string(), key.clone()));
            txn.events.touch_key(key);
        }
        if !held.is_empty() {
            txn.mark(TABLE_KVS, index);
        }
    }
    txn.mark(TABLE_SESSIONS, index);
}

impl StateStore {
    /// Register a session. Fails when the id is empty, the behaviour string
    /// is unknown, the node is unknown, or any referenced check is unknown
    /// or critical. An empty behaviour defaults to `release`.
    pub fn session_create(&self, index: u64, session: Session) -> Result<()> {
        self.try_write(|txn| session_create_txn(txn, index, session))
    }

    pub fn session_get(&self, id: &str) -> Option<Session> {
        self.view().sessions.get(id).cloned()
    }

    /// All sessions with the sessions table's result index.
    pub fn session_list(&self) -> (u64, Vec<Session>) {
        let tables = self.view();
        (
            tables.table_index(TABLE_SESSIONS),
            tables.sessions.values().cloned().collect(),
        )
    }

    /// Sessions bound to one node.
    pub fn node_sessions(&self, node: &str) -> (u64, Vec<Session>) {
        let tables = self.view();
        let sessions: Vec<Session> = pairs_with_first(&tables.sessions_by_node, node)
            .filter_map(|(_, id)| tables.sessions.get(id).cloned())
            .collect();
        let row_max = sessions.iter().map(|s| s.modify_index).max().unwrap_or(0);
        (tables.table_index(TABLE_SESSIONS).max(row_max), sessions)
    }

    /// Destroy a session explicitly. Destroying a session that does not
    /// exist is a no-op.
    pub fn session_destroy(&self, index: u64, id: &str) {
        self.write(|txn| invalidate_session_txn(txn, index, id))
    }
}
