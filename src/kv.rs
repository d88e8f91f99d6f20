//! The hierarchical key/value store, including the session-lock operations.
//!
//! Keys are opaque strings; prefixes are a caller convention. Every removal
//! leaves a tombstone carrying the deletion index so that prefix queries keep
//! observing the delete until the tombstone is reaped (see
//! [`crate::tombstone`]).

use crate::db::{prefix_rows, WriteTxn, TABLE_KVS, TABLE_TOMBSTONES};
use crate::errors::{Result, StoreError};
use crate::store::StateStore;
use crate::types::DirEntry;

pub(crate) fn kvs_set_txn(txn: &mut WriteTxn, index: u64, mut entry: DirEntry) {
    match txn.tables.kvs.get(&entry.key) {
        Some(existing) => {
            entry.create_index = existing.create_index;
            // A plain set never steals or releases a lock.
            entry.lock_index = existing.lock_index;
            entry.session = existing.session.clone();
        }
        None => entry.create_index = index,
    }
    entry.modify_index = index;
    txn.tombstones_mut().remove(&entry.key);
    txn.events.touch_key(&entry.key);
    txn.mark(TABLE_KVS, index);
    txn.kvs_mut().insert(entry.key.clone(), entry);
}

/// Remove one live entry and leave a tombstone. Returns false (and mutates
/// nothing) when the key does not exist.
pub(crate) fn kvs_delete_txn(txn: &mut WriteTxn, index: u64, key: &str) -> bool {
    let Some(entry) = txn.kvs_mut().remove(key) else {
        return false;
    };
    if !entry.session.is_empty() {
        txn.kvs_by_session_mut()
            .remove(&(entry.session.clone(), key.to_string()));
    }
    txn.tombstones_mut().insert(key.to_string(), index);
    txn.mark(TABLE_TOMBSTONES, index);
    txn.mark(TABLE_KVS, index);
    txn.events.touch_key(key);
    txn.hint_gc(index);
    true
}

pub(crate) fn kvs_delete_tree_txn(txn: &mut WriteTxn, index: u64, prefix: &str) {
    let keys: Vec<String> = prefix_rows(&txn.tables.kvs, prefix)
        .map(|(k, _)| k.clone())
        .collect();
    // Nothing matched: neither table nor index row moves.
    if keys.is_empty() {
        return;
    }
    for key in &keys {
        kvs_delete_txn(txn, index, key);
    }
    txn.events.touch_subtree(prefix);
}

impl StateStore {
    /// Upsert a K/V entry. `create_index`, `lock_index` and the lock holder
    /// of an existing entry are preserved; a prior tombstone is removed.
    pub fn kvs_set(&self, index: u64, entry: DirEntry) {
        self.write(|txn| kvs_set_txn(txn, index, entry))
    }

    pub fn kvs_get(&self, key: &str) -> Option<DirEntry> {
        self.view().kvs.get(key).cloned()
    }

    /// Remove a key, writing a tombstone at `index`. Removing a key that
    /// does not exist is a no-op.
    pub fn kvs_delete(&self, index: u64, key: &str) {
        self.write(|txn| {
            kvs_delete_txn(txn, index, key);
        })
    }

    /// Check-and-set delete: succeeds when the key is already gone or its
    /// `modify_index` matches `cas_index`. Mutates only on success.
    pub fn kvs_delete_cas(&self, index: u64, cas_index: u64, key: &str) -> bool {
        self.write(|txn| {
            match txn.tables.kvs.get(key).map(|e| e.modify_index) {
                None => true,
                Some(stored) if stored == cas_index => {
                    kvs_delete_txn(txn, index, key);
                    true
                }
                Some(_) => false,
            }
        })
    }

    /// Remove every key under `prefix`, one tombstone per removal. When
    /// nothing matches, nothing moves.
    pub fn kvs_delete_tree(&self, index: u64, prefix: &str) {
        self.write(|txn| kvs_delete_tree_txn(txn, index, prefix))
    }

    /// Check-and-set upsert: succeeds when the entry does not exist and the
    /// request's `modify_index` is zero, or when it exists and the request's
    /// `modify_index` matches the stored one. Mutates only on success.
    pub fn kvs_set_cas(&self, index: u64, entry: DirEntry) -> bool {
        self.write(|txn| {
            let ok = match txn.tables.kvs.get(&entry.key) {
                None => entry.modify_index == 0,
                Some(existing) => entry.modify_index == existing.modify_index,
            };
            if ok {
                kvs_set_txn(txn, index, entry);
            }
            ok
        })
    }

    /// Acquire a lock for `entry.session`, creating the entry if needed.
    ///
    /// Returns `Ok(false)` when another session holds the key. `lock_index`
    /// is bumped only when the holder changes; re-locking by the current
    /// holder leaves it alone.
    pub fn kvs_lock(&self, index: u64, mut entry: DirEntry) -> Result<bool> {
        if entry.session.is_empty() {
            return Err(StoreError::MissingSession);
        }
        self.try_write(|txn| {
            if !txn.tables.sessions.contains_key(&entry.session) {
                return Err(StoreError::InvalidSession(entry.session.clone()));
            }
            match txn.tables.kvs.get(&entry.key) {
                Some(existing)
                    if !existing.session.is_empty() && existing.session != entry.session =>
                {
                    return Ok(false);
                }
                Some(existing) => {
                    entry.create_index = existing.create_index;
                    entry.lock_index = if existing.session == entry.session {
                        existing.lock_index
                    } else {
                        existing.lock_index + 1
                    };
                }
                None => {
                    entry.create_index = index;
                    entry.lock_index = 1;
                }
            }
            entry.modify_index = index;
            txn.kvs_by_session_mut()
                .insert((entry.session.clone(), entry.key.clone()));
            txn.tombstones_mut().remove(&entry.key);
            txn.events.touch_key(&entry.key);
            txn.mark(TABLE_KVS, index);
            txn.kvs_mut().insert(entry.key.clone(), entry);
            Ok(true)
        })
    }

    /// Release a lock held by `entry.session`. Returns `Ok(false)` without
    /// mutating when the key is missing or held by someone else;
    /// `lock_index` is preserved either way.
    pub fn kvs_unlock(&self, index: u64, mut entry: DirEntry) -> Result<bool> {
        if entry.session.is_empty() {
            return Err(StoreError::MissingSession);
        }
        self.try_write(|txn| {
            let Some(existing) = txn.tables.kvs.get(&entry.key) else {
                return Ok(false);
            };
            if existing.session != entry.session {
                return Ok(false);
            }
            let holder = existing.session.clone();
            entry.create_index = existing.create_index;
            entry.lock_index = existing.lock_index;
            entry.session = String::new();
            entry.modify_index = index;
            txn.kvs_by_session_mut()
                .remove(&(holder, entry.key.clone()));
            txn.events.touch_key(&entry.key);
            txn.mark(TABLE_KVS, index);
            txn.kvs_mut().insert(entry.key.clone(), entry);
            Ok(true)
        })
    }

    /// Live entries under `prefix`, with the prefix-scoped result index: the
    /// highest `modify_index` among matching live entries and the highest
    /// index among matching tombstones. When neither matches, the kvs table
    /// index row.
    pub fn kvs_list(&self, prefix: &str) -> (u64, Vec<DirEntry>) {
        let tables = self.view();
        let entries: Vec<DirEntry> = prefix_rows(&tables.kvs, prefix)
            .map(|(_, e)| e.clone())
            .collect();
        let idx = prefix_result_index(
            &tables,
            prefix,
            entries.iter().map(|e| e.modify_index).max(),
        );
        (idx, entries)
    }

    /// Keys under `prefix` in ascending order. A non-empty `separator`
    /// collapses everything past the first separator occurrence after the
    /// prefix into a single entry ending at that separator, giving
    /// directory-listing semantics. The result index follows
    /// [`kvs_list`](Self::kvs_list).
    pub fn kvs_list_keys(&self, prefix: &str, separator: &str) -> (u64, Vec<String>) {
        let tables = self.view();
        let mut keys: Vec<String> = Vec::new();
        let mut live_max = None::<u64>;
        for (key, entry) in prefix_rows(&tables.kvs, prefix) {
            live_max = Some(live_max.map_or(entry.modify_index, |m| m.max(entry.modify_index)));
            let collapsed = if separator.is_empty() {
                key.clone()
            } else {
                match key[prefix.len()..].find(separator) {
                    Some(at) => key[..prefix.len() + at + separator.len()].to_string(),
                    None => key.clone(),
                }
            };
            // Input keys are sorted and collapsing preserves order, so
            // duplicates are always adjacent.
            if keys.last() != Some(&collapsed) {
                keys.push(collapsed);
            }
        }
        (prefix_result_index(&tables, prefix, live_max), keys)
    }
}

fn prefix_result_index(
    tables: &crate::db::Tables,
    prefix: &str,
    live_max: Option<u64>,
) -> u64 {
    let tomb_max = prefix_rows(&tables.tombstones, prefix)
        .map(|(_, index)| *index)
        .max();
    match (live_max, tomb_max) {
        (None, None) => tables.table_index(TABLE_KVS),
        (live, tomb) => live.unwrap_or(0).max(tomb.unwrap_or(0)),
    }
}
