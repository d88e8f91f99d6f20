use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::commands::{
    self, AclRequest, DeregisterRequest, KvsRequest, MessageType, RegisterRequest,
    SessionRequest, TombstoneRequest, ACL_DELETE, ACL_FORCE_SET, ACL_SET,
    IGNORE_UNKNOWN_TYPE_FLAG, KVS_CAS, KVS_DELETE, KVS_DELETE_CAS, KVS_DELETE_TREE, KVS_LOCK,
    KVS_SET, KVS_UNLOCK, SESSION_CREATE, SESSION_DESTROY, TOMBSTONE_REAP,
};
use crate::db::{Tables, WriteTxn, ALL_TABLES};
use crate::errors::{Result, StoreError};
use crate::tombstone::TombstoneGc;
use crate::watch::WatchManager;

/// Value returned by [`StateStore::apply`] to the log driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Success with no payload.
    None,
    /// Result of a CAS-like K/V operation.
    Bool(bool),
    /// The id of the session or ACL a create/set command installed.
    Id(String),
}

/// The deterministic state machine behind the replicated log.
///
/// All writes arrive through [`apply`](Self::apply) (or the per-domain write
/// methods it dispatches to), one at a time, tagged with the log index that
/// committed them. Reads run against an immutable snapshot of the tables and
/// never block the writer; see the module docs of [`crate::db`].
#[derive(Debug)]
pub struct StateStore {
    root: RwLock<Arc<Tables>>,
    /// Serialises write transactions; held across build-mutate-commit.
    writer: Mutex<()>,
    watches: WatchManager,
    gc: Option<Arc<TombstoneGc>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Arc::new(Tables::default())),
            writer: Mutex::new(()),
            watches: WatchManager::default(),
            gc: None,
        }
    }

    /// A store whose tombstone writes hint the given garbage collector.
    pub fn with_gc(gc: Arc<TombstoneGc>) -> Self {
        Self {
            gc: Some(gc),
            ..Self::new()
        }
    }

    /// The current version of the tables. The returned handle stays
    /// consistent for as long as the caller keeps it.
    pub(crate) fn view(&self) -> Arc<Tables> {
        self.root.read().expect("table root lock poisoned").clone()
    }

    /// The last log index that changed anything in the store.
    pub fn last_index(&self) -> u64 {
        self.view().last_index()
    }

    /// Highest index row among the named tables.
    pub fn max_index(&self, tables: &[&str]) -> u64 {
        self.view().max_index(tables)
    }

    /// Run an infallible write transaction.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut WriteTxn) -> R) -> R {
        let _guard = self.writer.lock().expect("writer lock poisoned");
        let mut txn = WriteTxn::new((*self.view()).clone());
        let out = f(&mut txn);
        self.commit(txn);
        out
    }

    /// Run a write transaction that may abort. On error nothing is
    /// published, no index row moves and no watch fires.
    pub(crate) fn try_write<R>(&self, f: impl FnOnce(&mut WriteTxn) -> Result<R>) -> Result<R> {
        let _guard = self.writer.lock().expect("writer lock poisoned");
        let mut txn = WriteTxn::new((*self.view()).clone());
        let out = f(&mut txn)?;
        self.commit(txn);
        Ok(out)
    }

    fn commit(&self, txn: WriteTxn) {
        let WriteTxn {
            tables,
            events,
            gc_hint,
        } = txn;
        *self.root.write().expect("table root lock poisoned") = Arc::new(tables);
        // Notifications are released only now, so a woken subscriber always
        // reads a snapshot at least as new as the commit that fired it.
        self.watches.fire(events);
        if let (Some(gc), Some(index)) = (self.gc.as_ref(), gc_hint) {
            gc.hint(index);
        }
    }

    /// Subscribe to the next committed mutation of a table.
    ///
    /// # Panics
    ///
    /// Panics on a table name the store does not have.
    pub fn watch_table(&self, table: &str) -> watch::Receiver<()> {
        let canonical = ALL_TABLES
            .iter()
            .copied()
            .find(|t| *t == table)
            .unwrap_or_else(|| panic!("unknown table '{table}'"));
        self.watches.watch_table(canonical)
    }

    /// Subscribe to the next committed K/V mutation under a key prefix.
    pub fn watch_prefix(&self, prefix: &str) -> watch::Receiver<()> {
        self.watches.watch_prefix(prefix)
    }

    /// Subscribe to the next committed K/V mutation of one key.
    pub fn watch_key(&self, key: &str) -> watch::Receiver<()> {
        self.watches.watch_key(key)
    }

    /// Apply one committed log command.
    ///
    /// `buf` is a message type byte followed by a bincode payload (see
    /// [`crate::commands`]). Precondition failures come back as `Err` and
    /// leave no trace in the store. A payload that cannot be decoded, or an
    /// unknown type without [`IGNORE_UNKNOWN_TYPE_FLAG`], panics: the log is
    /// authoritative and a malformed command means corruption or version
    /// skew.
    pub fn apply(&self, index: u64, buf: &[u8]) -> Result<ApplyOutcome> {
        let Some((&type_byte, payload)) = buf.split_first() else {
            panic!("failed to apply command: empty buffer");
        };
        let ignore_unknown = type_byte & IGNORE_UNKNOWN_TYPE_FLAG != 0;
        let raw_type = type_byte & !IGNORE_UNKNOWN_TYPE_FLAG;

        match MessageType::from_byte(raw_type) {
            Some(MessageType::Register) => {
                let req: RegisterRequest = commands::decode(payload);
                debug!(node = %req.node, "apply register");
                self.ensure_registration(index, &req)?;
                Ok(ApplyOutcome::None)
            }
            Some(MessageType::Deregister) => {
                let req: DeregisterRequest = commands::decode(payload);
                debug!(node = %req.node, "apply deregister");
                if !req.service_id.is_empty() {
                    self.delete_service(index, &req.node, &req.service_id);
                } else if !req.check_id.is_empty() {
                    self.delete_check(index, &req.node, &req.check_id);
                } else {
                    self.delete_node(index, &req.node);
                }
                Ok(ApplyOutcome::None)
            }
            Some(MessageType::Kvs) => {
                let req: KvsRequest = commands::decode(payload);
                self.apply_kvs(index, req)
            }
            Some(MessageType::Session) => {
                let req: SessionRequest = commands::decode(payload);
                self.apply_session(index, req)
            }
            Some(MessageType::Acl) => {
                let req: AclRequest = commands::decode(payload);
                self.apply_acl(index, req)
            }
            Some(MessageType::Tombstone) => {
                let req: TombstoneRequest = commands::decode(payload);
                self.apply_tombstone(req)
            }
            None => {
                if ignore_unknown {
                    warn!(
                        message_type = raw_type,
                        "ignoring unknown command type, upgrade to a newer version"
                    );
                    Ok(ApplyOutcome::None)
                } else {
                    panic!("failed to apply command: unknown message type {raw_type}");
                }
            }
        }
    }

    fn apply_kvs(&self, index: u64, req: KvsRequest) -> Result<ApplyOutcome> {
        debug!(op = %req.op, key = %req.entry.key, "apply kvs");
        match req.op.as_str() {
            KVS_SET => {
                self.kvs_set(index, req.entry);
                Ok(ApplyOutcome::None)
            }
            KVS_DELETE => {
                self.kvs_delete(index, &req.entry.key);
                Ok(ApplyOutcome::None)
            }
            KVS_DELETE_CAS => Ok(ApplyOutcome::Bool(self.kvs_delete_cas(
                index,
                req.entry.modify_index,
                &req.entry.key,
            ))),
            KVS_DELETE_TREE => {
                self.kvs_delete_tree(index, &req.entry.key);
                Ok(ApplyOutcome::None)
            }
            KVS_CAS => Ok(ApplyOutcome::Bool(self.kvs_set_cas(index, req.entry))),
            KVS_LOCK => Ok(ApplyOutcome::Bool(self.kvs_lock(index, req.entry)?)),
            KVS_UNLOCK => Ok(ApplyOutcome::Bool(self.kvs_unlock(index, req.entry)?)),
            other => {
                warn!(op = %other, "invalid KVS operation");
                Err(StoreError::UnknownKvsOp(other.to_string()))
            }
        }
    }

    fn apply_session(&self, index: u64, req: SessionRequest) -> Result<ApplyOutcome> {
        debug!(op = %req.op, session = %req.session.id, "apply session");
        match req.op.as_str() {
            SESSION_CREATE => {
                let id = req.session.id.clone();
                self.session_create(index, req.session)?;
                Ok(ApplyOutcome::Id(id))
            }
            SESSION_DESTROY => {
                self.session_destroy(index, &req.session.id);
                Ok(ApplyOutcome::None)
            }
            other => {
                warn!(op = %other, "invalid session operation");
                Err(StoreError::UnknownSessionOp(other.to_string()))
            }
        }
    }

    fn apply_acl(&self, index: u64, req: AclRequest) -> Result<ApplyOutcome> {
        debug!(op = %req.op, acl = %req.acl.id, "apply acl");
        match req.op.as_str() {
            ACL_SET | ACL_FORCE_SET => {
                let id = req.acl.id.clone();
                self.acl_set(index, req.acl)?;
                Ok(ApplyOutcome::Id(id))
            }
            ACL_DELETE => {
                self.acl_delete(index, &req.acl.id);
                Ok(ApplyOutcome::None)
            }
            other => {
                warn!(op = %other, "invalid ACL operation");
                Err(StoreError::UnknownAclOp(other.to_string()))
            }
        }
    }

    fn apply_tombstone(&self, req: TombstoneRequest) -> Result<ApplyOutcome> {
        debug!(op = %req.op, reap_index = req.reap_index, "apply tombstone");
        match req.op.as_str() {
            TOMBSTONE_REAP => {
                self.reap_tombstones(req.reap_index);
                Ok(ApplyOutcome::None)
            }
            other => {
                warn!(op = %other, "invalid tombstone operation");
                Err(StoreError::UnknownTombstoneOp(other.to_string()))
            }
        }
    }
}
