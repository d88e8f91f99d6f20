//! Access-control records: by-id upserts and deletes, no cascades.

use crate::db::{WriteTxn, TABLE_ACLS};
use crate::errors::{Result, StoreError};
use crate::store::StateStore;
use crate::types::Acl;

pub(crate) fn acl_set_txn(txn: &mut WriteTxn, index: u64, mut acl: Acl) -> Result<()> {
    if acl.id.is_empty() {
        return Err(StoreError::MissingAclId);
    }
    match txn.tables.acls.get(&acl.id) {
        Some(existing) => acl.create_index = existing.create_index,
        None => acl.create_index = index,
    }
    acl.modify_index = index;
    txn.acls_mut().insert(acl.id.clone(), acl);
    txn.mark(TABLE_ACLS, index);
    Ok(())
}

pub(crate) fn acl_delete_txn(txn: &mut WriteTxn, index: u64, id: &str) {
    if txn.acls_mut().remove(id).is_some() {
        txn.mark(TABLE_ACLS, index);
    }
}

impl StateStore {
    /// Upsert an ACL, preserving `create_index`. Fails on an empty id.
    pub fn acl_set(&self, index: u64, acl: Acl) -> Result<()> {
        self.try_write(|txn| acl_set_txn(txn, index, acl))
    }

    pub fn acl_get(&self, id: &str) -> Option<Acl> {
        self.view().acls.get(id).cloned()
    }

    /// All ACLs with the acls table's result index.
    pub fn acl_list(&self) -> (u64, Vec<Acl>) {
        let tables = self.view();
        (
            tables.table_index(TABLE_ACLS),
            tables.acls.values().cloned().collect(),
        )
    }

    /// Remove an ACL. Removing one that does not exist is a no-op.
    pub fn acl_delete(&self, index: u64, id: &str) {
        self.write(|txn| acl_delete_txn(txn, index, id))
    }
}
