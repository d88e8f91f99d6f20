//! The log-apply wire surface.
//!
//! Every command handed to [`crate::StateStore::apply`] is a single message
//! type byte followed by a bincode-encoded request record. The high bit of
//! the type byte marks commands that older versions may safely skip.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Acl, DirEntry, HealthCheck, Service, Session};

/// First byte of every command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Register = 0,
    Deregister = 1,
    Kvs = 2,
    Session = 3,
    Acl = 4,
    Tombstone = 5,
}

/// When set on the message type byte, unknown types are logged and skipped
/// instead of halting the store.
pub const IGNORE_UNKNOWN_TYPE_FLAG: u8 = 0x80;

impl MessageType {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Register),
            1 => Some(Self::Deregister),
            2 => Some(Self::Kvs),
            3 => Some(Self::Session),
            4 => Some(Self::Acl),
            5 => Some(Self::Tombstone),
            _ => None,
        }
    }
}

/// K/V operations, as carried in [`KvsRequest::op`].
pub const KVS_SET: &str = "set";
pub const KVS_DELETE: &str = "delete";
pub const KVS_DELETE_CAS: &str = "delete-cas";
pub const KVS_DELETE_TREE: &str = "delete-tree";
pub const KVS_CAS: &str = "cas";
pub const KVS_LOCK: &str = "lock";
pub const KVS_UNLOCK: &str = "unlock";

/// Session operations, as carried in [`SessionRequest::op`].
pub const SESSION_CREATE: &str = "create";
pub const SESSION_DESTROY: &str = "destroy";

/// ACL operations, as carried in [`AclRequest::op`].
pub const ACL_SET: &str = "set";
pub const ACL_FORCE_SET: &str = "force-set";
pub const ACL_DELETE: &str = "delete";

/// Tombstone operations, as carried in [`TombstoneRequest::op`].
pub const TOMBSTONE_REAP: &str = "reap";

/// Catalog upsert: the node, then optionally one service, one top-level
/// check, and any number of additional checks, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node: String,
    pub address: String,
    pub service: Option<Service>,
    pub check: Option<HealthCheck>,
    pub checks: Vec<HealthCheck>,
}

impl RegisterRequest {
    pub fn node(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }
}

/// Catalog removal. A non-empty `service_id` removes that service (and its
/// checks); otherwise a non-empty `check_id` removes that check; otherwise
/// the whole node is removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub node: String,
    pub service_id: String,
    pub check_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvsRequest {
    pub op: String,
    pub entry: DirEntry,
}

impl KvsRequest {
    pub fn new(op: &str, entry: DirEntry) -> Self {
        Self { op: op.to_string(), entry }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub op: String,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRequest {
    pub op: String,
    pub acl: Acl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TombstoneRequest {
    pub op: String,
    pub reap_index: u64,
}

impl TombstoneRequest {
    /// The command the log layer builds from a [`crate::TombstoneGc`] expiry.
    pub fn reap(reap_index: u64) -> Self {
        Self {
            op: TOMBSTONE_REAP.to_string(),
            reap_index,
        }
    }
}

/// Build a command buffer: `[type byte][bincode payload]`.
pub fn encode<T: Serialize>(
    msg: MessageType,
    body: &T,
) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let mut buf = vec![msg as u8];
    buf.extend(bincode::serde::encode_to_vec(body, bincode::config::standard())?);
    Ok(buf)
}

/// Decode a command payload. The log is authoritative: a payload that fails
/// to decode means corruption or version skew, and the store must halt.
pub(crate) fn decode<T: DeserializeOwned>(buf: &[u8]) -> T {
    match bincode::serde::decode_from_slice(buf, bincode::config::standard()) {
        Ok((body, _)) => body,
        Err(err) => panic!("failed to decode command payload: {err}"),
    }
}
