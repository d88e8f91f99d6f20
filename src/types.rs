use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health check states. Stored as plain strings so they round-trip through
/// the log and snapshot encodings unchanged.
pub const HEALTH_PASSING: &str = "passing";
pub const HEALTH_WARNING: &str = "warning";
pub const HEALTH_CRITICAL: &str = "critical";
/// Pseudo-state accepted by [`crate::StateStore::checks_in_state`] to bypass
/// the status filter.
pub const HEALTH_ANY: &str = "any";

/// What happens to a session's held keys when the session is destroyed.
pub const BEHAVIOR_RELEASE: &str = "release";
pub const BEHAVIOR_DELETE: &str = "delete";

/// A member node of the cluster catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    /// Content equality, ignoring the index stamps.
    pub(crate) fn same_content(&self, other: &Node) -> bool {
        self.name == other.name && self.address == other.address
    }
}

/// A service instance registered against a node. Keyed by `(node, id)`; the
/// `name` is the logical service name shared across instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Service {
    pub(crate) fn same_content(&self, other: &Service) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.tags == other.tags
            && self.address == other.address
            && self.port == other.port
    }
}

/// A health check registered against a node, optionally attached to one of
/// the node's services via `service_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    pub name: String,
    pub status: String,
    pub notes: String,
    pub output: String,
    pub service_id: String,
    pub service_name: String,
    pub create_index: u64,
    pub modify_index: u64,
}

impl HealthCheck {
    pub(crate) fn same_content(&self, other: &HealthCheck) -> bool {
        self.node == other.node
            && self.check_id == other.check_id
            && self.name == other.name
            && self.status == other.status
            && self.notes == other.notes
            && self.output == other.output
            && self.service_id == other.service_id
            && self.service_name == other.service_name
    }
}

/// A key/value directory entry.
///
/// An empty `session` means the entry is unheld; `lock_index` counts holder
/// transitions and survives releases.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u64,
    pub session: String,
    pub lock_index: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl DirEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirEntry")
            .field("key", &self.key)
            .field("value_len", &self.value.len())
            .field("flags", &self.flags)
            .field("session", &self.session)
            .field("lock_index", &self.lock_index)
            .field("create_index", &self.create_index)
            .field("modify_index", &self.modify_index)
            .finish()
    }
}

/// Marker remembering the log index at which a key was deleted, so range
/// queries can observe the deletion until the marker is reaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: String,
    pub index: u64,
}

/// An ephemeral coordination object bound to a node and zero or more checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub node: String,
    pub checks: Vec<String>,
    pub behavior: String,
    pub ttl: Option<Duration>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// An access-control record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub id: String,
    pub name: String,
    pub acl_type: String,
    pub rules: String,
    pub create_index: u64,
    pub modify_index: u64,
}

/// A node together with its registered services, as returned by
/// [`crate::StateStore::node_services`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServices {
    pub node: Node,
    pub services: BTreeMap<String, Service>,
}

/// One `{node, service, checks}` triple of the
/// [`crate::StateStore::check_service_nodes`] join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: Service,
    pub checks: Vec<HealthCheck>,
}

/// Everything registered against a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    pub address: String,
    pub services: Vec<Service>,
    pub checks: Vec<HealthCheck>,
}
