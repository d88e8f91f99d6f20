//! Catalog: nodes, the services registered on them, and their health checks.
//!
//! Upserts preserve `create_index` and skip entirely when the stored content
//! already matches. Deletes cascade downward (node → services → checks) and
//! invalidate sessions that referenced the removed entities. Deleting
//! something that does not exist is a silent no-op that moves no index.

use std::collections::BTreeSet;

use tracing::debug;

use crate::commands::RegisterRequest;
use crate::db::{
    node_rows, pairs_with_first, triples_with_first, triples_with_pair, Tables, WriteTxn,
    TABLE_CHECKS, TABLE_NODES, TABLE_SERVICES,
};
use crate::errors::{Result, StoreError};
use crate::session::invalidate_session_txn;
use crate::store::StateStore;
use crate::types::{
    CheckServiceNode, HealthCheck, Node, NodeInfo, NodeServices, Service, HEALTH_ANY,
    HEALTH_CRITICAL,
};

pub(crate) fn ensure_node_txn(txn: &mut WriteTxn, index: u64, mut node: Node) {
    match txn.tables.nodes.get(&node.name) {
        Some(existing) if existing.same_content(&node) => return,
        Some(existing) => node.create_index = existing.create_index,
        None => node.create_index = index,
    }
    node.modify_index = index;
    txn.nodes_mut().insert(node.name.clone(), node);
    txn.mark(TABLE_NODES, index);
}

pub(crate) fn ensure_service_txn(
    txn: &mut WriteTxn,
    index: u64,
    node: &str,
    mut service: Service,
) -> Result<()> {
    if !txn.tables.nodes.contains_key(node) {
        return Err(StoreError::MissingNode);
    }

    let key = (node.to_string(), service.id.clone());
    match txn.tables.services.get(&key).cloned() {
        Some(existing) if existing.same_content(&service) => return Ok(()),
        Some(existing) => {
            service.create_index = existing.create_index;
            if existing.name != service.name {
                let stale = (existing.name, node.to_string(), service.id.clone());
                txn.services_by_name_mut().remove(&stale);
            }
        }
        None => service.create_index = index,
    }
    service.modify_index = index;
    txn.services_by_name_mut()
        .insert((service.name.clone(), node.to_string(), service.id.clone()));
    txn.services_mut().insert(key, service);
    txn.mark(TABLE_SERVICES, index);
    Ok(())
}

pub(crate) fn ensure_check_txn(
    txn: &mut WriteTxn,
    index: u64,
    mut check: HealthCheck,
) -> Result<()> {
    if check.status.is_empty() {
        check.status = HEALTH_CRITICAL.to_string();
    }
    if !txn.tables.nodes.contains_key(&check.node) {
        return Err(StoreError::MissingNode);
    }
    if check.service_id.is_empty() {
        check.service_name.clear();
    } else {
        let key = (check.node.clone(), check.service_id.clone());
        let Some(service) = txn.tables.services.get(&key) else {
            return Err(StoreError::MissingService);
        };
        check.service_name = service.name.clone();
    }

    let key = (check.node.clone(), check.check_id.clone());
    match txn.tables.checks.get(&key).cloned() {
        Some(existing) if existing.same_content(&check) => return Ok(()),
        Some(existing) => {
            check.create_index = existing.create_index;
            let stale_status = (existing.status, check.node.clone(), check.check_id.clone());
            txn.checks_by_status_mut().remove(&stale_status);
            if !existing.service_name.is_empty() {
                let stale_service = (
                    existing.service_name,
                    check.node.clone(),
                    check.check_id.clone(),
                );
                txn.checks_by_service_mut().remove(&stale_service);
            }
        }
        None => check.create_index = index,
    }
    check.modify_index = index;

    txn.checks_by_status_mut().insert((
        check.status.clone(),
        check.node.clone(),
        check.check_id.clone(),
    ));
    if !check.service_name.is_empty() {
        txn.checks_by_service_mut().insert((
            check.service_name.clone(),
            check.node.clone(),
            check.check_id.clone(),
        ));
    }

    let went_critical = check.status == HEALTH_CRITICAL;
    let node = check.node.clone();
    let check_id = check.check_id.clone();
    txn.checks_mut().insert(key, check);
    txn.mark(TABLE_CHECKS, index);

    // A check in critical state can no longer back a session.
    if went_critical {
        invalidate_check_sessions_txn(txn, index, &node, &check_id);
    }
    Ok(())
}

/// Destroy every session whose check set references the given check.
pub(crate) fn invalidate_check_sessions_txn(
    txn: &mut WriteTxn,
    index: u64,
    node: &str,
    check_id: &str,
) {
    let sessions: Vec<String> = triples_with_pair(&txn.tables.session_checks, node, check_id)
        .map(|(_, _, session)| session.clone())
        .collect();
    for session in sessions {
        debug!(%session, %node, %check_id, "invalidating session bound to check");
        invalidate_session_txn(txn, index, &session);
    }
}

fn remove_check_rows(txn: &mut WriteTxn, node: &str, check_ids: &[String]) {
    for check_id in check_ids {
        let key = (node.to_string(), check_id.clone());
        if let Some(check) = txn.checks_mut().remove(&key) {
            txn.checks_by_status_mut().remove(&(
                check.status.clone(),
                node.to_string(),
                check_id.clone(),
            ));
            if !check.service_name.is_empty() {
                txn.checks_by_service_mut().remove(&(
                    check.service_name.clone(),
                    node.to_string(),
                    check_id.clone(),
                ));
            }
        }
    }
}

pub(crate) fn delete_node_txn(txn: &mut WriteTxn, index: u64, node: &str) {
    if !txn.tables.nodes.contains_key(node) {
        return;
    }
    debug!(%node, "deleting node and everything registered against it");

    let check_ids: Vec<String> = node_rows(&txn.tables.checks, node)
        .map(|((_, id), _)| id.clone())
        .collect();
    let service_keys: Vec<(String, String)> = node_rows(&txn.tables.services, node)
        .map(|(key, _)| key.clone())
        .collect();

    // Sessions to destroy: those bound to the node plus those referencing
    // any of its checks.
    let mut doomed: BTreeSet<String> = pairs_with_first(&txn.tables.sessions_by_node, node)
        .map(|(_, session)| session.clone())
        .collect();
    doomed.extend(
        triples_with_first(&txn.tables.session_checks, node).map(|(_, _, s)| s.clone()),
    );

    if !check_ids.is_empty() {
        remove_check_rows(txn, node, &check_ids);
        txn.mark(TABLE_CHECKS, index);
    }
    if !service_keys.is_empty() {
        for key in &service_keys {
            if let Some(service) = txn.services_mut().remove(key) {
                txn.services_by_name_mut().remove(&(
                    service.name.clone(),
                    key.0.clone(),
                    key.1.clone(),
                ));
            }
        }
        txn.mark(TABLE_SERVICES, index);
    }
    txn.nodes_mut().remove(node);
    txn.mark(TABLE_NODES, index);

    for session in doomed {
        invalidate_session_txn(txn, index, &session);
    }
}

pub(crate) fn delete_service_txn(txn: &mut WriteTxn, index: u64, node: &str, service_id: &str) {
    let key = (node.to_string(), service_id.to_string());
    let Some(service) = txn.services_mut().remove(&key) else {
        return;
    };
    txn.services_by_name_mut().remove(&(
        service.name.clone(),
        node.to_string(),
        service_id.to_string(),
    ));
    txn.mark(TABLE_SERVICES, index);

    let check_ids: Vec<String> = node_rows(&txn.tables.checks, node)
        .filter(|(_, check)| check.service_id == service_id)
        .map(|((_, id), _)| id.clone())
        .collect();
    if !check_ids.is_empty() {
        debug!(%node, %service_id, checks = check_ids.len(), "cascading service delete to checks");
        for check_id in &check_ids {
            invalidate_check_sessions_txn(txn, index, node, check_id);
        }
        remove_check_rows(txn, node, &check_ids);
        txn.mark(TABLE_CHECKS, index);
    }
}

pub(crate) fn delete_check_txn(txn: &mut WriteTxn, index: u64, node: &str, check_id: &str) {
    let key = (node.to_string(), check_id.to_string());
    if !txn.tables.checks.contains_key(&key) {
        return;
    }
    invalidate_check_sessions_txn(txn, index, node, check_id);
    remove_check_rows(txn, node, &[check_id.to_string()]);
    txn.mark(TABLE_CHECKS, index);
}

fn node_info_row(tables: &Tables, node: &Node) -> NodeInfo {
    NodeInfo {
        node: node.name.clone(),
        address: node.address.clone(),
        services: node_rows(&tables.services, &node.name)
            .map(|(_, s)| s.clone())
            .collect(),
        checks: node_rows(&tables.checks, &node.name)
            .map(|(_, c)| c.clone())
            .collect(),
    }
}

impl StateStore {
    /// Atomic catalog upsert: the node, then the optional service, the
    /// optional top-level check, then each additional check. Any failing
    /// sub-step aborts the whole registration.
    pub fn ensure_registration(&self, index: u64, req: &RegisterRequest) -> Result<()> {
        self.try_write(|txn| {
            ensure_node_txn(txn, index, Node::new(&req.node, &req.address));
            if let Some(service) = &req.service {
                ensure_service_txn(txn, index, &req.node, service.clone())?;
            }
            if let Some(check) = &req.check {
                ensure_check_txn(txn, index, check.clone())?;
            }
            for check in &req.checks {
                ensure_check_txn(txn, index, check.clone())?;
            }
            Ok(())
        })
    }

    /// Idempotent node upsert. `create_index` of an existing node is
    /// preserved, and an upsert with unchanged content moves nothing.
    pub fn ensure_node(&self, index: u64, node: Node) {
        self.write(|txn| ensure_node_txn(txn, index, node))
    }

    /// Idempotent upsert of a service on an existing node.
    pub fn ensure_service(&self, index: u64, node: &str, service: Service) -> Result<()> {
        self.try_write(|txn| ensure_service_txn(txn, index, node, service))
    }

    /// Idempotent upsert of a health check. An empty status defaults to
    /// critical; a check whose status is (or becomes) critical destroys the
    /// sessions referencing it.
    pub fn ensure_check(&self, index: u64, check: HealthCheck) -> Result<()> {
        self.try_write(|txn| ensure_check_txn(txn, index, check))
    }

    /// Remove a node and cascade to its services, checks, and the sessions
    /// bound to any of them.
    pub fn delete_node(&self, index: u64, node: &str) {
        self.write(|txn| delete_node_txn(txn, index, node))
    }

    /// Remove a service and cascade to the checks attached to it.
    pub fn delete_service(&self, index: u64, node: &str, service_id: &str) {
        self.write(|txn| delete_service_txn(txn, index, node, service_id))
    }

    /// Remove a single check, destroying sessions that referenced it.
    pub fn delete_check(&self, index: u64, node: &str, check_id: &str) {
        self.write(|txn| delete_check_txn(txn, index, node, check_id))
    }

    /// All nodes, with the nodes table's result index.
    pub fn nodes(&self) -> (u64, Vec<Node>) {
        let tables = self.view();
        let idx = tables.table_index(TABLE_NODES);
        (idx, tables.nodes.values().cloned().collect())
    }

    pub fn get_node(&self, name: &str) -> Option<Node> {
        self.view().nodes.get(name).cloned()
    }

    /// A node and its services. The result index covers both contributing
    /// tables, so any later change to either is newer than it.
    pub fn node_services(&self, node: &str) -> (u64, Option<NodeServices>) {
        let tables = self.view();
        let idx = tables.max_index(&[TABLE_NODES, TABLE_SERVICES]);
        let Some(node_row) = tables.nodes.get(node) else {
            return (idx, None);
        };
        let services = node_rows(&tables.services, node)
            .map(|((_, id), s)| (id.clone(), s.clone()))
            .collect();
        (
            idx,
            Some(NodeServices {
                node: node_row.clone(),
                services,
            }),
        )
    }

    /// Checks registered against a node, ascending by check id.
    pub fn node_checks(&self, node: &str) -> (u64, Vec<HealthCheck>) {
        let tables = self.view();
        let checks: Vec<HealthCheck> = node_rows(&tables.checks, node)
            .map(|(_, c)| c.clone())
            .collect();
        (result_index(&tables, TABLE_CHECKS, &checks), checks)
    }

    /// Checks attached to any instance of a logical service.
    pub fn service_checks(&self, service_name: &str) -> (u64, Vec<HealthCheck>) {
        let tables = self.view();
        let checks: Vec<HealthCheck> =
            triples_with_first(&tables.checks_by_service, service_name)
                .filter_map(|(_, node, check_id)| {
                    tables
                        .checks
                        .get(&(node.clone(), check_id.clone()))
                        .cloned()
                })
                .collect();
        (result_index(&tables, TABLE_CHECKS, &checks), checks)
    }

    /// Checks in the given state; [`HEALTH_ANY`] bypasses the filter.
    pub fn checks_in_state(&self, state: &str) -> (u64, Vec<HealthCheck>) {
        let tables = self.view();
        let checks: Vec<HealthCheck> = if state == HEALTH_ANY {
            tables.checks.values().cloned().collect()
        } else {
            triples_with_first(&tables.checks_by_status, state)
                .filter_map(|(_, node, check_id)| {
                    tables
                        .checks
                        .get(&(node.clone(), check_id.clone()))
                        .cloned()
                })
                .collect()
        };
        (result_index(&tables, TABLE_CHECKS, &checks), checks)
    }

    /// The `{node, service, checks}` join for one logical service. The
    /// result index covers all three tables.
    pub fn check_service_nodes(&self, service_name: &str) -> (u64, Vec<CheckServiceNode>) {
        let tables = self.view();
        let idx = tables.max_index(&[TABLE_NODES, TABLE_SERVICES, TABLE_CHECKS]);
        let mut results = Vec::new();
        for (_, node, service_id) in triples_with_first(&tables.services_by_name, service_name) {
            let Some(node_row) = tables.nodes.get(node) else {
                continue;
            };
            let Some(service) = tables.services.get(&(node.clone(), service_id.clone())) else {
                continue;
            };
            let checks = node_rows(&tables.checks, node)
                .filter(|(_, c)| c.service_id == *service_id)
                .map(|(_, c)| c.clone())
                .collect();
            results.push(CheckServiceNode {
                node: node_row.clone(),
                service: service.clone(),
                checks,
            });
        }
        (idx, results)
    }

    /// Everything registered against one node.
    pub fn node_info(&self, node: &str) -> (u64, Vec<NodeInfo>) {
        let tables = self.view();
        let idx = tables.max_index(&[TABLE_NODES, TABLE_SERVICES, TABLE_CHECKS]);
        let info = tables
            .nodes
            .get(node)
            .map(|n| node_info_row(&tables, n))
            .into_iter()
            .collect();
        (idx, info)
    }

    /// Everything registered against every node, ascending by node name.
    pub fn node_dump(&self) -> (u64, Vec<NodeInfo>) {
        let tables = self.view();
        let idx = tables.max_index(&[TABLE_NODES, TABLE_SERVICES, TABLE_CHECKS]);
        let dump = tables
            .nodes
            .values()
            .map(|n| node_info_row(&tables, n))
            .collect();
        (idx, dump)
    }
}

/// Result index for a filtered scan of one table: the table's index row or
/// the highest `modify_index` among the matched rows, whichever is larger.
fn result_index(tables: &Tables, table: &str, rows: &[HealthCheck]) -> u64 {
    let row_max = rows.iter().map(|c| c.modify_index).max().unwrap_or(0);
    tables.table_index(table).max(row_max)
}
