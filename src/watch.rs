//! One-shot watch sets keyed to tables, K/V key prefixes, and single keys.
//!
//! A watch set is a broadcast point: subscribers register a channel, and the
//! next committed transaction that touches the watched domain notifies and
//! clears every subscriber. Dropping the receiver deregisters; closed
//! subscriptions are pruned on the next subscribe or fire.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use tokio::sync::watch;

/// A single one-shot broadcast point.
#[derive(Debug, Default)]
pub(crate) struct WatchSet {
    subs: Vec<watch::Sender<()>>,
}

impl WatchSet {
    fn subscribe(&mut self) -> watch::Receiver<()> {
        self.subs.retain(|tx| !tx.is_closed());
        let (tx, rx) = watch::channel(());
        self.subs.push(tx);
        rx
    }

    fn fire(&mut self) {
        for tx in self.subs.drain(..) {
            // A send to a dropped receiver just means the subscriber
            // deregistered; nothing to do.
            let _ = tx.send(());
        }
    }

    fn compact(&mut self) {
        self.subs.retain(|tx| !tx.is_closed());
    }

    fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// Node of the compressed radix tree holding prefix watch sets. Each node
/// owns the set for the prefix spelled by the path leading to it; edges carry
/// multi-byte labels and are split when a new prefix diverges mid-label.
#[derive(Debug, Default)]
struct PrefixNode {
    set: WatchSet,
    children: HashMap<u8, PrefixEdge>,
}

#[derive(Debug)]
struct PrefixEdge {
    label: Vec<u8>,
    node: PrefixNode,
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn subscribe_at(node: &mut PrefixNode, prefix: &[u8]) -> watch::Receiver<()> {
    if prefix.is_empty() {
        return node.set.subscribe();
    }
    if let Some(edge) = node.children.get_mut(&prefix[0]) {
        let common = common_prefix_len(&edge.label, prefix);
        if common < edge.label.len() {
            // The new prefix diverges inside this edge: split it.
            let tail = edge.label.split_off(common);
            let old_child = std::mem::take(&mut edge.node);
            edge.node.children.insert(
                tail[0],
                PrefixEdge {
                    label: tail,
                    node: old_child,
                },
            );
        }
        return subscribe_at(&mut edge.node, &prefix[common..]);
    }
    let mut leaf = PrefixNode::default();
    let rx = leaf.set.subscribe();
    node.children.insert(
        prefix[0],
        PrefixEdge {
            label: prefix.to_vec(),
            node: leaf,
        },
    );
    rx
}

/// Fire every set whose prefix is a prefix of `key`.
fn fire_path(node: &mut PrefixNode, key: &[u8]) {
    node.set.fire();
    if key.is_empty() {
        return;
    }
    if let Some(edge) = node.children.get_mut(&key[0]) {
        if key.len() >= edge.label.len() && key[..edge.label.len()] == edge.label[..] {
            fire_path(&mut edge.node, &key[edge.label.len()..]);
        }
    }
}

/// Fire every set on the path to `prefix` and every set at or below it.
/// Used by tree deletes, where subscribers under the prefix can observe the
/// change even when none of their own keys existed.
fn fire_tree(node: &mut PrefixNode, prefix: &[u8]) {
    node.set.fire();
    if prefix.is_empty() {
        for edge in node.children.values_mut() {
            fire_all(&mut edge.node);
        }
        return;
    }
    if let Some(edge) = node.children.get_mut(&prefix[0]) {
        if prefix.len() >= edge.label.len() && prefix[..edge.label.len()] == edge.label[..] {
            fire_tree(&mut edge.node, &prefix[edge.label.len()..]);
        } else if edge.label.starts_with(prefix) {
            fire_all(&mut edge.node);
        }
    }
}

fn fire_all(node: &mut PrefixNode) {
    node.set.fire();
    for edge in node.children.values_mut() {
        fire_all(&mut edge.node);
    }
}

/// Drop subtrees that no longer hold any live subscription.
fn prune(node: &mut PrefixNode) {
    node.children.retain(|_, edge| {
        prune(&mut edge.node);
        edge.node.set.compact();
        !edge.node.set.is_empty() || !edge.node.children.is_empty()
    });
}

/// Notifications buffered by a write transaction. Fired only after commit;
/// an aborted transaction drops them unseen.
#[derive(Debug, Default)]
pub(crate) struct WatchEvents {
    pub(crate) tables: BTreeSet<&'static str>,
    pub(crate) keys: BTreeSet<String>,
    pub(crate) subtrees: BTreeSet<String>,
}

impl WatchEvents {
    pub(crate) fn touch_table(&mut self, table: &'static str) {
        self.tables.insert(table);
    }

    pub(crate) fn touch_key(&mut self, key: &str) {
        self.keys.insert(key.to_string());
    }

    pub(crate) fn touch_subtree(&mut self, prefix: &str) {
        self.subtrees.insert(prefix.to_string());
    }
}

/// All watch state of a store. Subscriptions are keyed to whole tables, K/V
/// prefixes (the radix tree), and exact K/V keys.
#[derive(Debug, Default)]
pub(crate) struct WatchManager {
    tables: Mutex<HashMap<&'static str, WatchSet>>,
    kv: Mutex<PrefixNode>,
    items: Mutex<HashMap<String, WatchSet>>,
}

impl WatchManager {
    pub(crate) fn watch_table(&self, table: &'static str) -> watch::Receiver<()> {
        let mut tables = self.tables.lock().expect("watch table lock poisoned");
        tables.entry(table).or_default().subscribe()
    }

    pub(crate) fn watch_prefix(&self, prefix: &str) -> watch::Receiver<()> {
        let mut kv = self.kv.lock().expect("watch prefix lock poisoned");
        subscribe_at(&mut kv, prefix.as_bytes())
    }

    pub(crate) fn watch_key(&self, key: &str) -> watch::Receiver<()> {
        let mut items = self.items.lock().expect("watch item lock poisoned");
        items.entry(key.to_string()).or_default().subscribe()
    }

    /// Release the buffered notifications of a committed transaction.
    pub(crate) fn fire(&self, events: WatchEvents) {
        {
            let mut tables = self.tables.lock().expect("watch table lock poisoned");
            for table in &events.tables {
                if let Some(set) = tables.get_mut(table) {
                    set.fire();
                }
            }
        }
        {
            let mut kv = self.kv.lock().expect("watch prefix lock poisoned");
            for key in &events.keys {
                fire_path(&mut kv, key.as_bytes());
            }
            for prefix in &events.subtrees {
                fire_tree(&mut kv, prefix.as_bytes());
            }
            prune(&mut kv);
        }
        {
            let mut items = self.items.lock().expect("watch item lock poisoned");
            for key in &events.keys {
                if let Some(set) = items.get_mut(key) {
                    set.fire();
                }
            }
            for prefix in &events.subtrees {
                for (key, set) in items.iter_mut() {
                    if key.starts_with(prefix.as_str()) {
                        set.fire();
                    }
                }
            }
            items.retain(|_, set| {
                set.compact();
                !set.is_empty()
            });
        }
    }
}
