//! Snapshot and restore.
//!
//! A snapshot is a frozen read view of the tables plus the last index that
//! affected them. [`StateSnapshot::persist`] streams it as a length-framed
//! header followed by `(type byte, length, bincode payload, crc32)` records;
//! [`StateStore::restore`] rebuilds a fresh store by driving those records
//! through the same paths the log uses. Taking or persisting a snapshot
//! never blocks writers.

use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use fs_err::{self as fs, File, OpenOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::commands::{MessageType, RegisterRequest};
use crate::db::{node_rows, Tables, TABLE_ACLS, TABLE_KVS, TABLE_SESSIONS, TABLE_TOMBSTONES};
use crate::store::StateStore;
use crate::tombstone::TombstoneGc;
use crate::types::{Acl, DirEntry, HealthCheck, Node, Service, Session, Tombstone, BEHAVIOR_RELEASE};

/// First record of every snapshot stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotHeader {
    magic: [u8; 4],
    version: u32,
    created_at: i64,
    /// The last log index that affected the captured state. Restore applies
    /// every record at this index.
    last_index: u64,
}

impl SnapshotHeader {
    const MAGIC: [u8; 4] = *b"TDSS";
    const VERSION: u32 = 1;

    pub(crate) fn new(last_index: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            created_at: chrono::Utc::now().timestamp_millis(),
            last_index,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!("invalid snapshot magic header");
        }
        if self.version != Self::VERSION {
            bail!(
                "unsupported snapshot version: expected {}, found {}",
                Self::VERSION,
                self.version
            );
        }
        Ok(())
    }
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(body, bincode::config::standard())
        .context("failed to encode snapshot record")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (body, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("failed to decode snapshot record")?;
    Ok(body)
}

pub(crate) fn write_record<W: Write, T: Serialize>(
    sink: &mut W,
    msg: MessageType,
    body: &T,
) -> Result<()> {
    let bytes = encode(body)?;
    sink.write_all(&[msg as u8])?;
    sink.write_all(&(bytes.len() as u32).to_le_bytes())?;
    sink.write_all(&bytes)?;
    sink.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;
    Ok(())
}

fn read_record_body<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .context("failed to read snapshot record length")?;
    let len = u32::from_le_bytes(len_bytes);

    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .context("failed to read snapshot record")?;

    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut crc_bytes)
        .context("failed to read snapshot record checksum")?;
    if crc32fast::hash(&bytes) != u32::from_le_bytes(crc_bytes) {
        bail!("snapshot record corrupted");
    }
    Ok(bytes)
}

/// A consistent view of the whole store at one point in time. Holding it
/// costs nothing and blocks nobody; the underlying tables are immutable.
pub struct StateSnapshot {
    tables: Arc<Tables>,
    last_index: u64,
}

impl StateStore {
    /// Capture the current state for streaming.
    pub fn snapshot(&self) -> StateSnapshot {
        let tables = self.view();
        StateSnapshot {
            last_index: tables.last_index(),
            tables,
        }
    }
}

impl StateSnapshot {
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn node_dump(&self) -> Vec<Node> {
        self.tables.nodes.values().cloned().collect()
    }

    pub fn service_dump(&self, node: &str) -> Vec<Service> {
        node_rows(&self.tables.services, node)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn check_dump(&self, node: &str) -> Vec<HealthCheck> {
        node_rows(&self.tables.checks, node)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn session_dump(&self) -> Vec<Session> {
        self.tables.sessions.values().cloned().collect()
    }

    pub fn acl_dump(&self) -> Vec<Acl> {
        self.tables.acls.values().cloned().collect()
    }

    pub fn kvs_dump(&self) -> Vec<DirEntry> {
        self.tables.kvs.values().cloned().collect()
    }

    pub fn tombstone_dump(&self) -> Vec<Tombstone> {
        self.tables
            .tombstones
            .iter()
            .map(|(key, index)| Tombstone {
                key: key.clone(),
                index: *index,
            })
            .collect()
    }

    /// Stream every live entity into `sink`.
    ///
    /// Registration records go out node-first, then one record per service,
    /// then one per check, so restore can replay them through the ordinary
    /// registration path without ever missing a parent.
    pub fn persist<W: Write>(&self, sink: &mut W) -> Result<()> {
        let header = SnapshotHeader::new(self.last_index);
        let header_bytes = encode(&header)?;
        sink.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        sink.write_all(&header_bytes)?;

        for node in self.tables.nodes.values() {
            let mut req = RegisterRequest::node(&node.name, &node.address);
            write_record(sink, MessageType::Register, &req)?;

            for (_, service) in node_rows(&self.tables.services, &node.name) {
                req.service = Some(service.clone());
                write_record(sink, MessageType::Register, &req)?;
            }
            req.service = None;

            for (_, check) in node_rows(&self.tables.checks, &node.name) {
                req.check = Some(check.clone());
                write_record(sink, MessageType::Register, &req)?;
            }
        }

        for session in self.tables.sessions.values() {
            write_record(sink, MessageType::Session, session)?;
        }
        for acl in self.tables.acls.values() {
            write_record(sink, MessageType::Acl, acl)?;
        }
        for entry in self.tables.kvs.values() {
            write_record(sink, MessageType::Kvs, entry)?;
        }
        for (key, index) in self.tables.tombstones.iter() {
            // Serialised as a K/V record carrying the tombstone index in
            // `modify_index`, keeping the stream format compatible with
            // readers that predate the tombstone record type.
            let fake = DirEntry {
                key: key.clone(),
                modify_index: *index,
                ..Default::default()
            };
            write_record(sink, MessageType::Tombstone, &fake)?;
        }
        Ok(())
    }

    /// Persist to a file with an atomic replace: write a temp file, fsync,
    /// rename over the target, then sync the parent directory.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("snapshot.tmp");

        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            self.persist(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        info!(path = %path.display(), last_index = self.last_index, "persisted snapshot");
        Ok(())
    }
}

impl StateStore {
    /// Rebuild a fresh store from a snapshot stream.
    ///
    /// Registration records replay through the normal registration path at
    /// `header.last_index`; K/V, session, ACL and tombstone records are
    /// restored verbatim with their recorded indexes. Any error leaves the
    /// partially-populated store to be discarded by the caller.
    pub fn restore<R: Read>(reader: R, gc: Option<Arc<TombstoneGc>>) -> Result<StateStore> {
        let store = match gc {
            Some(gc) => StateStore::with_gc(gc),
            None => StateStore::new(),
        };
        let mut reader = BufReader::new(reader);

        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .context("failed to read snapshot header length")?;
        let mut header_bytes = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        reader
            .read_exact(&mut header_bytes)
            .context("failed to read snapshot header")?;
        let header: SnapshotHeader = decode(&header_bytes)?;
        header.validate()?;

        let mut records = 0usize;
        loop {
            let mut type_byte = [0u8; 1];
            match reader.read_exact(&mut type_byte) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err).context("failed to read snapshot record type"),
            }
            let bytes = read_record_body(&mut reader)?;
            records += 1;

            match MessageType::from_byte(type_byte[0]) {
                Some(MessageType::Register) => {
                    let req: RegisterRequest = decode(&bytes)?;
                    store
                        .ensure_registration(header.last_index, &req)
                        .context("failed to restore registration")?;
                }
                Some(MessageType::Kvs) => {
                    store.kvs_restore(decode(&bytes)?);
                }
                Some(MessageType::Session) => {
                    store.session_restore(decode(&bytes)?);
                }
                Some(MessageType::Acl) => {
                    store.acl_restore(decode(&bytes)?);
                }
                Some(MessageType::Tombstone) => {
                    let fake: DirEntry = decode(&bytes)?;
                    store.tombstone_restore(Tombstone {
                        key: fake.key,
                        index: fake.modify_index,
                    });
                }
                _ => bail!("unrecognized snapshot record type {}", type_byte[0]),
            }
        }

        // The header's last index is authoritative, even when a tombstone
        // record carries something newer.
        store.write(|txn| {
            let rows = Arc::make_mut(&mut txn.tables.index);
            for row in rows.values_mut() {
                *row = (*row).min(header.last_index);
            }
        });

        info!(
            records,
            last_index = header.last_index,
            "restored state store from snapshot"
        );
        Ok(store)
    }

    pub fn restore_from_file<P: AsRef<Path>>(
        path: P,
        gc: Option<Arc<TombstoneGc>>,
    ) -> Result<StateStore> {
        let file = File::open(path.as_ref())?;
        Self::restore(BufReader::new(file), gc)
    }

    /// Install a K/V entry verbatim, keeping its recorded indexes. Restore
    /// paths skip preconditions; watches still fire.
    pub fn kvs_restore(&self, entry: DirEntry) {
        self.write(|txn| {
            if !entry.session.is_empty() {
                txn.kvs_by_session_mut()
                    .insert((entry.session.clone(), entry.key.clone()));
            }
            txn.events.touch_key(&entry.key);
            txn.mark(TABLE_KVS, entry.modify_index);
            txn.kvs_mut().insert(entry.key.clone(), entry);
        })
    }

    /// Install a session verbatim, rebuilding its check mappings without
    /// re-validating them; a restored session may legitimately reference a
    /// check that has since gone critical.
    pub fn session_restore(&self, mut session: Session) {
        if session.behavior.is_empty() {
            session.behavior = BEHAVIOR_RELEASE.to_string();
        }
        self.write(|txn| {
            txn.sessions_by_node_mut()
                .insert((session.node.clone(), session.id.clone()));
            for check_id in &session.checks {
                txn.session_checks_mut().insert((
                    session.node.clone(),
                    check_id.clone(),
                    session.id.clone(),
                ));
            }
            txn.mark(TABLE_SESSIONS, session.modify_index);
            txn.sessions_mut().insert(session.id.clone(), session);
        })
    }

    /// Install an ACL verbatim, keeping its recorded indexes.
    pub fn acl_restore(&self, acl: Acl) {
        self.write(|txn| {
            txn.mark(TABLE_ACLS, acl.modify_index);
            txn.acls_mut().insert(acl.id.clone(), acl);
        })
    }

    /// Install a tombstone verbatim.
    pub fn tombstone_restore(&self, stone: Tombstone) {
        if stone.index == 0 {
            warn!(key = %stone.key, "restoring tombstone without an index");
        }
        self.write(|txn| {
            txn.mark(TABLE_TOMBSTONES, stone.index);
            txn.tombstones_mut().insert(stone.key, stone.index);
        })
    }
}
