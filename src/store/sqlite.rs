use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde_json::Value;

use crate::error::{MeshError, Result};
use crate::model::{PendingMasterAction, TabDescriptor};
use crate::state::{SharedState, StateDelta, StateSnapshot};
use crate::store::channel::{Channel, check_gap};
use crate::tab_id::TabId;

// ---------------------------------------------------------------------------
// Helpers: RFC 3339 timestamps and JSON columns
// ---------------------------------------------------------------------------

fn parse_dt(column: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MeshError::CorruptRecord(column.to_string(), e.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(column: &str, s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| MeshError::CorruptRecord(column.to_string(), e.to_string()))
}

type PendingRow = (TabId, String, String, String, TabId);

fn pending_from_row(row: PendingRow) -> Result<(TabId, PendingMasterAction)> {
    let (target, action_name, payload, requested_at, requesting_tab_id) = row;
    Ok((
        target,
        PendingMasterAction {
            action_name,
            payload: parse_json("pending.payload", &payload)?,
            requested_at: parse_dt("pending.requested_at", &requested_at)?,
            requesting_tab_id,
        },
    ))
}

// ---------------------------------------------------------------------------
// SqliteChannel
// ---------------------------------------------------------------------------

/// File-backed channel shared by tab processes on one machine.
///
/// WAL mode lets readers proceed while a writer holds the lock; every write
/// that reads-then-writes runs in an IMMEDIATE transaction.
pub struct SqliteChannel {
    conn: Connection,
    capacity: usize,
}

impl SqliteChannel {
    /// Open (or create) the channel database at `path`.
    pub fn open(path: &Path, delta_log_capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        let channel = Self {
            conn,
            capacity: delta_log_capacity.max(1),
        };
        channel.create_tables()?;
        Ok(channel)
    }

    /// Open an in-memory database (private to this connection; for tests).
    pub fn open_memory(delta_log_capacity: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        let channel = Self {
            conn,
            capacity: delta_log_capacity.max(1),
        };
        channel.create_tables()?;
        Ok(channel)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tabs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL,
                is_master INTEGER NOT NULL DEFAULT 0,
                is_closing INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS pending (
                target TEXT PRIMARY KEY,
                action_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                requested_at TEXT NOT NULL,
                requesting_tab_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deltas (
                seq INTEGER PRIMARY KEY,
                origin TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                seq INTEGER NOT NULL,
                origin TEXT NOT NULL,
                state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO meta (key, value) VALUES ('last_seq', 0);",
        )?;
        Ok(())
    }

    /// Expose the raw connection (for tests or advanced usage).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    fn last_seq(conn: &Connection) -> Result<u64> {
        let seq: i64 = conn.query_row(
            "SELECT value FROM meta WHERE key = 'last_seq'",
            [],
            |row| row.get(0),
        )?;
        Ok(seq.max(0) as u64)
    }
}

impl Channel for SqliteChannel {
    fn upsert_tab(&self, descriptor: &TabDescriptor) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tabs (id, started_at, last_heartbeat_at, is_master, is_closing)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                started_at = ?2,
                last_heartbeat_at = ?3,
                is_master = ?4,
                is_closing = ?5",
            params![
                &descriptor.id,
                descriptor.started_at.to_rfc3339(),
                descriptor.last_heartbeat_at.to_rfc3339(),
                descriptor.is_master,
                descriptor.is_closing,
            ],
        )?;
        Ok(())
    }

    fn list_tabs(&self) -> Result<Vec<TabDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, last_heartbeat_at, is_master, is_closing
             FROM tabs ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, TabId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, started_at, heartbeat, is_master, is_closing)| {
                Ok(TabDescriptor {
                    id,
                    started_at: parse_dt("tabs.started_at", &started_at)?,
                    last_heartbeat_at: parse_dt("tabs.last_heartbeat_at", &heartbeat)?,
                    is_master,
                    is_closing,
                })
            })
            .collect()
    }

    fn remove_tab(&self, id: &TabId) -> Result<bool> {
        let changes = self
            .conn
            .execute("DELETE FROM tabs WHERE id = ?1", params![id])?;
        Ok(changes > 0)
    }

    fn put_pending(
        &self,
        target: &TabId,
        action: &PendingMasterAction,
    ) -> Result<Option<PendingMasterAction>> {
        let tx = self.immediate()?;
        let displaced: Option<PendingRow> = tx
            .query_row(
                "SELECT target, action_name, payload, requested_at, requesting_tab_id
                 FROM pending WHERE target = ?1",
                params![target],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        tx.execute(
            "INSERT OR REPLACE INTO pending
                (target, action_name, payload, requested_at, requesting_tab_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target,
                &action.action_name,
                serde_json::to_string(&action.payload)?,
                action.requested_at.to_rfc3339(),
                &action.requesting_tab_id,
            ],
        )?;
        tx.commit()?;
        displaced
            .map(pending_from_row)
            .transpose()
            .map(|opt| opt.map(|(_, action)| action))
    }

    fn take_pending(&self, target: &TabId) -> Result<Option<PendingMasterAction>> {
        let row: Option<PendingRow> = self
            .conn
            .query_row(
                "DELETE FROM pending WHERE target = ?1
                 RETURNING target, action_name, payload, requested_at, requesting_tab_id",
                params![target],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        row.map(pending_from_row)
            .transpose()
            .map(|opt| opt.map(|(_, action)| action))
    }

    fn list_pending(&self) -> Result<Vec<(TabId, PendingMasterAction)>> {
        let mut stmt = self.conn.prepare(
            "SELECT target, action_name, payload, requested_at, requesting_tab_id
             FROM pending ORDER BY target",
        )?;
        let rows: Vec<PendingRow> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(pending_from_row).collect()
    }

    fn publish(
        &self,
        origin: &TabId,
        fields: &BTreeMap<String, Value>,
        state: &SharedState,
    ) -> Result<u64> {
        let tx = self.immediate()?;
        let seq = Self::last_seq(&tx)? + 1;
        tx.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'last_seq'",
            params![seq as i64],
        )?;
        tx.execute(
            "INSERT INTO deltas (seq, origin, fields, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                seq as i64,
                origin,
                serde_json::to_string(fields)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.execute(
            "DELETE FROM deltas WHERE seq <= ?1",
            params![seq as i64 - self.capacity as i64],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshot (id, seq, origin, state) VALUES (1, ?1, ?2, ?3)",
            params![seq as i64, origin, serde_json::to_string(state)?],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    fn deltas_since(&self, after: u64) -> Result<Vec<StateDelta>> {
        let tx = self.conn.unchecked_transaction()?;
        let latest = Self::last_seq(&tx)?;
        let oldest: Option<i64> = tx.query_row("SELECT MIN(seq) FROM deltas", [], |row| row.get(0))?;
        check_gap(after, oldest.map(|s| s.max(0) as u64), latest)?;

        let rows: Vec<(i64, TabId, String)> = {
            let mut stmt = tx.prepare(
                "SELECT seq, origin, fields FROM deltas WHERE seq > ?1 ORDER BY seq",
            )?;
            stmt.query_map(params![after as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        rows.into_iter()
            .map(|(seq, origin, fields)| {
                Ok(StateDelta {
                    seq: seq.max(0) as u64,
                    origin,
                    fields: parse_json("deltas.fields", &fields)?,
                })
            })
            .collect()
    }

    fn snapshot(&self) -> Result<Option<StateSnapshot>> {
        let row: Option<(i64, TabId, String)> = self
            .conn
            .query_row(
                "SELECT seq, origin, state FROM snapshot WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(seq, origin, state)| {
            Ok(StateSnapshot {
                seq: seq.max(0) as u64,
                origin,
                state: parse_json("snapshot.state", &state)?,
            })
        })
        .transpose()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(s: &str) -> TabId {
        s.parse().unwrap()
    }

    #[test]
    fn schema_tables_exist() {
        let channel = SqliteChannel::open_memory(8).unwrap();
        let tables: Vec<String> = channel
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in ["deltas", "meta", "pending", "snapshot", "tabs"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn descriptors_round_trip() {
        let channel = SqliteChannel::open_memory(8).unwrap();
        let mut desc = TabDescriptor::new(id("00000000000000a1"), Utc::now());
        desc.is_master = true;
        channel.upsert_tab(&desc).unwrap();

        let tabs = channel.list_tabs().unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].id, desc.id);
        assert!(tabs[0].is_master);
        assert!(!tabs[0].is_closing);
        assert!(channel.remove_tab(&desc.id).unwrap());
        assert!(channel.list_tabs().unwrap().is_empty());
    }

    #[test]
    fn corrupt_heartbeat_is_reported() {
        let channel = SqliteChannel::open_memory(8).unwrap();
        channel
            .conn()
            .execute(
                "INSERT INTO tabs (id, started_at, last_heartbeat_at) VALUES ('00000000000000a1', 'x', 'y')",
                [],
            )
            .unwrap();
        assert!(matches!(
            channel.list_tabs().unwrap_err(),
            MeshError::CorruptRecord(_, _)
        ));
    }

    #[test]
    fn pending_take_is_single_shot() {
        let channel = SqliteChannel::open_memory(8).unwrap();
        let target = id("00000000000000a1");
        let action = PendingMasterAction::new(
            "call.join",
            serde_json::json!({"chat_id": "c1"}),
            id("00000000000000b2"),
            Utc::now(),
        );
        assert!(channel.put_pending(&target, &action).unwrap().is_none());
        let newer = PendingMasterAction {
            payload: serde_json::json!({"chat_id": "c2"}),
            ..action.clone()
        };
        let displaced = channel.put_pending(&target, &newer).unwrap().unwrap();
        assert_eq!(displaced.payload["chat_id"], "c1");

        assert_eq!(channel.list_pending().unwrap().len(), 1);
        let taken = channel.take_pending(&target).unwrap().unwrap();
        assert_eq!(taken.payload["chat_id"], "c2");
        assert!(channel.take_pending(&target).unwrap().is_none());
    }

    #[test]
    fn publish_trims_log_and_keeps_snapshot() {
        let channel = SqliteChannel::open_memory(3).unwrap();
        let origin = id("00000000000000a1");
        let mut state = SharedState::default();
        for n in 0..5 {
            state.active_call_id = Some(format!("call-{n}"));
            let mut fields = BTreeMap::new();
            fields.insert(
                "active_call_id".to_string(),
                Value::String(format!("call-{n}")),
            );
            channel.publish(&origin, &fields, &state).unwrap();
        }

        let deltas = channel.deltas_since(2).unwrap();
        assert_eq!(deltas.iter().map(|d| d.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(channel.deltas_since(5).unwrap().is_empty());
        assert!(matches!(
            channel.deltas_since(1).unwrap_err(),
            MeshError::ReplicationGap { expected: 2, oldest: 3 }
        ));

        let snapshot = channel.snapshot().unwrap().unwrap();
        assert_eq!(snapshot.seq, 5);
        assert_eq!(snapshot.state.active_call_id.as_deref(), Some("call-4"));
    }

    #[test]
    fn two_connections_share_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session").join("channel.db");
        let a = SqliteChannel::open(&path, 8).unwrap();
        let b = SqliteChannel::open(&path, 8).unwrap();

        a.upsert_tab(&TabDescriptor::new(id("00000000000000a1"), Utc::now()))
            .unwrap();
        assert_eq!(b.list_tabs().unwrap().len(), 1);

        a.publish(&id("00000000000000a1"), &BTreeMap::new(), &SharedState::default())
            .unwrap();
        assert_eq!(b.deltas_since(0).unwrap().len(), 1);
    }
}
