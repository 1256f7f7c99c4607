use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tp_core::{
    generate_join_code, Delivery, FleetError, Node, NodeStatus, Nudge, NudgePriority, NudgeStats,
    RateLimitPolicy, SignalChannel,
};

pub const FLEET_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error(transparent)]
    Fleet(#[from] FleetError),
}

impl StoreError {
    /// The domain error behind this failure, when there is one.
    pub fn as_fleet(&self) -> Option<&FleetError> {
        match self {
            StoreError::Fleet(err) => Some(err),
            _ => None,
        }
    }
}

/// New node row from the joining facilitator's session context. The join
/// code is generated here; ids come from the surrounding application.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub node_id: i64,
    pub session_id: i64,
    pub session_name: String,
    pub event_name: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct BroadcastOutcome {
    pub sent: Vec<Nudge>,
    /// Node ids skipped because their rate-limit window was full.
    pub skipped: Vec<i64>,
}

/// Node registry and nudge mailbox in one sqlite store. Mutations run
/// inside a transaction on a mutex-guarded connection.
pub struct FleetStore {
    conn: Mutex<Connection>,
}

impl FleetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > FLEET_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: FLEET_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_fleet_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    // ---- node registry ----

    /// Registers a table at the moment a facilitator joins it.
    pub fn register_node(&self, new: &NewNode) -> Result<Node, StoreError> {
        let join_code = generate_join_code();
        let conn = self.conn();
        conn.execute(
            "
            INSERT INTO nodes (
                node_id, session_id, session_name, event_name, topic, join_code, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                new.node_id,
                new.session_id,
                new.session_name,
                new.event_name,
                new.topic,
                join_code,
                NodeStatus::Active.as_str(),
            ],
        )?;
        drop(conn);
        self.get_node(new.node_id)
    }

    pub fn get_node(&self, node_id: i64) -> Result<Node, StoreError> {
        let conn = self.conn();
        let node = conn
            .query_row(
                &format!("{NODE_SELECT} WHERE node_id = ?1"),
                [node_id],
                node_from_row,
            )
            .optional()?;
        node.ok_or_else(|| FleetError::NotFound(format!("node {node_id}")).into())
    }

    pub fn list_active(&self) -> Result<Vec<Node>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{NODE_SELECT} WHERE status = 'active' ORDER BY node_id"))?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_active_in_session(&self, session_id: i64) -> Result<Vec<Node>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{NODE_SELECT} WHERE status = 'active' AND session_id = ?1 ORDER BY node_id"
        ))?;
        let rows = stmt.query_map([session_id], node_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Marks a table completed; later channel observations are rejected.
    pub fn complete_node(&self, node_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET status = 'completed' WHERE node_id = ?1",
            [node_id],
        )?;
        if changed == 0 {
            return Err(FleetError::NotFound(format!("node {node_id}")).into());
        }
        Ok(())
    }

    /// Records a channel observation, last-writer-wins per channel. An
    /// instant older than the stored one, or any write against a completed
    /// node, fails with `StaleWriteRejected`; callers log and move on.
    pub fn upsert_last_seen(
        &self,
        node_id: i64,
        channel: SignalChannel,
        instant: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let column = channel_column(channel);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let row: Option<(String, Option<String>)> = tx
            .query_row(
                &format!("SELECT status, {column} FROM nodes WHERE node_id = ?1"),
                [node_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, stored)) = row else {
            return Err(FleetError::NotFound(format!("node {node_id}")).into());
        };
        if status == NodeStatus::Completed.as_str() {
            return Err(FleetError::StaleWriteRejected(format!(
                "node {node_id} is completed, dropping {channel} observation"
            ))
            .into());
        }
        if let Some(stored) = stored {
            let stored = parse_ts(&stored)?;
            if stored > instant {
                return Err(FleetError::StaleWriteRejected(format!(
                    "out-of-order {channel} instant for node {node_id}: stored {stored}, got {instant}"
                ))
                .into());
            }
        }

        tx.execute(
            &format!("UPDATE nodes SET {column} = ?1 WHERE node_id = ?2"),
            params![instant.to_rfc3339(), node_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ---- nudge mailbox ----

    /// Creates one nudge and its delivery row. The rate-limit check runs in
    /// the same transaction as the inserts; urgent nudges skip the check.
    pub fn create_nudge(
        &self,
        node_id: i64,
        message: &str,
        priority: NudgePriority,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Nudge, StoreError> {
        if message.trim().is_empty() {
            return Err(FleetError::Validation("nudge message is empty".to_string()).into());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let session_id: Option<i64> = tx
            .query_row(
                "SELECT session_id FROM nodes WHERE node_id = ?1",
                [node_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(session_id) = session_id else {
            return Err(FleetError::NotFound(format!("node {node_id}")).into());
        };

        if priority == NudgePriority::Normal {
            let recent = count_in_window(&tx, node_id, now - policy.window)?;
            if recent >= policy.max_per_window {
                return Err(FleetError::RateLimited {
                    node_id,
                    count: recent,
                }
                .into());
            }
        }

        tx.execute(
            "
            INSERT INTO nudges (node_id, session_id, message, priority, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                node_id,
                session_id,
                message,
                priority.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        let nudge_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO deliveries (nudge_id, recipient_node_id) VALUES (?1, ?2)",
            params![nudge_id, node_id],
        )?;
        tx.commit()?;

        Ok(Nudge {
            nudge_id,
            node_id,
            session_id,
            message: message.to_string(),
            priority,
            created_at: now,
        })
    }

    /// Fan-out-by-repetition: one independently trackable nudge per active
    /// node of the session. Rate-limited nodes are skipped, the rest still
    /// get theirs.
    pub fn broadcast(
        &self,
        session_id: i64,
        message: &str,
        priority: NudgePriority,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BroadcastOutcome, StoreError> {
        if message.trim().is_empty() {
            return Err(FleetError::Validation("nudge message is empty".to_string()).into());
        }

        let nodes = self.list_active_in_session(session_id)?;
        let mut outcome = BroadcastOutcome {
            sent: Vec::new(),
            skipped: Vec::new(),
        };
        for node in nodes {
            match self.create_nudge(node.node_id, message, priority, policy, now) {
                Ok(nudge) => outcome.sent.push(nudge),
                Err(StoreError::Fleet(FleetError::RateLimited { .. })) => {
                    outcome.skipped.push(node.node_id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    /// Nudges awaiting acknowledgment, FIFO by creation order. The first
    /// poll stamps `delivered_at`; a nudge keeps coming back on every poll
    /// until acknowledged.
    pub fn poll_pending(
        &self,
        node_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Nudge>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT node_id FROM nodes WHERE node_id = ?1",
                [node_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(FleetError::NotFound(format!("node {node_id}")).into());
        }

        let pending = {
            let mut stmt = tx.prepare(
                "
                SELECT n.nudge_id, n.node_id, n.session_id, n.message, n.priority, n.created_at
                FROM nudges n
                JOIN deliveries d ON d.nudge_id = n.nudge_id
                WHERE d.recipient_node_id = ?1 AND d.acknowledged_at IS NULL
                ORDER BY n.nudge_id
                ",
            )?;
            let rows = stmt.query_map([node_id], nudge_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        tx.execute(
            "
            UPDATE deliveries SET delivered_at = ?1
            WHERE recipient_node_id = ?2 AND acknowledged_at IS NULL AND delivered_at IS NULL
            ",
            params![now.to_rfc3339(), node_id],
        )?;
        tx.commit()?;
        Ok(pending)
    }

    /// Records an "opened" observation. An open implies the nudge reached
    /// the client, so `delivered_at` is stamped too if a poll never did.
    /// No-op once acknowledged or already opened.
    pub fn mark_opened(
        &self,
        nudge_id: i64,
        node_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "
            UPDATE deliveries
            SET opened_at = ?1, delivered_at = COALESCE(delivered_at, ?1)
            WHERE nudge_id = ?2 AND recipient_node_id = ?3
              AND opened_at IS NULL AND acknowledged_at IS NULL
            ",
            params![now.to_rfc3339(), nudge_id, node_id],
        )?;
        Ok(())
    }

    /// Terminal transition. Stamps `acknowledged_at` (and `opened_at` if no
    /// open was reported). Duplicate or unknown acks are a harmless no-op.
    pub fn acknowledge(
        &self,
        nudge_id: i64,
        node_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "
            UPDATE deliveries
            SET acknowledged_at = ?1, opened_at = COALESCE(opened_at, ?1)
            WHERE nudge_id = ?2 AND recipient_node_id = ?3 AND acknowledged_at IS NULL
            ",
            params![now.to_rfc3339(), nudge_id, node_id],
        )?;
        Ok(())
    }

    /// The tracking row for one (nudge, recipient) pair.
    pub fn delivery(&self, nudge_id: i64, node_id: i64) -> Result<Option<Delivery>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "
                SELECT delivery_id, nudge_id, recipient_node_id,
                       delivered_at, opened_at, acknowledged_at
                FROM deliveries
                WHERE nudge_id = ?1 AND recipient_node_id = ?2
                ",
                params![nudge_id, node_id],
                delivery_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Read-only projection over all deliveries whose nudge targets the
    /// node. Recomputed per call.
    pub fn nudge_stats(&self, node_id: i64) -> Result<NudgeStats, StoreError> {
        let conn = self.conn();
        let (sent, delivered, opened, acknowledged): (u32, u32, u32, u32) = conn.query_row(
            "
            SELECT
                COUNT(*),
                COUNT(d.delivered_at),
                COUNT(d.opened_at),
                COUNT(d.acknowledged_at)
            FROM deliveries d
            JOIN nudges n ON n.nudge_id = d.nudge_id
            WHERE n.node_id = ?1
            ",
            [node_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(NudgeStats {
            sent,
            delivered,
            pending: sent - acknowledged,
            opened,
            acknowledged,
        })
    }

    /// Drops unacknowledged deliveries (and their nudges) created before
    /// the cutoff. Returns how many were dropped.
    pub fn expire_pending(&self, cutoff: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let candidates = {
            let mut stmt = tx.prepare(
                "
                SELECT d.delivery_id, n.nudge_id, n.created_at
                FROM deliveries d
                JOIN nudges n ON n.nudge_id = d.nudge_id
                WHERE d.acknowledged_at IS NULL
                ",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut dropped = 0u32;
        for (delivery_id, nudge_id, created_at) in candidates {
            if parse_ts(&created_at)? >= cutoff {
                continue;
            }
            tx.execute("DELETE FROM deliveries WHERE delivery_id = ?1", [delivery_id])?;
            tx.execute(
                "
                DELETE FROM nudges
                WHERE nudge_id = ?1
                  AND NOT EXISTS (SELECT 1 FROM deliveries WHERE nudge_id = ?1)
                ",
                [nudge_id],
            )?;
            dropped += 1;
        }
        tx.commit()?;
        Ok(dropped)
    }
}

const NODE_SELECT: &str = "
    SELECT node_id, session_id, session_name, event_name, topic, join_code, status,
           last_activity_at, last_audio_at, last_transcript_at, last_summary_at
    FROM nodes
";

fn channel_column(channel: SignalChannel) -> &'static str {
    match channel {
        SignalChannel::Activity => "last_activity_at",
        SignalChannel::Audio => "last_audio_at",
        SignalChannel::Transcript => "last_transcript_at",
        SignalChannel::Summary => "last_summary_at",
    }
}

/// Rolling-window occupancy, urgent nudges included. Timestamps are
/// compared after parsing; RFC 3339 strings with mixed subsecond widths do
/// not sort reliably as text.
fn count_in_window(
    tx: &rusqlite::Transaction<'_>,
    node_id: i64,
    window_start: DateTime<Utc>,
) -> Result<u32, StoreError> {
    let mut stmt = tx.prepare("SELECT created_at FROM nudges WHERE node_id = ?1")?;
    let rows = stmt.query_map([node_id], |row| row.get::<_, String>(0))?;
    let mut count = 0u32;
    for created_at in rows {
        if parse_ts(&created_at?)? > window_start {
            count += 1;
        }
    }
    Ok(count)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Timestamp(format!("{raw}: {err}")))
}

fn ts_from_row(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
    })
    .transpose()
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let status: String = row.get(6)?;
    let status = status.parse::<NodeStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(Node {
        node_id: row.get(0)?,
        session_id: row.get(1)?,
        session_name: row.get(2)?,
        event_name: row.get(3)?,
        topic: row.get(4)?,
        join_code: row.get(5)?,
        status,
        last_activity_at: ts_from_row(7, row.get(7)?)?,
        last_audio_at: ts_from_row(8, row.get(8)?)?,
        last_transcript_at: ts_from_row(9, row.get(9)?)?,
        last_summary_at: ts_from_row(10, row.get(10)?)?,
    })
}

fn delivery_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        delivery_id: row.get(0)?,
        nudge_id: row.get(1)?,
        recipient_node_id: row.get(2)?,
        delivered_at: ts_from_row(3, row.get(3)?)?,
        opened_at: ts_from_row(4, row.get(4)?)?,
        acknowledged_at: ts_from_row(5, row.get(5)?)?,
    })
}

fn nudge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Nudge> {
    let priority: String = row.get(4)?;
    let priority = priority.parse::<NudgePriority>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, err.into())
    })?;
    let created_at: String = row.get(5)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
    Ok(Nudge {
        nudge_id: row.get(0)?,
        node_id: row.get(1)?,
        session_id: row.get(2)?,
        message: row.get(3)?,
        priority,
        created_at,
    })
}
