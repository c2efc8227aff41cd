use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    helpers::{from_flag, parse_datetime, to_flag},
    Database,
};

/// Raw row of the per-principal local snapshot table. The payload is the
/// versioned JSON record; decoding and upgrading it is the caller's job.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub principal_id: String,
    pub payload: String,
    pub is_finishing: bool,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    /// Overwrites the record and clears the finishing guard. Only a fresh
    /// session start may do this.
    pub async fn replace_snapshot(
        &self,
        principal_id: &str,
        payload: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let principal_id = principal_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO local_snapshots (principal_id, payload, is_finishing, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(principal_id) DO UPDATE
                 SET payload = excluded.payload,
                     is_finishing = excluded.is_finishing,
                     updated_at = excluded.updated_at",
                params![principal_id, payload, to_flag(false), updated_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Last-write-wins save that is suppressed while the record is finishing.
    /// Returns whether a row was written.
    pub async fn write_snapshot(
        &self,
        principal_id: &str,
        payload: String,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let principal_id = principal_id.to_string();
        self.execute(move |conn| guarded_write(conn, &principal_id, &payload, updated_at))
            .await
    }

    /// Same as [`write_snapshot`](Self::write_snapshot) without waiting for
    /// the result. The write still runs after everything sent before it.
    pub fn queue_snapshot_write(
        &self,
        principal_id: &str,
        payload: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let principal_id = principal_id.to_string();
        self.enqueue(move |conn| {
            if !guarded_write(conn, &principal_id, &payload, updated_at)? {
                info!("Snapshot write for {principal_id} suppressed while finishing");
            }
            Ok(())
        })
    }

    pub async fn mark_snapshot_finishing(
        &self,
        principal_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let principal_id = principal_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE local_snapshots
                 SET is_finishing = 1,
                     payload = CASE
                         WHEN json_valid(payload)
                         THEN json_set(payload, '$.isFinishing', json('true'))
                         ELSE payload
                     END,
                     updated_at = ?2
                 WHERE principal_id = ?1",
                params![principal_id, updated_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_snapshot(&self, principal_id: &str) -> Result<Option<StoredSnapshot>> {
        let principal_id = principal_id.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT principal_id, payload, is_finishing, updated_at
                     FROM local_snapshots
                     WHERE principal_id = ?1",
                    params![principal_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((principal_id, payload, is_finishing, updated_at)) => Ok(Some(StoredSnapshot {
                    principal_id,
                    payload,
                    is_finishing: from_flag(is_finishing),
                    updated_at: parse_datetime(&updated_at, "updated_at")?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn delete_snapshot(&self, principal_id: &str) -> Result<()> {
        let principal_id = principal_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM local_snapshots WHERE principal_id = ?1",
                params![principal_id],
            )?;
            Ok(())
        })
        .await
    }
}

fn guarded_write(
    conn: &mut Connection,
    principal_id: &str,
    payload: &str,
    updated_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO local_snapshots (principal_id, payload, is_finishing, updated_at)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(principal_id) DO UPDATE
         SET payload = excluded.payload,
             updated_at = excluded.updated_at
         WHERE local_snapshots.is_finishing = 0",
        params![principal_id, payload, updated_at.to_rfc3339()],
    )?;
    Ok(changed > 0)
}
