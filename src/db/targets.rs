use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::models::{Target, TargetStatus};

/// Fields an operator supplies when registering a target. Everything else
/// takes schema defaults.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub name: String,
    pub service: String,
    pub db_path: String,
    pub backup_files: Vec<String>,
    pub service_name: String,
    pub timeout_seconds: u64,
    pub storage_bucket: String,
}

pub async fn create(conn: &Connection, new: NewTarget) -> Result<Target> {
    let now = Utc::now().to_rfc3339();
    let name = new.name.clone();

    conn.call(move |c| {
        let backup_files = serde_json::to_string(&new.backup_files).unwrap_or_else(|_| "[]".into());
        c.execute(
            "INSERT INTO targets (name, service, db_path, backup_files, service_name,
                                  timeout_seconds, storage_bucket, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                &new.name,
                &new.service,
                &new.db_path,
                backup_files,
                &new.service_name,
                new.timeout_seconds,
                &new.storage_bucket,
                now,
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    get_by_name(conn, name.clone())
        .await?
        .ok_or_else(|| anyhow!("target '{}' vanished after insert", name))
}

pub async fn get(conn: &Connection, id: i64) -> Result<Option<Target>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(&format!("{SELECT_TARGET} WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], target_from_row)?;
        rows.next().transpose()
    })
    .await
    .map_err(|e| anyhow!("Failed to get target {}: {}", id, e))
}

pub async fn get_by_name(conn: &Connection, name: String) -> Result<Option<Target>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(&format!("{SELECT_TARGET} WHERE name = ?1"))?;
        let mut rows = stmt.query_map(params![name], target_from_row)?;
        rows.next().transpose()
    })
    .await
    .map_err(|e| anyhow!("Failed to get target: {}", e))
}

pub async fn list(conn: &Connection) -> Result<Vec<Target>> {
    conn.call(|c| {
        let mut stmt = c.prepare(&format!("{SELECT_TARGET} ORDER BY name"))?;
        let rows = stmt.query_map([], target_from_row)?;
        rows.collect()
    })
    .await
    .map_err(|e| anyhow!("Failed to list targets: {}", e))
}

const SELECT_TARGET: &str = "SELECT id, name, service, db_path, backup_files, service_name,
        status, retention_days, timeout_seconds, storage_bucket, created_at, updated_at
        FROM targets";

fn target_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Target> {
    let backup_files: String = row.get(4)?;
    let status: String = row.get(6)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        service: row.get(2)?,
        db_path: row.get(3)?,
        backup_files: serde_json::from_str(&backup_files).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        service_name: row.get(5)?,
        status: TargetStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown target status '{status}'").into(),
            )
        })?,
        retention_days: row.get(7)?,
        timeout_seconds: row.get(8)?,
        storage_bucket: row.get(9)?,
        created_at: parse_timestamp(row, 10)?,
        updated_at: parse_timestamp(row, 11)?,
    })
}

pub(crate) fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
