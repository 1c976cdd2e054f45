use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Folder name of the day bucket for one backup run, e.g. `date-[2024-05-01] (day 2)`.
pub fn day_folder(date: &str, day_index: u32) -> String {
    format!("date-[{}] (day {})", date, day_index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Day {
    pub folder: String,
    pub date: String,
    pub day_index: u32,
    pub created_at: String,
}

/// A committed, immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version_id: String,
    pub day_folder: String,
    /// Relative to the data root
    pub path: String,
    pub created_at: String,
    pub file_count: i64,
    pub total_bytes: i64,
    pub extra: serde_json::Value,
}

fn row_to_day(row: &Row) -> rusqlite::Result<Day> {
    Ok(Day {
        folder: row.get("folder")?,
        date: row.get("date")?,
        day_index: row.get("day_index")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_version(row: &Row) -> rusqlite::Result<VersionRecord> {
    let extra: String = row.get("extra")?;
    Ok(VersionRecord {
        version_id: row.get("version_id")?,
        day_folder: row.get("day_folder")?,
        path: row.get("path")?,
        created_at: row.get("created_at")?,
        file_count: row.get("file_count")?,
        total_bytes: row.get("total_bytes")?,
        extra: serde_json::from_str(&extra).unwrap_or_else(|_| serde_json::json!({})),
    })
}

/// Hands out the next day index for `date` (1, 2, 3, ...) and advances the counter.
/// Indices are never reused, even after the day bucket is deleted.
pub fn next_day_index(conn: &Connection, date: &str) -> anyhow::Result<u32> {
    let current: Option<u32> = conn
        .query_row(
            "SELECT next_index FROM day_counters WHERE date = ?",
            params![date],
            |row| row.get(0),
        )
        .optional()?;
    let index = current.unwrap_or(1);
    conn.execute(
        "INSERT INTO day_counters (date, next_index) VALUES (?1, ?2)
         ON CONFLICT(date) DO UPDATE SET next_index = excluded.next_index",
        params![date, index + 1],
    )?;
    Ok(index)
}

pub fn ensure_day(conn: &Connection, date: &str, day_index: u32) -> anyhow::Result<String> {
    let folder = day_folder(date, day_index);
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO days (folder, date, day_index, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(folder) DO NOTHING",
        params![folder, date, day_index, now],
    )?;
    Ok(folder)
}

pub fn find_day(conn: &Connection, folder: &str) -> anyhow::Result<Option<Day>> {
    let day = conn
        .query_row("SELECT * FROM days WHERE folder = ?", params![folder], row_to_day)
        .optional()?;
    Ok(day)
}

pub fn list_days(conn: &Connection) -> anyhow::Result<Vec<Day>> {
    let mut stmt = conn.prepare("SELECT * FROM days ORDER BY id")?;
    let rows = stmt.query_map([], row_to_day)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert_version(conn: &Connection, version: &VersionRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO versions (version_id, day_folder, path, created_at, file_count, total_bytes, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            version.version_id,
            version.day_folder,
            version.path,
            version.created_at,
            version.file_count,
            version.total_bytes,
            version.extra.to_string(),
        ],
    )?;
    Ok(())
}

pub fn find_version(conn: &Connection, version_id: &str) -> anyhow::Result<Option<VersionRecord>> {
    let version = conn
        .query_row(
            "SELECT * FROM versions WHERE version_id = ?",
            params![version_id],
            row_to_version,
        )
        .optional()?;
    Ok(version)
}

/// Versions of one day in commit order.
pub fn list_versions(conn: &Connection, folder: &str) -> anyhow::Result<Vec<VersionRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM versions WHERE day_folder = ? ORDER BY id")?;
    let rows = stmt.query_map(params![folder], row_to_version)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn count_versions(conn: &Connection) -> anyhow::Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM versions", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_versions_in_day(conn: &Connection, folder: &str) -> anyhow::Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM versions WHERE day_folder = ?",
        params![folder],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// True if a committed version or an open session already uses this id.
pub fn version_id_taken(conn: &Connection, version_id: &str) -> anyhow::Result<bool> {
    let taken: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM versions WHERE version_id = ?1)
              + (SELECT COUNT(*) FROM sessions WHERE version_id = ?1)",
        params![version_id],
        |row| row.get(0),
    )?;
    Ok(taken > 0)
}

pub fn delete_version(conn: &Connection, version_id: &str) -> anyhow::Result<usize> {
    let count = conn.execute("DELETE FROM versions WHERE version_id = ?", params![version_id])?;
    Ok(count)
}

/// Removes the day bucket; its versions go with it through the foreign key.
pub fn delete_day(conn: &Connection, folder: &str) -> anyhow::Result<usize> {
    let count = conn.execute("DELETE FROM days WHERE folder = ?", params![folder])?;
    Ok(count)
}
