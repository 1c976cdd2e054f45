use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// An in-flight backup run between `init-backup` and `commit-version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_key: String,
    pub client_id: String,
    pub date: String,
    pub day_index: u32,
    pub version_id: String,
    /// Relative to the data root
    pub version_path: String,
    pub created_at: String,
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        session_key: row.get("session_key")?,
        client_id: row.get("client_id")?,
        date: row.get("date")?,
        day_index: row.get("day_index")?,
        version_id: row.get("version_id")?,
        version_path: row.get("version_path")?,
        created_at: row.get("created_at")?,
    })
}

pub fn find_by_key(conn: &Connection, session_key: &str) -> anyhow::Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT * FROM sessions WHERE session_key = ?",
            params![session_key],
            row_to_session,
        )
        .optional()?;
    Ok(session)
}

pub fn find_by_version_id(conn: &Connection, version_id: &str) -> anyhow::Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT * FROM sessions WHERE version_id = ?",
            params![version_id],
            row_to_session,
        )
        .optional()?;
    Ok(session)
}

pub fn find_created_before(conn: &Connection, cutoff: &str) -> anyhow::Result<Vec<Session>> {
    let mut stmt = conn.prepare("SELECT * FROM sessions WHERE created_at < ? ORDER BY created_at")?;
    let rows = stmt.query_map(params![cutoff], row_to_session)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert(conn: &Connection, session: &Session) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO sessions (session_key, client_id, date, day_index, version_id, version_path, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session.session_key,
            session.client_id,
            session.date,
            session.day_index,
            session.version_id,
            session.version_path,
            session.created_at,
        ],
    )?;
    Ok(())
}

/// Marks an idle session as being committed. False when the session is
/// missing or another commit already holds it.
pub fn claim(conn: &Connection, session_key: &str) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE sessions SET committing = 1 WHERE session_key = ? AND committing = 0",
        params![session_key],
    )?;
    Ok(count == 1)
}

pub fn release(conn: &Connection, session_key: &str) -> anyhow::Result<usize> {
    let count = conn.execute(
        "UPDATE sessions SET committing = 0 WHERE session_key = ?",
        params![session_key],
    )?;
    Ok(count)
}

pub fn delete(conn: &Connection, session_key: &str) -> anyhow::Result<usize> {
    let count = conn.execute("DELETE FROM sessions WHERE session_key = ?", params![session_key])?;
    Ok(count)
}

/// Records one verified upload in the session's provisional file map.
/// A later upload for the same path replaces the earlier hash.
pub fn add_file(conn: &Connection, session_key: &str, relpath: &str, sha: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO session_files (session_key, relpath, sha, uploaded_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_key, relpath) DO UPDATE SET sha = excluded.sha, uploaded_at = excluded.uploaded_at",
        params![session_key, relpath, sha, now],
    )?;
    Ok(())
}

pub fn files(conn: &Connection, session_key: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT relpath, sha FROM session_files WHERE session_key = ? ORDER BY relpath",
    )?;
    let rows = stmt.query_map(params![session_key], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
