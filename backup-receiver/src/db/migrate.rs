use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS day_counters (
  date TEXT PRIMARY KEY,
  next_index INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
  session_key TEXT PRIMARY KEY,
  client_id TEXT NOT NULL,
  date TEXT NOT NULL,
  day_index INTEGER NOT NULL,
  version_id TEXT NOT NULL UNIQUE,
  version_path TEXT NOT NULL,
  created_at TEXT NOT NULL,
  committing INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS session_files (
  session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
  relpath TEXT NOT NULL,
  sha TEXT NOT NULL,
  uploaded_at TEXT NOT NULL,
  PRIMARY KEY (session_key, relpath)
);

CREATE TABLE IF NOT EXISTS days (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  folder TEXT NOT NULL UNIQUE,
  date TEXT NOT NULL,
  day_index INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS versions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version_id TEXT NOT NULL UNIQUE,
  day_folder TEXT NOT NULL REFERENCES days(folder) ON DELETE CASCADE,
  path TEXT NOT NULL,
  created_at TEXT NOT NULL,
  file_count INTEGER NOT NULL DEFAULT 0,
  total_bytes INTEGER NOT NULL DEFAULT 0,
  extra TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_versions_day_folder ON versions(day_folder);
CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);
"#;

fn has_column(conn: &rusqlite::Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns.iter().any(|c| c == column))
}

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    if !has_column(&conn, "sessions", "committing")? {
        conn.execute_batch("ALTER TABLE sessions ADD COLUMN committing INTEGER NOT NULL DEFAULT 0")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
