use rusqlite::{params, Connection, OptionalExtension};

pub const STORAGE_LOCATIONS: &str = "storage_locations";
pub const ACTIVE_STORAGE_INDEX: &str = "active_storage_index";

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM settings WHERE key = ?", params![key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
