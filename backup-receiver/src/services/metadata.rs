//! Sessions, day buckets and committed versions.
//!
//! All mutations go through [`MetadataStore::mutate`], which holds a single
//! writer lock and wraps the closure in one SQLite transaction. Readers only
//! take a pooled connection.

use crate::db::connection::DbPool;
use crate::models::session::{self, Session};
use crate::models::settings;
use crate::models::version::{self, Day, VersionRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};
use std::sync::{Arc, Mutex};

/// `version-2024-05-01T12-30-45-123Z`
pub fn version_id_for(now: DateTime<Utc>) -> String {
    format!("version-{}", now.format("%Y-%m-%dT%H-%M-%S-%3fZ"))
}

/// Fixed-width UTC timestamps so stored values order lexically.
pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Summary stored alongside a committed version.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub file_count: i64,
    pub total_bytes: i64,
    pub extra: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct DeletedVersion {
    pub version: VersionRecord,
    /// The day bucket went away with its last version
    pub day_removed: bool,
}

/// Result of trying to take a session for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionClaim {
    Claimed(Session),
    /// Another commit holds the session
    Busy,
    Unknown,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: DbPool,
    writer: Arc<Mutex<()>>,
}

impl MetadataStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    async fn read<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    async fn mutate<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Transaction) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = writer.lock().unwrap_or_else(|e| e.into_inner());
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    /// Allocates the day index, a unique version id and a unique session key,
    /// then persists the session. All in one transaction.
    pub async fn create_session(
        &self,
        client_id: &str,
        date: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Session> {
        let client_id = client_id.to_string();
        let date = date.to_string();
        self.mutate(move |tx| {
            let day_index = version::next_day_index(tx, &date)?;

            let base_version = version_id_for(now);
            let mut version_id = base_version.clone();
            let mut n = 1;
            while version::version_id_taken(tx, &version_id)? {
                version_id = format!("{}-{}", base_version, n);
                n += 1;
            }

            let base_key = format!("{}_{}", client_id, now.timestamp_millis());
            let mut session_key = base_key.clone();
            let mut n = 1;
            while session::find_by_key(tx, &session_key)?.is_some() {
                session_key = format!("{}_{}", base_key, n);
                n += 1;
            }

            let version_path = format!(
                "backups/{}/{}",
                version::day_folder(&date, day_index),
                version_id
            );
            let session = Session {
                session_key,
                client_id,
                date,
                day_index,
                version_id,
                version_path,
                created_at: timestamp(now),
            };
            session::insert(tx, &session)?;
            Ok(session)
        })
        .await
    }

    pub async fn session_by_key(&self, session_key: &str) -> anyhow::Result<Option<Session>> {
        let key = session_key.to_string();
        self.read(move |conn| session::find_by_key(conn, &key)).await
    }

    pub async fn session_by_version(&self, version_id: &str) -> anyhow::Result<Option<Session>> {
        let id = version_id.to_string();
        self.read(move |conn| session::find_by_version_id(conn, &id)).await
    }

    pub async fn record_provisional_file(
        &self,
        session_key: &str,
        relpath: &str,
        sha: &str,
    ) -> anyhow::Result<()> {
        let (key, relpath, sha) = (session_key.to_string(), relpath.to_string(), sha.to_string());
        self.mutate(move |tx| session::add_file(tx, &key, &relpath, &sha)).await
    }

    pub async fn provisional_files(&self, session_key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let key = session_key.to_string();
        self.read(move |conn| session::files(conn, &key)).await
    }

    /// Takes the session for one commit. Until [`commit_session`] or
    /// [`release_session`], further claims get [`SessionClaim::Busy`].
    ///
    /// [`commit_session`]: Self::commit_session
    /// [`release_session`]: Self::release_session
    pub async fn claim_session(&self, session_key: &str) -> anyhow::Result<SessionClaim> {
        let key = session_key.to_string();
        self.mutate(move |tx| {
            let Some(session) = session::find_by_key(tx, &key)? else {
                return Ok(SessionClaim::Unknown);
            };
            if session::claim(tx, &key)? {
                Ok(SessionClaim::Claimed(session))
            } else {
                Ok(SessionClaim::Busy)
            }
        })
        .await
    }

    /// Hands a claimed session back so the client can retry its commit.
    pub async fn release_session(&self, session_key: &str) -> anyhow::Result<()> {
        let key = session_key.to_string();
        self.mutate(move |tx| session::release(tx, &key).map(|_| ())).await
    }

    /// Registers the session's version under its day bucket and drops the
    /// session. `None` if the session no longer exists.
    pub async fn commit_session(
        &self,
        session_key: &str,
        summary: CommitSummary,
    ) -> anyhow::Result<Option<VersionRecord>> {
        let key = session_key.to_string();
        self.mutate(move |tx| {
            let Some(session) = session::find_by_key(tx, &key)? else {
                return Ok(None);
            };
            let folder = version::ensure_day(tx, &session.date, session.day_index)?;
            let record = VersionRecord {
                version_id: session.version_id.clone(),
                day_folder: folder,
                path: session.version_path.clone(),
                created_at: summary.created_at,
                file_count: summary.file_count,
                total_bytes: summary.total_bytes,
                extra: summary.extra,
            };
            version::insert_version(tx, &record)?;
            session::delete(tx, &key)?;
            Ok(Some(record))
        })
        .await
    }

    pub async fn list_days(&self) -> anyhow::Result<Vec<Day>> {
        self.read(|conn| version::list_days(conn)).await
    }

    pub async fn find_day(&self, folder: &str) -> anyhow::Result<Option<Day>> {
        let folder = folder.to_string();
        self.read(move |conn| version::find_day(conn, &folder)).await
    }

    pub async fn list_versions(&self, folder: &str) -> anyhow::Result<Vec<VersionRecord>> {
        let folder = folder.to_string();
        self.read(move |conn| version::list_versions(conn, &folder)).await
    }

    /// Every day with its versions, oldest first.
    pub async fn days_with_versions(&self) -> anyhow::Result<Vec<(Day, Vec<VersionRecord>)>> {
        self.read(|conn| {
            let mut out = Vec::new();
            for day in version::list_days(conn)? {
                let versions = version::list_versions(conn, &day.folder)?;
                out.push((day, versions));
            }
            Ok(out)
        })
        .await
    }

    pub async fn version(&self, version_id: &str) -> anyhow::Result<Option<VersionRecord>> {
        let id = version_id.to_string();
        self.read(move |conn| version::find_version(conn, &id)).await
    }

    pub async fn count_versions(&self) -> anyhow::Result<i64> {
        self.read(|conn| version::count_versions(conn)).await
    }

    /// Deletes one version and, if it was the last one, its day bucket.
    pub async fn delete_version(&self, version_id: &str) -> anyhow::Result<Option<DeletedVersion>> {
        let id = version_id.to_string();
        self.mutate(move |tx| {
            let Some(record) = version::find_version(tx, &id)? else {
                return Ok(None);
            };
            version::delete_version(tx, &id)?;
            let day_removed = if version::count_versions_in_day(tx, &record.day_folder)? == 0 {
                version::delete_day(tx, &record.day_folder)? > 0
            } else {
                false
            };
            Ok(Some(DeletedVersion {
                version: record,
                day_removed,
            }))
        })
        .await
    }

    /// Deletes a day bucket with all its versions. Returns the removed
    /// versions, or `None` if the day does not exist.
    pub async fn delete_day(&self, folder: &str) -> anyhow::Result<Option<Vec<VersionRecord>>> {
        let folder = folder.to_string();
        self.mutate(move |tx| {
            if version::find_day(tx, &folder)?.is_none() {
                return Ok(None);
            }
            let versions = version::list_versions(tx, &folder)?;
            version::delete_day(tx, &folder)?;
            Ok(Some(versions))
        })
        .await
    }

    /// Drops sessions created before `cutoff`. Blobs they uploaded stay in
    /// the content store.
    pub async fn prune_sessions(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<Session>> {
        let cutoff = timestamp(cutoff);
        self.mutate(move |tx| {
            let stale = session::find_created_before(tx, &cutoff)?;
            for s in &stale {
                session::delete(tx, &s.session_key)?;
            }
            Ok(stale)
        })
        .await
    }

    pub async fn setting(&self, key: &'static str) -> anyhow::Result<Option<String>> {
        self.read(move |conn| settings::get(conn, key)).await
    }

    pub async fn set_setting(&self, key: &'static str, value: String) -> anyhow::Result<()> {
        self.mutate(move |tx| settings::set(tx, key, &value)).await
    }
}
