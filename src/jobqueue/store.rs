//! SQLite persistence for jobs and the webhook registry.
//!
//! One connection behind a mutex; every method is synchronous. Async code
//! goes through [`JobStore::blocking`], which hops onto the blocking pool.
//!
//! The database runs in WAL mode with `synchronous = FULL`. The schema is
//! versioned through a `schema_version` table and migrated on open.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::args::{Job, JobKind, JobState, WebhookArgs};
use crate::config::SecretStore;
use crate::types::{ConnectorId, JobId};

const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error during {op}: {source}")]
    Sqlite {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("corrupt {what} in row {id}: {detail}")]
    Corrupt {
        what: &'static str,
        id: i64,
        detail: String,
    },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("database schema version {found} is newer than supported version {supported}")]
    FutureSchema { found: i64, supported: i64 },

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("blocking store task failed: {0}")]
    Join(String),
}

fn sqlite(op: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| StoreError::Sqlite { op, source }
}

/// Whether a registry row has a live webhook behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    /// Installed by this service.
    Automatic,
    /// Installed, but the forge expects manual confirmation.
    Manual,
    /// Removed or never installed.
    Unconnected,
}

impl RegistryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryStatus::Automatic => "automatic",
            RegistryStatus::Manual => "manual",
            RegistryStatus::Unconnected => "unconnected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(RegistryStatus::Automatic),
            "manual" => Some(RegistryStatus::Manual),
            "unconnected" => Some(RegistryStatus::Unconnected),
            _ => None,
        }
    }
}

/// One row of `webhook_registry`, keyed by `(connector_id, project_full_name)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryRecord {
    pub connector_id: ConnectorId,
    pub provider: String,
    pub provider_project_id: String,
    pub project_name: String,
    pub project_full_name: String,
    pub webhook_id: String,
    pub webhook_url: String,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub webhook_name: String,
    pub events: String,
    pub status: RegistryStatus,
    pub last_verified_at: DateTime<Utc>,
}

/// Shared handle to the queue database.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Opens (creating if needed) the database at `path` and migrates it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(dir = %parent.display(), error = %e, "Failed to create database directory");
        }
        let conn = Connection::open(path).map_err(sqlite("open"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite("open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(sqlite("set journal_mode"))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            debug!(journal_mode, "WAL unavailable, keeping default journal");
        }
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite("configure"))?;

        let version: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sqlite("read schema version"))?
            .unwrap_or(0);
        migrate(&conn, version)?;

        Ok(JobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` against this store on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&JobStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // ─── Jobs ─────────────────────────────────────────────────────────────

    /// Persists a new job, runnable immediately.
    pub fn insert(
        &self,
        kind: JobKind,
        args: &WebhookArgs,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<JobId, StoreError> {
        let args_json = serde_json::to_string(args).map_err(|e| StoreError::Corrupt {
            what: "job args",
            id: 0,
            detail: e.to_string(),
        })?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (kind, args, state, attempt, max_attempts, scheduled_at, created_at, updated_at)
             VALUES (?1, ?2, 'available', 0, ?3, ?4, ?4, ?4)",
            params![kind.as_str(), args_json, max_attempts, now.timestamp_millis()],
        )
        .map_err(sqlite("insert job"))?;
        let id = JobId(conn.last_insert_rowid());
        info!(job_id = %id, kind = %kind, connector_id = %args.connector_id, project = %args.project_path, "Job enqueued");
        Ok(id)
    }

    /// Atomically moves the oldest runnable job to `running` and returns it.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "UPDATE jobs
             SET state = 'running', attempt = attempt + 1, attempted_at = ?1, updated_at = ?1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state IN ('available', 'retryable') AND scheduled_at <= ?1
                 ORDER BY scheduled_at, id
                 LIMIT 1
             )
             RETURNING id, kind, args, state, attempt, max_attempts, last_error",
            params![now.timestamp_millis()],
            read_job,
        )
        .optional()
        .map_err(sqlite("claim job"))?
        .transpose()
    }

    pub fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET state = 'completed', last_error = NULL, finalized_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![id.0, now.timestamp_millis()],
            )
            .map_err(sqlite("complete job"))?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Records a failed run. The job becomes `retryable` at `next_run`, or
    /// `discarded` when it has used all its attempts.
    pub fn fail(
        &self,
        id: JobId,
        error: &str,
        next_run: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobState, StoreError> {
        let conn = self.lock()?;
        let state: Option<String> = conn
            .query_row(
                "UPDATE jobs
                 SET state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'retryable' END,
                     last_error = ?2,
                     scheduled_at = ?3,
                     finalized_at = CASE WHEN attempt >= max_attempts THEN ?4 ELSE NULL END,
                     updated_at = ?4
                 WHERE id = ?1
                 RETURNING state",
                params![
                    id.0,
                    error,
                    next_run.timestamp_millis(),
                    now.timestamp_millis()
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite("fail job"))?;
        let state = state.ok_or(StoreError::NotFound(id))?;
        state.parse().map_err(|detail| StoreError::Corrupt {
            what: "job state",
            id: id.0,
            detail,
        })
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, kind, args, state, attempt, max_attempts, last_error FROM jobs WHERE id = ?1",
            params![id.0],
            read_job,
        )
        .optional()
        .map_err(sqlite("get job"))?
        .transpose()
    }

    /// Makes jobs left `running` by a previous process runnable again.
    pub fn recover_running(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let recovered = conn
            .execute(
                "UPDATE jobs SET state = 'retryable', scheduled_at = ?1, updated_at = ?1
                 WHERE state = 'running'",
                params![now.timestamp_millis()],
            )
            .map_err(sqlite("recover jobs"))?;
        if recovered > 0 {
            warn!(recovered, "Requeued jobs interrupted by a previous shutdown");
        }
        Ok(recovered)
    }

    /// Earliest `scheduled_at` among runnable jobs, if any.
    pub fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let millis: Option<i64> = conn
            .query_row(
                "SELECT MIN(scheduled_at) FROM jobs WHERE state IN ('available', 'retryable')",
                [],
                |row| row.get(0),
            )
            .map_err(sqlite("next scheduled"))?;
        Ok(millis.and_then(|m| Utc.timestamp_millis_opt(m).single()))
    }

    // ─── Webhook registry ─────────────────────────────────────────────────

    /// Inserts or updates the row for `(connector_id, project_full_name)`.
    pub fn upsert_registry(&self, record: &RegistryRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO webhook_registry (
                 connector_id, provider, provider_project_id, project_name, project_full_name,
                 webhook_id, webhook_url, webhook_secret, webhook_name, events, status,
                 last_verified_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(connector_id, project_full_name) DO UPDATE SET
                 provider = excluded.provider,
                 provider_project_id = excluded.provider_project_id,
                 project_name = excluded.project_name,
                 webhook_id = excluded.webhook_id,
                 webhook_url = excluded.webhook_url,
                 webhook_secret = excluded.webhook_secret,
                 webhook_name = excluded.webhook_name,
                 events = excluded.events,
                 status = excluded.status,
                 last_verified_at = excluded.last_verified_at,
                 updated_at = excluded.updated_at",
            params![
                record.connector_id.as_str(),
                record.provider,
                record.provider_project_id,
                record.project_name,
                record.project_full_name,
                record.webhook_id,
                record.webhook_url,
                record.webhook_secret,
                record.webhook_name,
                record.events,
                record.status.as_str(),
                record.last_verified_at.timestamp_millis(),
                now,
            ],
        )
        .map_err(sqlite("upsert registry"))?;
        debug!(
            connector_id = %record.connector_id,
            project = %record.project_full_name,
            status = record.status.as_str(),
            webhook_id = %record.webhook_id,
            "Webhook registry updated"
        );
        Ok(())
    }

    pub fn registry(
        &self,
        connector_id: &ConnectorId,
        project_full_name: &str,
    ) -> Result<Option<RegistryRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT rowid, connector_id, provider, provider_project_id, project_name, project_full_name,
                    webhook_id, webhook_url, webhook_secret, webhook_name, events, status, last_verified_at
             FROM webhook_registry WHERE connector_id = ?1 AND project_full_name = ?2",
            params![connector_id.as_str(), project_full_name],
            read_registry,
        )
        .optional()
        .map_err(sqlite("get registry"))?
        .transpose()
    }

    pub fn registry_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM webhook_registry", [], |row| row.get(0))
            .map_err(sqlite("count registry"))?;
        Ok(n as usize)
    }
}

impl SecretStore for JobStore {
    /// Secret of the most recently verified live webhook for the connector.
    fn webhook_secret(
        &self,
        connector_id: &ConnectorId,
        provider: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let secret: Option<Option<String>> = conn
            .query_row(
                "SELECT webhook_secret FROM webhook_registry
                 WHERE connector_id = ?1 AND provider = ?2 AND status != 'unconnected'
                 ORDER BY last_verified_at DESC
                 LIMIT 1",
                params![connector_id.as_str(), provider],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite("lookup webhook secret"))?;
        Ok(secret.flatten().filter(|s| !s.is_empty()))
    }

    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(sqlite("ping"))?;
        Ok(())
    }
}

fn migrate(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
    if from_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: from_version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if from_version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    if from_version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                args TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_error TEXT,
                scheduled_at INTEGER NOT NULL,
                attempted_at INTEGER,
                finalized_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_runnable
                ON jobs(scheduled_at, id) WHERE state IN ('available', 'retryable');

            CREATE TABLE IF NOT EXISTS webhook_registry (
                connector_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_project_id TEXT NOT NULL,
                project_name TEXT NOT NULL,
                project_full_name TEXT NOT NULL,
                webhook_id TEXT NOT NULL,
                webhook_url TEXT NOT NULL,
                webhook_secret TEXT,
                webhook_name TEXT NOT NULL,
                events TEXT NOT NULL,
                status TEXT NOT NULL,
                last_verified_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (connector_id, project_full_name)
            );
            "#,
        )
        .map_err(sqlite("migration v1"))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        params![CURRENT_SCHEMA_VERSION],
    )
    .map_err(sqlite("update schema version"))?;
    Ok(())
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Row mapper for jobs. Column errors fail the query; content errors are
/// reported as [`StoreError::Corrupt`].
fn read_job(row: &Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let id: i64 = row.get(0)?;
    let kind: String = row.get(1)?;
    let args: String = row.get(2)?;
    let state: String = row.get(3)?;
    let attempt: u32 = row.get(4)?;
    let max_attempts: u32 = row.get(5)?;
    let last_error: Option<String> = row.get(6)?;

    let corrupt = |what: &'static str, detail: String| StoreError::Corrupt { what, id, detail };
    Ok((|| -> Result<Job, StoreError> {
        Ok(Job {
            id: JobId(id),
            kind: kind.parse().map_err(|e| corrupt("job kind", e))?,
            args: serde_json::from_str(&args).map_err(|e| corrupt("job args", e.to_string()))?,
            state: state.parse().map_err(|e| corrupt("job state", e))?,
            attempt,
            max_attempts,
            last_error,
        })
    })())
}

fn read_registry(row: &Row<'_>) -> rusqlite::Result<Result<RegistryRecord, StoreError>> {
    let rowid: i64 = row.get(0)?;
    let status: String = row.get(11)?;
    let Some(status) = RegistryStatus::parse(&status) else {
        return Ok(Err(StoreError::Corrupt {
            what: "registry status",
            id: rowid,
            detail: status,
        }));
    };
    Ok(Ok(RegistryRecord {
        connector_id: ConnectorId(row.get(1)?),
        provider: row.get(2)?,
        provider_project_id: row.get(3)?,
        project_name: row.get(4)?,
        project_full_name: row.get(5)?,
        webhook_id: row.get(6)?,
        webhook_url: row.get(7)?,
        webhook_secret: row.get(8)?,
        webhook_name: row.get(9)?,
        events: row.get(10)?,
        status,
        last_verified_at: millis_to_datetime(row.get(12)?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn args() -> WebhookArgs {
        WebhookArgs {
            connector_id: ConnectorId::new("3"),
            project_path: "team/api".into(),
            provider: "gitlab".into(),
            base_url: "https://gitlab.example.com".into(),
            pat: "token".into(),
        }
    }

    fn record(status: RegistryStatus, webhook_id: &str) -> RegistryRecord {
        RegistryRecord {
            connector_id: ConnectorId::new("3"),
            provider: "gitlab".into(),
            provider_project_id: "17".into(),
            project_name: "api".into(),
            project_full_name: "team/api".into(),
            webhook_id: webhook_id.into(),
            webhook_url: "https://relay.example.com/api/v1/gitlab-hook/3".into(),
            webhook_secret: Some("hook-secret".into()),
            webhook_name: "Review Relay Webhook".into(),
            events: "merge_requests,notes".into(),
            status,
            last_verified_at: Utc::now(),
        }
    }

    #[test]
    fn claim_is_exclusive_and_counts_attempts() {
        let store = JobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let id = store.insert(JobKind::WebhookInstall, &args(), 3, now).unwrap();

        let job = store.claim_next(now).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.args, args());

        assert!(store.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn failed_job_waits_for_its_schedule_then_is_discarded() {
        let store = JobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(10);
        let id = store.insert(JobKind::WebhookRemoval, &args(), 2, now).unwrap();

        store.claim_next(now).unwrap().unwrap();
        let state = store.fail(id, "502 bad gateway", later, now).unwrap();
        assert_eq!(state, JobState::Retryable);
        assert!(store.claim_next(now).unwrap().is_none());
        assert_eq!(store.next_scheduled().unwrap(), Some(millis_to_datetime(later.timestamp_millis())));

        let job = store.claim_next(later).unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.last_error.as_deref(), Some("502 bad gateway"));

        let state = store.fail(id, "still down", later, later).unwrap();
        assert_eq!(state, JobState::Discarded);
        assert!(store.claim_next(later).unwrap().is_none());
        assert_eq!(store.next_scheduled().unwrap(), None);
    }

    #[test]
    fn complete_is_terminal() {
        let store = JobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let id = store.insert(JobKind::WebhookInstall, &args(), 3, now).unwrap();
        store.claim_next(now).unwrap();
        store.complete(id, now).unwrap();

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.state.is_terminal());
        assert!(matches!(
            store.complete(JobId(999), now),
            Err(StoreError::NotFound(JobId(999)))
        ));
    }

    #[test]
    fn interrupted_jobs_are_recovered_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let now = Utc::now();
        {
            let store = JobStore::open(&path).unwrap();
            store.insert(JobKind::WebhookInstall, &args(), 3, now).unwrap();
            store.claim_next(now).unwrap().unwrap();
        }

        let store = JobStore::open(&path).unwrap();
        assert_eq!(store.recover_running(now).unwrap(), 1);
        let job = store.claim_next(now).unwrap().unwrap();
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn registry_upsert_updates_in_place() {
        let store = JobStore::open_in_memory().unwrap();
        store.upsert_registry(&record(RegistryStatus::Automatic, "11")).unwrap();
        store.upsert_registry(&record(RegistryStatus::Automatic, "12")).unwrap();

        assert_eq!(store.registry_count().unwrap(), 1);
        let row = store
            .registry(&ConnectorId::new("3"), "team/api")
            .unwrap()
            .unwrap();
        assert_eq!(row.webhook_id, "12");
        assert_eq!(row.status, RegistryStatus::Automatic);
    }

    #[test]
    fn secret_lookup_ignores_unconnected_rows() {
        let store = JobStore::open_in_memory().unwrap();
        let connector = ConnectorId::new("3");
        store.upsert_registry(&record(RegistryStatus::Automatic, "11")).unwrap();
        assert_eq!(
            store.webhook_secret(&connector, "gitlab").unwrap().as_deref(),
            Some("hook-secret")
        );
        assert_eq!(store.webhook_secret(&connector, "github").unwrap(), None);

        store.upsert_registry(&record(RegistryStatus::Unconnected, "")).unwrap();
        assert_eq!(store.webhook_secret(&connector, "gitlab").unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_runs_on_the_pool() {
        let store = JobStore::open_in_memory().unwrap();
        let id = store
            .blocking(|s| s.insert(JobKind::WebhookInstall, &args(), 1, Utc::now()))
            .await
            .unwrap();
        assert_eq!(id, JobId(1));
    }
}
