//! Durable job queue for StoryCrew.
//!
//! The [`DurableQueue`] trait lets the dispatcher hand jobs to worker loops,
//! possibly in another process. Two backends ship:
//! - [`MemoryQueue`]: process-local, for tests and single-process runs
//! - [`LibsqlQueue`]: Turso Embedded / libSQL file database shared by the
//!   `submit`, `status` and `worker` CLI commands
//!
//! Each item carries a full [`Job`] snapshot. `dequeue` claims the oldest
//! queued item by flipping it to running, so an item is claimed at most once.
//! Terminal items stay readable until [`DurableQueue::evict_terminal`] drops
//! them.

mod memory;
mod migrations;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use storycrew_shared::{Job, JobPatch, JobStatus, Result, StoryCrewError};

pub use memory::MemoryQueue;

/// How often [`LibsqlQueue::dequeue`] polls for new rows.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A FIFO of job snapshots with at-most-once claiming.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Store a queued job. Returns the item ID (the job ID).
    async fn enqueue(&self, job: &Job) -> Result<String>;

    /// Claim the oldest queued job, waiting up to `timeout` for one to appear.
    /// The returned snapshot is already `running`.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>>;

    async fn get_status(&self, item_id: &str) -> Result<Option<Job>>;

    /// Apply a state-machine transition to a stored item.
    async fn update_status(&self, item_id: &str, status: JobStatus, patch: JobPatch) -> Result<()>;

    /// Number of items still waiting to be claimed.
    async fn pending(&self) -> Result<usize>;

    /// Drop completed and failed items that finished before `before`.
    /// Returns how many were removed.
    async fn evict_terminal(&self, before: DateTime<Utc>) -> Result<usize>;
}

fn storage_err(e: libsql::Error) -> StoryCrewError {
    StoryCrewError::Storage(e.to_string())
}

/// Fixed-width UTC timestamps, so SQL string comparison orders them.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// LibsqlQueue
// ---------------------------------------------------------------------------

/// Queue persisted in a local libSQL database.
pub struct LibsqlQueue {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
    worker_id: String,
    poll_interval: Duration,
}

impl LibsqlQueue {
    /// Open or create a queue database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoryCrewError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        // Several CLI processes may share the file.
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .await
            .map_err(storage_err)?;

        let queue = Self {
            db,
            conn: Mutex::new(conn),
            worker_id: Uuid::now_v7().to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        queue.run_migrations().await?;
        tracing::debug!(
            path = %path.display(),
            worker_id = %queue.worker_id,
            "queue database opened"
        );
        Ok(queue)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Identifier recorded on rows this handle claims.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    StoryCrewError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    async fn load(conn: &Connection, item_id: &str) -> Result<Option<Job>> {
        let mut rows = conn
            .query("SELECT job_json FROM queue_items WHERE id = ?1", params![item_id])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let raw: String = row.get(0).map_err(storage_err)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Write `job` back if the row is still in `expected` status.
    /// Returns false when another writer moved the row first.
    async fn store_if(
        conn: &Connection,
        job: &Job,
        expected: JobStatus,
        claimed_by: Option<&str>,
    ) -> Result<bool> {
        let json = serde_json::to_string(job)?;
        let now = timestamp(Utc::now());
        let changed = conn
            .execute(
                "UPDATE queue_items
                 SET status = ?1, job_json = ?2, updated_at = ?3,
                     claimed_by = COALESCE(?4, claimed_by)
                 WHERE id = ?5 AND status = ?6",
                params![
                    job.status.as_str(),
                    json,
                    now,
                    claimed_by,
                    job.id.as_str(),
                    expected.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed == 1)
    }

    /// Mark a queued row failed without going through its snapshot.
    async fn quarantine(conn: &Connection, item_id: &str, error: &str) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE queue_items
                 SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'queued'",
                params![error, timestamp(Utc::now()), item_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed == 1)
    }

    async fn try_claim(&self) -> Result<Option<Job>> {
        let conn = self.conn.lock().await;
        loop {
            let mut rows = conn
                .query(
                    "SELECT id, job_json FROM queue_items
                     WHERE status = 'queued' ORDER BY seq LIMIT 1",
                    params![],
                )
                .await
                .map_err(storage_err)?;
            let Some(row) = rows.next().await.map_err(storage_err)? else {
                return Ok(None);
            };
            let id: String = row.get(0).map_err(storage_err)?;
            let raw: String = row.get(1).map_err(storage_err)?;
            drop(rows);

            let claimed = serde_json::from_str::<Job>(&raw)
                .map_err(StoryCrewError::from)
                .and_then(|mut job| {
                    job.transition(JobStatus::Running, JobPatch::started(Utc::now()))?;
                    Ok(job)
                });
            let job = match claimed {
                Ok(job) => job,
                Err(e) => {
                    // An unreadable row must not block the items behind it.
                    let error = format!("unreadable queue item: {e}");
                    if Self::quarantine(&conn, &id, &error).await? {
                        tracing::warn!(item_id = %id, error = %e, "failed unreadable queue item");
                    }
                    continue;
                }
            };
            if Self::store_if(&conn, &job, JobStatus::Queued, Some(&self.worker_id)).await? {
                tracing::debug!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    "claimed queue item"
                );
                return Ok(Some(job));
            }
            // Another process claimed it between our read and write.
        }
    }
}

#[async_trait]
impl DurableQueue for LibsqlQueue {
    async fn enqueue(&self, job: &Job) -> Result<String> {
        if job.status != JobStatus::Queued {
            return Err(StoryCrewError::validation(format!(
                "only queued jobs can be enqueued, {} is {}",
                job.id, job.status
            )));
        }
        let conn = self.conn.lock().await;
        if Self::load(&conn, job.id.as_str()).await?.is_some() {
            return Err(StoryCrewError::DuplicateId(job.id.to_string()));
        }

        let json = serde_json::to_string(job)?;
        let now = timestamp(Utc::now());
        conn.execute(
            "INSERT INTO queue_items
                 (id, status, pipeline_type, project_id, enqueued_at, updated_at, job_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id.as_str(),
                job.status.as_str(),
                job.pipeline_type.as_str(),
                job.project_id.as_str(),
                now.as_str(),
                now.as_str(),
                json
            ],
        )
        .await
        .map_err(storage_err)?;

        Ok(job.id.to_string())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_claim().await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn get_status(&self, item_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().await;
        Self::load(&conn, item_id).await
    }

    async fn update_status(&self, item_id: &str, status: JobStatus, patch: JobPatch) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut job = Self::load(&conn, item_id)
            .await?
            .ok_or_else(|| StoryCrewError::NotFound(item_id.to_string()))?;
        let previous = job.status;
        job.transition(status, patch)?;

        if !Self::store_if(&conn, &job, previous, None).await? {
            return Err(StoryCrewError::Storage(format!(
                "queue item {item_id} changed concurrently"
            )));
        }
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM queue_items WHERE status = 'queued'",
                params![],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as usize),
            None => Ok(0),
        }
    }

    async fn evict_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM queue_items
                 WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                params![timestamp(before)],
            )
            .await
            .map_err(storage_err)?;
        Ok(removed as usize)
    }
}
