//! SQLite-backed job store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Job, JobError, JobFilter, JobStore};

/// SQLite-backed job store.
///
/// Scalar columns used for filtering and ordering are kept next to the full
/// JSON document so that schema changes to `Job` don't need migrations.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, JobError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_stage ON jobs(stage);
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, priority DESC, created_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, JobError> {
        self.conn
            .lock()
            .map_err(|_| JobError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(stage) = filter.stage {
            conditions.push("stage = ?");
            params.push(Box::new(stage.as_str().to_string()));
        }

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let data: String = row.get(0)?;
        serde_json::from_str(&data).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    fn serialize(job: &Job) -> Result<String, JobError> {
        serde_json::to_string(job).map_err(|e| JobError::Database(e.to_string()))
    }
}

/// Fixed-width timestamps so string comparison matches time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: &Job) -> Result<(), JobError> {
        let conn = self.conn()?;
        let data = Self::serialize(job)?;

        let result = conn.execute(
            "INSERT INTO jobs (id, stage, status, priority, next_attempt_at, created_at, updated_at, data) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                job.id,
                job.stage.as_str(),
                job.status.as_str(),
                job.options.priority,
                job.next_attempt_at.as_ref().map(timestamp),
                timestamp(&job.created_at),
                timestamp(&job.updated_at),
                data,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(JobError::AlreadyExists(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                "SELECT data FROM jobs WHERE id = ?",
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT data FROM jobs {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn count(&self, filter: &JobFilter) -> Result<i64, JobError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    fn save(&self, job: &Job) -> Result<(), JobError> {
        let conn = self.conn()?;
        let data = Self::serialize(job)?;

        let updated = conn.execute(
            "UPDATE jobs SET stage = ?, status = ?, priority = ?, next_attempt_at = ?, updated_at = ?, data = ? WHERE id = ?",
            params![
                job.stage.as_str(),
                job.status.as_str(),
                job.options.priority,
                job.next_attempt_at.as_ref().map(timestamp),
                timestamp(&job.updated_at),
                data,
                job.id,
            ],
        )?;

        if updated == 0 {
            return Err(JobError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    fn list_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&Job>,
        limit: i64,
    ) -> Result<Vec<Job>, JobError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT data FROM jobs
            WHERE stage NOT IN ('done', 'failed')
              AND (status = 'pending'
                   OR (status = 'awaiting_retry'
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)))
              AND (?2 IS NULL
                   OR priority < ?2
                   OR (priority = ?2
                       AND (created_at > ?3 OR (created_at = ?3 AND id > ?4))))
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?5
            "#,
        )?;
        let jobs = stmt
            .query_map(
                params![
                    timestamp(&now),
                    after.map(|job| job.options.priority),
                    after.map(|job| timestamp(&job.created_at)),
                    after.map(|job| job.id.as_str()),
                    limit,
                ],
                Self::row_to_job,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn delete(&self, id: &str) -> Result<Job, JobError> {
        let job = self.get(id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let conn = self.conn()?;
        conn.execute("DELETE FROM jobs WHERE id = ?", params![id])?;
        Ok(job)
    }
}
