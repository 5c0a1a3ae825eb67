//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Instants are stored
//! as integer milliseconds since the epoch so range filters compare
//! numerically; target lists and task arguments are stored as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{JobStore, ProbeRecord, ProbeRegistry, StorageError, TaskStore};
use crate::core::job::{Job, JobBookkeeping, Target, TaskTemplate};
use crate::core::schedule::ScheduleSpec;
use crate::core::task::{Task, TaskState, TimestampField};
use crate::core::types::{JobId, ProbeId, TaskId};

const JOB_COLUMNS: &str = "id, comment, schedule, start_time, delay_secs, target_countries, \
     target_platforms, test_name, arguments, creation_time, times_run, next_run_at, is_done";

const TASK_COLUMNS: &str = "id, probe_id, test_name, arguments, state, creation_time, \
     notify_time, accept_time, done_time, last_updated";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // A single connection that is never recycled; each connection to
        // `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {}", millis)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StorageError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let expression: String = row.try_get("schedule").map_err(db_err)?;
    let start_time = from_millis(row.try_get("start_time").map_err(db_err)?)?;
    let delay_secs: i64 = row.try_get("delay_secs").map_err(db_err)?;
    let countries: String = row.try_get("target_countries").map_err(db_err)?;
    let platforms: String = row.try_get("target_platforms").map_err(db_err)?;
    let arguments: String = row.try_get("arguments").map_err(db_err)?;
    let times_run: i64 = row.try_get("times_run").map_err(db_err)?;

    let schedule = ScheduleSpec::parse_at(&expression, start_time)
        .map_err(|e| StorageError::Serialization(format!("job {}: {}", id, e)))?;

    Ok(Job {
        id: JobId::parse(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        comment: row.try_get("comment").map_err(db_err)?,
        schedule,
        delay: TimeDelta::try_seconds(delay_secs).ok_or_else(|| {
            StorageError::Serialization(format!("delay out of range: {}", delay_secs))
        })?,
        target: Target {
            countries: from_json(&countries)?,
            platforms: from_json(&platforms)?,
        },
        task: TaskTemplate {
            test_name: row.try_get("test_name").map_err(db_err)?,
            arguments: from_json(&arguments)?,
        },
        creation_time: from_millis(row.try_get("creation_time").map_err(db_err)?)?,
        bookkeeping: JobBookkeeping {
            times_run: u64::try_from(times_run).map_err(|_| {
                StorageError::Serialization(format!("negative times_run: {}", times_run))
            })?,
            next_run_at: from_millis(row.try_get("next_run_at").map_err(db_err)?)?,
            is_done: row.try_get("is_done").map_err(db_err)?,
        },
    })
}

fn optional_millis(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
    let value: Option<i64> = row.try_get(column).map_err(db_err)?;
    value.map(from_millis).transpose()
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StorageError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let probe_id: String = row.try_get("probe_id").map_err(db_err)?;
    let arguments: String = row.try_get("arguments").map_err(db_err)?;
    let state: String = row.try_get("state").map_err(db_err)?;

    Ok(Task {
        id: TaskId::parse(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        probe_id: ProbeId::new(probe_id),
        test_name: row.try_get("test_name").map_err(db_err)?,
        arguments: from_json(&arguments)?,
        state: TaskState::from_str(&state).map_err(StorageError::Serialization)?,
        creation_time: from_millis(row.try_get("creation_time").map_err(db_err)?)?,
        notify_time: optional_millis(row, "notify_time")?,
        accept_time: optional_millis(row, "accept_time")?,
        done_time: optional_millis(row, "done_time")?,
        last_updated: from_millis(row.try_get("last_updated").map_err(db_err)?)?,
    })
}

#[async_trait]
impl JobStore for SqliteStorage {
    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(&format!(
            "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(&job.comment)
        .bind(job.schedule.expression())
        .bind(to_millis(job.schedule.start_time()))
        .bind(job.delay.num_seconds())
        .bind(to_json(&job.target.countries)?)
        .bind(to_json(&job.target.platforms)?)
        .bind(&job.task.test_name)
        .bind(to_json(&job.task.arguments)?)
        .bind(to_millis(job.creation_time))
        .bind(job.bookkeeping.times_run as i64)
        .bind(to_millis(job.bookkeeping.next_run_at))
        .bind(job.bookkeeping.is_done)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
            }
            Err(e) => return Err(db_err(e)),
        }

        tx.commit().await.map_err(db_err)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        job_from_row(&row)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs ORDER BY creation_time, id",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE is_done = 0 ORDER BY creation_time, id",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn update_job_bookkeeping(
        &self,
        id: &JobId,
        bookkeeping: &JobBookkeeping,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE jobs SET times_run = ?, next_run_at = ?, is_done = ? WHERE id = ?")
                .bind(bookkeeping.times_run as i64)
                .bind(to_millis(bookkeeping.next_run_at))
                .bind(bookkeeping.is_done)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteStorage {
    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        let result = sqlx::query(&format!(
            "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TASK_COLUMNS
        ))
        .bind(task.id.to_string())
        .bind(task.probe_id.as_str())
        .bind(&task.test_name)
        .bind(to_json(&task.arguments)?)
        .bind(task.state.as_str())
        .bind(to_millis(task.creation_time))
        .bind(task.notify_time.map(to_millis))
        .bind(task.accept_time.map(to_millis))
        .bind(task.done_time.map(to_millis))
        .bind(to_millis(task.last_updated))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("task: {}", task.id)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_ready_tasks_for_probe(
        &self,
        probe_id: &ProbeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks \
             WHERE state = 'ready' AND probe_id = ? AND creation_time >= ? \
             ORDER BY creation_time, id",
            TASK_COLUMNS
        ))
        .bind(probe_id.as_str())
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn list_tasks_for_probe(&self, probe_id: &ProbeId) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE probe_id = ? ORDER BY creation_time, id",
            TASK_COLUMNS
        ))
        .bind(probe_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn transition_task_if(
        &self,
        id: &TaskId,
        allowed_from: &[TaskState],
        target: TaskState,
        field: TimestampField,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if allowed_from.is_empty() {
            return Ok(false);
        }

        let at = to_millis(at);
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE tasks SET state = ");
        query
            .push_bind(target.as_str())
            .push(format!(", {} = ", field.column()))
            .push_bind(at)
            .push(", last_updated = ")
            .push_bind(at)
            .push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND state IN (");
        let mut states = query.separated(", ");
        for state in allowed_from {
            states.push_bind(state.as_str());
        }
        states.push_unseparated(")");

        let result = query.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ProbeRegistry for SqliteStorage {
    async fn register_probe(&self, probe: ProbeRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO probes (id, country, platform, registered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                country = excluded.country,
                platform = excluded.platform,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(probe.id.as_str())
        .bind(&probe.country)
        .bind(&probe.platform)
        .bind(to_millis(probe.registered_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn resolve_targets(&self, target: &Target) -> Result<Vec<ProbeId>, StorageError> {
        let target = target.normalized();
        let mut query = QueryBuilder::<Sqlite>::new("SELECT id FROM probes WHERE 1 = 1");

        if !target.countries.is_empty() {
            query.push(" AND country IN (");
            let mut countries = query.separated(", ");
            for country in &target.countries {
                countries.push_bind(country.clone());
            }
            countries.push_unseparated(")");
        }
        if !target.platforms.is_empty() {
            query.push(" AND platform IN (");
            let mut platforms = query.separated(", ");
            for platform in &target.platforms {
                platforms.push_bind(platform.clone());
            }
            platforms.push_unseparated(")");
        }
        query.push(" ORDER BY id");

        let rows: Vec<(String,)> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(|(id,)| ProbeId::new(id)).collect())
    }
}
