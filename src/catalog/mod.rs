//! Catalog storage using SQLite
//!
//! Persists everything created through statements so a new process can
//! rebuild its registry:
//! - Objects (knowledge bases, models, agents, views)
//! - Jobs (definition and schedule)
//! - Job runs (history)
//! - Watermarks (last processed value per `LAST` column)

mod schema;

pub use schema::*;

use crate::ast::{CreateJob, ObjectKind, Statement};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Last processed value per watermark column
pub type Watermarks = BTreeMap<String, Value>;

/// Job run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            _ => Err(Error::Config(format!("Unknown run status: {}", s))),
        }
    }
}

/// A stored knowledge base, model, agent or view
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: String,
    pub kind: String,
    pub definition_json: String,
    pub created_at: String,
}

impl ObjectRecord {
    pub fn kind(&self) -> Result<ObjectKind> {
        Ok(self.kind.parse()?)
    }

    /// The CREATE statement this object was made from
    pub fn statement(&self) -> Result<Statement> {
        Ok(serde_json::from_str(&self.definition_json)?)
    }
}

/// A stored job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub definition_json: String,
    pub created_at: String,
    pub next_run_at: String,
    pub last_run_at: Option<String>,
    pub run_count: i64,
}

impl JobRecord {
    pub fn new(job: &CreateJob, next_run_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            name: job.name.qualified(),
            definition_json: serde_json::to_string(job)?,
            created_at: Utc::now().to_rfc3339(),
            next_run_at: next_run_at.to_rfc3339(),
            last_run_at: None,
            run_count: 0,
        })
    }

    pub fn definition(&self) -> Result<CreateJob> {
        Ok(serde_json::from_str(&self.definition_json)?)
    }

    pub fn next_run(&self) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.next_run_at)
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("bad timestamp '{}': {}", text, e)))
}

/// One job run record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub rows_processed: i64,
    pub error: Option<String>,
    pub watermarks_json: Option<String>,
}

impl JobRun {
    pub fn new(job_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running.to_string(),
            rows_processed: 0,
            error: None,
            watermarks_json: None,
        }
    }

    pub fn get_status(&self) -> Result<RunStatus> {
        self.status.parse()
    }
}

/// Catalog database handle
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Connect to the configured catalog database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file).await
    }

    /// Open (creating if needed) a catalog at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite catalog at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let catalog = Self { pool };
        if !catalog.is_initialized().await? {
            catalog.init_schema().await?;
        }
        Ok(catalog)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing catalog schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='objects'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    // ===== Objects =====

    /// Store a CREATE statement; the name must be unused
    pub async fn insert_object(&self, name: &str, kind: ObjectKind, statement: &Statement) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO objects (name, kind, definition_json, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(serde_json::to_string(statement)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    pub async fn get_object(&self, name: &str) -> Result<Option<ObjectRecord>> {
        let record = sqlx::query_as::<_, ObjectRecord>("SELECT * FROM objects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Objects in creation order, optionally of one kind
    pub async fn list_objects(&self, kind: Option<ObjectKind>) -> Result<Vec<ObjectRecord>> {
        let records = match kind {
            Some(kind) => {
                sqlx::query_as::<_, ObjectRecord>(
                    "SELECT * FROM objects WHERE kind = ? ORDER BY created_at, name",
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ObjectRecord>("SELECT * FROM objects ORDER BY created_at, name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(records)
    }

    pub async fn delete_object(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ===== Jobs =====

    pub async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (name, definition_json, created_at, next_run_at, last_run_at, run_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&job.name)
        .bind(&job.definition_json)
        .bind(&job.created_at)
        .bind(&job.next_run_at)
        .bind(&job.last_run_at)
        .bind(job.run_count)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::AlreadyExists(job.name.clone()));
        }
        Ok(())
    }

    pub async fn get_job(&self, name: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    /// Delete a job with its history and watermarks
    pub async fn delete_job(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM watermarks WHERE job_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_runs WHERE job_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM jobs WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_next_run(&self, name: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET next_run_at = ? WHERE name = ?")
            .bind(next_run_at.to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Runs and watermarks =====

    pub async fn start_run(&self, job_name: &str) -> Result<JobRun> {
        let run = JobRun::new(job_name);
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job_name, started_at, status, rows_processed)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.job_name)
        .bind(&run.started_at)
        .bind(&run.status)
        .bind(run.rows_processed)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    /// Mark a run completed and advance the job's watermarks and schedule.
    /// All of it commits or none of it does.
    pub async fn complete_run(
        &self,
        run_id: &str,
        job_name: &str,
        rows_processed: usize,
        watermarks: &Watermarks,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE job_runs SET completed_at = ?, status = ?, rows_processed = ?, watermarks_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(RunStatus::Completed.to_string())
        .bind(rows_processed as i64)
        .bind(serde_json::to_string(watermarks)?)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        for (column, value) in watermarks {
            sqlx::query(
                r#"
                INSERT INTO watermarks (job_name, column_key, value_json, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(job_name, column_key) DO UPDATE SET
                    value_json = excluded.value_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(job_name)
            .bind(column)
            .bind(serde_json::to_string(value)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE jobs SET next_run_at = ?, last_run_at = ?, run_count = run_count + 1 WHERE name = ?",
        )
        .bind(next_run_at.to_rfc3339())
        .bind(&now)
        .bind(job_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Close a run that did not complete. Watermarks are left untouched.
    pub async fn close_run(
        &self,
        run_id: &str,
        job_name: &str,
        status: RunStatus,
        error: Option<&str>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE job_runs SET completed_at = ?, status = ?, error = ? WHERE id = ?")
            .bind(&now)
            .bind(status.to_string())
            .bind(error)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE jobs SET next_run_at = ?, last_run_at = ? WHERE name = ?")
            .bind(next_run_at.to_rfc3339())
            .bind(&now)
            .bind(job_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_watermarks(&self, job_name: &str) -> Result<Watermarks> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_key, value_json FROM watermarks WHERE job_name = ?",
        )
        .bind(job_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(column, json)| Ok((column, serde_json::from_str(&json)?)))
            .collect()
    }

    /// Seed watermarks before the first run
    pub async fn init_watermarks(&self, job_name: &str, watermarks: &Watermarks) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (column, value) in watermarks {
            sqlx::query(
                r#"
                INSERT INTO watermarks (job_name, column_key, value_json, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(job_name, column_key) DO NOTHING
                "#,
            )
            .bind(job_name)
            .bind(column)
            .bind(serde_json::to_string(value)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent runs first
    pub async fn list_runs(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        let runs = sqlx::query_as::<_, JobRun>(
            "SELECT * FROM job_runs WHERE job_name = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(job_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    /// Keep only the newest `keep` runs of a job
    pub async fn prune_runs(&self, job_name: &str, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_runs WHERE job_name = ? AND id NOT IN (
                SELECT id FROM job_runs WHERE job_name = ?
                ORDER BY started_at DESC, rowid DESC LIMIT ?
            )
            "#,
        )
        .bind(job_name)
        .bind(job_name)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ObjectName, Query, Select, TableExpr};
    use tempfile::TempDir;

    async fn setup_test_catalog() -> (Catalog, TempDir) {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("catalog.db")).await.unwrap();
        (catalog, tmp)
    }

    fn job(name: &str) -> CreateJob {
        CreateJob {
            name: ObjectName::new(name),
            statements: vec![Statement::Query(Query::from(Select::star(TableExpr::relation(
                "crm.events",
            ))))],
            every: "1 day".to_string(),
            start_at: None,
            end_at: None,
            if_query: None,
            backfill: false,
            max_runs: None,
        }
    }

    #[tokio::test]
    async fn test_object_crud() {
        let (catalog, _tmp) = setup_test_catalog().await;
        let stmt = Statement::CreateView {
            name: ObjectName::new("v"),
            query: Query::from(Select::star(TableExpr::relation("crm.customers"))),
        };
        catalog.insert_object("v", ObjectKind::View, &stmt).await.unwrap();
        assert!(matches!(
            catalog.insert_object("v", ObjectKind::View, &stmt).await,
            Err(Error::AlreadyExists(_))
        ));

        let record = catalog.get_object("v").await.unwrap().unwrap();
        assert_eq!(record.kind().unwrap(), ObjectKind::View);
        assert_eq!(record.statement().unwrap(), stmt);
        assert_eq!(catalog.list_objects(Some(ObjectKind::Model)).await.unwrap().len(), 0);

        assert!(catalog.delete_object("v").await.unwrap());
        assert!(catalog.get_object("v").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_run_advances_watermark() {
        let (catalog, _tmp) = setup_test_catalog().await;
        let record = JobRecord::new(&job("sync"), Utc::now()).unwrap();
        catalog.insert_job(&record).await.unwrap();

        let run = catalog.start_run("sync").await.unwrap();
        let mut marks = Watermarks::new();
        marks.insert("created_at".to_string(), Value::Int(42));
        catalog
            .complete_run(&run.id, "sync", 3, &marks, Utc::now())
            .await
            .unwrap();

        assert_eq!(catalog.get_watermarks("sync").await.unwrap(), marks);
        let runs = catalog.list_runs("sync", 10).await.unwrap();
        assert_eq!(runs[0].get_status().unwrap(), RunStatus::Completed);
        assert_eq!(runs[0].rows_processed, 3);
        assert_eq!(catalog.get_job("sync").await.unwrap().unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_watermark() {
        let (catalog, _tmp) = setup_test_catalog().await;
        catalog
            .insert_job(&JobRecord::new(&job("sync"), Utc::now()).unwrap())
            .await
            .unwrap();
        let mut marks = Watermarks::new();
        marks.insert("id".to_string(), Value::Int(5));
        catalog.init_watermarks("sync", &marks).await.unwrap();

        let run = catalog.start_run("sync").await.unwrap();
        catalog
            .close_run(&run.id, "sync", RunStatus::Failed, Some("boom"), Utc::now())
            .await
            .unwrap();

        assert_eq!(catalog.get_watermarks("sync").await.unwrap(), marks);
        let runs = catalog.list_runs("sync", 10).await.unwrap();
        assert_eq!(runs[0].error.as_deref(), Some("boom"));
        assert_eq!(catalog.get_job("sync").await.unwrap().unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn test_prune_and_delete_job() {
        let (catalog, _tmp) = setup_test_catalog().await;
        catalog
            .insert_job(&JobRecord::new(&job("sync"), Utc::now()).unwrap())
            .await
            .unwrap();
        for _ in 0..4 {
            let run = catalog.start_run("sync").await.unwrap();
            catalog
                .close_run(&run.id, "sync", RunStatus::Skipped, None, Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(catalog.prune_runs("sync", 2).await.unwrap(), 2);
        assert_eq!(catalog.list_runs("sync", 10).await.unwrap().len(), 2);

        assert!(catalog.delete_job("sync").await.unwrap());
        assert!(catalog.list_jobs().await.unwrap().is_empty());
        assert!(catalog.list_runs("sync", 10).await.unwrap().is_empty());
    }
}
