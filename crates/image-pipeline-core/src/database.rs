//! SQLite persistence for executions, saved configurations and images

use crate::error::{ProcessingError, Result};
use crate::models::{
    ConfigurationId, ExecutionId, ExecutionStatus, GeneratedImage, ImageId, ImageMetadata,
    JobConfiguration, JobExecution, QcStatus, SavedConfiguration,
};
use crate::repository::Repository;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use uuid::Uuid;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub enable_wal_mode: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./image_pipeline.db".to_string(),
            max_connections: 5,
            enable_wal_mode: true,
        }
    }
}

impl DatabaseConfig {
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Repository backed by a SQLite file
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

const EXECUTION_COLUMNS: &str = "id, configuration_id, label, status, started_at, ended_at, \
     total_images, successful_images, failed_images, error_message, configuration_snapshot";

const IMAGE_COLUMNS: &str = "id, execution_id, generation_prompt, seed, qc_status, qc_reason, \
     temp_image_path, final_image_path, metadata, processing_settings, created_at";

impl SqliteRepository {
    /// Open (creating if needed) the database and run migrations
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        let filename = config
            .database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .to_string();

        if let Some(parent) = PathBuf::from(&filename).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&filename)
            .create_if_missing(true)
            .journal_mode(if config.enable_wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            });

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let repository = Self { pool };
        repository.run_migrations().await?;

        tracing::info!("Opened pipeline database at {}", filename);
        Ok(repository)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_executions (
                id TEXT PRIMARY KEY,
                configuration_id TEXT,
                label TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                total_images INTEGER NOT NULL DEFAULT 0,
                successful_images INTEGER NOT NULL DEFAULT 0,
                failed_images INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                configuration_snapshot TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_configurations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                settings TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generated_images (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                generation_prompt TEXT NOT NULL,
                seed INTEGER,
                qc_status TEXT NOT NULL,
                qc_reason TEXT,
                temp_image_path TEXT,
                final_image_path TEXT,
                metadata TEXT,
                processing_settings TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON job_executions (status)",
            "CREATE INDEX IF NOT EXISTS idx_executions_started_at ON job_executions (started_at)",
            "CREATE INDEX IF NOT EXISTS idx_images_execution_id ON generated_images (execution_id)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        tracing::debug!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn decode_error<E>(error: E) -> ProcessingError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ProcessingError::Database(sqlx::Error::Decode(Box::new(error)))
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(decode_error)
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(decode_error)
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

fn execution_from_row(row: &SqliteRow) -> Result<JobExecution> {
    let status: String = row.get("status");
    let snapshot = row
        .get::<Option<String>, _>("configuration_snapshot")
        .map(|json| serde_json::from_str::<JobConfiguration>(&json))
        .transpose()?;

    Ok(JobExecution {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        configuration_id: row
            .get::<Option<String>, _>("configuration_id")
            .map(|s| parse_uuid(&s))
            .transpose()?,
        label: row.get("label"),
        status: ExecutionStatus::parse(&status).ok_or_else(|| ProcessingError::InvalidInput {
            message: format!("Unknown execution status '{}'", status),
        })?,
        started_at: parse_timestamp(&row.get::<String, _>("started_at"))?,
        ended_at: row
            .get::<Option<String>, _>("ended_at")
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        total_images: row.get::<i64, _>("total_images") as u32,
        successful_images: row.get::<i64, _>("successful_images") as u32,
        failed_images: row.get::<i64, _>("failed_images") as u32,
        error_message: row.get("error_message"),
        configuration_snapshot: snapshot,
    })
}

fn image_from_row(row: &SqliteRow) -> Result<GeneratedImage> {
    let qc_status: String = row.get("qc_status");
    let metadata = row
        .get::<Option<String>, _>("metadata")
        .map(|json| serde_json::from_str::<ImageMetadata>(&json))
        .transpose()?;

    Ok(GeneratedImage {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        execution_id: parse_uuid(&row.get::<String, _>("execution_id"))?,
        generation_prompt: row.get("generation_prompt"),
        seed: row.get("seed"),
        qc_status: QcStatus::parse(&qc_status).ok_or_else(|| ProcessingError::InvalidInput {
            message: format!("Unknown qc status '{}'", qc_status),
        })?,
        qc_reason: row.get("qc_reason"),
        temp_image_path: row.get::<Option<String>, _>("temp_image_path").map(PathBuf::from),
        final_image_path: row.get::<Option<String>, _>("final_image_path").map(PathBuf::from),
        metadata,
        processing_settings: row.get("processing_settings"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn insert_execution(&self, execution: &JobExecution) -> Result<()> {
        let snapshot = execution
            .configuration_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO job_executions (id, configuration_id, label, status, started_at, ended_at,
                total_images, successful_images, failed_images, error_message, configuration_snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.configuration_id.map(|id| id.to_string()))
        .bind(&execution.label)
        .bind(execution.status.as_str())
        .bind(timestamp(&execution.started_at))
        .bind(execution.ended_at.as_ref().map(timestamp))
        .bind(execution.total_images as i64)
        .bind(execution.successful_images as i64)
        .bind(execution.failed_images as i64)
        .bind(&execution.error_message)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET label = ?1, status = ?2, ended_at = ?3, total_images = ?4,
                successful_images = ?5, failed_images = ?6, error_message = ?7
            WHERE id = ?8
            "#,
        )
        .bind(&execution.label)
        .bind(execution.status.as_str())
        .bind(execution.ended_at.as_ref().map(timestamp))
        .bind(execution.total_images as i64)
        .bind(execution.successful_images as i64)
        .bind(execution.failed_images as i64)
        .bind(&execution.error_message)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProcessingError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>> {
        let sql = format!("SELECT {} FROM job_executions WHERE id = ?1", EXECUTION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<JobExecution>> {
        let sql = format!(
            "SELECT {} FROM job_executions ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn running_execution(&self) -> Result<Option<JobExecution>> {
        let sql = format!(
            "SELECT {} FROM job_executions WHERE status = 'running' ORDER BY started_at DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn save_configuration(&self, configuration: &SavedConfiguration) -> Result<()> {
        let settings = serde_json::to_string(&configuration.settings.without_credentials())?;

        sqlx::query(
            r#"
            INSERT INTO job_configurations (id, name, settings, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                settings = excluded.settings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(configuration.id.to_string())
        .bind(&configuration.name)
        .bind(settings)
        .bind(timestamp(&configuration.created_at))
        .bind(timestamp(&configuration.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_configuration(&self, id: ConfigurationId) -> Result<Option<SavedConfiguration>> {
        let row = sqlx::query(
            "SELECT id, name, settings, created_at, updated_at FROM job_configurations WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(SavedConfiguration {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            settings: serde_json::from_str(&row.get::<String, _>("settings"))?,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        }))
    }

    async fn insert_image(&self, image: &GeneratedImage) -> Result<()> {
        let metadata = image.metadata.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO generated_images (id, execution_id, generation_prompt, seed, qc_status,
                qc_reason, temp_image_path, final_image_path, metadata, processing_settings, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(image.id.to_string())
        .bind(image.execution_id.to_string())
        .bind(&image.generation_prompt)
        .bind(image.seed)
        .bind(image.qc_status.as_str())
        .bind(&image.qc_reason)
        .bind(path_text(&image.temp_image_path))
        .bind(path_text(&image.final_image_path))
        .bind(metadata)
        .bind(&image.processing_settings)
        .bind(timestamp(&image.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_image(&self, image: &GeneratedImage) -> Result<()> {
        let metadata = image.metadata.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE generated_images
            SET qc_status = ?1, qc_reason = ?2, temp_image_path = ?3, final_image_path = ?4,
                metadata = ?5, processing_settings = ?6
            WHERE id = ?7
            "#,
        )
        .bind(image.qc_status.as_str())
        .bind(&image.qc_reason)
        .bind(path_text(&image.temp_image_path))
        .bind(path_text(&image.final_image_path))
        .bind(metadata)
        .bind(&image.processing_settings)
        .bind(image.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProcessingError::NotFound {
                entity: "image",
                id: image.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_image(&self, id: ImageId) -> Result<Option<GeneratedImage>> {
        let sql = format!("SELECT {} FROM generated_images WHERE id = ?1", IMAGE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(image_from_row).transpose()
    }

    async fn images_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<GeneratedImage>> {
        let sql = format!(
            "SELECT {} FROM generated_images WHERE execution_id = ?1 ORDER BY rowid",
            IMAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(image_from_row).collect()
    }

    async fn update_image_status(
        &self,
        id: ImageId,
        status: QcStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE generated_images SET qc_status = ?1, qc_reason = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(reason)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ProcessingError::NotFound {
                entity: "image",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
