use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::{Pool, QueryBuilder};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::cli::config::StorageSettings;
use crate::credentials::{CredentialFilter, CredentialSecret, ScraperCredential};
use crate::dedup::{JobPosting, SkipReason};
use crate::error::{OrchestratorError, Result};
use crate::platform::Platform;
use crate::queue::{QueueFilter, QueueStatus, RoleLocationQueueEntry};
use crate::session::{
    BatchApplication, BatchApply, BatchProgress, JobLogFilter, JobLogSummary, PlatformFinish,
    PlatformStatus, ScrapeSession, SessionFilter, SessionJobLog, SessionPlatformStatus,
    SessionStatus,
};
use crate::storage::{
    CredentialStore, Page, Paged, PostingInsert, PostingStore, QueueStore, SessionStore,
};

/// PostgreSQL implementation of every store trait
pub struct PostgresStorage {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema holding the orchestrator tables
    schema: String,
}

const CREDENTIAL_COLUMNS: &str = "id, platform, name, secret, status, failure_count, \
    success_count, last_failure_at, last_failure_message, last_success_at, \
    assigned_to_session_id, assigned_at, cooldown_until, last_used_at, created_at, \
    updated_at, version";

const QUEUE_COLUMNS: &str = "id, global_role_id, location, queue_status, priority, \
    candidate_count, total_jobs_scraped, last_scraped_at, created_at, updated_at, version";

const QUEUE_ORDER: &str = " ORDER BY CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 \
    WHEN 'normal' THEN 2 ELSE 3 END, created_at, id";

const SESSION_COLUMNS: &str = "session_id, role_location_queue_id, role_id, location, status, \
    platforms_total, platforms_completed, platforms_failed, jobs_found, jobs_imported, \
    jobs_skipped, total_batches, completed_batches, started_at, completed_at, \
    last_progress_at, error_message";

const PLATFORM_COLUMNS: &str = "session_id, platform_name, status, credential_id, jobs_found, \
    jobs_imported, jobs_skipped, total_batches, completed_batches, error_message, started_at, \
    completed_at";

const JOB_LOG_COLUMNS: &str = "session_id, platform_name, batch_index, job_index, status, \
    skip_reason, duplicate_job_id, imported_job_id, external_job_id, title, company, \
    error_message, created_at";

const POSTING_COLUMNS: &str = "id, platform, external_job_id, title, company, location, \
    description, job_url, normalized_title, normalized_company, normalized_location, \
    session_id, created_at";

fn parse<T: FromStr<Err = OrchestratorError>>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e: OrchestratorError| OrchestratorError::Storage(e.to_string()))
}

fn parse_opt<T: FromStr<Err = OrchestratorError>>(value: Option<&str>) -> Result<Option<T>> {
    value.map(parse).transpose()
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    platform: String,
    name: String,
    secret: Json<CredentialSecret>,
    status: String,
    failure_count: i32,
    success_count: i32,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_message: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    assigned_to_session_id: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<CredentialRow> for ScraperCredential {
    type Error = OrchestratorError;

    fn try_from(row: CredentialRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            platform: parse(&row.platform)?,
            name: row.name,
            secret: row.secret.0,
            status: parse(&row.status)?,
            failure_count: to_u32(row.failure_count),
            success_count: to_u32(row.success_count),
            last_failure_at: row.last_failure_at,
            last_failure_message: row.last_failure_message,
            last_success_at: row.last_success_at,
            assigned_to_session_id: row.assigned_to_session_id,
            assigned_at: row.assigned_at,
            cooldown_until: row.cooldown_until,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: to_u64(row.version),
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    global_role_id: String,
    location: String,
    queue_status: String,
    priority: String,
    candidate_count: i32,
    total_jobs_scraped: i64,
    last_scraped_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<QueueRow> for RoleLocationQueueEntry {
    type Error = OrchestratorError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            global_role_id: row.global_role_id,
            location: row.location,
            queue_status: parse(&row.queue_status)?,
            priority: parse(&row.priority)?,
            candidate_count: to_u32(row.candidate_count),
            total_jobs_scraped: to_u64(row.total_jobs_scraped),
            last_scraped_at: row.last_scraped_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: to_u64(row.version),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    role_location_queue_id: String,
    role_id: String,
    location: String,
    status: String,
    platforms_total: i32,
    platforms_completed: i32,
    platforms_failed: i32,
    jobs_found: i64,
    jobs_imported: i64,
    jobs_skipped: i64,
    total_batches: i32,
    completed_batches: i32,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    last_progress_at: DateTime<Utc>,
    error_message: Option<String>,
}

impl TryFrom<SessionRow> for ScrapeSession {
    type Error = OrchestratorError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            session_id: row.session_id,
            role_location_queue_id: row.role_location_queue_id,
            role_id: row.role_id,
            location: row.location,
            status: parse(&row.status)?,
            platforms_total: to_u32(row.platforms_total),
            platforms_completed: to_u32(row.platforms_completed),
            platforms_failed: to_u32(row.platforms_failed),
            jobs_found: to_u64(row.jobs_found),
            jobs_imported: to_u64(row.jobs_imported),
            jobs_skipped: to_u64(row.jobs_skipped),
            total_batches: to_u32(row.total_batches),
            completed_batches: to_u32(row.completed_batches),
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_progress_at: row.last_progress_at,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlatformRow {
    session_id: String,
    platform_name: String,
    status: String,
    credential_id: Option<String>,
    jobs_found: i64,
    jobs_imported: i64,
    jobs_skipped: i64,
    total_batches: i32,
    completed_batches: i32,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PlatformRow> for SessionPlatformStatus {
    type Error = OrchestratorError;

    fn try_from(row: PlatformRow) -> Result<Self> {
        Ok(Self {
            session_id: row.session_id,
            platform_name: parse(&row.platform_name)?,
            status: parse(&row.status)?,
            credential_id: row.credential_id,
            jobs_found: to_u64(row.jobs_found),
            jobs_imported: to_u64(row.jobs_imported),
            jobs_skipped: to_u64(row.jobs_skipped),
            total_batches: to_u32(row.total_batches),
            completed_batches: to_u32(row.completed_batches),
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobLogRow {
    session_id: String,
    platform_name: String,
    batch_index: i32,
    job_index: i64,
    status: String,
    skip_reason: Option<String>,
    duplicate_job_id: Option<String>,
    imported_job_id: Option<String>,
    external_job_id: Option<String>,
    title: Option<String>,
    company: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobLogRow> for SessionJobLog {
    type Error = OrchestratorError;

    fn try_from(row: JobLogRow) -> Result<Self> {
        Ok(Self {
            session_id: row.session_id,
            platform_name: parse(&row.platform_name)?,
            batch_index: to_u32(row.batch_index),
            job_index: to_u64(row.job_index),
            status: parse(&row.status)?,
            skip_reason: parse_opt(row.skip_reason.as_deref())?,
            duplicate_job_id: row.duplicate_job_id,
            imported_job_id: row.imported_job_id,
            external_job_id: row.external_job_id,
            title: row.title,
            company: row.company,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PostingRow {
    id: String,
    platform: String,
    external_job_id: Option<String>,
    title: String,
    company: String,
    location: Option<String>,
    description: Option<String>,
    job_url: String,
    normalized_title: String,
    normalized_company: String,
    normalized_location: String,
    session_id: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PostingRow> for JobPosting {
    type Error = OrchestratorError;

    fn try_from(row: PostingRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            platform: parse(&row.platform)?,
            external_job_id: row.external_job_id,
            title: row.title,
            company: row.company,
            location: row.location,
            description: row.description,
            job_url: row.job_url,
            normalized_title: row.normalized_title,
            normalized_company: row.normalized_company,
            normalized_location: row.normalized_location,
            session_id: row.session_id,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = OrchestratorError>,
{
    rows.into_iter().map(T::try_from).collect()
}

impl PostgresStorage {
    /// Connect and make sure every table exists
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        validate_schema_name(&settings.schema_name)?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                OrchestratorError::Storage(format!("failed to connect to PostgreSQL: {}", e))
            })?;

        let storage = Self {
            pool,
            schema: settings.schema_name.clone(),
        };
        storage.ensure_schema().await?;

        info!("Connected to PostgreSQL (schema {})", storage.schema);
        Ok(storage)
    }

    /// Create the schema, tables and indexes when missing
    async fn ensure_schema(&self) -> Result<()> {
        let s = &self.schema;
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {s}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.scraper_credentials (
                    id TEXT PRIMARY KEY,
                    platform TEXT NOT NULL,
                    name TEXT NOT NULL,
                    secret JSONB NOT NULL,
                    status TEXT NOT NULL,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    success_count INTEGER NOT NULL DEFAULT 0,
                    last_failure_at TIMESTAMPTZ,
                    last_failure_message TEXT,
                    last_success_at TIMESTAMPTZ,
                    assigned_to_session_id TEXT,
                    assigned_at TIMESTAMPTZ,
                    cooldown_until TIMESTAMPTZ,
                    last_used_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    version BIGINT NOT NULL DEFAULT 0,
                    CHECK ((status = 'in_use') = (assigned_to_session_id IS NOT NULL))
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS scraper_credentials_platform_status
                 ON {s}.scraper_credentials (platform, status)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.role_location_queue (
                    id TEXT PRIMARY KEY,
                    global_role_id TEXT NOT NULL,
                    location TEXT NOT NULL,
                    queue_status TEXT NOT NULL,
                    priority TEXT NOT NULL,
                    candidate_count INTEGER NOT NULL DEFAULT 1,
                    total_jobs_scraped BIGINT NOT NULL DEFAULT 0,
                    last_scraped_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    version BIGINT NOT NULL DEFAULT 0
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS role_location_queue_active_pair
                 ON {s}.role_location_queue (global_role_id, location)
                 WHERE queue_status IN ('pending', 'approved', 'processing')"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.scrape_sessions (
                    session_id TEXT PRIMARY KEY,
                    role_location_queue_id TEXT NOT NULL,
                    role_id TEXT NOT NULL,
                    location TEXT NOT NULL,
                    status TEXT NOT NULL,
                    platforms_total INTEGER NOT NULL,
                    platforms_completed INTEGER NOT NULL DEFAULT 0,
                    platforms_failed INTEGER NOT NULL DEFAULT 0,
                    jobs_found BIGINT NOT NULL DEFAULT 0,
                    jobs_imported BIGINT NOT NULL DEFAULT 0,
                    jobs_skipped BIGINT NOT NULL DEFAULT 0,
                    total_batches INTEGER NOT NULL DEFAULT 0,
                    completed_batches INTEGER NOT NULL DEFAULT 0,
                    started_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    last_progress_at TIMESTAMPTZ NOT NULL,
                    error_message TEXT
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS scrape_sessions_started_at
                 ON {s}.scrape_sessions (started_at DESC)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.session_platform_status (
                    session_id TEXT NOT NULL REFERENCES {s}.scrape_sessions (session_id) ON DELETE CASCADE,
                    platform_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    credential_id TEXT,
                    jobs_found BIGINT NOT NULL DEFAULT 0,
                    jobs_imported BIGINT NOT NULL DEFAULT 0,
                    jobs_skipped BIGINT NOT NULL DEFAULT 0,
                    total_batches INTEGER NOT NULL DEFAULT 0,
                    completed_batches INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    PRIMARY KEY (session_id, platform_name),
                    CHECK (completed_batches <= total_batches)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.applied_batches (
                    session_id TEXT NOT NULL,
                    platform_name TEXT NOT NULL,
                    batch_index INTEGER NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (session_id, platform_name, batch_index)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.parked_batches (
                    session_id TEXT NOT NULL,
                    platform_name TEXT NOT NULL,
                    batch_index INTEGER NOT NULL,
                    payload JSONB NOT NULL,
                    parked_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (session_id, platform_name, batch_index)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.session_job_logs (
                    id BIGSERIAL PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    platform_name TEXT NOT NULL,
                    batch_index INTEGER NOT NULL,
                    job_index BIGINT NOT NULL,
                    status TEXT NOT NULL,
                    skip_reason TEXT,
                    duplicate_job_id TEXT,
                    imported_job_id TEXT,
                    external_job_id TEXT,
                    title TEXT,
                    company TEXT,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS session_job_logs_session
                 ON {s}.session_job_logs (session_id, id)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.job_postings (
                    id TEXT PRIMARY KEY,
                    platform TEXT NOT NULL,
                    external_job_id TEXT,
                    title TEXT NOT NULL,
                    company TEXT NOT NULL,
                    location TEXT,
                    description TEXT,
                    job_url TEXT NOT NULL,
                    normalized_title TEXT NOT NULL,
                    normalized_company TEXT NOT NULL,
                    normalized_location TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS job_postings_platform_external_id
                 ON {s}.job_postings (platform, external_job_id)
                 WHERE external_job_id IS NOT NULL"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS job_postings_title_company
                 ON {s}.job_postings (normalized_title, normalized_company)"
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Ensured schema exists: {}", self.schema);
        Ok(())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {}.scrape_sessions WHERE session_id = $1)",
            self.schema
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

fn validate_schema_name(schema: &str) -> Result<()> {
    let valid = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
        .map(|re| re.is_match(schema))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::Config(format!(
            "invalid schema name '{}'",
            schema
        )))
    }
}

#[async_trait]
impl CredentialStore for PostgresStorage {
    async fn insert_credential(&self, c: &ScraperCredential) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.scraper_credentials ({CREDENTIAL_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            self.schema
        ))
        .bind(&c.id)
        .bind(c.platform.as_str())
        .bind(&c.name)
        .bind(Json(&c.secret))
        .bind(c.status.as_str())
        .bind(c.failure_count as i32)
        .bind(c.success_count as i32)
        .bind(c.last_failure_at)
        .bind(&c.last_failure_message)
        .bind(c.last_success_at)
        .bind(&c.assigned_to_session_id)
        .bind(c.assigned_at)
        .bind(c.cooldown_until)
        .bind(c.last_used_at)
        .bind(c.created_at)
        .bind(c.updated_at)
        .bind(c.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<ScraperCredential>> {
        let row: Option<CredentialRow> = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM {}.scraper_credentials WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScraperCredential::try_from).transpose()
    }

    async fn list_credentials(&self, filter: &CredentialFilter) -> Result<Vec<ScraperCredential>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM {}.scraper_credentials WHERE TRUE",
            self.schema
        ));
        if let Some(platform) = filter.platform {
            query.push(" AND platform = ").push_bind(platform.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(session_id) = &filter.assigned_to_session_id {
            query
                .push(" AND assigned_to_session_id = ")
                .push_bind(session_id.clone());
        }
        query.push(" ORDER BY created_at, id");

        let rows: Vec<CredentialRow> = query.build_query_as().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn compare_and_swap_credential(
        &self,
        current_version: u64,
        c: &ScraperCredential,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {}.scraper_credentials SET
                name = $3, secret = $4, status = $5, failure_count = $6, success_count = $7,
                last_failure_at = $8, last_failure_message = $9, last_success_at = $10,
                assigned_to_session_id = $11, assigned_at = $12, cooldown_until = $13,
                last_used_at = $14, updated_at = $15, version = $16
             WHERE id = $1 AND version = $2",
            self.schema
        ))
        .bind(&c.id)
        .bind(current_version as i64)
        .bind(&c.name)
        .bind(Json(&c.secret))
        .bind(c.status.as_str())
        .bind(c.failure_count as i32)
        .bind(c.success_count as i32)
        .bind(c.last_failure_at)
        .bind(&c.last_failure_message)
        .bind(c.last_success_at)
        .bind(&c.assigned_to_session_id)
        .bind(c.assigned_at)
        .bind(c.cooldown_until)
        .bind(c.last_used_at)
        .bind(c.updated_at)
        .bind(c.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_credential(&self, id: &str, current_version: u64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {}.scraper_credentials WHERE id = $1 AND version = $2",
            self.schema
        ))
        .bind(id)
        .bind(current_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl QueueStore for PostgresStorage {
    async fn insert_entry(&self, e: &RoleLocationQueueEntry) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {}.role_location_queue ({QUEUE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (global_role_id, location)
                WHERE queue_status IN ('pending', 'approved', 'processing')
             DO NOTHING",
            self.schema
        ))
        .bind(&e.id)
        .bind(&e.global_role_id)
        .bind(&e.location)
        .bind(e.queue_status.as_str())
        .bind(e.priority.as_str())
        .bind(e.candidate_count as i32)
        .bind(e.total_jobs_scraped as i64)
        .bind(e.last_scraped_at)
        .bind(e.created_at)
        .bind(e.updated_at)
        .bind(e.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_entry(&self, id: &str) -> Result<Option<RoleLocationQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS} FROM {}.role_location_queue WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RoleLocationQueueEntry::try_from).transpose()
    }

    async fn list_entries(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<Paged<RoleLocationQueueEntry>> {
        fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &QueueFilter) {
            if let Some(status) = filter.status {
                query.push(" AND queue_status = ").push_bind(status.as_str());
            }
            if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                let pattern = format!("%{}%", term);
                query
                    .push(" AND (global_role_id ILIKE ")
                    .push_bind(pattern.clone())
                    .push(" OR location ILIKE ")
                    .push_bind(pattern)
                    .push(")");
            }
        }

        let mut count = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) FROM {}.role_location_queue WHERE TRUE",
            self.schema
        ));
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {QUEUE_COLUMNS} FROM {}.role_location_queue WHERE TRUE",
            self.schema
        ));
        push_filter(&mut query, filter);
        query
            .push(QUEUE_ORDER)
            .push(" LIMIT ")
            .push_bind(page.page_size as i64)
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows: Vec<QueueRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Paged {
            items: convert_all(rows)?,
            total: to_u64(total),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn approved_entries(&self) -> Result<Vec<RoleLocationQueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS} FROM {}.role_location_queue
             WHERE queue_status = 'approved'{QUEUE_ORDER}",
            self.schema
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_active_entry(
        &self,
        global_role_id: &str,
        location: &str,
    ) -> Result<Option<RoleLocationQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS} FROM {}.role_location_queue
             WHERE global_role_id = $1 AND location = $2
               AND queue_status IN ('pending', 'approved', 'processing')",
            self.schema
        ))
        .bind(global_role_id)
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RoleLocationQueueEntry::try_from).transpose()
    }

    async fn compare_and_swap_entry(
        &self,
        current_version: u64,
        e: &RoleLocationQueueEntry,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {}.role_location_queue SET
                queue_status = $3, priority = $4, candidate_count = $5,
                total_jobs_scraped = $6, last_scraped_at = $7, updated_at = $8, version = $9
             WHERE id = $1 AND version = $2",
            self.schema
        ))
        .bind(&e.id)
        .bind(current_version as i64)
        .bind(e.queue_status.as_str())
        .bind(e.priority.as_str())
        .bind(e.candidate_count as i32)
        .bind(e.total_jobs_scraped as i64)
        .bind(e.last_scraped_at)
        .bind(e.updated_at)
        .bind(e.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_entry(&self, id: &str, current_version: u64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {}.role_location_queue WHERE id = $1 AND version = $2",
            self.schema
        ))
        .bind(id)
        .bind(current_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_by_status(&self) -> Result<HashMap<QueueStatus, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT queue_status, COUNT(*) FROM {}.role_location_queue GROUP BY queue_status",
            self.schema
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(parse(&status)?, to_u64(count));
        }
        Ok(counts)
    }
}

#[async_trait]
impl SessionStore for PostgresStorage {
    async fn insert_session(
        &self,
        s: &ScrapeSession,
        platforms: &[SessionPlatformStatus],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO {}.scrape_sessions ({SESSION_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            self.schema
        ))
        .bind(&s.session_id)
        .bind(&s.role_location_queue_id)
        .bind(&s.role_id)
        .bind(&s.location)
        .bind(s.status.as_str())
        .bind(s.platforms_total as i32)
        .bind(s.platforms_completed as i32)
        .bind(s.platforms_failed as i32)
        .bind(s.jobs_found as i64)
        .bind(s.jobs_imported as i64)
        .bind(s.jobs_skipped as i64)
        .bind(s.total_batches as i32)
        .bind(s.completed_batches as i32)
        .bind(s.started_at)
        .bind(s.completed_at)
        .bind(s.last_progress_at)
        .bind(&s.error_message)
        .execute(&mut *tx)
        .await?;

        for p in platforms {
            sqlx::query(&format!(
                "INSERT INTO {}.session_platform_status ({PLATFORM_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                self.schema
            ))
            .bind(&p.session_id)
            .bind(p.platform_name.as_str())
            .bind(p.status.as_str())
            .bind(&p.credential_id)
            .bind(p.jobs_found as i64)
            .bind(p.jobs_imported as i64)
            .bind(p.jobs_skipped as i64)
            .bind(p.total_batches as i32)
            .bind(p.completed_batches as i32)
            .bind(&p.error_message)
            .bind(p.started_at)
            .bind(p.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ScrapeSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM {}.scrape_sessions WHERE session_id = $1",
            self.schema
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScrapeSession::try_from).transpose()
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ScrapeSession>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {SESSION_COLUMNS} FROM {}.scrape_sessions WHERE TRUE",
            self.schema
        ));
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.started_after {
            query.push(" AND started_at >= ").push_bind(after);
        }
        query.push(" ORDER BY started_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<SessionRow> = query.build_query_as().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn platform_statuses(&self, session_id: &str) -> Result<Vec<SessionPlatformStatus>> {
        let rows: Vec<PlatformRow> = sqlx::query_as(&format!(
            "SELECT {PLATFORM_COLUMNS} FROM {}.session_platform_status
             WHERE session_id = $1 ORDER BY platform_name",
            self.schema
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn set_platform_credential(
        &self,
        session_id: &str,
        platform: Platform,
        credential_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {}.session_platform_status SET credential_id = $3
             WHERE session_id = $1 AND platform_name = $2",
            self.schema
        ))
        .bind(session_id)
        .bind(platform.as_str())
        .bind(credential_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::not_found("session platform", session_id));
        }
        Ok(())
    }

    async fn apply_batch(&self, batch: &BatchApplication) -> Result<BatchApply> {
        let key = &batch.key;
        let counts = batch.counts();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {}.applied_batches (session_id, platform_name, batch_index, applied_at)
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            self.schema
        ))
        .bind(&key.session_id)
        .bind(key.platform.as_str())
        .bind(key.batch_index as i32)
        .bind(batch.applied_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(BatchApply::AlreadyApplied);
        }

        let status: Option<String> = sqlx::query_scalar(&format!(
            "SELECT status FROM {}.scrape_sessions WHERE session_id = $1 FOR UPDATE",
            self.schema
        ))
        .bind(&key.session_id)
        .fetch_optional(&mut *tx)
        .await?;
        let status: SessionStatus = match status {
            Some(status) => parse(&status)?,
            None => {
                tx.rollback().await?;
                return Err(OrchestratorError::not_found("session", &key.session_id));
            }
        };
        if status.is_terminal() {
            tx.rollback().await?;
            return Err(OrchestratorError::invalid_transition(
                "session",
                status,
                "batch applied",
            ));
        }

        let completed: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT completed_batches FROM {}.session_platform_status
             WHERE session_id = $1 AND platform_name = $2 FOR UPDATE",
            self.schema
        ))
        .bind(&key.session_id)
        .bind(key.platform.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let completed = match completed {
            Some(completed) => to_u32(completed),
            None => {
                tx.rollback().await?;
                return Err(OrchestratorError::not_found(
                    "session platform",
                    &key.session_id,
                ));
            }
        };
        if completed != key.batch_index {
            tx.rollback().await?;
            return Ok(if key.batch_index < completed {
                BatchApply::AlreadyApplied
            } else {
                BatchApply::OutOfOrder {
                    expected: completed,
                }
            });
        }

        let updated = sqlx::query(&format!(
            "UPDATE {}.session_platform_status SET
                jobs_found = jobs_found + $3,
                jobs_imported = jobs_imported + $4,
                jobs_skipped = jobs_skipped + $5,
                completed_batches = completed_batches + 1,
                total_batches = GREATEST(total_batches, $6, completed_batches + 1),
                status = CASE WHEN status = 'pending' THEN 'in_progress' ELSE status END,
                started_at = COALESCE(started_at, $7)
             WHERE session_id = $1 AND platform_name = $2 AND completed_batches = $8",
            self.schema
        ))
        .bind(&key.session_id)
        .bind(key.platform.as_str())
        .bind(counts.found as i64)
        .bind(counts.imported as i64)
        .bind(counts.skipped as i64)
        .bind(batch.total_batches_hint.unwrap_or(0) as i32)
        .bind(batch.applied_at)
        .bind(key.batch_index as i32)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Err(OrchestratorError::not_found(
                "session platform",
                &key.session_id,
            ));
        }

        sqlx::query(&format!(
            "UPDATE {s}.scrape_sessions SET
                jobs_found = jobs_found + $2,
                jobs_imported = jobs_imported + $3,
                jobs_skipped = jobs_skipped + $4,
                completed_batches = completed_batches + 1,
                total_batches = (SELECT COALESCE(SUM(total_batches), 0)
                                 FROM {s}.session_platform_status WHERE session_id = $1),
                last_progress_at = GREATEST(last_progress_at, $5)
             WHERE session_id = $1",
            s = self.schema
        ))
        .bind(&key.session_id)
        .bind(counts.found as i64)
        .bind(counts.imported as i64)
        .bind(counts.skipped as i64)
        .bind(batch.applied_at)
        .execute(&mut *tx)
        .await?;

        for log in &batch.logs {
            sqlx::query(&format!(
                "INSERT INTO {}.session_job_logs ({JOB_LOG_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                self.schema
            ))
            .bind(&log.session_id)
            .bind(log.platform_name.as_str())
            .bind(log.batch_index as i32)
            .bind(log.job_index as i64)
            .bind(log.status.as_str())
            .bind(log.skip_reason.map(|r| r.as_str()))
            .bind(&log.duplicate_job_id)
            .bind(&log.imported_job_id)
            .bind(&log.external_job_id)
            .bind(&log.title)
            .bind(&log.company)
            .bind(&log.error_message)
            .bind(log.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(BatchApply::Applied)
    }

    async fn park_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch: &BatchProgress,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.session_exists(session_id).await? {
            return Err(OrchestratorError::not_found("session", session_id));
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {}.parked_batches (session_id, platform_name, batch_index, payload, parked_at)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
            self.schema
        ))
        .bind(session_id)
        .bind(platform.as_str())
        .bind(batch.batch_index as i32)
        .bind(Json(batch))
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn take_parked_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch_index: u32,
    ) -> Result<Option<BatchProgress>> {
        let payload: Option<Json<BatchProgress>> = sqlx::query_scalar(&format!(
            "DELETE FROM {}.parked_batches
             WHERE session_id = $1 AND platform_name = $2 AND batch_index = $3
             RETURNING payload",
            self.schema
        ))
        .bind(session_id)
        .bind(platform.as_str())
        .bind(batch_index as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload.map(|p| p.0))
    }

    async fn discard_parked_batches(
        &self,
        session_id: &str,
        platform: Option<Platform>,
    ) -> Result<u64> {
        let dropped = sqlx::query(&format!(
            "DELETE FROM {}.parked_batches
             WHERE session_id = $1 AND ($2::TEXT IS NULL OR platform_name = $2)",
            self.schema
        ))
        .bind(session_id)
        .bind(platform.map(|p| p.as_str()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(dropped)
    }

    async fn finish_platform(&self, finish: &PlatformFinish) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE {}.session_platform_status SET
                status = $3, completed_at = $4, error_message = COALESCE($5, error_message)
             WHERE session_id = $1 AND platform_name = $2
               AND status NOT IN ('completed', 'failed', 'skipped')",
            self.schema
        ))
        .bind(&finish.session_id)
        .bind(finish.platform.as_str())
        .bind(finish.status.as_str())
        .bind(finish.at)
        .bind(&finish.error_message)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            if self.session_exists(&finish.session_id).await? {
                return Ok(false);
            }
            return Err(OrchestratorError::not_found("session", &finish.session_id));
        }

        let (completed, failed) = match finish.status {
            PlatformStatus::Completed => (1, 0),
            PlatformStatus::Failed => (0, 1),
            _ => (0, 0),
        };
        sqlx::query(&format!(
            "UPDATE {}.scrape_sessions SET
                platforms_completed = platforms_completed + $2,
                platforms_failed = platforms_failed + $3,
                last_progress_at = GREATEST(last_progress_at, $4)
             WHERE session_id = $1",
            self.schema
        ))
        .bind(&finish.session_id)
        .bind(completed as i32)
        .bind(failed as i32)
        .bind(finish.at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(&format!(
            "UPDATE {}.scrape_sessions SET
                status = $2, completed_at = $3, error_message = COALESCE($4, error_message)
             WHERE session_id = $1 AND status = 'in_progress'",
            self.schema
        ))
        .bind(session_id)
        .bind(status.as_str())
        .bind(at)
        .bind(error_message)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && !self.session_exists(session_id).await? {
            return Err(OrchestratorError::not_found("session", session_id));
        }
        Ok(updated == 1)
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.scrape_sessions SET last_progress_at = GREATEST(last_progress_at, $2)
             WHERE session_id = $1",
            self.schema
        ))
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_logs(
        &self,
        session_id: &str,
        filter: &JobLogFilter,
        page: Page,
    ) -> Result<Paged<SessionJobLog>> {
        fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &JobLogFilter) {
            if let Some(status) = filter.status {
                query.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(platform) = filter.platform {
                query.push(" AND platform_name = ").push_bind(platform.as_str());
            }
            if let Some(reason) = filter.skip_reason {
                query.push(" AND skip_reason = ").push_bind(reason.as_str());
            }
        }

        let mut count = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) FROM {}.session_job_logs WHERE session_id = ",
            self.schema
        ));
        count.push_bind(session_id.to_string());
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {JOB_LOG_COLUMNS} FROM {}.session_job_logs WHERE session_id = ",
            self.schema
        ));
        query.push_bind(session_id.to_string());
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY id LIMIT ")
            .push_bind(page.page_size as i64)
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows: Vec<JobLogRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Paged {
            items: convert_all(rows)?,
            total: to_u64(total),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn job_log_summary(&self, session_id: &str) -> Result<JobLogSummary> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(&format!(
            "SELECT status, skip_reason, COUNT(*) FROM {}.session_job_logs
             WHERE session_id = $1 GROUP BY status, skip_reason",
            self.schema
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = JobLogSummary::default();
        for (status, reason, count) in rows {
            let reason: Option<SkipReason> = parse_opt(reason.as_deref())?;
            summary.add(parse(&status)?, reason, to_u64(count));
        }
        Ok(summary)
    }
}

#[async_trait]
impl PostingStore for PostgresStorage {
    async fn find_by_platform_id(
        &self,
        platform: Platform,
        external_job_id: &str,
    ) -> Result<Option<JobPosting>> {
        let row: Option<PostingRow> = sqlx::query_as(&format!(
            "SELECT {POSTING_COLUMNS} FROM {}.job_postings
             WHERE platform = $1 AND external_job_id = $2",
            self.schema
        ))
        .bind(platform.as_str())
        .bind(external_job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobPosting::try_from).transpose()
    }

    async fn find_by_title_company_location(
        &self,
        title: &str,
        company: &str,
        location: &str,
    ) -> Result<Option<JobPosting>> {
        let row: Option<PostingRow> = sqlx::query_as(&format!(
            "SELECT {POSTING_COLUMNS} FROM {}.job_postings
             WHERE normalized_title = $1 AND normalized_company = $2 AND normalized_location = $3
             ORDER BY created_at, id LIMIT 1",
            self.schema
        ))
        .bind(title)
        .bind(company)
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobPosting::try_from).transpose()
    }

    async fn find_by_title_company(&self, title: &str, company: &str) -> Result<Vec<JobPosting>> {
        let rows: Vec<PostingRow> = sqlx::query_as(&format!(
            "SELECT {POSTING_COLUMNS} FROM {}.job_postings
             WHERE normalized_title = $1 AND normalized_company = $2
             ORDER BY created_at, id",
            self.schema
        ))
        .bind(title)
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn insert_posting(&self, p: &JobPosting) -> Result<PostingInsert> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO {}.job_postings ({POSTING_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (platform, external_job_id) WHERE external_job_id IS NOT NULL
             DO NOTHING",
            self.schema
        ))
        .bind(&p.id)
        .bind(p.platform.as_str())
        .bind(&p.external_job_id)
        .bind(&p.title)
        .bind(&p.company)
        .bind(&p.location)
        .bind(&p.description)
        .bind(&p.job_url)
        .bind(&p.normalized_title)
        .bind(&p.normalized_company)
        .bind(&p.normalized_location)
        .bind(&p.session_id)
        .bind(p.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(PostingInsert::Inserted);
        }

        let external_id = p.external_job_id.as_deref().unwrap_or_default();
        match self.find_by_platform_id(p.platform, external_id).await? {
            Some(existing) => Ok(PostingInsert::Conflict {
                existing_id: existing.id,
            }),
            None => Err(OrchestratorError::Storage(format!(
                "posting {} was neither inserted nor found",
                p.id
            ))),
        }
    }
}
