use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use crate::errors::StoreError;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    requirement TEXT NOT NULL,
                    app_spec_id TEXT,
                    template_id TEXT,
                    tenant_id TEXT,
                    project_id TEXT,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    current_round INTEGER NOT NULL DEFAULT 0,
                    max_rounds INTEGER NOT NULL,
                    contract_schema TEXT,
                    contract_db_schema TEXT,
                    contract_units TEXT,
                    contract_locked INTEGER NOT NULL DEFAULT 0,
                    contract_locked_at TEXT,
                    sandbox_id TEXT,
                    sandbox_url TEXT,
                    last_error TEXT,
                    error_count INTEGER NOT NULL DEFAULT 0,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    CHECK (current_round <= max_rounds)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    artifact_type TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    language TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    checksum TEXT NOT NULL,
                    parent_artifact_id TEXT REFERENCES artifacts(id),
                    has_errors INTEGER NOT NULL DEFAULT 0,
                    compiler_output TEXT,
                    generated_by TEXT NOT NULL,
                    generation_round INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    validated_at TEXT,
                    UNIQUE(job_id, file_path, version),
                    CHECK ((has_errors = 1) = (compiler_output IS NOT NULL)),
                    CHECK ((version = 1) = (parent_artifact_id IS NULL))
                );

                CREATE TABLE IF NOT EXISTS validation_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    artifact_id TEXT NOT NULL REFERENCES artifacts(id),
                    round INTEGER NOT NULL,
                    validation_type TEXT NOT NULL,
                    passed INTEGER NOT NULL,
                    details TEXT NOT NULL DEFAULT '',
                    parsed_errors TEXT NOT NULL DEFAULT '[]',
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE(job_id, round, artifact_id)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_artifacts_job_path ON artifacts(job_id, file_path);
                CREATE INDEX IF NOT EXISTS idx_validation_results_round ON validation_results(job_id, round);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Job CRUD ──────────────────────────────────────────────────────

    pub fn create_job(&self, req: &SubmitJob, max_rounds: u32) -> Result<Job> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO jobs (id, requirement, app_spec_id, template_id, tenant_id, project_id, status, max_rounds, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    req.requirement,
                    req.app_spec_id,
                    req.template_id,
                    req.tenant_id,
                    req.project_id,
                    JobStatus::Pending.as_str(),
                    max_rounds,
                    now_ts(),
                ],
            )
            .context("Failed to insert job")?;
        self.require_job(id)
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        get_job_on(&self.conn, id)
    }

    /// Like `get_job`, but a missing row is a `StoreError::JobNotFound`.
    pub fn require_job(&self, id: Uuid) -> Result<Job> {
        require_job_on(&self.conn, id)
    }

    /// Jobs whose status is in `statuses`, oldest first. `None` lists every job.
    pub fn list_jobs(&self, statuses: Option<&[JobStatus]>) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM jobs ORDER BY created_at, id", JOB_COLUMNS))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map([], read_job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let job = row.context("Failed to read job row")?.into_job()?;
            if statuses.is_none_or(|s| s.contains(&job.status)) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn list_active_jobs(&self) -> Result<Vec<Job>> {
        self.list_jobs(Some(&JobStatus::NON_TERMINAL))
    }

    /// Optimistic status change: only applies when the stored status still
    /// equals `expected`.
    pub fn transition_status(&self, id: Uuid, expected: JobStatus, next: JobStatus) -> Result<Job> {
        transition_on(&self.conn, id, expected, next, None)?;
        self.require_job(id)
    }

    /// Move a job into a terminal status and record why.
    pub fn finish_job(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
        last_error: Option<&str>,
    ) -> Result<Job> {
        transition_on(&self.conn, id, expected, next, last_error)?;
        self.require_job(id)
    }

    pub fn request_cancel(&self, id: Uuid) -> Result<Job> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET cancel_requested = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .context("Failed to record cancellation")?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(id).into());
        }
        self.require_job(id)
    }

    /// Attach a provisioned sandbox. Only a `VALIDATING` job without a
    /// pending cancellation takes one.
    pub fn set_sandbox(&self, id: Uuid, sandbox: &SandboxInfo) -> Result<Job> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin sandbox transaction")?;
        ensure_active_on(&tx, id, JobStatus::Validating)?;
        tx.execute(
            "UPDATE jobs SET sandbox_id = ?1, sandbox_url = ?2 WHERE id = ?3",
            params![sandbox.id, sandbox.url, id.to_string()],
        )
        .context("Failed to set sandbox")?;
        tx.commit().context("Failed to commit sandbox")?;
        self.require_job(id)
    }

    pub fn advance_round(&self, id: Uuid, round: u32) -> Result<Job> {
        advance_round_on(&self.conn, id, round)?;
        self.require_job(id)
    }

    // ── Contract ──────────────────────────────────────────────────────

    /// Store (or replace) an unlocked contract.
    pub fn set_contract(&self, id: Uuid, schema: &str, db_schema: &str, units: &[ContractUnit]) -> Result<Job> {
        set_contract_on(&self.conn, id, schema, db_schema, units)?;
        self.require_job(id)
    }

    pub fn lock_contract(&self, id: Uuid) -> Result<Job> {
        lock_contract_on(&self.conn, id)?;
        self.require_job(id)
    }

    /// Store the contract, lock it, save the contract artifacts and move the
    /// job `CONTRACT_PENDING -> CONTRACT_LOCKED`, all in one transaction.
    pub fn commit_contract(
        &self,
        id: Uuid,
        schema: &str,
        db_schema: &str,
        units: &[ContractUnit],
    ) -> Result<Job> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin contract transaction")?;
        set_contract_on(&tx, id, schema, db_schema, units)?;
        lock_contract_on(&tx, id)?;
        let mut schema_artifact = NewArtifact::new(CONTRACT_SCHEMA_PATH, schema, ArtifactType::Contract);
        schema_artifact.generated_by = GeneratedBy::Architect;
        insert_artifact_on(&tx, id, &schema_artifact, true)?;
        if !db_schema.is_empty() {
            let mut db_artifact = NewArtifact::new(CONTRACT_DB_SCHEMA_PATH, db_schema, ArtifactType::Schema);
            db_artifact.generated_by = GeneratedBy::Architect;
            insert_artifact_on(&tx, id, &db_artifact, true)?;
        }
        transition_on(&tx, id, JobStatus::ContractPending, JobStatus::ContractLocked, None)?;
        tx.commit().context("Failed to commit contract")?;
        self.require_job(id)
    }

    // ── Artifact store ────────────────────────────────────────────────

    /// Insert version 1 of a file.
    pub fn insert_artifact(&self, job_id: Uuid, artifact: &NewArtifact) -> Result<Artifact> {
        let id = insert_artifact_on(&self.conn, job_id, artifact, false)?;
        self.require_artifact(id)
    }

    /// Insert version `parent.version + 1` of the parent's file.
    ///
    /// Fails with `SupersededParent` when the parent is no longer the latest
    /// version, which keeps each file's lineage a single chain.
    pub fn create_new_version(&self, parent_id: Uuid, content: &str, generated_by: GeneratedBy) -> Result<Artifact> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin version transaction")?;
        let id = create_version_on(&tx, parent_id, content, generated_by)?;
        tx.commit().context("Failed to commit new version")?;
        self.require_artifact(id)
    }

    pub fn mark_error(&self, artifact_id: Uuid, output: &str) -> Result<Artifact> {
        mark_error_on(&self.conn, artifact_id, output)?;
        self.require_artifact(artifact_id)
    }

    /// Clear the error state. Calling it on an already valid, validated
    /// artifact changes nothing.
    pub fn mark_valid(&self, artifact_id: Uuid) -> Result<Artifact> {
        mark_valid_on(&self.conn, artifact_id)?;
        self.require_artifact(artifact_id)
    }

    pub fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        get_artifact_on(&self.conn, id)
    }

    pub fn require_artifact(&self, id: Uuid) -> Result<Artifact> {
        get_artifact_on(&self.conn, id)?.ok_or_else(|| StoreError::ArtifactNotFound(id).into())
    }

    /// The newest version of every file of a job, ordered by path.
    pub fn latest_artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>> {
        self.query_artifacts(
            "WHERE a.job_id = ?1 AND a.version = (
                SELECT MAX(b.version) FROM artifacts b
                WHERE b.job_id = a.job_id AND b.file_path = a.file_path)
             ORDER BY a.file_path",
            params![job_id.to_string()],
        )
    }

    /// Every version of every file of a job, ordered by path then version.
    pub fn list_artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>> {
        self.query_artifacts(
            "WHERE a.job_id = ?1 ORDER BY a.file_path, a.version",
            params![job_id.to_string()],
        )
    }

    pub fn artifact_history(&self, job_id: Uuid, file_path: &str) -> Result<Vec<Artifact>> {
        self.query_artifacts(
            "WHERE a.job_id = ?1 AND a.file_path = ?2 ORDER BY a.version",
            params![job_id.to_string(), file_path],
        )
    }

    fn query_artifacts(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM artifacts a {}", ARTIFACT_COLUMNS, clause))
            .context("Failed to prepare artifact query")?;
        let rows = stmt
            .query_map(params, read_artifact_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?.into_artifact()?);
        }
        Ok(artifacts)
    }

    // ── Generation and repair commits ─────────────────────────────────

    /// Insert the first version of every generated file and move the job
    /// `GENERATING -> VALIDATING` in one transaction.
    pub fn commit_generation(&self, job_id: Uuid, artifacts: &[NewArtifact]) -> Result<Vec<Artifact>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin generation transaction")?;
        let mut ids = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            ids.push(insert_artifact_on(&tx, job_id, artifact, false)?);
        }
        transition_on(&tx, job_id, JobStatus::Generating, JobStatus::Validating, None)?;
        tx.commit().context("Failed to commit generation")?;
        ids.into_iter().map(|id| self.require_artifact(id)).collect()
    }

    /// Store repaired versions, bump the round and move the job
    /// `REPAIRING -> VALIDATING` in one transaction.
    pub fn commit_repairs(&self, job_id: Uuid, next_round: u32, repairs: &[(Uuid, String)]) -> Result<Vec<Artifact>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin repair transaction")?;
        let mut ids = Vec::with_capacity(repairs.len());
        for (parent_id, content) in repairs {
            ids.push(create_version_on(&tx, *parent_id, content, GeneratedBy::Coach)?);
        }
        advance_round_on(&tx, job_id, next_round)?;
        transition_on(&tx, job_id, JobStatus::Repairing, JobStatus::Validating, None)?;
        tx.commit().context("Failed to commit repairs")?;
        ids.into_iter().map(|id| self.require_artifact(id)).collect()
    }

    // ── Validation results ────────────────────────────────────────────

    /// Write one round's results and flip each artifact's validity, in one
    /// transaction. A round is recorded at most once, and only while the job
    /// is `VALIDATING` with no pending cancellation.
    pub fn record_round(&self, job_id: Uuid, round: u32, results: &[NewValidationResult]) -> Result<Vec<ValidationResult>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin validation transaction")?;
        ensure_active_on(&tx, job_id, JobStatus::Validating)?;
        let now = now_ts();
        for result in results {
            let parsed = serde_json::to_string(&result.parsed_errors)?;
            tx.execute(
                "INSERT INTO validation_results (job_id, artifact_id, round, validation_type, passed, details, parsed_errors, duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job_id.to_string(),
                    result.artifact_id.to_string(),
                    round,
                    result.validation_type.as_str(),
                    result.passed,
                    result.details,
                    parsed,
                    result.duration_ms as i64,
                    now,
                ],
            )
            .context("Failed to insert validation result")?;
            if result.passed {
                mark_valid_on(&tx, result.artifact_id)?;
            } else {
                mark_error_on(&tx, result.artifact_id, &result.details)?;
            }
        }
        tx.commit().context("Failed to commit validation round")?;
        self.validation_results(job_id, Some(round))
    }

    pub fn validation_results(&self, job_id: Uuid, round: Option<u32>) -> Result<Vec<ValidationResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, artifact_id, round, validation_type, passed, details, parsed_errors, duration_ms, created_at
                 FROM validation_results
                 WHERE job_id = ?1 AND (?2 IS NULL OR round = ?2)
                 ORDER BY round, id",
            )
            .context("Failed to prepare validation_results")?;
        let rows = stmt
            .query_map(params![job_id.to_string(), round], |row| {
                Ok(ValidationRow {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    artifact_id: row.get(2)?,
                    round: row.get(3)?,
                    validation_type: row.get(4)?,
                    passed: row.get(5)?,
                    details: row.get(6)?,
                    parsed_errors: row.get(7)?,
                    duration_ms: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query validation results")?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("Failed to read validation row")?.into_result()?);
        }
        Ok(results)
    }
}

pub const CONTRACT_SCHEMA_PATH: &str = "contract/openapi.yaml";
pub const CONTRACT_DB_SCHEMA_PATH: &str = "contract/schema.sql";

// ── Statement helpers shared by plain calls and transactions ──────────

const JOB_COLUMNS: &str = "id, requirement, app_spec_id, template_id, tenant_id, project_id, status, current_round, max_rounds, contract_schema, contract_db_schema, contract_units, contract_locked, contract_locked_at, sandbox_id, sandbox_url, last_error, error_count, cancel_requested, created_at, started_at, completed_at";

const ARTIFACT_COLUMNS: &str = "a.id, a.job_id, a.artifact_type, a.file_path, a.file_name, a.content, a.language, a.version, a.checksum, a.parent_artifact_id, a.has_errors, a.compiler_output, a.generated_by, a.generation_round, a.created_at, a.validated_at";

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid id: {}", value))
}

fn get_job_on(conn: &Connection, id: Uuid) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id.to_string()],
            read_job_row,
        )
        .optional()
        .context("Failed to query job")?;
    row.map(JobRow::into_job).transpose()
}

fn require_job_on(conn: &Connection, id: Uuid) -> Result<Job> {
    get_job_on(conn, id)?.ok_or_else(|| StoreError::JobNotFound(id).into())
}

fn transition_on(
    conn: &Connection,
    id: Uuid,
    expected: JobStatus,
    next: JobStatus,
    last_error: Option<&str>,
) -> Result<()> {
    if !expected.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
        }
        .into());
    }
    let now = now_ts();
    let completed_at = next.is_terminal().then(|| now.clone());
    // Progress, including COMPLETED, must not commit over a recorded cancel.
    let stopping = matches!(next, JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled);
    let changed = conn
        .execute(
            "UPDATE jobs SET
                status = ?1,
                started_at = COALESCE(started_at, ?2),
                completed_at = COALESCE(?3, completed_at),
                last_error = COALESCE(?4, last_error),
                error_count = error_count + (?4 IS NOT NULL)
             WHERE id = ?5 AND status = ?6 AND (?7 OR cancel_requested = 0)",
            params![
                next.as_str(),
                now,
                completed_at,
                last_error,
                id.to_string(),
                expected.as_str(),
                stopping,
            ],
        )
        .context("Failed to update job status")?;
    if changed == 0 {
        ensure_active_on(conn, id, expected)?;
    }
    Ok(())
}

/// Fail unless the job is in `expected` with no cancellation recorded.
fn ensure_active_on(conn: &Connection, id: Uuid, expected: JobStatus) -> Result<()> {
    let job = require_job_on(conn, id)?;
    if job.status != expected {
        return Err(StoreError::StatusConflict {
            job_id: id,
            expected,
            actual: job.status,
        }
        .into());
    }
    if job.cancel_requested {
        return Err(StoreError::CancelRequested(id).into());
    }
    Ok(())
}

fn advance_round_on(conn: &Connection, id: Uuid, round: u32) -> Result<()> {
    let job = require_job_on(conn, id)?;
    if round < job.current_round {
        return Err(StoreError::RoundRegression {
            job_id: id,
            current: job.current_round,
            requested: round,
        }
        .into());
    }
    if round > job.max_rounds {
        return Err(StoreError::RoundBudget {
            job_id: id,
            requested: round,
            max_rounds: job.max_rounds,
        }
        .into());
    }
    conn.execute(
        "UPDATE jobs SET current_round = ?1 WHERE id = ?2",
        params![round, id.to_string()],
    )
    .context("Failed to advance round")?;
    Ok(())
}

fn set_contract_on(conn: &Connection, id: Uuid, schema: &str, db_schema: &str, units: &[ContractUnit]) -> Result<()> {
    let job = require_job_on(conn, id)?;
    if job.contract_locked() {
        return Err(StoreError::ContractLocked(id).into());
    }
    let units = serde_json::to_string(units)?;
    conn.execute(
        "UPDATE jobs SET contract_schema = ?1, contract_db_schema = ?2, contract_units = ?3 WHERE id = ?4",
        params![schema, db_schema, units, id.to_string()],
    )
    .context("Failed to store contract")?;
    Ok(())
}

fn lock_contract_on(conn: &Connection, id: Uuid) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE jobs SET contract_locked = 1, contract_locked_at = ?1
             WHERE id = ?2 AND contract_locked = 0 AND contract_schema IS NOT NULL",
            params![now_ts(), id.to_string()],
        )
        .context("Failed to lock contract")?;
    if changed == 0 {
        let job = require_job_on(conn, id)?;
        if job.contract_locked() {
            return Err(StoreError::ContractLocked(id).into());
        }
        anyhow::bail!("Job {} has no contract to lock", id);
    }
    Ok(())
}

fn insert_artifact_on(conn: &Connection, job_id: Uuid, artifact: &NewArtifact, validated: bool) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let now = now_ts();
    let file_name = file_name_of(&artifact.file_path);
    conn.execute(
        "INSERT INTO artifacts (id, job_id, artifact_type, file_path, file_name, content, language, version, checksum,
                                parent_artifact_id, has_errors, compiler_output, generated_by, generation_round, created_at, validated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL, 0, NULL, ?9, ?10, ?11, ?12)",
        params![
            id.to_string(),
            job_id.to_string(),
            artifact.artifact_type.as_str(),
            artifact.file_path,
            file_name,
            artifact.content,
            Language::from_file_name(&file_name).as_str(),
            checksum_of(&artifact.content),
            artifact.generated_by.as_str(),
            artifact.generation_round,
            now,
            validated.then(|| now.clone()),
        ],
    )
    .with_context(|| format!("Failed to insert artifact {}", artifact.file_path))?;
    Ok(id)
}

fn create_version_on(conn: &Connection, parent_id: Uuid, content: &str, generated_by: GeneratedBy) -> Result<Uuid> {
    let parent = get_artifact_on(conn, parent_id)?.ok_or(StoreError::ArtifactNotFound(parent_id))?;
    let latest: u32 = conn
        .query_row(
            "SELECT MAX(version) FROM artifacts WHERE job_id = ?1 AND file_path = ?2",
            params![parent.job_id.to_string(), parent.file_path],
            |row| row.get(0),
        )
        .context("Failed to read latest version")?;
    if latest != parent.version {
        return Err(StoreError::SupersededParent(parent_id).into());
    }

    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO artifacts (id, job_id, artifact_type, file_path, file_name, content, language, version, checksum,
                                parent_artifact_id, has_errors, compiler_output, generated_by, generation_round, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, ?11, ?12, ?13)",
        params![
            id.to_string(),
            parent.job_id.to_string(),
            parent.artifact_type.as_str(),
            parent.file_path,
            parent.file_name,
            content,
            parent.language.as_str(),
            parent.version + 1,
            checksum_of(content),
            parent.id.to_string(),
            generated_by.as_str(),
            parent.generation_round + 1,
            now_ts(),
        ],
    )
    .with_context(|| format!("Failed to insert version {} of {}", parent.version + 1, parent.file_path))?;
    Ok(id)
}

fn mark_error_on(conn: &Connection, artifact_id: Uuid, output: &str) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE artifacts SET has_errors = 1, compiler_output = ?1, validated_at = ?2 WHERE id = ?3",
            params![output, now_ts(), artifact_id.to_string()],
        )
        .context("Failed to mark artifact error")?;
    if changed == 0 {
        return Err(StoreError::ArtifactNotFound(artifact_id).into());
    }
    Ok(())
}

fn mark_valid_on(conn: &Connection, artifact_id: Uuid) -> Result<()> {
    let id = artifact_id.to_string();
    conn.execute(
        "UPDATE artifacts SET has_errors = 0, compiler_output = NULL, validated_at = ?1
         WHERE id = ?2 AND (has_errors = 1 OR validated_at IS NULL)",
        params![now_ts(), id],
    )
    .context("Failed to mark artifact valid")?;
    let exists: bool = conn
        .query_row("SELECT COUNT(*) > 0 FROM artifacts WHERE id = ?1", params![id], |row| row.get(0))
        .context("Failed to check artifact")?;
    if !exists {
        return Err(StoreError::ArtifactNotFound(artifact_id).into());
    }
    Ok(())
}

fn get_artifact_on(conn: &Connection, id: Uuid) -> Result<Option<Artifact>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM artifacts a WHERE a.id = ?1", ARTIFACT_COLUMNS),
            params![id.to_string()],
            read_artifact_row,
        )
        .optional()
        .context("Failed to query artifact")?;
    row.map(ArtifactRow::into_artifact).transpose()
}

// ── Row structs ───────────────────────────────────────────────────────

/// Intermediate row struct for jobs.
struct JobRow {
    id: String,
    requirement: String,
    app_spec_id: Option<String>,
    template_id: Option<String>,
    tenant_id: Option<String>,
    project_id: Option<String>,
    status: String,
    current_round: u32,
    max_rounds: u32,
    contract_schema: Option<String>,
    contract_db_schema: Option<String>,
    contract_units: Option<String>,
    contract_locked: bool,
    contract_locked_at: Option<String>,
    sandbox_id: Option<String>,
    sandbox_url: Option<String>,
    last_error: Option<String>,
    error_count: u32,
    cancel_requested: bool,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        requirement: row.get(1)?,
        app_spec_id: row.get(2)?,
        template_id: row.get(3)?,
        tenant_id: row.get(4)?,
        project_id: row.get(5)?,
        status: row.get(6)?,
        current_round: row.get(7)?,
        max_rounds: row.get(8)?,
        contract_schema: row.get(9)?,
        contract_db_schema: row.get(10)?,
        contract_units: row.get(11)?,
        contract_locked: row.get(12)?,
        contract_locked_at: row.get(13)?,
        sandbox_id: row.get(14)?,
        sandbox_url: row.get(15)?,
        last_error: row.get(16)?,
        error_count: row.get(17)?,
        cancel_requested: row.get(18)?,
        created_at: row.get(19)?,
        started_at: row.get(20)?,
        completed_at: row.get(21)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let contract = match self.contract_schema {
            Some(schema) => {
                let units: Vec<ContractUnit> = match self.contract_units {
                    Some(raw) => serde_json::from_str(&raw).context("Failed to parse contract units")?,
                    None => Vec::new(),
                };
                Some(Contract {
                    schema,
                    db_schema: self.contract_db_schema.unwrap_or_default(),
                    units,
                    locked: self.contract_locked,
                    locked_at: self.contract_locked_at.as_deref().map(parse_ts).transpose()?,
                })
            }
            None => None,
        };
        let sandbox = match (self.sandbox_id, self.sandbox_url) {
            (Some(id), Some(url)) => Some(SandboxInfo { id, url }),
            _ => None,
        };
        Ok(Job {
            id: parse_uuid(&self.id)?,
            requirement: self.requirement,
            app_spec_id: self.app_spec_id,
            template_id: self.template_id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            status,
            current_round: self.current_round,
            max_rounds: self.max_rounds,
            contract,
            sandbox,
            last_error: self.last_error,
            error_count: self.error_count,
            cancel_requested: self.cancel_requested,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Intermediate row struct for artifacts.
struct ArtifactRow {
    id: String,
    job_id: String,
    artifact_type: String,
    file_path: String,
    file_name: String,
    content: String,
    language: String,
    version: u32,
    checksum: String,
    parent_artifact_id: Option<String>,
    has_errors: bool,
    compiler_output: Option<String>,
    generated_by: String,
    generation_round: u32,
    created_at: String,
    validated_at: Option<String>,
}

fn read_artifact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        artifact_type: row.get(2)?,
        file_path: row.get(3)?,
        file_name: row.get(4)?,
        content: row.get(5)?,
        language: row.get(6)?,
        version: row.get(7)?,
        checksum: row.get(8)?,
        parent_artifact_id: row.get(9)?,
        has_errors: row.get(10)?,
        compiler_output: row.get(11)?,
        generated_by: row.get(12)?,
        generation_round: row.get(13)?,
        created_at: row.get(14)?,
        validated_at: row.get(15)?,
    })
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact> {
        // Unknown stored labels degrade to the explicit catch-all variants.
        let artifact_type = ArtifactType::from_str(&self.artifact_type).unwrap_or(ArtifactType::Other);
        let generated_by = GeneratedBy::from_str(&self.generated_by).unwrap_or(GeneratedBy::Other);
        let language = Language::from_str(&self.language).unwrap_or(Language::Other);
        Ok(Artifact {
            id: parse_uuid(&self.id)?,
            job_id: parse_uuid(&self.job_id)?,
            artifact_type,
            file_path: self.file_path,
            file_name: self.file_name,
            content: self.content,
            language,
            version: self.version,
            checksum: self.checksum,
            parent_artifact_id: self.parent_artifact_id.as_deref().map(parse_uuid).transpose()?,
            validity: ArtifactValidity::from_columns(self.has_errors, self.compiler_output),
            generated_by,
            generation_round: self.generation_round,
            created_at: parse_ts(&self.created_at)?,
            validated_at: self.validated_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Intermediate row struct for validation_results.
struct ValidationRow {
    id: i64,
    job_id: String,
    artifact_id: String,
    round: u32,
    validation_type: String,
    passed: bool,
    details: String,
    parsed_errors: String,
    duration_ms: i64,
    created_at: String,
}

impl ValidationRow {
    fn into_result(self) -> Result<ValidationResult> {
        Ok(ValidationResult {
            id: self.id,
            job_id: parse_uuid(&self.job_id)?,
            artifact_id: parse_uuid(&self.artifact_id)?,
            round: self.round,
            validation_type: ValidationType::from_str(&self.validation_type).unwrap_or(ValidationType::Other),
            passed: self.passed,
            details: self.details,
            parsed_errors: serde_json::from_str(&self.parsed_errors).context("Failed to parse parsed_errors")?,
            duration_ms: self.duration_ms.max(0) as u64,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
