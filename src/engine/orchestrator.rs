//! Job orchestrator: drives one job through contract, generation and the
//! validate/repair loop.
//!
//! The orchestrator keeps no job state of its own. Every step starts by
//! reloading the job from the store and dispatching on its persisted
//! status, so resuming after a restart is the normal code path. Each step
//! ends in a single store commit that also moves the status forward.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::broadcaster::LogBroadcaster;
use super::db::{CONTRACT_DB_SCHEMA_PATH, CONTRACT_SCHEMA_PATH, DbHandle};
use super::knowledge::{DocumentKind, KnowledgeDocument, KnowledgeStore};
use super::locks::JobLockMap;
use super::models::{
    Artifact, ArtifactType, Contract, Job, JobStatus, LogLevel, LogRole, NewArtifact, SandboxInfo, SubmitJob,
};
use super::repair::Repairer;
use super::retry::{RetryPolicy, call_stage};
use super::stages::{ContractRequest, GenerationRequest, Stages, check_against_contract};
use super::validator::{Validator, summarize_failures};
use crate::config::EngineConfig;
use crate::errors::{InvalidRequest, JobError, StageError, StoreError};

pub struct Orchestrator {
    db: DbHandle,
    logs: Arc<LogBroadcaster>,
    knowledge: Arc<dyn KnowledgeStore>,
    stages: Stages,
    validator: Validator,
    repairer: Repairer,
    policy: RetryPolicy,
    config: EngineConfig,
    locks: JobLockMap,
    queue: mpsc::UnboundedSender<Uuid>,
}

/// Map a store failure onto the orchestrator's taxonomy. A lost
/// compare-and-set becomes `StatusConflict`, which stops the job silently.
/// A commit refused over a recorded cancel becomes `Cancelled`; anything
/// else fails the job.
fn store_error(err: anyhow::Error) -> JobError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::StatusConflict { expected, actual, .. }) => JobError::StatusConflict {
            expected: *expected,
            actual: *actual,
        },
        Some(StoreError::CancelRequested(_)) => JobError::Cancelled,
        _ => JobError::Store(err),
    }
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        stages: Stages,
        knowledge: Arc<dyn KnowledgeStore>,
        logs: Arc<LogBroadcaster>,
        config: EngineConfig,
        queue: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            validator: Validator::new(stages.sandbox.clone(), config.project_type.clone()),
            repairer: Repairer::new(stages.repair.clone(), knowledge.clone(), config.knowledge.top_k),
            policy: RetryPolicy::from_config(&config),
            locks: JobLockMap::new(),
            db,
            logs,
            knowledge,
            stages,
            config,
            queue,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn logs(&self) -> &Arc<LogBroadcaster> {
        &self.logs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &JobLockMap {
        &self.locks
    }

    /// Hand a job id to the worker pool.
    pub fn enqueue(&self, job_id: Uuid) {
        if self.queue.send(job_id).is_err() {
            warn!(job_id = %job_id, "Job queue closed; job will resume on next start");
        }
    }

    /// Create a `PENDING` job and queue it.
    pub async fn submit(&self, request: SubmitJob) -> Result<Job> {
        if request.requirement.trim().is_empty() {
            return Err(InvalidRequest("requirement must not be empty".into()).into());
        }
        let max_rounds = request.max_rounds.unwrap_or(self.config.max_rounds);
        if max_rounds == 0 || max_rounds > self.config.max_rounds_cap {
            return Err(InvalidRequest(format!(
                "maxRounds must be between 1 and {}, got {}",
                self.config.max_rounds_cap, max_rounds
            ))
            .into());
        }

        let job = self
            .db
            .call(move |db| db.create_job(&request, max_rounds))
            .await?;
        info!(job_id = %job.id, max_rounds, "Job submitted");
        self.enqueue(job.id);
        Ok(job)
    }

    /// Record a cancellation request. A terminal job is returned unchanged.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let job = self.db.call(move |db| db.require_job(job_id)).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let job = self.db.call(move |db| db.request_cancel(job_id)).await?;
        info!(job_id = %job_id, status = %job.status, "Cancellation requested");
        // An idle job has nobody to notice the flag; wake a worker for it.
        if !self.locks.is_locked(job_id) {
            self.enqueue(job_id);
        }
        Ok(job)
    }

    /// Drive a job from its persisted status until it is terminal or another
    /// writer takes over. Returns the last status this run observed.
    ///
    /// A job already being driven by another worker is skipped.
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobStatus> {
        let Some(_guard) = self.locks.try_lock(job_id) else {
            debug!(job_id = %job_id, "Job is already running, skipping");
            let job = self.db.call(move |db| db.require_job(job_id)).await?;
            return Ok(job.status);
        };
        self.drive(job_id)
            .instrument(info_span!("job", job_id = %job_id))
            .await
    }

    async fn drive(&self, job_id: Uuid) -> Result<JobStatus> {
        loop {
            let job = self.load(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job.status);
            }
            let step = match self.boundary(&job) {
                Err(err) => Err(err),
                Ok(()) => self.step(&job).await,
            };
            if let Err(err) = step {
                return self.stop(job_id, err).await;
            }
        }
    }

    async fn step(&self, job: &Job) -> Result<(), JobError> {
        match job.status {
            JobStatus::Pending => self.transition(job, JobStatus::ContractPending).await,
            JobStatus::ContractPending => self.design_contract(job).await,
            JobStatus::ContractLocked => self.transition(job, JobStatus::Generating).await,
            JobStatus::Generating => self.generate(job).await,
            JobStatus::Validating => self.validate(job).await,
            JobStatus::Repairing => self.repair(job).await,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled => Ok(()),
        }
    }

    // ── Stage steps ───────────────────────────────────────────────────

    async fn design_contract(&self, job: &Job) -> Result<(), JobError> {
        self.emit(job, LogLevel::Info, LogRole::Architect, "Designing API contract");
        let context = self.repo_context(job, &job.requirement).await;
        let request = ContractRequest {
            job_id: job.id,
            requirement: job.requirement.clone(),
            app_spec_id: job.app_spec_id.clone(),
            template_id: job.template_id.clone(),
            context,
        };

        let stage = &self.stages.contract;
        let req = &request;
        let draft = call_stage(
            &self.policy,
            "contract",
            move || stage.design(req),
            |attempt, err, delay| self.retry_notice(job, LogRole::Architect, "contract", attempt, err, delay),
        )
        .await
        .map_err(|e| JobError::from_stage("contract", e))?;
        draft.check().map_err(|e| JobError::from_stage("contract", e))?;

        self.checkpoint(job.id, JobStatus::ContractPending).await?;
        let job_id = job.id;
        let (schema, db_schema, units) = (draft.schema.clone(), draft.db_schema.clone(), draft.units.clone());
        self.db
            .call(move |db| db.commit_contract(job_id, &schema, &db_schema, &units))
            .await
            .map_err(store_error)?;

        self.remember(job, DocumentKind::Contract, CONTRACT_SCHEMA_PATH, &draft.schema, 0)
            .await;
        self.remember(job, DocumentKind::Contract, CONTRACT_DB_SCHEMA_PATH, &draft.db_schema, 0)
            .await;
        self.emit(
            job,
            LogLevel::Success,
            LogRole::Architect,
            format!("Contract locked with {} units", draft.units.len()),
        );
        Ok(())
    }

    async fn generate(&self, job: &Job) -> Result<(), JobError> {
        let contract = locked_contract(job)?;
        self.emit(
            job,
            LogLevel::Info,
            LogRole::Coder,
            format!("Generating {} files", contract.units.len()),
        );
        let mut docs = self.job_documents(job, &job.requirement).await;
        docs.extend(self.repo_documents(job, &job.requirement).await);
        let request = GenerationRequest {
            job_id: job.id,
            requirement: job.requirement.clone(),
            contract: contract.clone(),
            context: self.knowledge.format_for_context(&docs),
        };

        let stage = &self.stages.generation;
        let req = &request;
        let files = call_stage(
            &self.policy,
            "generation",
            move || stage.generate(req),
            |attempt, err, delay| self.retry_notice(job, LogRole::Coder, "generation", attempt, err, delay),
        )
        .await
        .map_err(|e| JobError::from_stage("generation", e))?;
        check_against_contract(contract, &files).map_err(|e| JobError::from_stage("generation", e))?;

        self.checkpoint(job.id, JobStatus::Generating).await?;
        let artifacts: Vec<NewArtifact> = files
            .iter()
            .map(|f| {
                let artifact_type = contract
                    .unit(&f.file_path)
                    .map(|u| u.artifact_type)
                    .unwrap_or_else(|| ArtifactType::from_file_path(&f.file_path));
                NewArtifact::new(f.file_path.clone(), f.content.clone(), artifact_type)
            })
            .collect();
        let job_id = job.id;
        let stored = self
            .db
            .call(move |db| db.commit_generation(job_id, &artifacts))
            .await
            .map_err(store_error)?;

        for artifact in &stored {
            self.remember(job, DocumentKind::Source, &artifact.file_path, &artifact.content, 0)
                .await;
        }
        self.emit(
            job,
            LogLevel::Success,
            LogRole::Coder,
            format!("Generated {} artifacts", stored.len()),
        );
        Ok(())
    }

    async fn validate(&self, job: &Job) -> Result<(), JobError> {
        let contract = locked_contract(job)?;
        let job_id = job.id;
        let round = job.current_round;

        let latest = self
            .db
            .call(move |db| db.latest_artifacts(job_id))
            .await
            .map_err(store_error)?;
        let artifacts = Validator::round_set(contract, latest);

        let mut results = self
            .db
            .call(move |db| db.validation_results(job_id, Some(round)))
            .await
            .map_err(store_error)?;

        // A round whose results were committed before a restart is decided
        // from the stored results without touching the sandbox again.
        if results.is_empty() {
            let sandbox = self.sandbox_for(job).await?;
            self.emit(
                job,
                LogLevel::Info,
                LogRole::Executor,
                format!("Validating {} artifacts", artifacts.len()),
            );
            let validator = &self.validator;
            let (sandbox_ref, set) = (&sandbox, artifacts.as_slice());
            let new_results = call_stage(
                &self.policy,
                "validation",
                move || validator.run(job, sandbox_ref, set),
                |attempt, err, delay| self.retry_notice(job, LogRole::Executor, "validation", attempt, err, delay),
            )
            .await
            .map_err(|e| JobError::from_stage("validation", e))?;

            self.checkpoint(job_id, JobStatus::Validating).await?;
            results = self
                .db
                .call(move |db| db.record_round(job_id, round, &new_results))
                .await
                .map_err(store_error)?;
        }

        let paths: HashMap<Uuid, &str> = artifacts.iter().map(|a| (a.id, a.file_path.as_str())).collect();
        let failing: Vec<(String, String)> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| {
                let path = paths.get(&r.artifact_id).copied().unwrap_or("<unknown>");
                (path.to_string(), r.details.clone())
            })
            .collect();

        if failing.is_empty() {
            self.emit(
                job,
                LogLevel::Success,
                LogRole::Executor,
                format!("All {} artifacts passed round {}", results.len(), round),
            );
            let done = self
                .db
                .call(move |db| db.finish_job(job_id, JobStatus::Validating, JobStatus::Completed, None))
                .await
                .map_err(store_error)?;
            info!(job_id = %job_id, round, "Job completed");
            self.promote(&done, &artifacts).await;
            self.finalize(&done).await;
            return Ok(());
        }

        for (path, details) in &failing {
            self.remember(job, DocumentKind::CompilerOutput, path, details, round)
                .await;
        }
        self.emit(
            job,
            LogLevel::Warn,
            LogRole::Executor,
            format!(
                "{} of {} artifacts failed round {}",
                failing.len(),
                results.len(),
                round
            ),
        );

        if !job.has_round_budget() {
            return Err(JobError::RoundBudgetExceeded {
                rounds: job.max_rounds,
                summary: summarize_failures(&failing),
            });
        }
        self.transition(job, JobStatus::Repairing).await
    }

    async fn repair(&self, job: &Job) -> Result<(), JobError> {
        let contract = locked_contract(job)?;
        let job_id = job.id;
        let round = job.current_round;

        let (latest, results) = self
            .db
            .call(move |db| Ok((db.latest_artifacts(job_id)?, db.validation_results(job_id, Some(round))?)))
            .await
            .map_err(store_error)?;
        let failing_ids: HashSet<Uuid> = results.iter().filter(|r| !r.passed).map(|r| r.artifact_id).collect();
        let parents: Vec<Artifact> = Validator::round_set(contract, latest)
            .into_iter()
            .filter(|a| failing_ids.contains(&a.id))
            .collect();

        self.emit(
            job,
            LogLevel::Info,
            LogRole::Coach,
            format!("Repairing {} artifacts for round {}", parents.len(), round + 1),
        );

        let mut requests = Vec::with_capacity(parents.len());
        for parent in &parents {
            let path = parent.file_path.clone();
            let history = self
                .db
                .call(move |db| db.artifact_history(job_id, &path))
                .await
                .map_err(store_error)?;
            requests.push(self.repairer.prepare(job, contract, parent, &history).await);
        }

        let (repairer, policy) = (&self.repairer, &self.policy);
        let outcomes = join_all(requests.iter().map(move |request| {
            call_stage(
                policy,
                "repair",
                move || repairer.repair(request),
                move |attempt, err, delay| self.retry_notice(job, LogRole::Coach, "repair", attempt, err, delay),
            )
        }))
        .await;

        let mut repairs = Vec::with_capacity(parents.len());
        for (parent, outcome) in parents.iter().zip(outcomes) {
            let content = outcome.map_err(|e| JobError::from_stage("repair", e))?;
            repairs.push((parent.id, content));
        }

        self.checkpoint(job_id, JobStatus::Repairing).await?;
        let next_round = round + 1;
        let (stored, advanced) = self
            .db
            .call(move |db| Ok((db.commit_repairs(job_id, next_round, &repairs)?, db.require_job(job_id)?)))
            .await
            .map_err(store_error)?;

        for artifact in &stored {
            self.remember(job, DocumentKind::Source, &artifact.file_path, &artifact.content, next_round)
                .await;
        }
        self.emit(
            &advanced,
            LogLevel::Success,
            LogRole::Coach,
            format!("Stored {} repaired versions", stored.len()),
        );
        Ok(())
    }

    // ── Boundaries and termination ────────────────────────────────────

    /// Cancellation and wall-clock checks made at every stage boundary.
    fn boundary(&self, job: &Job) -> Result<(), JobError> {
        if job.cancel_requested {
            return Err(JobError::Cancelled);
        }
        if self.expired(job) {
            return Err(JobError::TimedOut);
        }
        Ok(())
    }

    /// Re-check the job after a stage returned and before its output is
    /// applied. The output is discarded when this fails.
    async fn checkpoint(&self, job_id: Uuid, expected: JobStatus) -> Result<Job, JobError> {
        let job = self.load(job_id).await.map_err(store_error)?;
        if job.status != expected {
            return Err(JobError::StatusConflict {
                expected,
                actual: job.status,
            });
        }
        self.boundary(&job)?;
        Ok(job)
    }

    fn expired(&self, job: &Job) -> bool {
        job.started_at.is_some_and(|started| {
            Utc::now()
                .signed_duration_since(started)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.config.job_timeout)
        })
    }

    async fn transition(&self, job: &Job, next: JobStatus) -> Result<(), JobError> {
        let (job_id, from) = (job.id, job.status);
        self.db
            .call(move |db| db.transition_status(job_id, from, next))
            .await
            .map_err(store_error)?;
        info!(job_id = %job_id, from = %from, to = %next, "Job transition");
        Ok(())
    }

    /// Apply a termination cause. A lost race ends the run without writing.
    async fn stop(&self, job_id: Uuid, err: JobError) -> Result<JobStatus> {
        let Some(target) = err.terminal_status() else {
            if let JobError::StatusConflict { expected, actual } = err {
                warn!(job_id = %job_id, %expected, %actual, "Another writer moved the job; stopping");
                return Ok(actual);
            }
            return Err(err.into());
        };

        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        let message = err.to_string();
        let last_error = (target != JobStatus::Cancelled).then_some(message.clone());
        let from = job.status;
        let finished = match self
            .db
            .call(move |db| db.finish_job(job_id, from, target, last_error.as_deref()))
            .await
        {
            Ok(job) => job,
            Err(e) => match e.downcast_ref::<StoreError>() {
                Some(StoreError::StatusConflict { actual, .. }) => {
                    warn!(job_id = %job_id, %actual, "Job finished elsewhere");
                    return Ok(*actual);
                }
                _ => return Err(e),
            },
        };

        match target {
            JobStatus::Cancelled => info!(job_id = %job_id, from = %from, "Job cancelled"),
            _ => warn!(job_id = %job_id, from = %from, to = %target, error = %message, "Job stopped"),
        }
        let level = if target == JobStatus::Cancelled { LogLevel::Warn } else { LogLevel::Error };
        self.emit(&finished, level, LogRole::System, message);
        self.finalize(&finished).await;
        Ok(finished.status)
    }

    /// Release what a terminal job still holds.
    async fn finalize(&self, job: &Job) {
        if let Some(sandbox) = &job.sandbox
            && let Err(e) = self.stages.sandbox.release(sandbox).await
        {
            warn!(job_id = %job.id, sandbox = %sandbox.id, error = %e, "Failed to release sandbox");
        }
        if let Err(e) = self.knowledge.clear_job(job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to clear job knowledge");
        }
        self.emit(job, LogLevel::Info, LogRole::System, format!("Job {}", job.status));
        self.logs.close(job.id);
    }

    /// Move every job whose wall-clock budget ran out to `TIMED_OUT`.
    /// Returns the ids it timed out.
    pub async fn watchdog_scan(&self) -> Result<Vec<Uuid>> {
        let active = self.db.call(|db| db.list_active_jobs()).await?;
        let mut timed_out = Vec::new();
        for job in active.into_iter().filter(|j| self.expired(j)) {
            let (job_id, from) = (job.id, job.status);
            let message = JobError::TimedOut.to_string();
            match self
                .db
                .call(move |db| db.finish_job(job_id, from, JobStatus::TimedOut, Some(&message)))
                .await
            {
                Ok(finished) => {
                    warn!(job_id = %job_id, from = %from, "Watchdog timed out job");
                    self.emit(&finished, LogLevel::Error, LogRole::System, "Job exceeded its wall-clock budget");
                    self.finalize(&finished).await;
                    timed_out.push(job_id);
                }
                Err(e) => debug!(job_id = %job_id, error = %e, "Watchdog lost the race"),
            }
        }
        Ok(timed_out)
    }

    // ── Helpers ───────────────────────────────────────────────────────

    async fn load(&self, job_id: Uuid) -> Result<Job> {
        self.db.call(move |db| db.require_job(job_id)).await
    }

    /// The job's sandbox, provisioning and storing one on first use.
    async fn sandbox_for(&self, job: &Job) -> Result<SandboxInfo, JobError> {
        if let Some(sandbox) = &job.sandbox {
            return Ok(sandbox.clone());
        }
        let sandbox_stage = &self.stages.sandbox;
        let job_id = job.id;
        let sandbox = call_stage(
            &self.policy,
            "sandbox",
            move || sandbox_stage.provision(job_id),
            |attempt, err, delay| self.retry_notice(job, LogRole::Executor, "sandbox", attempt, err, delay),
        )
        .await
        .map_err(|e| JobError::from_stage("sandbox", e))?;
        let stored = sandbox.clone();
        if let Err(e) = self.db.call(move |db| db.set_sandbox(job_id, &stored)).await {
            // Unrecorded, so finalize cannot release it.
            if let Err(release) = self.stages.sandbox.release(&sandbox).await {
                warn!(job_id = %job_id, sandbox = %sandbox.id, error = %release, "Failed to release sandbox");
            }
            return Err(store_error(e));
        }
        info!(job_id = %job_id, sandbox = %sandbox.id, "Sandbox provisioned");
        Ok(sandbox)
    }

    async fn job_documents(&self, job: &Job, query: &str) -> Vec<KnowledgeDocument> {
        match self.knowledge.search(query, job.id, self.config.knowledge.top_k).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job knowledge search failed");
                Vec::new()
            }
        }
    }

    async fn repo_documents(&self, job: &Job, query: &str) -> Vec<KnowledgeDocument> {
        if !job.has_repo_scope() {
            return Vec::new();
        }
        match self
            .knowledge
            .search_repo(
                query,
                job.tenant_id.as_deref(),
                job.project_id.as_deref(),
                self.config.knowledge.top_k,
            )
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Repo knowledge search failed");
                Vec::new()
            }
        }
    }

    async fn repo_context(&self, job: &Job, query: &str) -> String {
        let docs = self.repo_documents(job, query).await;
        self.knowledge.format_for_context(&docs)
    }

    /// Ingest into the job's knowledge scope. Failures only cost context.
    async fn remember(&self, job: &Job, kind: DocumentKind, path: &str, content: &str, round: u32) {
        if content.trim().is_empty() {
            return;
        }
        if let Err(e) = self
            .knowledge
            .ingest_job_document(job.id, kind, path, content, round)
            .await
        {
            warn!(job_id = %job.id, path, error = %e, "Knowledge ingest failed");
        }
    }

    /// Share a completed job's sources with later jobs of the same
    /// tenant/project.
    async fn promote(&self, job: &Job, artifacts: &[Artifact]) {
        if !job.has_repo_scope() {
            return;
        }
        let mut promoted = 0;
        for artifact in artifacts {
            match self
                .knowledge
                .ingest_repo_document(
                    job.tenant_id.as_deref(),
                    job.project_id.as_deref(),
                    &artifact.file_path,
                    &artifact.content,
                )
                .await
            {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, path = %artifact.file_path, error = %e, "Repo ingest failed"),
            }
        }
        debug!(job_id = %job.id, promoted, "Promoted artifacts to repo knowledge");
    }

    fn emit(&self, job: &Job, level: LogLevel, role: LogRole, message: impl Into<String>) {
        self.logs.emit(job.id, job.current_round, level, role, message);
    }

    fn retry_notice(
        &self,
        job: &Job,
        role: LogRole,
        stage: &str,
        attempt: u32,
        err: &StageError,
        delay: std::time::Duration,
    ) {
        self.emit(
            job,
            LogLevel::Warn,
            role,
            format!(
                "{} stage attempt {} failed ({}); retrying in {}ms",
                stage,
                attempt,
                err,
                delay.as_millis()
            ),
        );
    }
}

fn locked_contract(job: &Job) -> Result<&Contract, JobError> {
    job.contract
        .as_ref()
        .filter(|c| c.locked)
        .ok_or_else(|| JobError::Store(anyhow::anyhow!("job {} has no locked contract", job.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::db::EngineDb;
    use crate::engine::knowledge::InMemoryKnowledgeStore;
    use crate::engine::models::ContractUnit;
    use crate::engine::stages::{
        ContractDraft, ContractStage, GeneratedFile, GenerationStage, RepairRequest, RepairStage, Sandbox,
        SandboxReport, SandboxRequest,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct Unused;

    #[async_trait]
    impl ContractStage for Unused {
        async fn design(&self, _request: &ContractRequest) -> Result<ContractDraft, StageError> {
            Err(StageError::Fatal("unused".into()))
        }
    }

    #[async_trait]
    impl GenerationStage for Unused {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<GeneratedFile>, StageError> {
            Err(StageError::Fatal("unused".into()))
        }
    }

    #[async_trait]
    impl RepairStage for Unused {
        async fn repair(&self, _request: &RepairRequest) -> Result<GeneratedFile, StageError> {
            Err(StageError::Fatal("unused".into()))
        }
    }

    #[async_trait]
    impl Sandbox for Unused {
        async fn provision(&self, _job_id: Uuid) -> Result<SandboxInfo, StageError> {
            Err(StageError::Fatal("unused".into()))
        }
        async fn validate(&self, _request: &SandboxRequest) -> Result<SandboxReport, StageError> {
            Err(StageError::Fatal("unused".into()))
        }
        async fn release(&self, _sandbox: &SandboxInfo) -> Result<(), StageError> {
            Ok(())
        }
    }

    fn orchestrator(config: EngineConfig) -> (Orchestrator, mpsc::UnboundedReceiver<Uuid>) {
        let unused = Arc::new(Unused);
        let stages = Stages {
            contract: unused.clone(),
            generation: unused.clone(),
            repair: unused.clone(),
            sandbox: unused,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let orch = Orchestrator::new(
            DbHandle::new(EngineDb::new_in_memory().unwrap()),
            stages,
            Arc::new(InMemoryKnowledgeStore::new(10, 4000)),
            Arc::new(LogBroadcaster::new(16)),
            config,
            tx,
        );
        (orch, rx)
    }

    #[tokio::test]
    async fn test_submit_validates_and_enqueues() {
        let (orch, mut rx) = orchestrator(EngineConfig::default());

        let err = orch.submit(SubmitJob::new("   ")).await.unwrap_err();
        assert!(err.downcast_ref::<InvalidRequest>().is_some());

        let mut too_many = SubmitJob::new("Build a todo app");
        too_many.max_rounds = Some(11);
        assert!(orch.submit(too_many).await.unwrap_err().downcast_ref::<InvalidRequest>().is_some());

        let mut zero = SubmitJob::new("Build a todo app");
        zero.max_rounds = Some(0);
        assert!(orch.submit(zero).await.is_err());

        let job = orch.submit(SubmitJob::new("Build a todo app")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_rounds, 3);
        assert_eq!(rx.recv().await, Some(job.id));
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_noop() {
        let (orch, mut rx) = orchestrator(EngineConfig::default());
        let job = orch.submit(SubmitJob::new("x")).await.unwrap();
        rx.recv().await;
        let job_id = job.id;
        orch.db()
            .call(move |db| db.finish_job(job_id, JobStatus::Pending, JobStatus::Failed, Some("boom")))
            .await
            .unwrap();

        let after = orch.cancel(job_id).await.unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert!(!after.cancel_requested);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_job_before_any_stage() {
        let (orch, mut rx) = orchestrator(EngineConfig::default());
        let job = orch.submit(SubmitJob::new("x")).await.unwrap();
        rx.recv().await;

        let flagged = orch.cancel(job.id).await.unwrap();
        assert!(flagged.cancel_requested);
        assert_eq!(rx.recv().await, Some(job.id));

        assert_eq!(orch.run_job(job.id).await.unwrap(), JobStatus::Cancelled);
        let job_id = job.id;
        let stored = orch.db().call(move |db| db.require_job(job_id)).await.unwrap();
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn test_fatal_contract_failure_fails_job() {
        let (orch, _rx) = orchestrator(EngineConfig::default());
        let job = orch.submit(SubmitJob::new("x")).await.unwrap();

        assert_eq!(orch.run_job(job.id).await.unwrap(), JobStatus::Failed);
        let job_id = job.id;
        let stored = orch.db().call(move |db| db.require_job(job_id)).await.unwrap();
        assert!(stored.last_error.unwrap().contains("unused"));
        assert_eq!(stored.error_count, 1);
    }

    #[tokio::test]
    async fn test_locked_job_is_skipped() {
        let (orch, _rx) = orchestrator(EngineConfig::default());
        let job = orch.submit(SubmitJob::new("x")).await.unwrap();
        let _held = orch.locks().try_lock(job.id).unwrap();
        assert_eq!(orch.run_job(job.id).await.unwrap(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_watchdog_times_out_expired_jobs() {
        let config = EngineConfig {
            job_timeout: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let (orch, _rx) = orchestrator(config);
        let job = orch.submit(SubmitJob::new("x")).await.unwrap();
        let fresh = orch.submit(SubmitJob::new("y")).await.unwrap();
        let job_id = job.id;
        orch.db()
            .call(move |db| db.transition_status(job_id, JobStatus::Pending, JobStatus::ContractPending))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let timed_out = orch.watchdog_scan().await.unwrap();
        assert_eq!(timed_out, vec![job.id]);

        let stored = orch.db().call(move |db| db.require_job(job_id)).await.unwrap();
        assert_eq!(stored.status, JobStatus::TimedOut);
        assert!(stored.last_error.is_some());

        // Never started, so no wall-clock budget is running yet.
        let fresh_id = fresh.id;
        let untouched = orch.db().call(move |db| db.require_job(fresh_id)).await.unwrap();
        assert_eq!(untouched.status, JobStatus::Pending);
    }

    #[test]
    fn test_store_error_classification() {
        let conflict: anyhow::Error = StoreError::StatusConflict {
            job_id: Uuid::new_v4(),
            expected: JobStatus::Validating,
            actual: JobStatus::TimedOut,
        }
        .into();
        assert!(matches!(
            store_error(conflict),
            JobError::StatusConflict {
                actual: JobStatus::TimedOut,
                ..
            }
        ));
        let cancelled: anyhow::Error = StoreError::CancelRequested(Uuid::new_v4()).into();
        assert!(matches!(store_error(cancelled), JobError::Cancelled));
        let other: anyhow::Error = StoreError::JobNotFound(Uuid::new_v4()).into();
        assert!(matches!(store_error(other), JobError::Store(_)));
    }

    #[tokio::test]
    async fn test_missing_contract_fails_job() {
        let (orch, _rx) = orchestrator(EngineConfig::default());
        let job = orch.submit(SubmitJob::new("x")).await.unwrap();
        let job_id = job.id;
        orch.db()
            .call(move |db| {
                db.transition_status(job_id, JobStatus::Pending, JobStatus::ContractPending)?;
                db.transition_status(job_id, JobStatus::ContractPending, JobStatus::ContractLocked)?;
                db.transition_status(job_id, JobStatus::ContractLocked, JobStatus::Generating)
            })
            .await
            .unwrap();

        assert_eq!(orch.run_job(job_id).await.unwrap(), JobStatus::Failed);
        let stored = orch.db().call(move |db| db.require_job(job_id)).await.unwrap();
        assert!(stored.last_error.unwrap().contains("no locked contract"));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_locked_contract_required() {
        let mut job = Job {
            id: Uuid::new_v4(),
            requirement: "x".into(),
            app_spec_id: None,
            template_id: None,
            tenant_id: None,
            project_id: None,
            status: JobStatus::Generating,
            current_round: 0,
            max_rounds: 3,
            contract: None,
            sandbox: None,
            last_error: None,
            error_count: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(locked_contract(&job).is_err());
        job.contract = Some(Contract {
            schema: "s".into(),
            db_schema: String::new(),
            units: vec![ContractUnit {
                file_path: "a/A.java".into(),
                artifact_type: ArtifactType::Service,
                description: String::new(),
            }],
            locked: true,
            locked_at: None,
        });
        assert!(locked_contract(&job).is_ok());
    }
}
