//! Repair glue: gathers context for a failing artifact and asks the repair
//! stage for its next version.

use std::sync::Arc;

use super::knowledge::KnowledgeStore;
use super::models::{Artifact, Contract, Job};
use super::stages::{AttemptRecord, RepairRequest, RepairStage};
use crate::errors::StageError;

/// Lines of compiler output folded into the retrieval query.
const QUERY_OUTPUT_LINES: usize = 5;

pub struct Repairer {
    stage: Arc<dyn RepairStage>,
    knowledge: Arc<dyn KnowledgeStore>,
    top_k: usize,
}

impl Repairer {
    pub fn new(stage: Arc<dyn RepairStage>, knowledge: Arc<dyn KnowledgeStore>, top_k: usize) -> Self {
        Self {
            stage,
            knowledge,
            top_k,
        }
    }

    /// Build the repair request for `parent`, the failing latest version.
    /// `history` is the file's full version list, oldest first.
    pub async fn prepare(&self, job: &Job, contract: &Contract, parent: &Artifact, history: &[Artifact]) -> RepairRequest {
        let output = parent.validity.compiler_output().unwrap_or_default().to_string();
        let query = repair_query(&parent.file_path, &output);

        let mut docs = match self.knowledge.search(&query, job.id, self.top_k).await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job knowledge search failed");
                Vec::new()
            }
        };
        if job.has_repo_scope() {
            match self
                .knowledge
                .search_repo(&query, job.tenant_id.as_deref(), job.project_id.as_deref(), self.top_k)
                .await
            {
                Ok(repo_docs) => docs.extend(repo_docs),
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Repo knowledge search failed"),
            }
        }

        RepairRequest {
            job_id: job.id,
            round: job.current_round + 1,
            file_path: parent.file_path.clone(),
            content: parent.content.clone(),
            compiler_output: output,
            history: history
                .iter()
                .filter(|a| a.version < parent.version)
                .map(|a| AttemptRecord {
                    version: a.version,
                    content: a.content.clone(),
                    compiler_output: a.validity.compiler_output().map(str::to_string),
                })
                .collect(),
            contract: contract.clone(),
            context: self.knowledge.format_for_context(&docs),
        }
    }

    /// Ask the stage for corrected content. The result must stay on the
    /// same file; anything else breaks the contract.
    pub async fn repair(&self, request: &RepairRequest) -> Result<String, StageError> {
        let file = self.stage.repair(request).await?;
        if file.file_path != request.file_path {
            return Err(StageError::ContractViolation(format!(
                "repair of {} returned {}",
                request.file_path, file.file_path
            )));
        }
        Ok(file.content)
    }
}

fn repair_query(file_path: &str, output: &str) -> String {
    let head: Vec<&str> = output.lines().take(QUERY_OUTPUT_LINES).collect();
    format!("{} {}", file_path, head.join(" "))
}
