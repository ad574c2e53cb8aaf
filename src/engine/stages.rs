//! Seams to the out-of-process collaborators.
//!
//! The orchestrator only sequences these calls; what they do is up to the
//! implementation. HTTP-backed implementations live in `providers`; tests
//! plug in scripted doubles.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db::{CONTRACT_DB_SCHEMA_PATH, CONTRACT_SCHEMA_PATH};
use super::models::{Contract, ContractUnit, SandboxInfo, ValidationType};
use crate::errors::StageError;

// ── Contract ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRequest {
    pub job_id: Uuid,
    pub requirement: String,
    pub app_spec_id: Option<String>,
    pub template_id: Option<String>,
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractDraft {
    pub schema: String,
    pub db_schema: String,
    pub units: Vec<ContractUnit>,
}

impl ContractDraft {
    /// A usable contract declares at least one unit, no path twice, and
    /// none of the paths the contract artifacts themselves are stored under.
    pub fn check(&self) -> Result<(), StageError> {
        if self.schema.trim().is_empty() {
            return Err(StageError::ContractViolation("contract schema is empty".into()));
        }
        if self.units.is_empty() {
            return Err(StageError::ContractViolation("contract declares no units".into()));
        }
        let mut seen = HashSet::new();
        for unit in &self.units {
            if unit.file_path == CONTRACT_SCHEMA_PATH || unit.file_path == CONTRACT_DB_SCHEMA_PATH {
                return Err(StageError::ContractViolation(format!(
                    "unit {} uses a reserved contract path",
                    unit.file_path
                )));
            }
            if !seen.insert(unit.file_path.as_str()) {
                return Err(StageError::ContractViolation(format!(
                    "unit {} declared twice",
                    unit.file_path
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait ContractStage: Send + Sync {
    async fn design(&self, request: &ContractRequest) -> Result<ContractDraft, StageError>;
}

// ── Generation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub job_id: Uuid,
    pub requirement: String,
    pub contract: Contract,
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub file_path: String,
    pub content: String,
}

#[async_trait]
pub trait GenerationStage: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<GeneratedFile>, StageError>;
}

/// Check a generation result against the locked contract: every declared
/// unit exactly once, nothing undeclared.
pub fn check_against_contract(contract: &Contract, files: &[GeneratedFile]) -> Result<(), StageError> {
    let mut seen = HashSet::new();
    for file in files {
        if !contract.declares(&file.file_path) {
            return Err(StageError::ContractViolation(format!(
                "{} is not declared by the contract",
                file.file_path
            )));
        }
        if !seen.insert(file.file_path.as_str()) {
            return Err(StageError::ContractViolation(format!(
                "{} was generated twice",
                file.file_path
            )));
        }
    }
    let missing: Vec<&str> = contract
        .units
        .iter()
        .map(|u| u.file_path.as_str())
        .filter(|p| !seen.contains(p))
        .collect();
    if !missing.is_empty() {
        return Err(StageError::ContractViolation(format!(
            "missing contract units: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

// ── Repair ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub version: u32,
    pub content: String,
    pub compiler_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRequest {
    pub job_id: Uuid,
    pub round: u32,
    pub file_path: String,
    pub content: String,
    pub compiler_output: String,
    /// Earlier versions of the same file, oldest first.
    pub history: Vec<AttemptRecord>,
    pub contract: Contract,
    pub context: String,
}

#[async_trait]
pub trait RepairStage: Send + Sync {
    /// Return the corrected content for `request.file_path`.
    async fn repair(&self, request: &RepairRequest) -> Result<GeneratedFile, StageError>;
}

// ── Sandbox ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub job_id: Uuid,
    pub round: u32,
    pub project_type: String,
    pub sandbox: SandboxInfo,
    pub artifacts: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactOutcome {
    pub file_path: String,
    pub passed: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default = "default_validation_type")]
    pub validation_type: ValidationType,
    #[serde(default)]
    pub duration_ms: u64,
}

fn default_validation_type() -> ValidationType {
    ValidationType::Compile
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxReport {
    pub outcomes: Vec<ArtifactOutcome>,
    /// Output of the whole build, used when per-file output is missing.
    #[serde(default)]
    pub output: String,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn provision(&self, job_id: Uuid) -> Result<SandboxInfo, StageError>;

    async fn validate(&self, request: &SandboxRequest) -> Result<SandboxReport, StageError>;

    async fn release(&self, sandbox: &SandboxInfo) -> Result<(), StageError>;
}

/// The collaborators one orchestrator drives.
#[derive(Clone)]
pub struct Stages {
    pub contract: Arc<dyn ContractStage>,
    pub generation: Arc<dyn GenerationStage>,
    pub repair: Arc<dyn RepairStage>,
    pub sandbox: Arc<dyn Sandbox>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::ArtifactType;

    fn unit(path: &str) -> ContractUnit {
        ContractUnit {
            file_path: path.into(),
            artifact_type: ArtifactType::from_file_path(path),
            description: String::new(),
        }
    }

    fn contract(paths: &[&str]) -> Contract {
        Contract {
            schema: "openapi: 3.0.0".into(),
            db_schema: String::new(),
            units: paths.iter().map(|p| unit(p)).collect(),
            locked: true,
            locked_at: None,
        }
    }

    fn file(path: &str) -> GeneratedFile {
        GeneratedFile {
            file_path: path.into(),
            content: "x".into(),
        }
    }

    #[test]
    fn test_contract_draft_check() {
        let ok = ContractDraft {
            schema: "openapi: 3.0.0".into(),
            db_schema: String::new(),
            units: vec![unit("a/A.java"), unit("a/B.java")],
        };
        assert!(ok.check().is_ok());

        let empty = ContractDraft { units: vec![], ..ok.clone() };
        assert!(matches!(empty.check(), Err(StageError::ContractViolation(_))));

        let dup = ContractDraft {
            units: vec![unit("a/A.java"), unit("a/A.java")],
            ..ok.clone()
        };
        match dup.check() {
            Err(StageError::ContractViolation(msg)) => assert!(msg.contains("a/A.java")),
            other => panic!("expected violation, got {:?}", other),
        }

        let blank = ContractDraft { schema: " ".into(), ..ok };
        assert!(blank.check().is_err());
    }

    #[test]
    fn test_contract_draft_rejects_reserved_paths() {
        for reserved in [CONTRACT_SCHEMA_PATH, CONTRACT_DB_SCHEMA_PATH] {
            let draft = ContractDraft {
                schema: "openapi: 3.0.0".into(),
                db_schema: "CREATE TABLE t (id INT);".into(),
                units: vec![unit(reserved), unit("a/A.java")],
            };
            match draft.check() {
                Err(StageError::ContractViolation(msg)) => {
                    assert!(msg.contains(reserved));
                    assert!(msg.contains("reserved"));
                }
                other => panic!("expected violation for {}, got {:?}", reserved, other),
            }
        }

        // Same directory, different file.
        let nearby = ContractDraft {
            schema: "openapi: 3.0.0".into(),
            db_schema: String::new(),
            units: vec![unit("contract/Notes.java")],
        };
        assert!(nearby.check().is_ok());
    }

    #[test]
    fn test_generation_must_match_contract_exactly() {
        let c = contract(&["a/A.java", "a/B.java"]);
        assert!(check_against_contract(&c, &[file("a/B.java"), file("a/A.java")]).is_ok());

        match check_against_contract(&c, &[file("a/A.java")]) {
            Err(StageError::ContractViolation(msg)) => assert!(msg.contains("a/B.java")),
            other => panic!("expected missing unit, got {:?}", other),
        }
        assert!(check_against_contract(&c, &[file("a/A.java"), file("a/B.java"), file("a/C.java")]).is_err());
        assert!(check_against_contract(&c, &[file("a/A.java"), file("a/A.java"), file("a/B.java")]).is_err());
    }

    #[test]
    fn test_sandbox_report_defaults() {
        let report: SandboxReport =
            serde_json::from_str(r#"{"outcomes":[{"file_path":"a/A.java","passed":true}]}"#).unwrap();
        assert_eq!(report.outcomes[0].validation_type, ValidationType::Compile);
        assert_eq!(report.outcomes[0].output, "");
        assert_eq!(report.output, "");
    }
}
