//! Round validation: one sandbox run over the round's artifact set, one
//! `ValidationResult` per artifact.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::db::{CONTRACT_DB_SCHEMA_PATH, CONTRACT_SCHEMA_PATH};
use super::models::{Artifact, Contract, Job, NewValidationResult, ParsedError, SandboxInfo, ValidationType};
use super::stages::{GeneratedFile, Sandbox, SandboxReport, SandboxRequest};
use crate::errors::StageError;

static COMPILER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:\[(?P<sev1>ERROR|WARNING)\]\s+)?(?P<file>[\w./\\-]+\.\w+):\[?(?P<line>\d+)(?:[,:](?P<col>\d+))?\]?:?\s*(?:(?P<sev2>error|warning):\s*)?(?P<msg>.*)$",
    )
    .expect("compiler line regex is valid")
});

/// Output fragments that mean the build environment failed, not the code.
const ENVIRONMENT_MARKERS: &[&str] = &[
    "could not resolve dependencies",
    "could not transfer artifact",
    "failed to collect dependencies",
    "could not resolve host",
    "temporary failure in name resolution",
    "network is unreachable",
    "connection timed out",
    "read timed out",
    "npm err! network",
];

const SUMMARY_LIMIT: usize = 2000;
const SUMMARY_LINES_PER_FILE: usize = 3;

pub struct Validator {
    sandbox: Arc<dyn Sandbox>,
    project_type: String,
}

impl Validator {
    pub fn new(sandbox: Arc<dyn Sandbox>, project_type: impl Into<String>) -> Self {
        Self {
            sandbox,
            project_type: project_type.into(),
        }
    }

    /// The artifacts a round validates: the latest version of every file
    /// the contract declares. Contract artifacts themselves are excluded.
    pub fn round_set(contract: &Contract, latest: Vec<Artifact>) -> Vec<Artifact> {
        latest
            .into_iter()
            .filter(|a| a.file_path != CONTRACT_SCHEMA_PATH && a.file_path != CONTRACT_DB_SCHEMA_PATH)
            .filter(|a| contract.declares(&a.file_path))
            .collect()
    }

    /// Validate one round. Every artifact in `artifacts` gets exactly one
    /// result; an artifact the sandbox did not report on counts as failed.
    pub async fn run(
        &self,
        job: &Job,
        sandbox: &SandboxInfo,
        artifacts: &[Artifact],
    ) -> Result<Vec<NewValidationResult>, StageError> {
        let request = SandboxRequest {
            job_id: job.id,
            round: job.current_round,
            project_type: self.project_type.clone(),
            sandbox: sandbox.clone(),
            artifacts: artifacts
                .iter()
                .map(|a| GeneratedFile {
                    file_path: a.file_path.clone(),
                    content: a.content.clone(),
                })
                .collect(),
        };
        let report = self.sandbox.validate(&request).await?;
        if let Some(marker) = environment_failure(&report) {
            return Err(StageError::Transient(format!(
                "sandbox environment error ({}), not a code failure",
                marker
            )));
        }
        Ok(collect_results(&report, artifacts))
    }
}

fn environment_failure(report: &SandboxReport) -> Option<&'static str> {
    let failing = report.outcomes.iter().filter(|o| !o.passed).map(|o| o.output.as_str());
    let any_failed = report.outcomes.iter().any(|o| !o.passed);
    let texts: Vec<&str> = if any_failed || report.outcomes.is_empty() {
        failing.chain(std::iter::once(report.output.as_str())).collect()
    } else {
        Vec::new()
    };
    texts.iter().find_map(|text| {
        let lower = text.to_lowercase();
        ENVIRONMENT_MARKERS.iter().copied().find(|m| lower.contains(m))
    })
}

fn collect_results(report: &SandboxReport, artifacts: &[Artifact]) -> Vec<NewValidationResult> {
    let by_path: HashMap<&str, _> = report
        .outcomes
        .iter()
        .map(|o| (o.file_path.as_str(), o))
        .collect();
    let build_errors = parse_compiler_output(&report.output);

    artifacts
        .iter()
        .map(|artifact| match by_path.get(artifact.file_path.as_str()) {
            Some(outcome) if outcome.passed => NewValidationResult {
                artifact_id: artifact.id,
                validation_type: outcome.validation_type,
                passed: true,
                details: String::new(),
                parsed_errors: Vec::new(),
                duration_ms: outcome.duration_ms,
            },
            Some(outcome) => {
                let own = parse_compiler_output(&outcome.output);
                let (details, parsed_errors) = if !outcome.output.trim().is_empty() {
                    (outcome.output.clone(), own)
                } else {
                    attribute(&build_errors, artifact, &report.output)
                };
                NewValidationResult {
                    artifact_id: artifact.id,
                    validation_type: outcome.validation_type,
                    passed: false,
                    details,
                    parsed_errors,
                    duration_ms: outcome.duration_ms,
                }
            }
            None => NewValidationResult {
                artifact_id: artifact.id,
                validation_type: ValidationType::Other,
                passed: false,
                details: format!("no validation result reported for {}", artifact.file_path),
                parsed_errors: Vec::new(),
                duration_ms: 0,
            },
        })
        .collect()
}

/// Pick the build-level errors that mention this artifact.
fn attribute(errors: &[ParsedError], artifact: &Artifact, build_output: &str) -> (String, Vec<ParsedError>) {
    let mine: Vec<ParsedError> = errors
        .iter()
        .filter(|e| mentions(&e.file, artifact))
        .cloned()
        .collect();
    if mine.is_empty() {
        let details = if build_output.trim().is_empty() {
            format!("{} failed validation without output", artifact.file_path)
        } else {
            build_output.to_string()
        };
        return (details, mine);
    }
    let details = mine
        .iter()
        .map(|e| match e.line {
            Some(line) => format!("{}:{}: {}: {}", artifact.file_path, line, e.severity, e.message),
            None => format!("{}: {}: {}", artifact.file_path, e.severity, e.message),
        })
        .collect::<Vec<_>>()
        .join("\n");
    (details, mine)
}

fn mentions(reported: &str, artifact: &Artifact) -> bool {
    let reported = reported.replace('\\', "/");
    reported.ends_with(&artifact.file_path) || artifact.file_path.ends_with(&reported)
}

/// Extract `file:line[:col]: error: message` style lines from compiler output.
pub fn parse_compiler_output(output: &str) -> Vec<ParsedError> {
    COMPILER_LINE
        .captures_iter(output)
        .map(|caps| {
            let severity = caps
                .name("sev1")
                .or_else(|| caps.name("sev2"))
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_else(|| "error".to_string());
            ParsedError {
                file: caps["file"].to_string(),
                line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
                column: caps.name("col").and_then(|m| m.as_str().parse().ok()),
                message: caps["msg"].trim().to_string(),
                severity,
            }
        })
        .collect()
}

/// Human-readable summary of the files still failing, bounded in size.
pub fn summarize_failures(failing: &[(String, String)]) -> String {
    let mut summary = failing
        .iter()
        .map(|(path, output)| {
            let head: Vec<&str> = output
                .lines()
                .filter(|l| !l.trim().is_empty())
                .take(SUMMARY_LINES_PER_FILE)
                .collect();
            if head.is_empty() {
                path.clone()
            } else {
                format!("{}: {}", path, head.join(" | "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if summary.chars().count() > SUMMARY_LIMIT {
        summary = summary.chars().take(SUMMARY_LIMIT - 3).collect();
        summary.push_str("...");
    }
    summary
}
