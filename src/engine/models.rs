use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ── Job status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    ContractPending,
    ContractLocked,
    Generating,
    Validating,
    Repairing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 6] = [
        Self::Pending,
        Self::ContractPending,
        Self::ContractLocked,
        Self::Generating,
        Self::Validating,
        Self::Repairing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ContractPending => "CONTRACT_PENDING",
            Self::ContractLocked => "CONTRACT_LOCKED",
            Self::Generating => "GENERATING",
            Self::Validating => "VALIDATING",
            Self::Repairing => "REPAIRING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Edges of the job state machine. Any live state may be failed,
    /// timed out or cancelled; terminal states have no way out.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed | Self::TimedOut | Self::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Pending, Self::ContractPending)
                | (Self::ContractPending, Self::ContractLocked)
                | (Self::ContractLocked, Self::Generating)
                | (Self::Generating, Self::Validating)
                | (Self::Validating, Self::Completed)
                | (Self::Validating, Self::Repairing)
                | (Self::Repairing, Self::Validating)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONTRACT_PENDING" => Ok(Self::ContractPending),
            "CONTRACT_LOCKED" => Ok(Self::ContractLocked),
            "GENERATING" => Ok(Self::Generating),
            "VALIDATING" => Ok(Self::Validating),
            "REPAIRING" => Ok(Self::Repairing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

// ── Artifact classification ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Contract,
    Schema,
    Entity,
    Mapper,
    Service,
    Controller,
    Config,
    Test,
    Frontend,
    Other,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Schema => "schema",
            Self::Entity => "entity",
            Self::Mapper => "mapper",
            Self::Service => "service",
            Self::Controller => "controller",
            Self::Config => "config",
            Self::Test => "test",
            Self::Frontend => "frontend",
            Self::Other => "other",
        }
    }

    /// Infer the type from a project-relative path.
    pub fn from_file_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.contains("openapi") || lower.ends_with(".yaml") || lower.ends_with(".yml") {
            Self::Contract
        } else if lower.contains("schema") && lower.ends_with(".sql") {
            Self::Schema
        } else if lower.contains("/test/") || lower.ends_with("test.java") {
            Self::Test
        } else if lower.contains("/entity/") || lower.contains("/model/") || lower.contains("/domain/") {
            Self::Entity
        } else if lower.contains("/mapper/") || lower.contains("/repository/") {
            Self::Mapper
        } else if lower.contains("/service/") {
            Self::Service
        } else if lower.contains("/controller/") || lower.contains("/rest/") || lower.contains("/api/") {
            Self::Controller
        } else if lower.contains("/config/") {
            Self::Config
        } else if lower.ends_with(".tsx") || lower.ends_with(".jsx") || lower.ends_with(".vue") {
            Self::Frontend
        } else {
            Self::Other
        }
    }

    /// Which generator owns first versions of this type.
    pub fn default_generator(&self) -> GeneratedBy {
        match self {
            Self::Contract | Self::Schema | Self::Entity => GeneratedBy::Architect,
            _ => GeneratedBy::Coder,
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contract" => Ok(Self::Contract),
            "schema" => Ok(Self::Schema),
            "entity" => Ok(Self::Entity),
            "mapper" => Ok(Self::Mapper),
            "service" => Ok(Self::Service),
            "controller" => Ok(Self::Controller),
            "config" => Ok(Self::Config),
            "test" => Ok(Self::Test),
            "frontend" => Ok(Self::Frontend),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid artifact type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedBy {
    Architect,
    Coder,
    Coach,
    Other,
}

impl GeneratedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Coach => "coach",
            Self::Other => "other",
        }
    }
}

impl FromStr for GeneratedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architect" => Ok(Self::Architect),
            "coder" => Ok(Self::Coder),
            "coach" => Ok(Self::Coach),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid generator: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Java,
    Typescript,
    Javascript,
    Sql,
    Yaml,
    Json,
    Xml,
    Rust,
    Python,
    Other,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Typescript => "typescript",
            Self::Javascript => "javascript",
            Self::Sql => "sql",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Rust => "rust",
            Self::Python => "python",
            Self::Other => "other",
        }
    }

    pub fn from_file_name(name: &str) -> Self {
        let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("java") => Self::Java,
            Some("ts") | Some("tsx") => Self::Typescript,
            Some("js") | Some("jsx") | Some("mjs") => Self::Javascript,
            Some("sql") => Self::Sql,
            Some("yaml") | Some("yml") => Self::Yaml,
            Some("json") => Self::Json,
            Some("xml") => Self::Xml,
            Some("rs") => Self::Rust,
            Some("py") => Self::Python,
            _ => Self::Other,
        }
    }

    /// Tag used when fencing content of this language in markdown.
    pub fn fence(&self) -> &'static str {
        match self {
            Self::Other => "",
            other => other.as_str(),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "java" => Ok(Self::Java),
            "typescript" => Ok(Self::Typescript),
            "javascript" => Ok(Self::Javascript),
            "sql" => Ok(Self::Sql),
            "yaml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            "rust" => Ok(Self::Rust),
            "python" => Ok(Self::Python),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid language: {}", s)),
        }
    }
}

// ── Artifact ──────────────────────────────────────────────────────────

/// Validation state of one artifact version.
///
/// A freshly generated or repaired version is `Valid` until the validator
/// reports otherwise; `Invalid` always carries the compiler output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArtifactValidity {
    #[default]
    Valid,
    Invalid {
        output: String,
    },
}

impl ArtifactValidity {
    pub fn has_errors(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    pub fn compiler_output(&self) -> Option<&str> {
        match self {
            Self::Valid => None,
            Self::Invalid { output } => Some(output),
        }
    }

    pub(crate) fn from_columns(has_errors: bool, output: Option<String>) -> Self {
        match (has_errors, output) {
            (true, Some(output)) => Self::Invalid { output },
            (true, None) => Self::Invalid {
                output: String::new(),
            },
            (false, _) => Self::Valid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub artifact_type: ArtifactType,
    pub file_path: String,
    pub file_name: String,
    pub content: String,
    pub language: Language,
    pub version: u32,
    pub checksum: String,
    pub parent_artifact_id: Option<Uuid>,
    pub validity: ArtifactValidity,
    pub generated_by: GeneratedBy,
    pub generation_round: u32,
    pub created_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn has_errors(&self) -> bool {
        self.validity.has_errors()
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            id: self.id,
            file_path: self.file_path.clone(),
            artifact_type: self.artifact_type,
            version: self.version,
            parent_artifact_id: self.parent_artifact_id,
            generated_by: self.generated_by,
            round: self.generation_round,
            has_errors: self.has_errors(),
            created_at: self.created_at,
        }
    }
}

pub fn file_name_of(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

pub fn checksum_of(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Input for a first (version 1) artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub file_path: String,
    pub content: String,
    pub artifact_type: ArtifactType,
    pub generated_by: GeneratedBy,
    pub generation_round: u32,
}

impl NewArtifact {
    pub fn new(file_path: impl Into<String>, content: impl Into<String>, artifact_type: ArtifactType) -> Self {
        Self {
            file_path: file_path.into(),
            content: content.into(),
            artifact_type,
            generated_by: artifact_type.default_generator(),
            generation_round: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub id: Uuid,
    pub file_path: String,
    pub artifact_type: ArtifactType,
    pub version: u32,
    pub parent_artifact_id: Option<Uuid>,
    pub generated_by: GeneratedBy,
    pub round: u32,
    pub has_errors: bool,
    pub created_at: DateTime<Utc>,
}

// ── Contract & sandbox ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractUnit {
    pub file_path: String,
    pub artifact_type: ArtifactType,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub schema: String,
    pub db_schema: String,
    pub units: Vec<ContractUnit>,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Contract {
    pub fn declares(&self, file_path: &str) -> bool {
        self.units.iter().any(|u| u.file_path == file_path)
    }

    pub fn unit(&self, file_path: &str) -> Option<&ContractUnit> {
        self.units.iter().find(|u| u.file_path == file_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContractView {
    pub open_api_schema: String,
    pub db_schema: String,
    pub locked: bool,
}

impl From<&Contract> for ContractView {
    fn from(c: &Contract) -> Self {
        Self {
            open_api_schema: c.schema.clone(),
            db_schema: c.db_schema.clone(),
            locked: c.locked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxInfo {
    pub id: String,
    pub url: String,
}

// ── Job ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub requirement: String,
    pub app_spec_id: Option<String>,
    pub template_id: Option<String>,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub status: JobStatus,
    pub current_round: u32,
    pub max_rounds: u32,
    pub contract: Option<Contract>,
    pub sandbox: Option<SandboxInfo>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn contract_locked(&self) -> bool {
        self.contract.as_ref().is_some_and(|c| c.locked)
    }

    /// Whether a failed round may be followed by another repair round.
    pub fn has_round_budget(&self) -> bool {
        self.current_round < self.max_rounds
    }

    /// Whether repo-scoped knowledge applies to this job.
    pub fn has_repo_scope(&self) -> bool {
        self.tenant_id.is_some() || self.project_id.is_some()
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            status: self.status,
            current_round: self.current_round,
            max_rounds: self.max_rounds,
            contract_locked: self.contract_locked(),
            sandbox_id: self.sandbox.as_ref().map(|s| s.id.clone()),
            sandbox_url: self.sandbox.as_ref().map(|s| s.url.clone()),
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub current_round: u32,
    pub max_rounds: u32,
    pub contract_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A submission as accepted by the orchestrator and the HTTP surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    pub requirement: String,
    #[serde(default)]
    pub app_spec_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl SubmitJob {
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
            ..Default::default()
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    Compile,
    UnitTest,
    IntegrationTest,
    Runtime,
    Other,
}

impl ValidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::UnitTest => "unit_test",
            Self::IntegrationTest => "integration_test",
            Self::Runtime => "runtime",
            Self::Other => "other",
        }
    }
}

impl FromStr for ValidationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(Self::Compile),
            "unit_test" => Ok(Self::UnitTest),
            "integration_test" => Ok(Self::IntegrationTest),
            "runtime" => Ok(Self::Runtime),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid validation type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedError {
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub id: i64,
    pub job_id: Uuid,
    pub artifact_id: Uuid,
    pub round: u32,
    pub validation_type: ValidationType,
    pub passed: bool,
    pub details: String,
    pub parsed_errors: Vec<ParsedError>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// One result as produced by the validator, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewValidationResult {
    pub artifact_id: Uuid,
    pub validation_type: ValidationType,
    pub passed: bool,
    pub details: String,
    pub parsed_errors: Vec<ParsedError>,
    pub duration_ms: u64,
}

// ── Logs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogRole {
    Architect,
    Coder,
    Coach,
    Executor,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub round: u32,
    pub level: LogLevel,
    pub role: LogRole,
    pub message: String,
}

impl LogEntry {
    pub fn new(job_id: Uuid, round: u32, level: LogLevel, role: LogRole, message: impl Into<String>) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            round,
            level,
            role,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::ContractPending,
            JobStatus::ContractLocked,
            JobStatus::Generating,
            JobStatus::Validating,
            JobStatus::Repairing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("RUNNING").is_err());
    }

    #[test]
    fn job_status_serde_uses_state_names() {
        let json = serde_json::to_string(&JobStatus::ContractLocked).unwrap();
        assert_eq!(json, "\"CONTRACT_LOCKED\"");
    }

    #[test]
    fn job_status_happy_path_edges() {
        use JobStatus::*;
        let path = [Pending, ContractPending, ContractLocked, Generating, Validating, Repairing, Validating, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn job_status_rejects_skips_and_exits_from_terminal() {
        use JobStatus::*;
        assert!(!Pending.can_transition_to(Generating));
        assert!(!Generating.can_transition_to(Repairing));
        assert!(!Repairing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Pending));
        for live in JobStatus::NON_TERMINAL {
            assert!(live.can_transition_to(Cancelled));
            assert!(live.can_transition_to(TimedOut));
            assert!(live.can_transition_to(Failed));
        }
    }

    #[test]
    fn artifact_type_from_file_path() {
        assert_eq!(ArtifactType::from_file_path("contract/openapi.yaml"), ArtifactType::Contract);
        assert_eq!(ArtifactType::from_file_path("db/schema.sql"), ArtifactType::Schema);
        assert_eq!(
            ArtifactType::from_file_path("src/main/java/com/acme/entity/User.java"),
            ArtifactType::Entity
        );
        assert_eq!(
            ArtifactType::from_file_path("src/main/java/com/acme/service/UserService.java"),
            ArtifactType::Service
        );
        assert_eq!(
            ArtifactType::from_file_path("src/main/java/com/acme/controller/UserController.java"),
            ArtifactType::Controller
        );
        assert_eq!(
            ArtifactType::from_file_path("src/test/java/com/acme/UserServiceTest.java"),
            ArtifactType::Test
        );
        assert_eq!(ArtifactType::from_file_path("web/src/App.tsx"), ArtifactType::Frontend);
        assert_eq!(ArtifactType::from_file_path("README.md"), ArtifactType::Other);
    }

    #[test]
    fn default_generator_by_type() {
        assert_eq!(ArtifactType::Entity.default_generator(), GeneratedBy::Architect);
        assert_eq!(ArtifactType::Schema.default_generator(), GeneratedBy::Architect);
        assert_eq!(ArtifactType::Service.default_generator(), GeneratedBy::Coder);
        assert_eq!(ArtifactType::Frontend.default_generator(), GeneratedBy::Coder);
    }

    #[test]
    fn language_from_file_name() {
        assert_eq!(Language::from_file_name("User.java"), Language::Java);
        assert_eq!(Language::from_file_name("App.TSX"), Language::Typescript);
        assert_eq!(Language::from_file_name("schema.sql"), Language::Sql);
        assert_eq!(Language::from_file_name("Makefile"), Language::Other);
        assert_eq!(Language::Other.fence(), "");
        assert_eq!(Language::Java.fence(), "java");
    }

    #[test]
    fn validity_tracks_compiler_output() {
        let valid = ArtifactValidity::Valid;
        assert!(!valid.has_errors());
        assert_eq!(valid.compiler_output(), None);

        let invalid = ArtifactValidity::Invalid {
            output: "cannot find symbol".into(),
        };
        assert!(invalid.has_errors());
        assert_eq!(invalid.compiler_output(), Some("cannot find symbol"));

        assert_eq!(ArtifactValidity::from_columns(false, None), ArtifactValidity::Valid);
        assert_eq!(
            ArtifactValidity::from_columns(true, Some("x".into())),
            ArtifactValidity::Invalid { output: "x".into() }
        );
    }

    #[test]
    fn file_name_and_checksum() {
        assert_eq!(file_name_of("src/main/java/User.java"), "User.java");
        assert_eq!(file_name_of("User.java"), "User.java");
        let a = checksum_of("class A {}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum_of("class A {}"));
        assert_ne!(a, checksum_of("class B {}"));
    }

    #[test]
    fn submit_job_accepts_camel_case() {
        let req: SubmitJob = serde_json::from_str(
            r#"{"requirement":"todo app","appSpecId":"spec-1","maxRounds":2}"#,
        )
        .unwrap();
        assert_eq!(req.requirement, "todo app");
        assert_eq!(req.app_spec_id.as_deref(), Some("spec-1"));
        assert_eq!(req.max_rounds, Some(2));
        assert!(req.template_id.is_none());
    }

    #[test]
    fn job_view_omits_unset_fields() {
        let view = JobView {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            current_round: 0,
            max_rounds: 3,
            contract_locked: false,
            sandbox_id: None,
            sandbox_url: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["maxRounds"], 3);
        assert!(json.get("lastError").is_none());
    }
}
