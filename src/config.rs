//! Engine configuration.
//!
//! Layered: built-in defaults, then `<project>/.g3/engine.toml`, then
//! `G3_*` environment variables, then CLI flags (applied by the caller).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_DIR: &str = ".g3";
pub const CONFIG_FILE: &str = "engine.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub max_rounds: u32,
    pub max_rounds_cap: u32,
    pub workers: usize,
    pub stage_timeout: Duration,
    pub job_timeout: Duration,
    pub stage_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub log_backlog: usize,
    pub watchdog_interval: Duration,
    pub project_type: String,
    pub knowledge: KnowledgeConfig,
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeConfig {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub repo_capacity: usize,
}

/// Endpoints of the external stage services. Unset endpoints make the
/// server refuse to start.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderConfig {
    pub contract_url: Option<String>,
    pub generation_url: Option<String>,
    pub repair_url: Option<String>,
    pub sandbox_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 8000,
            repo_capacity: 500,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(CONFIG_DIR).join("engine.db"),
            max_rounds: 3,
            max_rounds_cap: 10,
            workers: 4,
            stage_timeout: Duration::from_secs(300),
            job_timeout: Duration::from_secs(3600),
            stage_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            log_backlog: 1000,
            watchdog_interval: Duration::from_secs(30),
            project_type: "spring-boot".to_string(),
            knowledge: KnowledgeConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

// ── TOML file shape (every key optional) ──────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct EngineToml {
    engine: Option<EngineSection>,
    knowledge: Option<KnowledgeSection>,
    providers: Option<ProvidersSection>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineSection {
    db_path: Option<PathBuf>,
    max_rounds: Option<u32>,
    max_rounds_cap: Option<u32>,
    workers: Option<usize>,
    stage_timeout_secs: Option<u64>,
    job_timeout_secs: Option<u64>,
    stage_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    log_backlog: Option<usize>,
    watchdog_interval_secs: Option<u64>,
    project_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KnowledgeSection {
    top_k: Option<usize>,
    max_context_chars: Option<usize>,
    repo_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersSection {
    contract_url: Option<String>,
    generation_url: Option<String>,
    repair_url: Option<String>,
    sandbox_url: Option<String>,
    api_key: Option<String>,
}

impl EngineConfig {
    /// Defaults overlaid with `<project_dir>/.g3/engine.toml` and the process
    /// environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let toml: EngineToml = toml::from_str(content).context("Invalid engine TOML")?;
        let mut config = Self::default();

        if let Some(engine) = toml.engine {
            if let Some(v) = engine.db_path {
                config.db_path = v;
            }
            if let Some(v) = engine.max_rounds {
                config.max_rounds = v;
            }
            if let Some(v) = engine.max_rounds_cap {
                config.max_rounds_cap = v;
            }
            if let Some(v) = engine.workers {
                config.workers = v;
            }
            if let Some(v) = engine.stage_timeout_secs {
                config.stage_timeout = Duration::from_secs(v);
            }
            if let Some(v) = engine.job_timeout_secs {
                config.job_timeout = Duration::from_secs(v);
            }
            if let Some(v) = engine.stage_retries {
                config.stage_retries = v;
            }
            if let Some(v) = engine.backoff_base_ms {
                config.backoff_base = Duration::from_millis(v);
            }
            if let Some(v) = engine.backoff_max_ms {
                config.backoff_max = Duration::from_millis(v);
            }
            if let Some(v) = engine.log_backlog {
                config.log_backlog = v;
            }
            if let Some(v) = engine.watchdog_interval_secs {
                config.watchdog_interval = Duration::from_secs(v);
            }
            if let Some(v) = engine.project_type {
                config.project_type = v;
            }
        }

        if let Some(knowledge) = toml.knowledge {
            if let Some(v) = knowledge.top_k {
                config.knowledge.top_k = v;
            }
            if let Some(v) = knowledge.max_context_chars {
                config.knowledge.max_context_chars = v;
            }
            if let Some(v) = knowledge.repo_capacity {
                config.knowledge.repo_capacity = v;
            }
        }

        if let Some(providers) = toml.providers {
            config.providers = ProviderConfig {
                contract_url: providers.contract_url,
                generation_url: providers.generation_url,
                repair_url: providers.repair_url,
                sandbox_url: providers.sandbox_url,
                api_key: providers.api_key,
            };
        }

        Ok(config)
    }

    /// Apply `G3_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("G3_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("G3_MAX_ROUNDS") {
            self.max_rounds = v.parse().with_context(|| format!("Invalid G3_MAX_ROUNDS: {}", v))?;
        }
        if let Some(v) = lookup("G3_WORKERS") {
            self.workers = v.parse().with_context(|| format!("Invalid G3_WORKERS: {}", v))?;
        }
        if let Some(v) = lookup("G3_STAGE_TIMEOUT_SECS") {
            let secs: u64 = v.parse().with_context(|| format!("Invalid G3_STAGE_TIMEOUT_SECS: {}", v))?;
            self.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("G3_JOB_TIMEOUT_SECS") {
            let secs: u64 = v.parse().with_context(|| format!("Invalid G3_JOB_TIMEOUT_SECS: {}", v))?;
            self.job_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("G3_API_KEY") {
            self.providers.api_key = Some(v);
        }
        Ok(())
    }

    /// Human-readable warnings for suspicious settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_rounds == 0 {
            warnings.push("max_rounds is 0: every failing round ends the job".to_string());
        }
        if self.max_rounds > self.max_rounds_cap {
            warnings.push(format!(
                "max_rounds ({}) exceeds max_rounds_cap ({})",
                self.max_rounds, self.max_rounds_cap
            ));
        }
        if self.workers == 0 {
            warnings.push("workers is 0: submitted jobs will never run".to_string());
        }
        if self.stage_timeout > self.job_timeout {
            warnings.push(format!(
                "stage_timeout ({:?}) is longer than job_timeout ({:?})",
                self.stage_timeout, self.job_timeout
            ));
        }
        if self.backoff_base > self.backoff_max {
            warnings.push("backoff_base is larger than backoff_max".to_string());
        }
        if self.knowledge.max_context_chars < 500 {
            warnings.push(format!(
                "knowledge.max_context_chars ({}) leaves almost no room for context",
                self.knowledge.max_context_chars
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.workers, 4);
        assert_eq!(config.log_backlog, 1000);
        assert_eq!(config.knowledge.top_k, 5);
        assert!(config.providers.sandbox_url.is_none());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let mut expected = EngineConfig::default();
        expected.apply_env(|key| std::env::var(key).ok()).unwrap();
        assert_eq!(EngineConfig::load(dir.path()).unwrap(), expected);
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = EngineConfig::parse(
            r#"
            [engine]
            max_rounds = 5
            stage_timeout_secs = 60
            backoff_base_ms = 250

            [knowledge]
            repo_capacity = 50

            [providers]
            sandbox_url = "http://sandbox:8080"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.stage_timeout, Duration::from_secs(60));
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.knowledge.repo_capacity, 50);
        assert_eq!(config.knowledge.top_k, 5);
        assert_eq!(config.providers.sandbox_url.as_deref(), Some("http://sandbox:8080"));
        assert!(config.providers.contract_url.is_none());
    }

    #[test]
    fn test_load_reads_project_file() {
        let dir = TempDir::new().unwrap();
        let g3_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&g3_dir).unwrap();
        std::fs::write(g3_dir.join(CONFIG_FILE), "[engine]\nworkers = 9\n").unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        if std::env::var("G3_WORKERS").is_err() {
            assert_eq!(config.workers, 9);
        }
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(EngineConfig::parse("[engine\nmax_rounds = ").is_err());
        assert!(EngineConfig::parse("[engine]\nmax_rounds = \"three\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("G3_MAX_ROUNDS", "7"),
            ("G3_WORKERS", "2"),
            ("G3_JOB_TIMEOUT_SECS", "90"),
            ("G3_DB_PATH", "/tmp/g3.db"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_rounds, 7);
        assert_eq!(config.workers, 2);
        assert_eq!(config.job_timeout, Duration::from_secs(90));
        assert_eq!(config.db_path, PathBuf::from("/tmp/g3.db"));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|k| (k == "G3_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("G3_WORKERS"));
    }

    #[test]
    fn test_validate_warnings() {
        let config = EngineConfig {
            workers: 0,
            max_rounds: 20,
            stage_timeout: Duration::from_secs(7200),
            ..EngineConfig::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("workers")));
        assert!(warnings.iter().any(|w| w.contains("max_rounds_cap")));
        assert!(warnings.iter().any(|w| w.contains("stage_timeout")));
    }
}
