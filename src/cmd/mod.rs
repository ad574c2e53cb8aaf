//! CLI command implementations.
//!
//! | Module   | Commands handled      |
//! |----------|-----------------------|
//! | `serve`  | `Serve`, `Init`       |
//! | `jobs`   | `Status`, `Jobs`      |

pub mod jobs;
pub mod serve;

use std::path::{Path, PathBuf};

use g3::config::EngineConfig;

pub use jobs::{cmd_jobs, cmd_status};
pub use serve::{cmd_init, cmd_serve};

/// `--db-path` wins; otherwise the configured path, relative to the project.
pub fn resolve_db_path(project_dir: &Path, config: &EngineConfig, flag: Option<PathBuf>) -> PathBuf {
    let path = flag.unwrap_or_else(|| config.db_path.clone());
    if path.is_absolute() {
        path
    } else {
        project_dir.join(path)
    }
}
