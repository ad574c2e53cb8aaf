//! Engine server commands: `g3 serve` and `g3 init`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use g3::config::EngineConfig;
use g3::engine::db::EngineDb;
use g3::engine::server::{ServerConfig, start_server};

pub async fn cmd_serve(port: u16, db_path: PathBuf, dev: bool, engine: EngineConfig) -> Result<()> {
    start_server(ServerConfig {
        port,
        db_path,
        dev_mode: dev,
        engine,
    })
    .await
}

pub fn cmd_init(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    EngineDb::new(db_path)?;
    println!("Engine database initialized at {}", db_path.display());
    Ok(())
}
