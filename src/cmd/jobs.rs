//! Read-only job inspection: `g3 status` and `g3 jobs`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use g3::engine::db::EngineDb;
use uuid::Uuid;

fn open_existing(db_path: &Path) -> Result<EngineDb> {
    if !db_path.exists() {
        bail!(
            "No engine database at {}. Run 'g3 init' or 'g3 serve' first.",
            db_path.display()
        );
    }
    EngineDb::new(db_path)
}

pub fn cmd_status(db_path: &Path, job_id: &str) -> Result<()> {
    let id = Uuid::parse_str(job_id).with_context(|| format!("Invalid job id: {}", job_id))?;
    let db = open_existing(db_path)?;
    let job = db.require_job(id)?;
    println!("{}", serde_json::to_string_pretty(&job.view())?);
    Ok(())
}

pub fn cmd_jobs(db_path: &Path, all: bool) -> Result<()> {
    let db = open_existing(db_path)?;
    let jobs = if all { db.list_jobs(None)? } else { db.list_active_jobs()? };

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!("{:<36}  {:<16}  {:>5}  CREATED", "ID", "STATUS", "ROUND");
    for job in jobs {
        println!(
            "{:<36}  {:<16}  {:>5}  {}",
            job.id,
            job.status.as_str(),
            format!("{}/{}", job.current_round, job.max_rounds),
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
