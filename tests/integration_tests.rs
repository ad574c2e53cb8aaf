//! Integration tests for the `g3` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use g3::engine::db::EngineDb;
use g3::engine::models::{JobStatus, SubmitJob};
use predicates::prelude::*;
use tempfile::TempDir;

fn g3() -> Command {
    cargo_bin_cmd!("g3")
}

/// A project directory with an initialized engine database.
fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    g3().arg("--project-dir")
        .arg(dir.path())
        .arg("init")
        .assert()
        .success();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        g3().arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        g3().arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("g3"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        g3().arg("frobnicate").assert().failure();
    }
}

mod init {
    use super::*;

    #[test]
    fn test_init_creates_database() {
        let dir = TempDir::new().unwrap();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Engine database initialized at"));
        assert!(dir.path().join(".g3/engine.db").exists());
    }

    #[test]
    fn test_init_honors_db_path_flag() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("custom/jobs.db");
        g3().arg("init").arg("--db-path").arg(&db).assert().success();
        assert!(db.exists());
    }

    #[test]
    fn test_init_honors_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".g3")).unwrap();
        std::fs::write(
            dir.path().join(".g3/engine.toml"),
            "[engine]\ndb_path = \"state/g3.db\"\n",
        )
        .unwrap();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .env_remove("G3_DB_PATH")
            .assert()
            .success();
        assert!(dir.path().join("state/g3.db").exists());
    }

    #[test]
    fn test_init_rejects_malformed_config() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".g3")).unwrap();
        std::fs::write(dir.path().join(".g3/engine.toml"), "[engine\n").unwrap();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("engine.toml"));
    }
}

mod inspection {
    use super::*;

    #[test]
    fn test_status_unknown_job_fails() {
        let dir = init_project();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .arg(uuid::Uuid::new_v4().to_string())
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_status_invalid_id_fails() {
        let dir = init_project();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .arg("not-a-uuid")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid job id"));
    }

    #[test]
    fn test_status_without_database_fails() {
        let dir = TempDir::new().unwrap();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .arg(uuid::Uuid::new_v4().to_string())
            .assert()
            .failure()
            .stderr(predicate::str::contains("g3 init"));
    }

    #[test]
    fn test_status_prints_job_view() {
        let dir = init_project();
        let job = {
            let db = EngineDb::new(&dir.path().join(".g3/engine.db")).unwrap();
            db.create_job(&SubmitJob::new("Build a todo API"), 3).unwrap()
        };

        let output = g3()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .arg(job.id.to_string())
            .output()
            .unwrap();
        assert!(output.status.success());
        let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(view["id"], job.id.to_string());
        assert_eq!(view["status"], "PENDING");
        assert_eq!(view["currentRound"], 0);
        assert_eq!(view["maxRounds"], 3);
        assert_eq!(view["contractLocked"], false);
    }

    #[test]
    fn test_jobs_lists_active_only_by_default() {
        let dir = init_project();
        let (pending, done) = {
            let db = EngineDb::new(&dir.path().join(".g3/engine.db")).unwrap();
            let pending = db.create_job(&SubmitJob::new("first"), 3).unwrap();
            let done = db.create_job(&SubmitJob::new("second"), 3).unwrap();
            db.request_cancel(done.id).unwrap();
            db.finish_job(done.id, JobStatus::Pending, JobStatus::Cancelled, None)
                .unwrap();
            (pending, done)
        };

        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("jobs")
            .assert()
            .success()
            .stdout(predicate::str::contains(pending.id.to_string()))
            .stdout(predicate::str::contains(done.id.to_string()).not());

        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("jobs")
            .arg("--all")
            .assert()
            .success()
            .stdout(predicate::str::contains(done.id.to_string()))
            .stdout(predicate::str::contains("CANCELLED"));
    }

    #[test]
    fn test_jobs_empty() {
        let dir = init_project();
        g3().arg("--project-dir")
            .arg(dir.path())
            .arg("jobs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No jobs."));
    }
}
