//! G3 engine: turns a natural-language requirement into a validated set of
//! source artifacts.
//!
//! ## Overview
//!
//! A job is submitted over HTTP, persisted as `PENDING` and queued. A worker
//! drives it through contract design, contract lock and code generation,
//! then alternates sandbox validation and targeted repair until every
//! artifact passes or the round budget runs out. Progress is streamed to
//! WebSocket subscribers as it happens.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (per-job log stream)               │
//!                       │         │                                        │
//!                       │         │ Orchestrator::submit() → queue         │
//!                       │         v                                        │
//!                       │  worker.rs  (WorkerPool, watchdog)               │
//!                       │         │                                        │
//!                       │         │ Orchestrator::run_job()                │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (state machine driver)         │
//!                       │    ├─ validator.rs  (sandbox round → results)    │
//!                       │    └─ repair.rs     (context + repair call)      │
//!                       │         │                                        │
//!                       │         │ Stages (trait objects)                 │
//!                       │         v                                        │
//!                       │  providers.rs  (HTTP-backed stages)              │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | Shared types: `Job`, `Artifact`, `JobStatus`, logs      |
//! | `db`          | SQLite artifact store via `DbHandle`                    |
//! | `knowledge`   | Job/repo scoped retrieval context                       |
//! | `broadcaster` | Per-job bounded log fan-out                             |
//! | `stages`      | Collaborator traits and their request/response types    |
//! | `retry`       | Stage timeout and exponential backoff                   |
//! | `locks`       | Per-job mutual exclusion across workers                 |
//!
//! ## Typical Job Flow
//!
//! 1. `POST /api/jobs` → `Orchestrator::submit()` persists the job and
//!    queues its id.
//! 2. A worker takes the id, acquires the job lock and reloads the job.
//! 3. `CONTRACT_PENDING`: the contract stage designs the API and DB
//!    schemas; they are stored and locked in one commit.
//! 4. `GENERATING`: the generation stage returns one file per contract
//!    unit; all of them land as version 1 artifacts.
//! 5. `VALIDATING`: the sandbox compiles the round's artifact set and each
//!    artifact gets a `ValidationResult`.
//! 6. `REPAIRING`: every failing artifact gets a new version whose parent is
//!    the failing one, then the job returns to `VALIDATING` one round up.
//! 7. All pass → `COMPLETED`. Budget spent → `FAILED`. The watchdog moves
//!    overdue jobs to `TIMED_OUT`; a cancel request ends in `CANCELLED`.

pub mod api;
pub mod broadcaster;
pub mod db;
pub mod knowledge;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod repair;
pub mod retry;
pub mod server;
pub mod stages;
pub mod validator;
pub mod worker;
pub mod ws;
