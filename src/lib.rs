//! # actionbook-builder
//!
//! Orchestration for the action build pipeline: turns a submitted site into
//! a versioned corpus of recorded UI actions by coordinating two external
//! content stages through a shared SQLite database.
//!
//! ## Architecture
//!
//! ```text
//!  submit ─▶ build_tasks (init) ─▶ knowledge worker (external)
//!                                        │
//!                                        ▼ knowledge_build/completed
//!  ┌─────────────┐  claim   ┌──────────────────┐  generate  ┌────────────────┐
//!  │ Coordinator │─────────▶│ BuildTaskRunner  │───────────▶│ recording_tasks│
//!  └─────────────┘          └──────────────────┘            └───────┬────────┘
//!                                                                   │ claim
//!                                                    ┌──────────────▼──────────┐
//!                                                    │ RecordingTaskQueueWorker│──▶ executor
//!                                                    └─────────────────────────┘
//!
//!  VersionManager: building ─publish─▶ active ─next publish─▶ archived
//! ```
//!
//! Processes never talk to each other. Every hand-off is a guarded
//! conditional `UPDATE` on a shared row, and a task whose owner stops
//! heartbeating becomes claimable again.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Row types and status enums |
//! | [`error`] | Typed version/API errors |
//! | [`build_tasks`] | Build task store and claims |
//! | [`recording_tasks`] | Recording task store and claims |
//! | [`classify`] | Chunk classification |
//! | [`generator`] | Recording task generation |
//! | [`executor`] | Recording executor trait and implementations |
//! | [`queue_worker`] | Bounded-concurrency recording consumer |
//! | [`runner`] | Per-build-task runner |
//! | [`coordinator`] | Build claim loop |
//! | [`versions`] | Source version management |
//! | [`stats`] | Recording task statistics |
//! | [`search`] | Recording task keyword search |
//! | [`server`] | JSON HTTP API |

pub mod build_tasks;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod daemon_cmd;
pub mod db;
pub mod error;
pub mod executor;
pub mod generator;
pub mod migrate;
pub mod models;
pub mod queue_worker;
pub mod recording_tasks;
pub mod runner;
pub mod search;
pub mod server;
pub mod stats;
pub mod task_cmd;
pub mod version_cmd;
pub mod versions;
