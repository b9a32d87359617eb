//! The worker agent: intake loop (C7), heartbeat loop (C8), runner (C9),
//! per-parent sequential queue (C10) and stopped-execution cache (C11).
//! `worker.rs` is the thin binary entrypoint; everything else lives here so
//! tests can drive [`agent::WorkerAgent`] directly against fakes.

pub mod agent;
pub mod config;
pub mod control_plane_client;
pub mod error;
pub mod heartbeat;
pub mod intake;
pub mod interpolation;
pub mod resource;
pub mod running_tasks;
pub mod runner;
pub mod sanitize;
pub mod sequential_queue;
pub mod step_executor;
pub mod stopped_cache;
