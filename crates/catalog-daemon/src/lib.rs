//! Catalog daemon library exports.
//!
//! This crate provides the CLI daemon binary for catalog search indexing.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (build, rebuild, optimize, notify, status, run)
//! - `scheduler`: Cron-driven build and optimize jobs

pub mod cli;
pub mod commands;
pub mod scheduler;

pub use cli::{Cli, Commands};
pub use commands::{
    handle_build, handle_notify, handle_optimize, handle_put_entity, handle_rebuild,
    init_logging, load_settings, run_daemon, show_status, DaemonContext,
};
pub use scheduler::{BuildScheduler, OverlapGuard, SchedulerError};
