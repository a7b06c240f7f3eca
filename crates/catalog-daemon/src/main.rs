//! Catalog Search Daemon
//!
//! Builds the catalog search indexes from pending index notifications.
//!
//! # Usage
//!
//! ```bash
//! catalog-daemon build [--index-type NAME]
//! catalog-daemon rebuild NAME
//! catalog-daemon notify NAME UPDATE_TYPE [--uid UID]... [--related TYPE:UID]
//! catalog-daemon run
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/catalog-search/config.toml)
//! 3. Environment variables (CATALOG_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use catalog_daemon::{
    handle_build, handle_notify, handle_optimize, handle_put_entity, handle_rebuild,
    init_logging, load_settings, run_daemon, show_status, Cli, Commands, DaemonContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(cli.config.as_deref(), cli.log_level.as_deref())?;
    init_logging(&settings.log_level)?;
    let ctx = DaemonContext::open(settings)?;

    match cli.command {
        Commands::Build { index_type } => {
            handle_build(&ctx, index_type.as_deref()).await?;
        }
        Commands::Rebuild { index } => {
            handle_rebuild(&ctx, &index).await?;
        }
        Commands::Optimize => {
            handle_optimize(&ctx).await?;
        }
        Commands::Notify {
            index,
            update_type,
            uids,
            related,
        } => {
            handle_notify(&ctx, &index, &update_type, &uids, related)?;
        }
        Commands::PutEntity {
            index,
            uid,
            fields,
            relations,
        } => {
            handle_put_entity(&ctx, &index, uid, fields, relations)?;
        }
        Commands::Status => {
            show_status(&ctx)?;
        }
        Commands::Run => {
            run_daemon(&ctx).await?;
        }
    }

    Ok(())
}
