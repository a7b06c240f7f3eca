//! Command implementations for the catalog daemon.
//!
//! Every command loads configuration, opens the RocksDB store and the
//! Tantivy indexes, then drives the build service.

use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{info, warn};

use catalog_indexing::{Collaborators, FieldCopyTranslator, IndexBuildService};
use catalog_search::{DirectorySearchIndexLocator, TantivyIndexEngine};
use catalog_storage::Storage;
use catalog_types::{
    AffectedEntities, EntityRecord, IndexNotification, IndexType, RelatedEntity, Settings, Uid,
    UpdateType,
};

use crate::scheduler::BuildScheduler;

/// Opened backends plus the service built over them.
pub struct DaemonContext {
    pub settings: Settings,
    pub storage: Arc<Storage>,
    pub engine: Arc<TantivyIndexEngine>,
    pub service: Arc<IndexBuildService>,
}

impl DaemonContext {
    /// Open storage and indexes at the configured paths.
    pub fn open(settings: Settings) -> Result<Self> {
        let db_path = settings.expanded_db_path();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        info!("Opening storage at {:?}", db_path);
        let storage = Arc::new(Storage::open(&db_path).context("Failed to open storage")?);

        let index_root = settings.expanded_search_index_path();
        fs::create_dir_all(&index_root).context("Failed to create search index directory")?;
        info!("Using search indexes under {:?}", index_root);
        let locator = Arc::new(DirectorySearchIndexLocator::new(index_root));
        let engine = Arc::new(
            TantivyIndexEngine::new(locator).with_writer_memory_mb(settings.writer_memory_mb),
        );

        let collaborators = Collaborators {
            notification_store: storage.clone(),
            entity_loader: storage.clone(),
            translator: Arc::new(FieldCopyTranslator::new()),
            engine: engine.clone(),
        };
        let service = IndexBuildService::from_settings(collaborators, &settings)
            .context("Invalid pipeline configuration")?;

        Ok(Self {
            settings,
            storage,
            engine,
            service: Arc::new(service),
        })
    }
}

/// Load configuration (defaults -> file -> env), then apply CLI overrides.
pub fn load_settings(config_path: Option<&str>, log_level: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(log_level) = log_level {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Initialize logging. RUST_LOG takes precedence over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Build one index, or every index type with pending work.
pub async fn handle_build(ctx: &DaemonContext, index_type: Option<&str>) -> Result<()> {
    if let Some(name) = index_type {
        let index_type = IndexType::from_name(name)?;
        let report = ctx
            .service
            .build_index(index_type)
            .await
            .with_context(|| format!("Build of {} failed", index_type))?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let results = ctx.service.build_all().await;
    if results.is_empty() {
        println!("Nothing to build");
        return Ok(());
    }

    let mut failed = Vec::new();
    for (index_type, result) in results {
        match result {
            Ok(report) => println!(
                "{}: {} ({} added, {} deleted{})",
                index_type,
                report.state,
                report.documents_added,
                report.documents_deleted,
                if report.rebuilt { ", rebuilt" } else { "" }
            ),
            Err(e) => {
                println!("{}: failed: {}", index_type, e);
                failed.push(index_type);
            }
        }
    }
    if !failed.is_empty() {
        bail!("{} index build(s) failed", failed.len());
    }
    Ok(())
}

pub async fn handle_rebuild(ctx: &DaemonContext, index: &str) -> Result<()> {
    let report = ctx
        .service
        .rebuild_index(index)
        .await
        .with_context(|| format!("Rebuild of {} failed", index))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn handle_optimize(ctx: &DaemonContext) -> Result<()> {
    let report = ctx
        .service
        .optimize_indices()
        .await
        .context("Optimize failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Build a notification from CLI arguments.
pub fn notification_from_args(
    index: &str,
    update_type: &str,
    uids: &[Uid],
    related: Option<RelatedEntity>,
) -> Result<IndexNotification> {
    let index_type = IndexType::from_name(index)?;
    let update_type: UpdateType = update_type.parse()?;

    let affected = if update_type.is_index_wide() {
        AffectedEntities::All
    } else if let Some(related) = related {
        AffectedEntities::Related(related)
    } else {
        match uids {
            [] => bail!("{} notification needs --uid or --related", update_type),
            [uid] => AffectedEntities::Single(*uid),
            _ => AffectedEntities::Many(uids.to_vec()),
        }
    };

    let notification = IndexNotification::new(index_type, update_type, affected);
    notification.validate()?;
    Ok(notification)
}

pub fn handle_notify(
    ctx: &DaemonContext,
    index: &str,
    update_type: &str,
    uids: &[Uid],
    related: Option<RelatedEntity>,
) -> Result<()> {
    let notification = notification_from_args(index, update_type, uids, related)?;
    let id = ctx
        .storage
        .put_notification(notification)
        .context("Failed to store notification")?;
    println!("Stored notification {}", id);
    Ok(())
}

pub fn handle_put_entity(
    ctx: &DaemonContext,
    index: &str,
    uid: Uid,
    fields: Vec<(String, String)>,
    relations: Vec<RelatedEntity>,
) -> Result<()> {
    let index_type = IndexType::from_name(index)?;
    let mut entity = EntityRecord::new(index_type, uid);
    for (name, value) in fields {
        entity = entity.with_field(name, value);
    }
    for related in relations {
        entity = entity.with_relation(related.entity_type, related.uid);
    }

    ctx.storage
        .put_entity(&entity)
        .context("Failed to store entity")?;
    println!("Stored {} {}", index_type, uid);
    Ok(())
}

/// Print pending notifications and per-index statistics.
pub fn show_status(ctx: &DaemonContext) -> Result<()> {
    let stats = ctx.storage.get_stats().context("Failed to read storage stats")?;
    let pending = ctx
        .storage
        .pending_notification_counts()
        .context("Failed to count notifications")?;

    println!("Storage: {:?}", ctx.settings.expanded_db_path());
    println!("  Pending notifications: {}", stats.notification_count);
    println!("  Entities: {}", stats.entity_count);
    println!("  Disk usage: {} bytes", stats.disk_usage_bytes);
    println!("Indexes: {:?}", ctx.settings.expanded_search_index_path());

    for index_type in IndexType::ALL {
        let pending = pending.get(&index_type).copied().unwrap_or(0);
        if !ctx.engine.index_exists(index_type) {
            println!("  {:<22} missing  pending={}", index_type.index_name(), pending);
            continue;
        }
        match ctx.engine.stats(index_type) {
            Ok(index_stats) => println!(
                "  {:<22} docs={} deleted={} segments={} pending={}",
                index_type.index_name(),
                index_stats.num_docs,
                index_stats.deleted_docs,
                index_stats.segments,
                pending
            ),
            Err(e) => println!("  {:<22} error: {}", index_type.index_name(), e),
        }
    }
    Ok(())
}

/// Run scheduled jobs until Ctrl+C or SIGTERM.
pub async fn run_daemon(ctx: &DaemonContext) -> Result<()> {
    info!("Catalog daemon starting...");
    info!("  Build schedule: {}", ctx.settings.schedule.build_cron);
    info!("  Optimize schedule: {}", ctx.settings.schedule.optimize_cron);

    let mut scheduler = BuildScheduler::new(ctx.service.clone(), &ctx.settings.schedule)
        .await
        .context("Failed to create scheduler")?;
    scheduler.start().await.context("Failed to start scheduler")?;

    shutdown_signal().await;

    scheduler.shutdown().await;
    ctx.storage.flush().context("Failed to flush storage")?;
    info!("Catalog daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> DaemonContext {
        let settings = Settings {
            db_path: dir.path().join("db").to_string_lossy().to_string(),
            search_index_path: dir.path().join("indexes").to_string_lossy().to_string(),
            writer_memory_mb: 15,
            ..Default::default()
        };
        DaemonContext::open(settings).unwrap()
    }

    #[test]
    fn test_notification_from_args() {
        let single = notification_from_args("product", "update", &[7], None).unwrap();
        assert_eq!(single.affected, AffectedEntities::Single(7));

        let many = notification_from_args("sku", "delete", &[1, 2], None).unwrap();
        assert_eq!(many.affected, AffectedEntities::Many(vec![1, 2]));

        let wide = notification_from_args("category", "delete-all", &[], None).unwrap();
        assert_eq!(wide.affected, AffectedEntities::All);

        let related = notification_from_args(
            "product",
            "update",
            &[],
            Some(RelatedEntity::new("brand", 5)),
        )
        .unwrap();
        assert_eq!(
            related.affected,
            AffectedEntities::Related(RelatedEntity::new("brand", 5))
        );
    }

    #[test]
    fn test_notification_from_args_rejects_bad_input() {
        assert!(notification_from_args("", "update", &[1], None).is_err());
        assert!(notification_from_args("widget", "update", &[1], None).is_err());
        assert!(notification_from_args("product", "upsert", &[1], None).is_err());
        assert!(notification_from_args("product", "update", &[], None).is_err());
    }

    #[tokio::test]
    async fn test_put_entity_notify_and_build() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        handle_put_entity(
            &ctx,
            "product",
            3,
            vec![("name".to_string(), "Lamp".to_string())],
            vec![RelatedEntity::new("category", 9)],
        )
        .unwrap();
        handle_notify(&ctx, "product", "update", &[3], None).unwrap();
        assert_eq!(
            ctx.storage.pending_notification_counts().unwrap()[&IndexType::Product],
            1
        );

        handle_build(&ctx, Some("product")).await.unwrap();

        assert_eq!(ctx.engine.indexed_uids(IndexType::Product).unwrap(), vec![3]);
        assert!(ctx.storage.find_all_notifications().unwrap().is_empty());
        show_status(&ctx).unwrap();
    }

    #[tokio::test]
    async fn test_build_unknown_index_fails() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert!(handle_build(&ctx, Some("widget")).await.is_err());
        assert!(handle_rebuild(&ctx, "").await.is_err());
    }
}
