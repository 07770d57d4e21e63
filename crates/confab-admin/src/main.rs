//! # confab-admin
//!
//! Maintenance tool for a confab message store.
//!
//! Opens the database named by the environment (see `ChatConfig`), repairs
//! the message id sequence and every direct room's unread counters, and
//! optionally hard-deletes soft-deleted conversations. The outcome is
//! printed to stdout as JSON.

use anyhow::Context;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confab_chat::ChatConfig;
use confab_store::Database;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,confab_store=debug,confab_chat=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting confab-admin v{}", env!("CARGO_PKG_VERSION"));

    let config = ChatConfig::from_env();
    info!(?config, "Loaded configuration");

    let mut db = match &config.database_path {
        Some(path) => Database::open_at(path)
            .with_context(|| format!("opening database at {}", path.display()))?,
        None => Database::new().context("opening database in the platform data directory")?,
    };
    db.set_busy_timeout(config.busy_timeout)?;

    let consistency = db.check_consistency().context("consistency check")?;

    let purge = if config.purge_deleted {
        let purged = db.purge_deleted().context("purging deleted conversations")?;
        let orphans = db
            .purge_orphaned_messages()
            .context("purging orphaned messages")?;
        Some(json!({ "deleted": purged, "orphaned_messages": orphans }))
    } else {
        None
    };

    let report = json!({
        "database": db.path(),
        "consistency": consistency,
        "purge": purge,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
