/// Family Portal server
///
/// Serves photo uploads, live family chat and push device registration
/// over a single embedded KV store.

use family_portal::{config::ServerConfig, context::AppContext, jobs, server};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // Load configuration
    let config = ServerConfig::from_env()?;

    // Create application context
    let ctx = AppContext::new(config).await?;

    // Requeue or fail uploads left Pending by the previous run
    jobs::tasks::recover_pending_media(&ctx).await?;

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::new(ctx.clone())));
    Arc::clone(&scheduler).start();

    // Run until Ctrl-C
    server::serve(ctx.clone()).await?;

    scheduler.stop();
    ctx.shutdown().await;
    tracing::info!("Family portal stopped");

    Ok(())
}

/// Human-readable logs by default, JSON lines when `LOG_FORMAT=json`
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "family_portal=debug,tower_http=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
