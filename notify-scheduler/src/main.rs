use notify_scheduler::config::AppConfig;
use notify_scheduler::database;
use notify_scheduler::logging;
use notify_scheduler::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let (log_handle, _log_guard) = logging::init_logging(&config.log_dir, config.log_format)?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::with_config(pool, &config)?;
    log_handle.start_retention_cleanup(container.cancellation_token());
    container.start().await?;

    tracing::info!(
        timezone = %config.scheduler.timezone,
        "notify-scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    container.shutdown().await?;
    Ok(())
}
