use chain_dispatch::{
    mount, ApiState, MemoryStore, MetricsCollector, Router, Server, ServerConfig, ServerResult,
    WorkerPool,
};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> ServerResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chain_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command-line arguments
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 && args[1] == "--init-config" {
        return save_default_config(&args[2]);
    }

    let config = if args.len() > 1 && Path::new(&args[1]).exists() {
        ServerConfig::from_json_file(&args[1])?
    } else {
        let config = ServerConfig::new();
        config.validate()?;
        config
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime_threads)
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> ServerResult<()> {
    let metrics = Arc::new(MetricsCollector::new());
    let pool = Arc::new(WorkerPool::with_metrics(
        config.worker_pool_size,
        metrics.clone(),
    )?);

    let mut router = Router::new();
    mount(
        &mut router,
        ApiState {
            store: Arc::new(MemoryStore::new()),
            pool: pool.clone(),
            admin: config.admin.clone(),
            cors_origins: config.cors_allowed_origins.clone(),
        },
    );
    log::info!(
        "Registered {} routes; worker pool of {}",
        router.len(),
        pool.size()
    );

    let dispatcher = router.into_dispatcher().with_metrics(metrics.clone());
    let server = Server::new(config, dispatcher).with_metrics(metrics.clone());
    let listener = server.bind()?;

    // Periodic metrics dump
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log::info!("Metrics:\n{}", metrics.format());
        }
    });

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
        log::info!("Received shutdown signal. Stopping server...");
    };

    let result = server.run(listener, shutdown).await;
    reporter.abort();
    result
}

// Save default configuration to a file
fn save_default_config(path: &str) -> ServerResult<()> {
    let config = ServerConfig::new();
    config.save_to_json_file(path)?;
    log::info!("Default configuration saved to: {}", path);
    Ok(())
}
