use std::sync::Arc;

use newsflow::classify::DomainTableClassifier;
use newsflow::config::EngineConfig;
use newsflow::http::job_routes;
use newsflow::orchestrator::{CallbackQueueHandler, Orchestrator, spawn_sweeper};
use newsflow::queue::{InMemoryBroker, MessageQueue, Producer};
use newsflow::store::{JobStore, LibSqlStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();

    eprintln!("📰 NewsFlow Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Job API: http://0.0.0.0:{}/api/jobs", config.port);
    eprintln!("   Dispatch topic: {}", config.dispatch_topic);
    eprintln!("   Result topic: {}", config.result_topic);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = config.db_path.clone();
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlStore::open_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    // ── Queue ────────────────────────────────────────────────────────────
    let broker = InMemoryBroker::new(config.consumer_retry.clone());
    let queue: Arc<dyn MessageQueue> = Arc::new(broker.clone());
    let producer = Producer::new(Arc::clone(&queue), config.producer.clone());

    // ── Orchestrator ─────────────────────────────────────────────────────
    let classifier = Arc::new(DomainTableClassifier::new());
    let orchestrator = Orchestrator::new(store, producer, classifier, config.clone());

    // Callbacks arriving on the result topic flow through the same ingest
    // path as HTTP callbacks.
    queue
        .subscribe(
            &config.result_topic,
            CallbackQueueHandler::new(Arc::clone(&orchestrator)),
        )
        .await?;

    // Spawn the timeout sweep task
    let _sweeper_handle = spawn_sweeper(Arc::clone(&orchestrator));

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = job_routes(orchestrator);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Job API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
