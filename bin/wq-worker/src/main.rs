//! WorkQueue Worker
//!
//! Consumes a SQLite-backed queue with a pool of polling workers until
//! Ctrl+C or SIGTERM, then runs the graceful shutdown sequence.
//!
//! Configuration comes from `workqueue.toml` (see `wq-config`) with `WQ_*`
//! overrides. Additionally:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WQ_METRICS_PORT` | `9090` | Port for `/metrics` and `/health` |
//! | `WQ_SEED_MESSAGES` | `0` | Enqueue this many demo messages at startup |
//! | `RUST_LOG` | `info` | Log level |
//! | `LOG_FORMAT` | `text` | `json` for structured output |

use anyhow::Result;
use axum::{extract::State, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use wq_common::{AdditionalMessageData, Message, ReceivedMessage};
use wq_config::ConfigLoader;
use wq_consumer::{ConsumerQueue, HandlerError, LoggingConsumerNotification, ProducerQueue};
use wq_transport::sqlite::SqliteTransport;
use wq_transport::{QueueStatusProvider, TransportServices, WorkerNotification};

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusHandle,
    transport: Arc<SqliteTransport>,
    consumer: Arc<ConsumerQueue>,
}

#[tokio::main]
async fn main() -> Result<()> {
    wq_common::logging::init_logging("wq-worker");

    info!("Starting WorkQueue worker");

    let config = ConfigLoader::new().load()?;
    let metrics_port: u16 = env_or_parse("WQ_METRICS_PORT", 9090);
    let seed_messages: usize = env_or_parse("WQ_SEED_MESSAGES", 0);

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let queue_name = config.transport.queue_name.clone();
    let transport = Arc::new(
        SqliteTransport::connect(&config.transport.connection_string, queue_name.clone()).await?,
    );
    info!(
        queue = %queue_name,
        database = %config.transport.connection_string,
        "SQLite transport initialized"
    );

    if seed_messages > 0 {
        let producer = ProducerQueue::new(transport.clone(), queue_name.clone());
        let sent = tokio::task::spawn_blocking(move || {
            let batch = (0..seed_messages)
                .map(|i| (Message::new(format!("demo message {i}")), AdditionalMessageData::new()))
                .collect();
            producer.send_batch(batch)
        })
        .await??;
        info!(count = sent.len(), "Seeded demo messages");
    }

    let consumer = Arc::new(
        ConsumerQueue::new(config, TransportServices::from_transport(&transport))?
            .with_notification(Arc::new(LoggingConsumerNotification)),
    );
    consumer.on_system_exception(|failure| {
        error!(
            worker = %failure.worker_name,
            message_id = ?failure.message_id,
            error = %failure.error,
            "System failure in consumer"
        );
    });
    consumer.start(handle_message)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = AppState {
        prometheus,
        transport: transport.clone(),
        consumer: consumer.clone(),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!("Metrics server listening on http://{}/metrics", metrics_addr);
    let server = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!(queue = %queue_name, "WorkQueue worker started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // The shutdown ladder blocks; keep it off the async workers
    let stopping = consumer.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        warn!("Metrics server did not shut down in time");
    }

    info!("WorkQueue worker shutdown complete");
    Ok(())
}

fn handle_message(message: &ReceivedMessage, notification: &WorkerNotification) -> Result<(), HandlerError> {
    if notification.should_abort() {
        return Err(HandlerError::Canceled);
    }
    let body = std::str::from_utf8(&message.body)
        .map_err(|e| HandlerError::poison(format!("body is not UTF-8: {e}")))?;
    info!(
        worker = notification.worker_name(),
        message_id = %message.id,
        correlation_id = %message.correlation_id,
        retry_count = message.retry_count,
        body,
        "Processing message"
    );
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let transport = state.transport.clone();
    let status = tokio::task::spawn_blocking(move || transport.status()).await;
    let queue = match status {
        Ok(Ok(status)) => serde_json::json!({
            "name": status.queue_name,
            "waiting": status.waiting,
            "processing": status.processing,
            "error": status.error,
        }),
        Ok(Err(e)) => serde_json::json!({ "error": e.to_string() }),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };

    Json(serde_json::json!({
        "status": if state.consumer.is_running() { "UP" } else { "DOWN" },
        "version": env!("CARGO_PKG_VERSION"),
        "queue": queue,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
