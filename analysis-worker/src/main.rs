//! Run the repository-analysis worker fleet.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use futures::future::join_all;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use analysis_common::clock::SystemClock;
use analysis_common::health::HealthRegistry;
use analysis_common::mail::LoggingDispatcher;
use analysis_common::metrics::{serve, setup_metrics_routes};
use analysis_common::pgqueue::PgQueue;
use analysis_common::registry::{ClaimRegistry, PgClaimRegistry};
use analysis_worker::audit::AuditNotifier;
use analysis_worker::config::Config;
use analysis_worker::failure::FailurePolicy;
use analysis_worker::monitor::WorkerHealthMonitor;
use analysis_worker::worker::{NoopMessageHandler, QueueWorker, WorkerSettings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)
        .expect("failed to create connection pool");

    let queue = Arc::new(PgQueue::new_from_pool(
        pool.clone(),
        config.max_attempts_default as i32,
    ));
    let registry: Arc<dyn ClaimRegistry> = Arc::new(PgClaimRegistry::new(pool));
    let dispatcher = Arc::new(LoggingDispatcher::new(config.dispatch_options()));
    let handler = Arc::new(NoopMessageHandler);
    let clock = Arc::new(SystemClock);

    let settings = WorkerSettings {
        queue_name: config.queue_name.as_str().to_owned(),
        poll_interval: config.poll_interval(),
        visibility_timeout_seconds: config.visibility_timeout_seconds as i32,
        batch_size: config.queue_batch_size as i32,
        consecutive_failure_limit: config.consecutive_failure_limit,
        ..WorkerSettings::default()
    };

    let workers: Vec<Arc<QueueWorker>> = (1..=config.worker_concurrency)
        .map(|index| {
            let worker_id = format!("{}-{}", config.worker_name_prefix.as_str(), index);
            let worker_liveness =
                liveness.register(worker_id.clone(), time::Duration::seconds(60));

            Arc::new(
                QueueWorker::new(
                    &worker_id,
                    queue.clone(),
                    Some(registry.clone()),
                    handler.clone(),
                    AuditNotifier::new(dispatcher.clone(), config.audit_recipients.0.clone()),
                    FailurePolicy::new(queue.clone(), config.retry_policy()),
                    settings.clone(),
                    clock.clone(),
                )
                .with_liveness(worker_liveness),
            )
        })
        .collect();

    let mut join_handles = Vec::new();
    for worker in &workers {
        let worker = worker.clone();
        join_handles.push(tokio::spawn(async move { worker.start().await }));
    }

    let monitor = WorkerHealthMonitor::new(workers.clone());
    tokio::spawn(monitor.start_monitoring());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutdown signal received, stopping workers");
    for worker in &workers {
        worker.stop().await;
    }
    join_all(join_handles).await;
}

pub async fn index() -> &'static str {
    "repository-analysis worker"
}
