use std::{error::Error, sync::Arc};

use cube_worker::{
    config::WorkerConfig,
    tasks::docker::DockerRuntime,
    worker::{
        stats::SysinfoMetrics,
        types::{TaskServer, Worker},
        worker::{collect_stats, run_tasks},
    },
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env()?;
    let runtime = Arc::new(DockerRuntime::connect()?);
    let worker = Arc::new(Worker::new(&config.name, runtime));

    info!(worker = %config.name, "starting worker");

    tokio::spawn(run_tasks(worker.clone(), config.poll_interval));
    tokio::spawn(collect_stats(
        worker.clone(),
        Arc::new(SysinfoMetrics::new()),
        config.stats_interval,
    ));

    let server = TaskServer::new(worker, &config.host, config.port);
    server.start_server().await?;

    Ok(())
}
