use std::{io, sync::Arc};

use edge::{
    CommandService, EdgeConfig, JobRunner, LifecycleController, OperatorReporter,
    data::SampledDataSource, serve, training::ProcessTrainer,
};
use log::{info, warn};
use tokio::{net::TcpListener, signal};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = EdgeConfig::from_env()?;
    info!(
        max_connections = config.max_connections;
        "operator at {}, trainer {}", config.operator_addr, config.train_program
    );

    let data = SampledDataSource::new(config.population, config.sample_size, config.seed)?;
    let trainer = ProcessTrainer::new(&config.train_program, &config.train_args);
    let reporter = OperatorReporter::new(config.operator_addr.clone(), config.report_timeout);

    let lifecycle = Arc::new(LifecycleController::new());
    let runner = JobRunner::new(
        lifecycle.state(),
        Arc::new(trainer),
        Arc::new(data),
        Arc::new(reporter),
    )
    .with_repos_root(&config.repos_root)
    .with_hyperparameters(config.hyperparameters.clone());
    let service = Arc::new(CommandService::new(Arc::clone(&lifecycle), runner));

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening at {}", config.listen_addr);

    let ctrl_c = {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("received SIGINT");
                    lifecycle.signal_shutdown();
                }
                Err(e) => warn!("failed to listen for SIGINT: {e}"),
            }
        })
    };

    serve(
        listener,
        service,
        config.max_connections,
        config.drain_grace,
    )
    .await?;
    ctrl_c.abort();

    info!("server stopped, waiting for in-flight training");
    for job in lifecycle.wait_for_jobs().await {
        info!(job_id = job.id(); "job finished as {}", job.status());
    }

    Ok(())
}
