use std::{any::Any, path::PathBuf, sync::Arc};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::{self, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    data::DataSource,
    error::Result,
    job::TrainingJob,
    reporter::Reporter,
    state::ServiceState,
    training::{Hyperparameters, TrainRequest, Trainer, TrainingError},
};

const DEFAULT_REPOS_ROOT: &str = "/repos";
const WEIGHTS_FILE: &str = "weights.tar";

/// Runs admitted jobs off the command path and hands every outcome to the reporter.
#[derive(Clone)]
pub struct JobRunner {
    state: Arc<Mutex<ServiceState>>,
    trainer: Arc<dyn Trainer>,
    data: Arc<dyn DataSource>,
    reporter: Arc<dyn Reporter>,
    repos_root: PathBuf,
    hyperparameters: Hyperparameters,
}

impl JobRunner {
    /// Creates a new `JobRunner`.
    ///
    /// # Args
    /// * `state` - The service state the admitted jobs live in.
    /// * `trainer` - The training routine.
    /// * `data` - Where jobs get their dataset from.
    /// * `reporter` - Receives every finished job.
    pub fn new(
        state: Arc<Mutex<ServiceState>>,
        trainer: Arc<dyn Trainer>,
        data: Arc<dyn DataSource>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            state,
            trainer,
            data,
            reporter,
            repos_root: PathBuf::from(DEFAULT_REPOS_ROOT),
            hyperparameters: Hyperparameters::default(),
        }
    }

    /// Sets the directory model locators are resolved against.
    pub fn with_repos_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repos_root = root.into();
        self
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }

    /// Starts an admitted job on its own task and returns right away.
    ///
    /// The returned handle resolves to the final job record once the outcome
    /// has been reported.
    ///
    /// # Errors
    /// Returns an error if `job` is not the admitted idle job of the state.
    pub fn submit(&self, job: TrainingJob) -> Result<JoinHandle<TrainingJob>> {
        let cancel = CancellationToken::new();
        let job = self.state.lock().start(job.id(), cancel.clone())?;

        info!(
            job_id = job.id(),
            epochs = job.epochs().get();
            "training job started: base={} local={}", job.base_model().path, job.local_model().path
        );

        let request = TrainRequest {
            base_weights: self.weights_path(&job.base_model().path),
            output_weights: self.weights_path(&job.local_model().path),
            epochs: job.epochs(),
            hyperparameters: self.hyperparameters.clone(),
        };

        let runner = self.clone();
        Ok(task::spawn(async move { runner.run(job, request, cancel).await }))
    }

    fn weights_path(&self, locator: &str) -> PathBuf {
        self.repos_root
            .join(locator.trim_start_matches('/'))
            .join(WEIGHTS_FILE)
    }

    async fn run(
        self,
        mut job: TrainingJob,
        request: TrainRequest,
        cancel: CancellationToken,
    ) -> TrainingJob {
        let Self {
            state,
            trainer,
            data,
            reporter,
            ..
        } = self;

        let blocking = task::spawn_blocking(move || {
            let dataset = match data.dataset() {
                Ok(dataset) => dataset,
                Err(e) => return (0, Err(e)),
            };

            let size = dataset.len() as u64;
            debug!(dataset_size = size; "dataset ready");
            (size, trainer.train(&dataset, &request, &cancel))
        });

        let (size, outcome) = blocking
            .await
            .unwrap_or_else(|e| (0, Err(join_failure(e))));

        let transition = match outcome {
            Ok(metrics) => {
                info!(job_id = job.id(), dataset_size = size; "training job succeeded");
                job.succeed(size, metrics)
            }
            Err(e) => {
                error!(job_id = job.id(); "training job failed: {e}");
                job.fail(size, e)
            }
        };

        if let Err(e) = transition {
            warn!(job_id = job.id(); "could not record job outcome: {e}");
        }

        if let Err(e) = state.lock().update(&job) {
            warn!(job_id = job.id(); "job record was replaced while running: {e}");
        }

        reporter.report(&job).await;
        job
    }
}

fn join_failure(err: JoinError) -> TrainingError {
    if err.is_panic() {
        TrainingError::Panicked(panic_message(err.into_panic()))
    } else {
        TrainingError::Panicked("training task was cancelled".into())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into())
}
