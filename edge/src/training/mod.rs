mod process;

use std::{collections::BTreeMap, error::Error, fmt, num::NonZeroU32, path::PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::data::Dataset;

pub use process::ProcessTrainer;

/// Metric name to value, as produced by a training routine.
pub type Metrics = BTreeMap<String, f64>;

/// Opaque knobs forwarded untouched to the training routine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hyperparameters {
    pub batch_size: usize,
    pub miss_rate: f64,
    pub hint_rate: f64,
    pub alpha: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            batch_size: 128,
            miss_rate: 0.9,
            hint_rate: 0.1,
            alpha: 100.0,
        }
    }
}

/// Everything a training routine needs to know about one job.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// Weights file of the model to start from.
    pub base_weights: PathBuf,
    /// Weights file the trained model should be written to.
    pub output_weights: PathBuf,
    pub epochs: NonZeroU32,
    pub hyperparameters: Hyperparameters,
}

/// The ways a training job can fail.
///
/// Each variant maps to a distinct non-zero error code in the operator report.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingError {
    /// The data source could not provide a dataset.
    DataSource(String),
    /// The training routine failed, `partial` holds whatever metrics it got to.
    Failed { cause: String, partial: Metrics },
    /// The routine stopped after a `TrainInterrupt`.
    Interrupted,
    /// The routine panicked or its task was torn down.
    Panicked(String),
}

impl TrainingError {
    /// A training failure with no partial metrics.
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Failed {
            cause: cause.into(),
            partial: Metrics::new(),
        }
    }

    /// The error code sent to the operator for this failure.
    pub fn code(&self) -> i32 {
        match self {
            TrainingError::DataSource(_) => 1,
            TrainingError::Failed { .. } => 2,
            TrainingError::Interrupted => 3,
            TrainingError::Panicked(_) => 4,
        }
    }

    /// Best-effort metrics collected before the failure.
    pub fn partial_metrics(&self) -> Metrics {
        match self {
            TrainingError::Failed { partial, .. } => partial.clone(),
            _ => Metrics::new(),
        }
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::DataSource(cause) => write!(f, "data source error: {cause}"),
            TrainingError::Failed { cause, .. } => write!(f, "training failed: {cause}"),
            TrainingError::Interrupted => write!(f, "training interrupted"),
            TrainingError::Panicked(cause) => write!(f, "training panicked: {cause}"),
        }
    }
}

impl Error for TrainingError {}

/// The model-fitting routine run by a job.
///
/// Implementations are called from a blocking thread and may take as long as
/// they need. `cancel` is fired by `TrainInterrupt`, honoring it is optional.
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        dataset: &Dataset,
        request: &TrainRequest,
        cancel: &CancellationToken,
    ) -> Result<Metrics, TrainingError>;
}
