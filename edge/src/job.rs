use std::{
    fmt,
    num::NonZeroU32,
    path::{Component, Path},
    time::SystemTime,
};

use comms::specs::edge::{LocalTrainSpec, ModelRef};

use crate::{
    error::{EdgeErr, Result},
    training::{Metrics, TrainingError},
};

/// Identifier of an admitted job, unique for the lifetime of the process.
pub type JobId = u64;

/// Lifecycle of a training job, it only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    fn can_become(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Idle, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };

        write!(f, "{s}")
    }
}

/// One local training round requested by the operator.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    id: JobId,
    base_model: ModelRef,
    local_model: ModelRef,
    epochs: NonZeroU32,
    status: JobStatus,
    metrics: Metrics,
    failure: Option<TrainingError>,
    dataset_size: u64,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
}

impl TrainingJob {
    /// Creates a new idle job out of an operator request.
    ///
    /// # Errors
    /// Returns `EdgeErr::InvalidRequest` if the epochs are zero or a model path is
    /// empty or climbs out of the repository with `..`.
    pub fn new(id: JobId, spec: LocalTrainSpec) -> Result<Self> {
        let LocalTrainSpec {
            base_model,
            local_model,
            epochs,
        } = spec;

        let epochs =
            NonZeroU32::new(epochs).ok_or(EdgeErr::InvalidRequest("epochs must be at least 1"))?;

        if base_model.path.trim().is_empty() {
            return Err(EdgeErr::InvalidRequest("base model path is empty"));
        }

        if local_model.path.trim().is_empty() {
            return Err(EdgeErr::InvalidRequest("local model path is empty"));
        }

        if escapes_root(&base_model.path) || escapes_root(&local_model.path) {
            return Err(EdgeErr::InvalidRequest("model path must not contain '..'"));
        }

        Ok(Self {
            id,
            base_model,
            local_model,
            epochs,
            status: JobStatus::Idle,
            metrics: Metrics::new(),
            failure: None,
            dataset_size: 0,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn base_model(&self) -> &ModelRef {
        &self.base_model
    }

    pub fn local_model(&self) -> &ModelRef {
        &self.local_model
    }

    pub fn epochs(&self) -> NonZeroU32 {
        self.epochs
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Metrics of a finished job, empty while it has not finished.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn failure(&self) -> Option<&TrainingError> {
        self.failure.as_ref()
    }

    pub fn dataset_size(&self) -> u64 {
        self.dataset_size
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }

    /// Marks the job as `Running`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(SystemTime::now());
        Ok(())
    }

    /// Marks the job as `Succeeded` with the metrics the routine returned.
    pub fn succeed(&mut self, dataset_size: u64, metrics: Metrics) -> Result<()> {
        self.transition(JobStatus::Succeeded)?;
        self.finish(dataset_size, metrics);
        Ok(())
    }

    /// Marks the job as `Failed`, keeping any partial metrics the error carries.
    pub fn fail(&mut self, dataset_size: u64, err: TrainingError) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.finish(dataset_size, err.partial_metrics());
        self.failure = Some(err);
        Ok(())
    }

    fn finish(&mut self, dataset_size: u64, metrics: Metrics) {
        self.dataset_size = dataset_size;
        self.metrics = metrics;
        self.finished_at = Some(SystemTime::now());
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_become(to) {
            return Err(EdgeErr::InvalidTransition {
                job: self.id,
                from: self.status,
                to,
            });
        }

        self.status = to;
        Ok(())
    }
}

fn escapes_root(locator: &str) -> bool {
    Path::new(locator)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(epochs: u32) -> LocalTrainSpec {
        LocalTrainSpec {
            base_model: ModelRef::new("base"),
            local_model: ModelRef::new("local"),
            epochs,
        }
    }

    #[test]
    fn new_job_is_idle_without_timestamps() {
        let job = TrainingJob::new(1, spec(2)).unwrap();

        assert_eq!(job.status(), JobStatus::Idle);
        assert_eq!(job.epochs().get(), 2);
        assert!(job.started_at().is_none());
        assert!(job.finished_at().is_none());
    }

    #[test]
    fn zero_epochs_are_rejected() {
        let err = TrainingJob::new(1, spec(0)).unwrap_err();
        assert!(matches!(err, EdgeErr::InvalidRequest(_)));
    }

    #[test]
    fn empty_paths_are_rejected() {
        let mut no_base = spec(1);
        no_base.base_model.path = "  ".into();
        assert!(TrainingJob::new(1, no_base).is_err());

        let mut no_local = spec(1);
        no_local.local_model.path.clear();
        assert!(TrainingJob::new(1, no_local).is_err());
    }

    #[test]
    fn parent_dir_locators_are_rejected() {
        for path in ["../../etc", "edge/../../secrets", ".."] {
            let mut escaping = spec(1);
            escaping.local_model.path = path.into();
            let err = TrainingJob::new(1, escaping).unwrap_err();
            assert!(matches!(err, EdgeErr::InvalidRequest(_)), "{path}");
        }

        let mut escaping = spec(1);
        escaping.base_model.path = "global/../../../repos".into();
        assert!(TrainingJob::new(1, escaping).is_err());

        let mut dotted = spec(1);
        dotted.local_model.path = "/edge-1/round..7".into();
        assert!(TrainingJob::new(1, dotted).is_ok());
    }

    #[test]
    fn success_records_metrics_and_times() {
        let mut job = TrainingJob::new(1, spec(1)).unwrap();
        job.start().unwrap();

        let metrics = Metrics::from([("accuracy".to_string(), 0.9)]);
        job.succeed(2000, metrics.clone()).unwrap();

        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.metrics(), &metrics);
        assert_eq!(job.dataset_size(), 2000);
        assert!(job.started_at().unwrap() <= job.finished_at().unwrap());
    }

    #[test]
    fn failure_keeps_partial_metrics() {
        let mut job = TrainingJob::new(1, spec(1)).unwrap();
        job.start().unwrap();

        let err = TrainingError::Failed {
            cause: "oom".into(),
            partial: Metrics::from([("D_loss".to_string(), 0.7)]),
        };
        job.fail(10, err.clone()).unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.metrics().get("D_loss"), Some(&0.7));
        assert_eq!(job.failure(), Some(&err));
    }

    #[test]
    fn status_never_moves_backwards() {
        let mut job = TrainingJob::new(4, spec(1)).unwrap();
        assert!(job.succeed(0, Metrics::new()).is_err());

        job.start().unwrap();
        assert!(job.start().is_err());

        job.fail(0, TrainingError::Interrupted).unwrap();
        let err = job.succeed(0, Metrics::new()).unwrap_err();

        assert!(matches!(
            err,
            EdgeErr::InvalidTransition {
                job: 4,
                from: JobStatus::Failed,
                to: JobStatus::Succeeded,
            }
        ));
        assert_eq!(job.status(), JobStatus::Failed);
    }
}
