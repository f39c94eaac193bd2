use comms::specs::edge::LocalTrainSpec;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{EdgeErr, Result},
    job::{JobId, JobStatus, TrainingJob},
};

/// Process-wide record of the current training job.
///
/// Only the latest job is remembered, and it is replaced only once it reached
/// a terminal status. Always accessed behind a single mutex.
#[derive(Debug, Default)]
pub struct ServiceState {
    current: Option<TrainingJob>,
    cancel: Option<CancellationToken>,
    next_id: JobId,
    stopping: bool,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the job currently holding the node, admitted or running.
    pub fn active(&self) -> Option<JobId> {
        self.current
            .as_ref()
            .filter(|job| !job.status().is_terminal())
            .map(TrainingJob::id)
    }

    pub fn current(&self) -> Option<&TrainingJob> {
        self.current.as_ref()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Flags the node as stopping, returns whether it was not flagged before.
    pub(crate) fn stop(&mut self) -> bool {
        !std::mem::replace(&mut self.stopping, true)
    }

    /// Admits a new idle job.
    ///
    /// # Errors
    /// Returns `EdgeErr::ShuttingDown` once stopping, `EdgeErr::Admission` while
    /// another job is active and `EdgeErr::InvalidRequest` for a malformed spec.
    pub fn admit(&mut self, spec: LocalTrainSpec) -> Result<TrainingJob> {
        if self.stopping {
            return Err(EdgeErr::ShuttingDown);
        }

        if let Some(running) = self.active() {
            return Err(EdgeErr::Admission { running });
        }

        let job = TrainingJob::new(self.next_id + 1, spec)?;
        self.next_id += 1;
        self.current = Some(job.clone());
        self.cancel = None;

        Ok(job)
    }

    /// Moves the admitted job `id` to `Running` and installs its interrupt token.
    pub fn start(&mut self, id: JobId, cancel: CancellationToken) -> Result<TrainingJob> {
        let job = self.job_mut(id)?;
        job.start()?;
        let job = job.clone();

        self.cancel = Some(cancel);
        Ok(job)
    }

    /// Replaces the stored record of `job` with its newer version.
    pub fn update(&mut self, job: &TrainingJob) -> Result<()> {
        let current = self.job_mut(job.id())?;
        *current = job.clone();

        if job.status().is_terminal() {
            self.cancel = None;
        }

        Ok(())
    }

    /// Forgets an admitted job that never started.
    pub fn discard(&mut self, id: JobId) {
        if self
            .current
            .as_ref()
            .is_some_and(|job| job.id() == id && job.status() == JobStatus::Idle)
        {
            self.current = None;
        }
    }

    /// Fires the interrupt token of the running job, if any.
    pub fn interrupt(&mut self) -> Option<JobId> {
        let id = self.active()?;
        let cancel = self.cancel.as_ref()?;
        cancel.cancel();
        Some(id)
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut TrainingJob> {
        match self.current.as_mut() {
            Some(job) if job.id() == id => Ok(job),
            _ => Err(EdgeErr::InvalidRequest("job is not the current one")),
        }
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::edge::ModelRef;

    use super::*;
    use crate::training::Metrics;

    fn spec() -> LocalTrainSpec {
        LocalTrainSpec {
            base_model: ModelRef::new("base"),
            local_model: ModelRef::new("local"),
            epochs: 1,
        }
    }

    #[test]
    fn second_admission_is_refused_while_active() {
        let mut state = ServiceState::new();
        let job = state.admit(spec()).unwrap();

        let err = state.admit(spec()).unwrap_err();
        assert!(matches!(err, EdgeErr::Admission { running } if running == job.id()));

        state.start(job.id(), CancellationToken::new()).unwrap();
        assert!(state.admit(spec()).is_err());
    }

    #[test]
    fn terminal_job_is_replaced_by_the_next_one() {
        let mut state = ServiceState::new();
        let mut job = state.start_new(spec());

        job.succeed(1, Metrics::new()).unwrap();
        state.update(&job).unwrap();
        assert_eq!(state.active(), None);

        let next = state.admit(spec()).unwrap();
        assert_eq!(next.id(), job.id() + 1);
        assert_eq!(state.current().map(TrainingJob::id), Some(next.id()));
    }

    #[test]
    fn invalid_spec_does_not_take_the_slot() {
        let mut state = ServiceState::new();
        let mut bad = spec();
        bad.epochs = 0;

        assert!(state.admit(bad).is_err());
        assert_eq!(state.active(), None);
        assert!(state.admit(spec()).is_ok());
    }

    #[test]
    fn discard_frees_an_unstarted_job_only() {
        let mut state = ServiceState::new();
        let job = state.admit(spec()).unwrap();
        state.discard(job.id());
        assert_eq!(state.active(), None);

        let job = state.start_new(spec());
        state.discard(job.id());
        assert_eq!(state.active(), Some(job.id()));
    }

    #[test]
    fn interrupt_fires_the_running_token() {
        let mut state = ServiceState::new();
        assert_eq!(state.interrupt(), None);

        let job = state.admit(spec()).unwrap();
        let cancel = CancellationToken::new();
        state.start(job.id(), cancel.clone()).unwrap();

        assert_eq!(state.interrupt(), Some(job.id()));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn stopping_refuses_admission() {
        let mut state = ServiceState::new();
        assert!(state.stop());
        assert!(!state.stop());
        assert!(matches!(state.admit(spec()), Err(EdgeErr::ShuttingDown)));
    }

    impl ServiceState {
        fn start_new(&mut self, spec: LocalTrainSpec) -> TrainingJob {
            let job = self.admit(spec).unwrap();
            self.start(job.id(), CancellationToken::new()).unwrap()
        }
    }
}
