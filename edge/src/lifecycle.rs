use std::sync::Arc;

use comms::specs::edge::LocalTrainSpec;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Result,
    job::{JobId, TrainingJob},
    state::ServiceState,
};

/// Owns the shutdown signal, the service state and the supervised job tasks.
#[derive(Debug, Default)]
pub struct LifecycleController {
    state: Arc<Mutex<ServiceState>>,
    shutdown: CancellationToken,
    jobs: Mutex<Vec<JoinHandle<TrainingJob>>>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared state handle, used by the job runner.
    pub fn state(&self) -> Arc<Mutex<ServiceState>> {
        Arc::clone(&self.state)
    }

    /// A copy of the most recent job record.
    pub fn current_job(&self) -> Option<TrainingJob> {
        self.state.lock().current().cloned()
    }

    /// Fires the shutdown signal.
    ///
    /// # Returns
    /// `true` only for the call that performed the transition, later calls are no-ops.
    pub fn signal_shutdown(&self) -> bool {
        let first = self.state.lock().stop();
        if first {
            info!("shutdown signaled, no longer accepting work");
            self.shutdown.cancel();
        }

        first
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().is_stopping()
    }

    /// A token that is cancelled once shutdown was signaled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves once shutdown was signaled.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Admits a new job, enforcing that at most one is ever active.
    ///
    /// # Errors
    /// See `ServiceState::admit`.
    pub fn admit(&self, spec: LocalTrainSpec) -> Result<TrainingJob> {
        self.state.lock().admit(spec)
    }

    /// Forgets an admitted job that could not be started.
    pub fn discard(&self, id: JobId) {
        self.state.lock().discard(id);
    }

    /// Sends the cooperative interrupt to the running job, if any.
    pub fn interrupt(&self) -> Option<JobId> {
        self.state.lock().interrupt()
    }

    /// Retains the task handle of a submitted job.
    pub fn supervise(&self, handle: JoinHandle<TrainingJob>) {
        let mut jobs = self.jobs.lock();
        jobs.retain(|handle| !handle.is_finished());
        jobs.push(handle);
    }

    /// Waits for every supervised job task to finish, including its report.
    ///
    /// # Returns
    /// The final record of each job that had not been collected yet.
    pub async fn wait_for_jobs(&self) -> Vec<TrainingJob> {
        let handles = std::mem::take(&mut *self.jobs.lock());
        let mut finished = Vec::with_capacity(handles.len());

        for handle in handles {
            match handle.await {
                Ok(job) => finished.push(job),
                Err(e) => warn!("job task did not complete: {e}"),
            }
        }

        finished
    }
}
