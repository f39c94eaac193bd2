use std::{error::Error, fmt, io, time::Duration};

use async_trait::async_trait;
use comms::specs::edge::LocalTrainResult;
use log::{error, info, warn};
use tokio::time;

use crate::{client::RpcClient, error::EdgeErr, job::TrainingJob};

/// Delivers the outcome of a finished job to the operator.
///
/// Called exactly once per job, after it reached a terminal status.
/// Implementations must contain their own failures.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, job: &TrainingJob);
}

/// Builds the `LocalTrainFinish` payload out of a terminal job.
///
/// Non-finite metric values can not travel as JSON numbers and are dropped.
pub fn build_result(job: &TrainingJob) -> LocalTrainResult {
    let error = job.failure().map_or(0, |e| e.code());
    let metrics = job
        .metrics()
        .iter()
        .filter(|(name, value)| {
            let finite = value.is_finite();
            if !finite {
                warn!(job_id = job.id(); "dropping non-finite metric {name}={value}");
            }
            finite
        })
        .map(|(name, value)| (name.clone(), *value))
        .collect();

    LocalTrainResult {
        error,
        dataset_size: job.dataset_size(),
        metrics,
    }
}

/// Report delivery failures. Only ever logged, never retried.
#[derive(Debug)]
pub enum ReportErr {
    Transport(io::Error),
    Timeout(Duration),
    Rejected(String),
    UnexpectedReply(&'static str),
}

impl fmt::Display for ReportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportErr::Transport(e) => write!(f, "transport error: {e}"),
            ReportErr::Timeout(after) => write!(f, "no reply from operator after {after:?}"),
            ReportErr::Rejected(reason) => write!(f, "operator rejected the report: {reason}"),
            ReportErr::UnexpectedReply(got) => write!(f, "unexpected reply from operator: {got}"),
        }
    }
}

impl Error for ReportErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReportErr::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EdgeErr> for ReportErr {
    fn from(value: EdgeErr) -> Self {
        match value {
            EdgeErr::Io(e) => Self::Transport(e),
            EdgeErr::Rejected(reason) => Self::Rejected(reason),
            EdgeErr::UnexpectedReply(got) => Self::UnexpectedReply(got),
            other => Self::Transport(io::Error::other(other)),
        }
    }
}

/// Reports over the control protocol to the operator's endpoint.
#[derive(Debug, Clone)]
pub struct OperatorReporter {
    addr: String,
    timeout: Duration,
}

impl OperatorReporter {
    /// Creates a new `OperatorReporter`.
    ///
    /// # Args
    /// * `addr` - The operator's `host:port`.
    /// * `timeout` - Upper bound for connecting, sending and awaiting the reply.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Sends `result` once and waits for the operator's acknowledgment.
    pub async fn deliver(&self, result: LocalTrainResult) -> Result<(), ReportErr> {
        let exchange = async {
            let mut client = RpcClient::connect(self.addr.as_str()).await?;
            client.local_train_finish(result).await?;

            // The report is already acknowledged, a failed goodbye changes nothing.
            let _ = client.close().await;
            Ok::<_, EdgeErr>(())
        };

        time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ReportErr::Timeout(self.timeout))?
            .map_err(ReportErr::from)
    }
}

#[async_trait]
impl Reporter for OperatorReporter {
    async fn report(&self, job: &TrainingJob) {
        let result = build_result(job);
        info!(
            job_id = job.id(),
            error = result.error,
            dataset_size = result.dataset_size;
            "reporting to operator at {}", self.addr
        );

        match self.deliver(result).await {
            Ok(()) => info!(job_id = job.id(); "operator acknowledged the report"),
            Err(e) => error!(job_id = job.id(); "failed to report job outcome: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::edge::{LocalTrainSpec, ModelRef};
    use tokio::net::TcpListener;

    use super::*;
    use crate::training::{Metrics, TrainingError};

    fn finished_job(outcome: std::result::Result<Metrics, TrainingError>) -> TrainingJob {
        let spec = LocalTrainSpec {
            base_model: ModelRef::new("base"),
            local_model: ModelRef::new("local"),
            epochs: 1,
        };
        let mut job = TrainingJob::new(1, spec).unwrap();
        job.start().unwrap();

        match outcome {
            Ok(metrics) => job.succeed(2000, metrics).unwrap(),
            Err(e) => job.fail(2000, e).unwrap(),
        }

        job
    }

    #[test]
    fn success_reports_error_zero() {
        let job = finished_job(Ok(Metrics::from([("accuracy".into(), 0.9)])));
        let result = build_result(&job);

        assert_eq!(result.error, 0);
        assert_eq!(result.dataset_size, 2000);
        assert_eq!(result.metrics.get("accuracy"), Some(&0.9));
    }

    #[test]
    fn failure_reports_its_code() {
        let job = finished_job(Err(TrainingError::failed("oom")));
        assert_eq!(build_result(&job).error, 2);

        let job = finished_job(Err(TrainingError::DataSource("disk".into())));
        assert_eq!(build_result(&job).error, 1);
    }

    #[test]
    fn non_finite_metrics_are_dropped() {
        let metrics = Metrics::from([
            ("loss".into(), f64::NAN),
            ("grad".into(), f64::INFINITY),
            ("accuracy".into(), 0.5),
        ]);
        let result = build_result(&finished_job(Ok(metrics)));

        assert_eq!(result.metrics.len(), 1);
        assert!(result.metrics.contains_key("accuracy"));
    }

    #[tokio::test]
    async fn unreachable_operator_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let reporter = OperatorReporter::new(addr.to_string(), Duration::from_secs(5));
        let err = reporter
            .deliver(build_result(&finished_job(Ok(Metrics::new()))))
            .await
            .unwrap_err();

        assert!(matches!(err, ReportErr::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn silent_operator_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reporter = OperatorReporter::new(addr.to_string(), Duration::from_millis(100));
        let err = reporter
            .deliver(build_result(&finished_job(Ok(Metrics::new()))))
            .await
            .unwrap_err();

        assert!(matches!(err, ReportErr::Timeout(_)), "{err}");
        drop(listener);
    }
}
