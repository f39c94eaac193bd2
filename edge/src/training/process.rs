use std::{
    ffi::OsString,
    io::{Read, Write},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::{Metrics, TrainRequest, Trainer, TrainingError};
use crate::data::Dataset;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL: usize = 512;

/// Runs the training routine as an external program.
///
/// The child gets the job through environment variables (`EDGE_BASE_WEIGHTS`,
/// `EDGE_OUTPUT_WEIGHTS`, `EDGE_EPOCHS`, `EDGE_HYPERPARAMETERS`) and the sample
/// indices as a JSON array on stdin. The last non-empty stdout line must be a
/// JSON object of numeric metrics. `TrainInterrupt` kills the child, so wrapper
/// scripts should `exec` the real trainer or its processes outlive the job.
#[derive(Debug, Clone)]
pub struct ProcessTrainer {
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessTrainer {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn spawn(&self, request: &TrainRequest) -> Result<Child, TrainingError> {
        let hyperparameters = serde_json::to_string(&request.hyperparameters)
            .map_err(|e| TrainingError::failed(format!("encoding hyperparameters: {e}")))?;

        Command::new(&self.program)
            .args(&self.args)
            .env("EDGE_BASE_WEIGHTS", &request.base_weights)
            .env("EDGE_OUTPUT_WEIGHTS", &request.output_weights)
            .env("EDGE_EPOCHS", request.epochs.to_string())
            .env("EDGE_HYPERPARAMETERS", hyperparameters)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TrainingError::failed(format!(
                    "spawning {}: {e}",
                    self.program.to_string_lossy()
                ))
            })
    }

    /// Polls the child until it exits, killing it once `cancel` fires.
    fn wait(child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus, TrainingError> {
        let io_err = |e: std::io::Error| TrainingError::failed(format!("waiting for trainer: {e}"));

        loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                return Ok(status);
            }

            if cancel.is_cancelled() {
                debug!("interrupt received, killing trainer process");
                if let Err(e) = child.kill() {
                    warn!("failed to kill trainer process: {e}");
                }
                child.wait().map_err(io_err)?;
                return Err(TrainingError::Interrupted);
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Trainer for ProcessTrainer {
    fn train(
        &self,
        dataset: &Dataset,
        request: &TrainRequest,
        cancel: &CancellationToken,
    ) -> Result<Metrics, TrainingError> {
        let input = serde_json::to_vec(dataset.indices())
            .map_err(|e| TrainingError::failed(format!("encoding dataset: {e}")))?;
        let mut child = self.spawn(request)?;

        let stdin = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                // The routine may legitimately exit without reading its input.
                let _ = stdin.write_all(&input);
            })
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        // After a kill the pipe readers are left detached, a grandchild may
        // still hold the pipes open until it exits on its own.
        let status = Self::wait(&mut child, cancel)?;

        if let Some(handle) = stdin {
            let _ = handle.join();
        }
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        let metrics = parse_metrics(&stdout);

        if status.success() {
            return metrics;
        }

        let tail = tail(stderr.trim(), STDERR_TAIL);
        let cause = if tail.is_empty() {
            format!("trainer exited with {status}")
        } else {
            format!("trainer exited with {status}: {tail}")
        };

        Err(TrainingError::Failed {
            cause,
            partial: metrics.unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut src: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = src.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn tail(text: &str, max: usize) -> &str {
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Parses the last non-empty line of `stdout` as a metrics object.
fn parse_metrics(stdout: &str) -> Result<Metrics, TrainingError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| TrainingError::failed("trainer printed no metrics"))?;

    serde_json::from_str(line)
        .map_err(|e| TrainingError::failed(format!("malformed metrics line {line:?}: {e}")))
}
