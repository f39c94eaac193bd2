pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod reporter;
pub mod runner;
pub mod service;
pub mod state;
pub mod training;

pub use client::RpcClient;
pub use config::EdgeConfig;
pub use error::EdgeErr;
pub use job::{JobId, JobStatus, TrainingJob};
pub use lifecycle::LifecycleController;
pub use reporter::{OperatorReporter, Reporter};
pub use runner::JobRunner;
pub use service::{CommandService, serve};
