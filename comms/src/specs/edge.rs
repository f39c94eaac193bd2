use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque locator of a model state, relative to the node's model repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub path: String,
}

impl ModelRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Wire-level request for one local training round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrainSpec {
    /// Model state to start from.
    pub base_model: ModelRef,
    /// Where the trained model should be written.
    pub local_model: ModelRef,
    /// Epochs requested by the operator, must be at least one.
    pub epochs: u32,
}

/// Wire-level outcome of a local training round, reported back to the operator.
///
/// `error` is `0` on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTrainResult {
    pub error: i32,
    pub dataset_size: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}
