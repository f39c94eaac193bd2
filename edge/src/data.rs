use std::sync::{Arc, OnceLock};

use log::info;
use rand::{SeedableRng, rngs::StdRng, seq::index};

use crate::{
    error::{EdgeErr, Result},
    training::TrainingError,
};

/// A selection of sample indices to train on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    indices: Arc<[usize]>,
}

impl Dataset {
    pub fn new(indices: impl Into<Arc<[usize]>>) -> Self {
        Self {
            indices: indices.into(),
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Supplies the dataset a job trains on.
pub trait DataSource: Send + Sync {
    fn dataset(&self) -> std::result::Result<Dataset, TrainingError>;
}

/// Draws `sample_size` distinct indices out of `population` on first use and
/// hands the same selection to every later job.
#[derive(Debug)]
pub struct SampledDataSource {
    population: usize,
    sample_size: usize,
    seed: Option<u64>,
    selection: OnceLock<Dataset>,
}

impl SampledDataSource {
    /// Creates a new `SampledDataSource`.
    ///
    /// # Args
    /// * `population` - The amount of samples available locally.
    /// * `sample_size` - How many of them each job trains on.
    /// * `seed` - Optional seed for a reproducible selection.
    ///
    /// # Errors
    /// Returns `EdgeErr::Config` if the sample is empty or larger than the population.
    pub fn new(population: usize, sample_size: usize, seed: Option<u64>) -> Result<Self> {
        if sample_size == 0 || sample_size > population {
            return Err(EdgeErr::Config(format!(
                "sample size {sample_size} must be within 1..={population}"
            )));
        }

        Ok(Self {
            population,
            sample_size,
            seed,
            selection: OnceLock::new(),
        })
    }

    fn sample(&self) -> Dataset {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let indices = index::sample(&mut rng, self.population, self.sample_size).into_vec();
        info!(
            population = self.population,
            sample_size = self.sample_size;
            "selected local training samples"
        );

        Dataset::new(indices)
    }
}

impl DataSource for SampledDataSource {
    fn dataset(&self) -> std::result::Result<Dataset, TrainingError> {
        Ok(self.selection.get_or_init(|| self.sample()).clone())
    }
}
