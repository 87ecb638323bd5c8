//! Read-only sampling of the cost history for the monitor.

use std::sync::{Arc, RwLock};

use super::history::{CostSample, CostSource, SampleError};

/// Pulls [`CostSample`]s from a [`CostSource`] and remembers the last good one.
pub struct MetricSampler {
    source: Arc<dyn CostSource>,
    last: RwLock<Option<CostSample>>,
}

impl MetricSampler {
    pub fn new(source: Arc<dyn CostSource>) -> Self {
        Self {
            source,
            last: RwLock::new(None),
        }
    }

    pub fn sample(&self) -> Result<CostSample, SampleError> {
        let sample = self.source.sample()?;
        *self.last.write().unwrap_or_else(|e| e.into_inner()) = Some(sample.clone());
        Ok(sample)
    }

    pub fn last(&self) -> Option<CostSample> {
        self.last.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for MetricSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSampler")
            .field("has_last", &self.last().is_some())
            .finish()
    }
}
